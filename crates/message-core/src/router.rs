//! Message routing core
//!
//! Holds the technology and handler registries, queues received messages
//! for delivery to handlers on a dedicated serializer and sends messages and
//! refers through the technology their destination names.

use std::sync::Arc;

use rvoip_infra_common::Serializer;
use rvoip_session_core::channel::Channel;
use tracing::{debug, info, warn};

use crate::errors::{MessageError, Result};
use crate::functions::find_message;
use crate::handler::MessageHandler;
use crate::message::Message;
use crate::refer::Refer;
use crate::tech::{tech_name, MessageTech, ReferTech, Registry};

/// Channel variable `message_send` reports its outcome in
pub const MESSAGE_SEND_STATUS: &str = "MESSAGE_SEND_STATUS";

/// Outcome of sending the message a channel carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Success,
    Failure,
    InvalidProtocol,
    InvalidUri,
}

impl SendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SendStatus::Success => "SUCCESS",
            SendStatus::Failure => "FAILURE",
            SendStatus::InvalidProtocol => "INVALID_PROTOCOL",
            SendStatus::InvalidUri => "INVALID_URI",
        }
    }
}

pub struct MessageRouter {
    techs: Registry<dyn MessageTech>,
    refer_techs: Registry<dyn ReferTech>,
    handlers: Arc<Registry<dyn MessageHandler>>,
    queue: Serializer,
}

impl MessageRouter {
    /// Create the router and its delivery queue. Must be called inside a tokio runtime.
    pub fn new() -> Arc<Self> {
        info!("Starting message router");
        Arc::new(Self {
            techs: Registry::new(),
            refer_techs: Registry::new(),
            handlers: Arc::new(Registry::new()),
            queue: Serializer::new("message/queue"),
        })
    }

    pub fn register_tech(&self, tech: Arc<dyn MessageTech>) -> Result<()> {
        self.techs.register(tech)
    }

    pub fn unregister_tech(&self, name: &str) -> Result<()> {
        self.techs.unregister(name)
    }

    pub fn register_refer_tech(&self, tech: Arc<dyn ReferTech>) -> Result<()> {
        self.refer_techs.register(tech)
    }

    pub fn unregister_refer_tech(&self, name: &str) -> Result<()> {
        self.refer_techs.unregister(name)
    }

    pub fn register_handler(&self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        self.handlers.register(handler)
    }

    pub fn unregister_handler(&self, name: &str) -> Result<()> {
        self.handlers.unregister(name)
    }

    pub fn tech(&self, name: &str) -> Option<Arc<dyn MessageTech>> {
        self.techs.find(name)
    }

    /// True when some handler would deliver `msg`
    pub fn has_destination(&self, msg: &Message) -> bool {
        self.handlers.all().iter().any(|h| h.has_destination(msg))
    }

    /// Hand `msg` to every handler that wants it, in registration order, on the delivery queue
    pub fn queue(&self, msg: Message) -> Result<()> {
        let handlers = self.handlers.clone();
        self.queue.push_task(async move {
            route(&handlers, &msg);
        })?;
        Ok(())
    }

    /// Wait until every message queued so far has been delivered
    pub async fn flush(&self) -> Result<()> {
        self.queue.push_task_synchronous(async {}).await?;
        Ok(())
    }

    /// Send `msg` to `to` through the technology its scheme names
    pub fn send(&self, msg: &Message, to: &str, from: &str) -> Result<()> {
        let tech = self.find_tech(to)?;
        debug!("Sending message to '{}' through {}", to, tech.name());
        tech.msg_send(msg, to, from)
    }

    /// Send `refer` through the technology its `to` names
    pub fn refer_send(&self, refer: &Refer) -> Result<()> {
        let name = tech_name(&refer.to).ok_or_else(|| MessageError::InvalidUri(refer.to.clone()))?;
        let tech = self
            .refer_techs
            .find(name)
            .ok_or_else(|| MessageError::NoTech(name.to_string()))?;
        debug!("Sending refer to '{}' through {}", refer.to, tech.name());
        tech.refer_send(refer)
    }

    fn find_tech(&self, destination: &str) -> Result<Arc<dyn MessageTech>> {
        let name = tech_name(destination).ok_or_else(|| MessageError::InvalidUri(destination.to_string()))?;
        self.techs
            .find(name)
            .ok_or_else(|| MessageError::NoTech(name.to_string()))
    }

    /// Send the message `channel` carries and record the outcome in `MESSAGE_SEND_STATUS`.
    ///
    /// A non-empty `to` replaces the message's own To before sending.
    pub fn message_send(
        &self,
        channel: &dyn Channel,
        destination: &str,
        from: Option<&str>,
        to: Option<&str>,
    ) -> SendStatus {
        let status = self.try_message_send(channel, destination, from, to);
        channel.set_variable(MESSAGE_SEND_STATUS, status.as_str());
        status
    }

    fn try_message_send(
        &self,
        channel: &dyn Channel,
        destination: &str,
        from: Option<&str>,
        to: Option<&str>,
    ) -> SendStatus {
        if tech_name(destination).is_none() {
            warn!("A 'to' URI with a technology is required to send a message, got '{}'", destination);
            return SendStatus::InvalidUri;
        }
        let Some(message) = find_message(channel) else {
            warn!("No message data found on channel {} to send", channel.name());
            return SendStatus::Failure;
        };
        let tech = match self.find_tech(destination) {
            Ok(tech) => tech,
            Err(e) => {
                warn!("{}", e);
                return SendStatus::InvalidProtocol;
            }
        };
        let msg = {
            let mut message = message.lock();
            if let Some(to) = to.filter(|t| !t.is_empty()) {
                message.to = to.to_string();
            }
            message.clone()
        };
        match tech.msg_send(&msg, destination, from.unwrap_or_default()) {
            Ok(()) => SendStatus::Success,
            Err(e) => {
                warn!("Sending message to '{}' failed: {}", destination, e);
                SendStatus::Failure
            }
        }
    }
}

fn route(handlers: &Registry<dyn MessageHandler>, msg: &Message) {
    let mut processed = false;
    for handler in handlers.all() {
        if !handler.has_destination(msg) {
            continue;
        }
        match handler.handle_msg(msg) {
            Ok(()) => processed = true,
            Err(e) => debug!("Handler {} did not take message: {}", handler.name(), e),
        }
    }
    if !processed {
        warn!("No handler processed message from '{}' to '{}'", msg.from, msg.to);
    }
}
