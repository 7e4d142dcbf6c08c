//! Message handlers
//!
//! Handlers receive queued messages. Every handler that wants a message gets
//! it; the dialplan handler delivers messages to a dialplan location on a
//! throwaway [`MessageChannel`] carrying the message.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rvoip_infra_common::DatastoreContainer;
use rvoip_session_core::channel::{Channel, Frame};
use rvoip_session_core::pbx::Dialplan;
use tracing::{debug, warn};

use crate::errors::{MessageError, Result};
use crate::functions::attach_message;
use crate::message::Message;
use crate::tech::Registered;

pub trait MessageHandler: Send + Sync {
    fn name(&self) -> &str;

    /// True when this handler would deliver `msg` somewhere
    fn has_destination(&self, msg: &Message) -> bool;

    fn handle_msg(&self, msg: &Message) -> Result<()>;
}

impl Registered for dyn MessageHandler {
    const KIND: &'static str = "message handler";

    fn registered_name(&self) -> &str {
        self.name()
    }
}

/// Name given to the channels messages run on
pub const MESSAGE_CHANNEL_NAME: &str = "Message/ast_msg_queue";

/// Bare channel a message runs through the dialplan on. Frames written to it are dropped.
pub struct MessageChannel {
    name: String,
    datastores: DatastoreContainer,
    variables: Mutex<HashMap<String, String>>,
}

impl MessageChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            name: MESSAGE_CHANNEL_NAME.to_string(),
            datastores: DatastoreContainer::new(),
            variables: Mutex::new(HashMap::new()),
        })
    }
}

impl Channel for MessageChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn queue_frame(&self, _frame: Frame) -> rvoip_session_core::Result<()> {
        Ok(())
    }

    fn datastores(&self) -> &DatastoreContainer {
        &self.datastores
    }

    fn set_variable(&self, name: &str, value: &str) {
        self.variables.lock().insert(name.to_string(), value.to_string());
    }

    fn variable(&self, name: &str) -> Option<String> {
        self.variables.lock().get(name).cloned()
    }
}

/// Executes the dialplan at a location for a channel
pub trait DialplanRunner: Send + Sync {
    fn run(&self, channel: Arc<dyn Channel>, context: &str, exten: &str) -> Result<()>;
}

/// Delivers messages to `context,exten` of the dialplan
pub struct DialplanHandler {
    dialplan: Arc<dyn Dialplan>,
    runner: Arc<dyn DialplanRunner>,
}

impl DialplanHandler {
    pub const NAME: &'static str = "dialplan";

    pub fn new(dialplan: Arc<dyn Dialplan>, runner: Arc<dyn DialplanRunner>) -> Self {
        Self { dialplan, runner }
    }
}

impl MessageHandler for DialplanHandler {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn has_destination(&self, msg: &Message) -> bool {
        !msg.context.is_empty() && self.dialplan.exists_extension(&msg.context, msg.exten_or_start())
    }

    fn handle_msg(&self, msg: &Message) -> Result<()> {
        let exten = msg.exten_or_start();
        if !self.has_destination(msg) {
            warn!(
                "Dialplan extension '{}@{}' not found for message from '{}'",
                exten, msg.context, msg.from
            );
            return Err(MessageError::NoDestination {
                context: msg.context.clone(),
                exten: exten.to_string(),
            });
        }
        let channel = MessageChannel::new();
        attach_message(channel.as_ref(), msg.clone())?;
        debug!("Running message from '{}' at {}@{}", msg.from, exten, msg.context);
        self.runner.run(channel, &msg.context, exten)
    }
}
