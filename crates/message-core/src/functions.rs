//! Channel functions over the message a channel carries
//!
//! `MESSAGE(to|from|body|custom_data)` and `MESSAGE_DATA(name)` read and
//! write the message kept in a channel datastore. Writing creates the
//! message when the channel has none yet.

use std::sync::Arc;

use parking_lot::Mutex;
use rvoip_infra_common::errors::ErrorExt;
use rvoip_infra_common::{Datastore, DatastoreType};
use rvoip_session_core::channel::Channel;
use tracing::{debug, warn};

use crate::errors::{MessageError, Result};
use crate::message::Message;

pub const MESSAGE_DATASTORE: &str = "message";

struct MessageDatastoreType;

impl DatastoreType for MessageDatastoreType {
    fn name(&self) -> &str {
        MESSAGE_DATASTORE
    }
}

pub type SharedMessage = Arc<Mutex<Message>>;

/// The message carried by `channel`, if any
pub fn find_message(channel: &dyn Channel) -> Option<SharedMessage> {
    channel
        .datastores()
        .find(MESSAGE_DATASTORE)?
        .data::<Mutex<Message>>()
}

fn ensure_message(channel: &dyn Channel) -> Result<SharedMessage> {
    if let Some(message) = find_message(channel) {
        return Ok(message);
    }
    attach_message(channel, Message::new())
}

/// Hang `msg` off `channel`, replacing any message already there
pub fn attach_message(channel: &dyn Channel, msg: Message) -> Result<SharedMessage> {
    let shared: SharedMessage = Arc::new(Mutex::new(msg));
    channel.datastores().remove(MESSAGE_DATASTORE);
    let datastore = Datastore::alloc(
        Arc::new(MessageDatastoreType),
        Some(MESSAGE_DATASTORE),
        Some(shared.clone()),
    );
    channel
        .datastores()
        .add(datastore)
        .with_context("message", "attach")?;
    Ok(shared)
}

/// `MESSAGE(field)` read
pub fn message_read(channel: &dyn Channel, field: &str) -> Result<String> {
    let message = find_message(channel).ok_or_else(|| {
        warn!("No MESSAGE data found on channel {} to read", channel.name());
        MessageError::NoMessage(channel.name().to_string())
    })?;
    let message = message.lock();
    match field.to_ascii_lowercase().as_str() {
        "to" => Ok(message.to.clone()),
        "from" => Ok(message.from.clone()),
        "body" => Ok(message.body.clone()),
        _ => Err(MessageError::invalid_argument(format!(
            "'{}' is not a MESSAGE() field",
            field
        ))),
    }
}

/// `MESSAGE(field)=value` write
pub fn message_write(channel: &dyn Channel, field: &str, value: &str) -> Result<()> {
    let message = ensure_message(channel)?;
    let mut message = message.lock();
    match field.to_ascii_lowercase().as_str() {
        "to" => message.to = value.to_string(),
        "from" => message.from = value.to_string(),
        "body" => message.body = value.to_string(),
        "custom_data" => {
            let outbound = match value.to_ascii_lowercase().as_str() {
                "mark_all_outbound" => true,
                "clear_all_outbound" => false,
                _ => {
                    return Err(MessageError::invalid_argument(format!(
                        "'{}' is not a valid value for custom_data",
                        value
                    )));
                }
            };
            debug!("Channel {}: marking message variables outbound={}", channel.name(), outbound);
            message.set_all_outbound(outbound);
        }
        _ => {
            return Err(MessageError::invalid_argument(format!(
                "'{}' is not a valid write argument",
                field
            )));
        }
    }
    Ok(())
}

/// `MESSAGE_DATA(name)` read, empty when the variable is unset
pub fn message_data_read(channel: &dyn Channel, name: &str) -> Result<String> {
    let message = find_message(channel)
        .ok_or_else(|| MessageError::NoMessage(channel.name().to_string()))?;
    let value = message.lock().var(name).unwrap_or_default().to_string();
    Ok(value)
}

/// `MESSAGE_DATA(name)=value` write. The variable is sent with the message.
pub fn message_data_write(channel: &dyn Channel, name: &str, value: &str) -> Result<()> {
    ensure_message(channel)?.lock().set_var_outbound(name, value);
    Ok(())
}
