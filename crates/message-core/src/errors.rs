//! Error types for out-of-call messaging

use rvoip_session_core::SessionError;
use thiserror::Error;

/// Result alias used throughout the messaging layer
pub type Result<T> = std::result::Result<T, MessageError>;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("A {kind} named '{name}' is already registered")]
    DuplicateRegistration { kind: &'static str, name: String },

    #[error("No {kind} named '{name}' is registered")]
    NotRegistered { kind: &'static str, name: String },

    #[error("No message technology '{0}'")]
    NoTech(String),

    #[error("Invalid URI: '{0}'")]
    InvalidUri(String),

    #[error("No message data on channel {0}")]
    NoMessage(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Max-Forwards reached zero")]
    MaxForwardsExceeded,

    #[error("No destination for message to {context},{exten}")]
    NoDestination { context: String, exten: String },

    #[error("Endpoint not found: {0}")]
    EndpointNotFound(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Infra(#[from] rvoip_infra_common::Error),
}

impl MessageError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        MessageError::InvalidArgument(msg.into())
    }
}

impl From<::config::ConfigError> for MessageError {
    fn from(e: ::config::ConfigError) -> Self {
        MessageError::Config(e.to_string())
    }
}
