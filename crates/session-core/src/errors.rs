//! Error types for the session layer

use thiserror::Error;

/// Result alias used throughout the session layer
pub type Result<T> = std::result::Result<T, SessionError>;

/// Errors raised by session operations and registries
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("SDP handler '{handler_id}' is already registered for stream type '{stream_type}'")]
    DuplicateSdpHandler {
        handler_id: String,
        stream_type: String,
    },

    #[error("Session {0} is disconnected")]
    Disconnected(String),

    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("SDP negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("Unable to create local SDP: {0}")]
    SdpCreationFailed(String),

    #[error("Session has no channel")]
    NoChannel,

    #[error("Endpoint not found: {0}")]
    EndpointNotFound(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Termination is already deferred")]
    AlreadyDeferred,

    #[error("No header named {0}")]
    HeaderNotFound(String),

    #[error("Callback rejected the request: {0}")]
    CallbackRejected(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Infra(#[from] rvoip_infra_common::Error),

    #[error("{0}")]
    Other(String),
}

impl SessionError {
    pub fn other(msg: impl Into<String>) -> Self {
        SessionError::Other(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        SessionError::InvalidState(msg.into())
    }
}

impl From<::config::ConfigError> for SessionError {
    fn from(e: ::config::ConfigError) -> Self {
        SessionError::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for SessionError {
    fn from(e: toml::ser::Error) -> Self {
        SessionError::Config(e.to_string())
    }
}
