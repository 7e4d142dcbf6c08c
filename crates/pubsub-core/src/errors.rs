//! Error types for event subscriptions and publications

use rvoip_session_core::SessionError;
use thiserror::Error;

/// Result alias used throughout the pub/sub layer
pub type Result<T> = std::result::Result<T, PubsubError>;

#[derive(Debug, Error)]
pub enum PubsubError {
    #[error("No event package given")]
    MissingEventName,

    #[error("Handler for event '{0}' accepts no body types")]
    NoAcceptTypes(String),

    #[error("A subscription handler for event '{0}' is already registered")]
    DuplicateHandler(String),

    #[error("No subscription handler for event '{0}'")]
    NoHandler(String),

    #[error("A publish handler for event '{0}' is already registered")]
    DuplicatePublishHandler(String),

    #[error("A body generator for {0} is already registered")]
    DuplicateBodyGenerator(String),

    #[error("No body generator for {0}")]
    NoBodyGenerator(String),

    #[error("Body generator {generator} does not accept '{body_type}' data")]
    BodyTypeMismatch { generator: String, body_type: String },

    #[error("Unable to build body: {0}")]
    BodyGeneration(String),

    #[error("Subscription {0} is terminated")]
    Terminated(String),

    #[error("Invalid subscription state: {0}")]
    InvalidState(String),

    #[error("Publication rejected: {0}")]
    PublicationRejected(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Infra(#[from] rvoip_infra_common::Error),
}

impl PubsubError {
    pub fn body(msg: impl Into<String>) -> Self {
        PubsubError::BodyGeneration(msg.into())
    }
}

impl From<::config::ConfigError> for PubsubError {
    fn from(e: ::config::ConfigError) -> Self {
        PubsubError::Config(e.to_string())
    }
}
