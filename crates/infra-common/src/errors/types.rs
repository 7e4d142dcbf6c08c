use thiserror::Error;

/// Result alias used across the infrastructure crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the infrastructure primitives
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Datastore '{0}' already exists in container")]
    DuplicateDatastore(String),

    #[error("Serializer '{0}' has shut down")]
    SerializerShutdown(String),

    #[error("Serializer '{0}' dropped the task before it completed")]
    TaskDropped(String),

    #[error("Serializer '{0}' cannot be suspended from one of its own tasks")]
    SuspendFromSelf(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Custom(String),
}
