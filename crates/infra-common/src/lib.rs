//! Common infrastructure for the RVOIP session layer
//!
//! This crate holds the primitives the session, subscription and messaging
//! crates are built on:
//!
//! - [`serializer`]: single-consumer ordered task queues with suspend support
//! - [`datastore`]: typed key/value attachments shared by sessions, subscriptions and channels
//! - [`timer`]: cancellable scheduled tasks
//! - [`logging`]: tracing subscriber setup
//! - [`errors`]: the shared error type

pub mod datastore;
pub mod errors;
pub mod logging;
pub mod serializer;
pub mod timer;

pub use datastore::{Datastore, DatastoreContainer, DatastoreData, DatastoreType};
pub use errors::types::{Error, Result};
pub use serializer::{Serializer, Suspension};
pub use timer::{schedule, ScheduledTask};
