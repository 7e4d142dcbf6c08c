//! Message and refer technologies
//!
//! A technology delivers messages or refers over one protocol. It is picked
//! by the scheme of the destination (`pjsip:bob` goes to the technology named
//! `pjsip`), so names are unique within each registry.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::errors::{MessageError, Result};
use crate::message::Message;
use crate::refer::Refer;

pub trait MessageTech: Send + Sync {
    fn name(&self) -> &str;

    /// Send `msg` to `destination` with `from` as the sender, empty when unset
    fn msg_send(&self, msg: &Message, destination: &str, from: &str) -> Result<()>;
}

pub trait ReferTech: Send + Sync {
    fn name(&self) -> &str;

    fn refer_send(&self, refer: &Refer) -> Result<()>;
}

/// Something kept in a [`Registry`] under a unique name
pub trait Registered: Send + Sync {
    /// Kind of entry, used in logs and errors
    const KIND: &'static str;

    fn registered_name(&self) -> &str;
}

impl Registered for dyn MessageTech {
    const KIND: &'static str = "message technology";

    fn registered_name(&self) -> &str {
        self.name()
    }
}

impl Registered for dyn ReferTech {
    const KIND: &'static str = "refer technology";

    fn registered_name(&self) -> &str {
        self.name()
    }
}

/// Name-unique registry, kept in registration order
pub struct Registry<T: ?Sized + Registered> {
    entries: RwLock<Vec<Arc<T>>>,
}

impl<T: ?Sized + Registered> Default for Registry<T> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }
}

impl<T: ?Sized + Registered> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, entry: Arc<T>) -> Result<()> {
        let name = entry.registered_name().to_string();
        let mut entries = self.entries.write();
        if entries.iter().any(|e| e.registered_name() == name) {
            warn!("{} '{}' already registered", T::KIND, name);
            return Err(MessageError::DuplicateRegistration {
                kind: T::KIND,
                name,
            });
        }
        entries.push(entry);
        debug!("{} '{}' registered", T::KIND, name);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Result<()> {
        let mut entries = self.entries.write();
        let Some(index) = entries.iter().position(|e| e.registered_name() == name) else {
            warn!("{} '{}' not registered", T::KIND, name);
            return Err(MessageError::NotRegistered {
                kind: T::KIND,
                name: name.to_string(),
            });
        };
        entries.remove(index);
        debug!("{} '{}' unregistered", T::KIND, name);
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<Arc<T>> {
        self.entries
            .read()
            .iter()
            .find(|e| e.registered_name() == name)
            .cloned()
    }

    /// Snapshot of every entry, in registration order
    pub fn all(&self) -> Vec<Arc<T>> {
        self.entries.read().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Technology name of a destination: everything before the first ':'
pub fn tech_name(destination: &str) -> Option<&str> {
    destination
        .split_once(':')
        .map(|(tech, _)| tech)
        .filter(|tech| !tech.is_empty())
}
