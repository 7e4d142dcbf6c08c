//! Session registry
//!
//! Live sessions indexed by id and by dialog key, so in-dialog requests and
//! responses can be routed back to their session.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::session::{Session, SessionId};

/// Counters kept by the registry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub total_created: usize,
    pub total_ended: usize,
    pub active: usize,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    by_id: DashMap<SessionId, Arc<Session>>,
    by_dialog: DashMap<String, SessionId>,
    total_created: AtomicUsize,
    total_ended: AtomicUsize,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session: Arc<Session>, dialog_key: String) {
        debug!("Registered session {} for dialog {}", session.id(), dialog_key);
        self.by_dialog.insert(dialog_key, session.id().clone());
        self.by_id.insert(session.id().clone(), session);
        self.total_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn remove(&self, id: &SessionId) -> Option<Arc<Session>> {
        let (_, session) = self.by_id.remove(id)?;
        self.by_dialog.retain(|_, sid| sid != id);
        self.total_ended.fetch_add(1, Ordering::Relaxed);
        debug!("Removed session {}", id);
        Some(session)
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.by_id.get(id).map(|s| s.value().clone())
    }

    pub fn find_by_dialog(&self, dialog_key: &str) -> Option<Arc<Session>> {
        let id = self.by_dialog.get(dialog_key)?.value().clone();
        self.get(&id)
    }

    /// First session matching `predicate`
    pub fn find(&self, predicate: impl Fn(&Session) -> bool) -> Option<Arc<Session>> {
        self.by_id
            .iter()
            .find(|entry| predicate(entry.value()))
            .map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.by_id.iter().map(|e| e.key().clone()).collect()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            total_created: self.total_created.load(Ordering::Relaxed),
            total_ended: self.total_ended.load(Ordering::Relaxed),
            active: self.by_id.len(),
        }
    }
}
