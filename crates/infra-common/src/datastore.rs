//! Datastores
//!
//! A datastore is a typed, uniquely identified attachment that extension code
//! hangs off a session, a subscription or a channel. The type descriptor
//! ([`DatastoreType`]) supplies the lifecycle callbacks; the payload is an
//! opaque shared value the owner downcasts on lookup.
//!
//! A [`DatastoreContainer`] enforces uid uniqueness and uses its own short
//! lived lock, so datastores may be attached or removed from any thread. The
//! container does not protect the payload: whatever discipline the payload's
//! owner picks (usually an interior `Mutex`) applies.
//!
//! The type's `destroy` callback runs exactly once, when the last handle to
//! the datastore is released.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::errors::types::{Error, Result};

/// Opaque datastore payload
pub type DatastoreData = Arc<dyn Any + Send + Sync>;

/// Lifecycle callbacks for one kind of datastore
pub trait DatastoreType: Send + Sync {
    /// Type name, used for logging
    fn name(&self) -> &str;

    /// Release resources owned by the payload
    fn destroy(&self, _data: Option<DatastoreData>) {}

    /// Produce a copy of the payload for a duplicated owner.
    ///
    /// Returning `None` means the datastore is not inherited.
    fn duplicate(&self, _data: Option<&DatastoreData>) -> Option<DatastoreData> {
        None
    }

    /// The owning channel was swapped for another one
    fn chan_fixup(&self, _data: Option<&DatastoreData>, _old_owner: &str, _new_owner: &str) {}

    /// The owning channel is being broken away from its peer
    fn chan_breakdown(&self, _data: Option<&DatastoreData>, _old_owner: &str, _new_owner: &str) {}
}

/// A single attachment: type descriptor, uid and payload
pub struct Datastore {
    uid: String,
    info: Arc<dyn DatastoreType>,
    data: Option<DatastoreData>,
}

impl Datastore {
    /// Allocate a datastore. A UUID is generated when `uid` is `None`.
    pub fn alloc(
        info: Arc<dyn DatastoreType>,
        uid: Option<&str>,
        data: Option<DatastoreData>,
    ) -> Arc<Self> {
        let uid = match uid {
            Some(uid) if !uid.is_empty() => uid.to_string(),
            _ => Uuid::new_v4().to_string(),
        };
        Arc::new(Datastore { uid, info, data })
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn info(&self) -> &Arc<dyn DatastoreType> {
        &self.info
    }

    pub fn type_name(&self) -> &str {
        self.info.name()
    }

    /// Raw payload handle
    pub fn raw_data(&self) -> Option<&DatastoreData> {
        self.data.as_ref()
    }

    /// Payload downcast to its concrete type
    pub fn data<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.data.clone()?.downcast::<T>().ok()
    }

    /// Duplicate through the type's `duplicate` callback, keeping the uid
    pub fn duplicate(&self) -> Option<Arc<Datastore>> {
        let data = self.info.duplicate(self.data.as_ref())?;
        Some(Arc::new(Datastore {
            uid: self.uid.clone(),
            info: self.info.clone(),
            data: Some(data),
        }))
    }
}

impl Drop for Datastore {
    fn drop(&mut self) {
        debug!("Destroying datastore '{}' of type {}", self.uid, self.info.name());
        self.info.destroy(self.data.take());
    }
}

impl fmt::Debug for Datastore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Datastore")
            .field("uid", &self.uid)
            .field("type", &self.info.name())
            .field("has_data", &self.data.is_some())
            .finish()
    }
}

/// Uid-keyed set of datastores
#[derive(Default)]
pub struct DatastoreContainer {
    entries: RwLock<HashMap<String, Arc<Datastore>>>,
}

impl DatastoreContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a datastore. Fails if one with the same uid is already present.
    pub fn add(&self, datastore: Arc<Datastore>) -> Result<()> {
        let mut entries = self.entries.write();
        if entries.contains_key(datastore.uid()) {
            return Err(Error::DuplicateDatastore(datastore.uid().to_string()));
        }
        debug!(
            "Adding datastore '{}' of type {}",
            datastore.uid(),
            datastore.type_name()
        );
        entries.insert(datastore.uid().to_string(), datastore);
        Ok(())
    }

    pub fn find(&self, uid: &str) -> Option<Arc<Datastore>> {
        self.entries.read().get(uid).cloned()
    }

    /// Remove a datastore by uid. Removing an unknown uid is a no-op.
    pub fn remove(&self, uid: &str) -> Option<Arc<Datastore>> {
        self.entries.write().remove(uid)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn uids(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Copy every duplicable datastore into `target`, skipping uids it already has
    pub fn inherit_into(&self, target: &DatastoreContainer) {
        let copies: Vec<Arc<Datastore>> = self
            .entries
            .read()
            .values()
            .filter_map(|ds| ds.duplicate())
            .collect();
        for copy in copies {
            let _ = target.add(copy);
        }
    }

    /// Run the fixup callback of every datastore after an owner swap
    pub fn fixup(&self, old_owner: &str, new_owner: &str) {
        let entries: Vec<Arc<Datastore>> = self.entries.read().values().cloned().collect();
        for ds in entries {
            ds.info().chan_fixup(ds.raw_data(), old_owner, new_owner);
        }
    }

    /// Drop every entry. Destroy callbacks run for entries nobody else holds.
    pub fn clear(&self) {
        let drained: Vec<Arc<Datastore>> = self.entries.write().drain().map(|(_, v)| v).collect();
        drop(drained);
    }
}

impl fmt::Debug for DatastoreContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatastoreContainer")
            .field("uids", &self.uids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        destroyed: Arc<AtomicUsize>,
    }

    impl DatastoreType for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn destroy(&self, _data: Option<DatastoreData>) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }

        fn duplicate(&self, data: Option<&DatastoreData>) -> Option<DatastoreData> {
            data.cloned()
        }
    }

    fn counting() -> (Arc<dyn DatastoreType>, Arc<AtomicUsize>) {
        let destroyed = Arc::new(AtomicUsize::new(0));
        (
            Arc::new(Counting {
                destroyed: destroyed.clone(),
            }),
            destroyed,
        )
    }

    #[test]
    fn duplicate_uid_is_rejected() {
        let (info, _) = counting();
        let container = DatastoreContainer::new();
        container
            .add(Datastore::alloc(info.clone(), Some("t38"), None))
            .unwrap();
        let err = container
            .add(Datastore::alloc(info, Some("t38"), None))
            .unwrap_err();
        assert_eq!(err, Error::DuplicateDatastore("t38".into()));
        assert_eq!(container.len(), 1);
    }

    #[test]
    fn removing_unknown_uid_is_noop() {
        let container = DatastoreContainer::new();
        assert!(container.remove("missing").is_none());
        assert!(container.is_empty());
    }

    #[test]
    fn generated_uids_are_unique() {
        let (info, _) = counting();
        let a = Datastore::alloc(info.clone(), None, None);
        let b = Datastore::alloc(info, None, None);
        assert_ne!(a.uid(), b.uid());
    }

    #[test]
    fn dropping_container_destroys_each_entry_once() {
        let (info, destroyed) = counting();
        let container = DatastoreContainer::new();
        for uid in ["a", "b", "c", "d"] {
            container
                .add(Datastore::alloc(info.clone(), Some(uid), None))
                .unwrap();
        }
        assert_eq!(destroyed.load(Ordering::SeqCst), 0);
        drop(container);
        assert_eq!(destroyed.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn destroy_waits_for_last_handle() {
        let (info, destroyed) = counting();
        let container = DatastoreContainer::new();
        container
            .add(Datastore::alloc(info, Some("held"), None))
            .unwrap();
        let held = container.find("held").unwrap();
        container.remove("held");
        assert_eq!(destroyed.load(Ordering::SeqCst), 0);
        drop(held);
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn payload_downcasts_to_concrete_type() {
        let (info, _) = counting();
        let payload: DatastoreData = Arc::new(Mutex::new(vec![1u8, 2, 3]));
        let ds = Datastore::alloc(info, Some("bytes"), Some(payload));
        let bytes = ds.data::<Mutex<Vec<u8>>>().unwrap();
        bytes.lock().push(4);
        assert_eq!(ds.data::<Mutex<Vec<u8>>>().unwrap().lock().len(), 4);
        assert!(ds.data::<String>().is_none());
    }

    #[test]
    fn inherit_copies_duplicable_entries() {
        let (info, _) = counting();
        let from = DatastoreContainer::new();
        let to = DatastoreContainer::new();
        from.add(Datastore::alloc(info, Some("x"), Some(Arc::new(5u32))))
            .unwrap();
        from.inherit_into(&to);
        assert_eq!(*to.find("x").unwrap().data::<u32>().unwrap(), 5);
    }
}
