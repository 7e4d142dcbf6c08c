//! Session supplements
//!
//! A supplement is a bundle of callbacks hooked into a session's request,
//! response and lifecycle events. Supplements are registered globally in
//! priority order; every new session takes a snapshot of the registry and
//! dispatches against that snapshot for its whole life, so later
//! registrations and removals never affect existing sessions.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::session::Session;
use crate::sip::{Method, SipRequest, SipResponse};

/// Supplement priorities. Lower runs first.
pub mod priority {
    /// Runs before everything else
    pub const FIRST: i32 = 0;
    /// Supplements that need the channel run after this point
    pub const CHANNEL: i32 = 1_000_000;
    pub const LAST: i32 = i32::MAX;
}

/// When a supplement sees an incoming response relative to media handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum ResponsePriority {
    BeforeRedirecting,
    #[default]
    BeforeMedia,
    AfterMedia,
}

/// Result of an `incoming_request` callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestDisposition {
    /// Let the next supplement see the request
    Continue,
    /// The supplement dealt with the request, including any response
    Handled,
}

/// Callbacks a module hooks into sessions. Every callback defaults to a no-op.
pub trait SessionSupplement: Send + Sync {
    fn name(&self) -> &str;

    /// Comma separated methods this supplement wants; `None` means all
    fn method(&self) -> Option<&str> {
        None
    }

    fn priority(&self) -> i32 {
        priority::CHANNEL
    }

    fn response_priority(&self) -> ResponsePriority {
        ResponsePriority::BeforeMedia
    }

    /// A channel has been attached to the session
    fn session_begin(&self, _session: &Arc<Session>) {}

    /// The session is ending. The channel may already be gone.
    fn session_end(&self, _session: &Arc<Session>) {}

    /// The session object is being torn down
    fn session_destroy(&self, _session: &Session) {}

    /// No guarantee a channel exists for the very first INVITE
    fn incoming_request(&self, _session: &Arc<Session>, _request: &SipRequest) -> RequestDisposition {
        RequestDisposition::Continue
    }

    fn incoming_response(&self, _session: &Arc<Session>, _response: &SipResponse) {}

    fn outgoing_request(&self, _session: &Arc<Session>, _request: &mut SipRequest) {}

    fn outgoing_response(&self, _session: &Arc<Session>, _response: &mut SipResponse) {}
}

impl fmt::Debug for dyn SessionSupplement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSupplement")
            .field("name", &self.name())
            .field("priority", &self.priority())
            .finish()
    }
}

/// True when the method filter is empty or names `method`
pub fn method_matches(filter: Option<&str>, method: &Method) -> bool {
    match filter {
        None => true,
        Some(list) if list.trim().is_empty() => true,
        Some(list) => list
            .split(',')
            .map(str::trim)
            .any(|m| m.eq_ignore_ascii_case(method.as_str())),
    }
}

/// Supplements ordered by priority, ties in registration order
#[derive(Default)]
pub struct SupplementRegistry {
    supplements: RwLock<Vec<Arc<dyn SessionSupplement>>>,
}

impl SupplementRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, supplement: Arc<dyn SessionSupplement>) {
        let mut supplements = self.supplements.write();
        let position = supplements
            .iter()
            .position(|s| s.priority() > supplement.priority())
            .unwrap_or(supplements.len());
        debug!(
            "Registering supplement '{}' with priority {} at position {}",
            supplement.name(),
            supplement.priority(),
            position
        );
        supplements.insert(position, supplement);
    }

    /// Remove a supplement by identity. Returns false if it was not registered.
    pub fn unregister(&self, supplement: &Arc<dyn SessionSupplement>) -> bool {
        let mut supplements = self.supplements.write();
        let before = supplements.len();
        supplements.retain(|s| !std::ptr::addr_eq(Arc::as_ptr(s), Arc::as_ptr(supplement)));
        let removed = supplements.len() != before;
        if removed {
            debug!("Unregistered supplement '{}'", supplement.name());
        }
        removed
    }

    /// Copy of the current list, as taken by a new session
    pub fn snapshot(&self) -> Vec<Arc<dyn SessionSupplement>> {
        self.supplements.read().clone()
    }

    pub fn len(&self) -> usize {
        self.supplements.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.supplements.read().is_empty()
    }
}

impl fmt::Debug for SupplementRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .supplements
            .read()
            .iter()
            .map(|s| s.name().to_string())
            .collect();
        f.debug_struct("SupplementRegistry")
            .field("supplements", &names)
            .finish()
    }
}
