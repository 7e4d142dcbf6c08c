//! SDP handlers
//!
//! Handlers are registered per stream type and tried in registration order.
//! The first handler that claims a stream owns it for the rest of the
//! negotiation; a failure from any handler aborts the whole pass.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::errors::{Result, SessionError};
use crate::media::SessionMedia;
use crate::sdp::SessionDescription;
use crate::session::Session;

/// Whether answering an incoming stream must wait for an outside decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpDeferral {
    /// This handler does not deal with the stream
    NotHandled,
    /// Abandon the negotiation
    Error,
    /// Handled, the answer can be produced right away
    NotNeeded,
    /// Handled, the answer has to wait until the session is resumed
    Needed,
}

/// Outcome of a negotiate, create or apply callback for one stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Try the next handler for the stream type
    NotHandled,
    /// This handler owns the stream
    Claimed,
    /// Abort the current negotiation pass
    Failed,
}

/// Per stream type negotiation callbacks
pub trait SdpHandler: Send + Sync {
    /// Unique id within a stream type
    fn id(&self) -> &str;

    fn defer_incoming_sdp_stream(
        &self,
        _session: &Arc<Session>,
        _media: &Arc<SessionMedia>,
        _sdp: &SessionDescription,
        _index: usize,
    ) -> SdpDeferral {
        SdpDeferral::NotHandled
    }

    fn negotiate_incoming_sdp_stream(
        &self,
        session: &Arc<Session>,
        media: &Arc<SessionMedia>,
        sdp: &SessionDescription,
        index: usize,
    ) -> StreamOutcome;

    /// Append a stream for `media` to `local`. `remote` is the offer being
    /// answered, if any.
    fn create_outgoing_sdp_stream(
        &self,
        session: &Arc<Session>,
        media: &Arc<SessionMedia>,
        local: &mut SessionDescription,
        remote: Option<&SessionDescription>,
        index: usize,
    ) -> StreamOutcome;

    fn apply_negotiated_sdp_stream(
        &self,
        session: &Arc<Session>,
        media: &Arc<SessionMedia>,
        local: &SessionDescription,
        remote: &SessionDescription,
        index: usize,
    ) -> StreamOutcome;

    /// Rewrite addresses in stream `index` of an outgoing SDP
    fn change_outgoing_sdp_stream_media_address(
        &self,
        _session: &Arc<Session>,
        _media: &Arc<SessionMedia>,
        _sdp: &mut SessionDescription,
        _index: usize,
    ) {
    }

    /// Stop using the stream's transport without releasing it
    fn stream_stop(&self, _media: &SessionMedia) {}

    /// Release resources the handler attached to the stream
    fn stream_destroy(&self, _media: &SessionMedia) {}
}

impl fmt::Debug for dyn SdpHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SdpHandler").field("id", &self.id()).finish()
    }
}

/// SDP handlers keyed by stream type
#[derive(Default)]
pub struct SdpHandlerRegistry {
    handlers: RwLock<HashMap<String, Vec<Arc<dyn SdpHandler>>>>,
}

impl SdpHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler to the chain for `stream_type`
    pub fn register(&self, handler: Arc<dyn SdpHandler>, stream_type: &str) -> Result<()> {
        let mut handlers = self.handlers.write();
        let chain = handlers.entry(stream_type.to_string()).or_default();
        if chain.iter().any(|h| h.id() == handler.id()) {
            warn!(
                "Handler '{}' already registered for SDP stream type '{}'",
                handler.id(),
                stream_type
            );
            return Err(SessionError::DuplicateSdpHandler {
                handler_id: handler.id().to_string(),
                stream_type: stream_type.to_string(),
            });
        }
        debug!(
            "Registered SDP stream handler '{}' for stream type '{}'",
            handler.id(),
            stream_type
        );
        chain.push(handler);
        Ok(())
    }

    /// Remove a handler. The stream type goes away with its last handler.
    pub fn unregister(&self, handler_id: &str, stream_type: &str) -> bool {
        let mut handlers = self.handlers.write();
        let Some(chain) = handlers.get_mut(stream_type) else {
            return false;
        };
        let before = chain.len();
        chain.retain(|h| h.id() != handler_id);
        let removed = chain.len() != before;
        if chain.is_empty() {
            handlers.remove(stream_type);
        }
        if removed {
            debug!(
                "Unregistered SDP stream handler '{}' for stream type '{}'",
                handler_id, stream_type
            );
        }
        removed
    }

    /// The chain for a stream type, in registration order
    pub fn handlers(&self, stream_type: &str) -> Vec<Arc<dyn SdpHandler>> {
        self.handlers
            .read()
            .get(stream_type)
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_handlers(&self, stream_type: &str) -> bool {
        self.handlers.read().contains_key(stream_type)
    }
}

impl fmt::Debug for SdpHandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let types: Vec<String> = self.handlers.read().keys().cloned().collect();
        f.debug_struct("SdpHandlerRegistry")
            .field("stream_types", &types)
            .finish()
    }
}
