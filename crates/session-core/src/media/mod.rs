//! Session media and media states
//!
//! A [`SessionMedia`] is the per-stream negotiation state of a session: the
//! handler that owns it, its transport, hold flags and bundle group. A
//! [`MediaState`] is the ordered set of them for one configuration. Each
//! session keeps an active state, replaced as a whole when a negotiation
//! completes, and a pending state being built by the current negotiation.
//!
//! Cloning a media state copies the stream list but shares the individual
//! [`SessionMedia`] handles.

pub mod handler;
pub mod rtp;
pub mod transport;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::errors::{Result, SessionError};
use crate::sdp::MediaDirection;

pub use handler::{SdpDeferral, SdpHandler, SdpHandlerRegistry, StreamOutcome};
pub use transport::{MediaTransport, TransportKind};

/// Mutable part of a [`SessionMedia`]
#[derive(Debug)]
pub struct MediaParams {
    pub transport: Option<Arc<MediaTransport>>,
    /// We put the stream on hold
    pub locally_held: bool,
    /// The peer put the stream on hold
    pub remotely_held: bool,
    /// Negotiated crypto suite, if any
    pub encryption: Option<String>,
    /// -1 when the stream is not bundled
    pub bundle_group: i32,
    pub direction: MediaDirection,
    /// Payload formats agreed for the stream
    pub formats: Vec<String>,
}

impl Default for MediaParams {
    fn default() -> Self {
        Self {
            transport: None,
            locally_held: false,
            remotely_held: false,
            encryption: None,
            bundle_group: -1,
            direction: MediaDirection::SendRecv,
            formats: Vec::new(),
        }
    }
}

/// Negotiation state for one stream of a session
pub struct SessionMedia {
    stream_type: String,
    position: usize,
    handler: Mutex<Option<Arc<dyn SdpHandler>>>,
    params: Mutex<MediaParams>,
}

impl SessionMedia {
    pub fn new(stream_type: impl Into<String>, position: usize) -> Arc<Self> {
        Arc::new(Self {
            stream_type: stream_type.into(),
            position,
            handler: Mutex::new(None),
            params: Mutex::new(MediaParams::default()),
        })
    }

    pub fn stream_type(&self) -> &str {
        &self.stream_type
    }

    /// Stream index in the SDP
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn handler(&self) -> Option<Arc<dyn SdpHandler>> {
        self.handler.lock().clone()
    }

    /// Bind a handler. A different previous handler gets `stream_destroy` first.
    pub fn set_handler(&self, handler: Arc<dyn SdpHandler>) {
        let previous = self.handler.lock().clone();
        if let Some(previous) = previous {
            if std::ptr::addr_eq(Arc::as_ptr(&previous), Arc::as_ptr(&handler)) {
                return;
            }
            previous.stream_destroy(self);
        }
        trace!(
            "Stream {} ({}) now handled by '{}'",
            self.position,
            self.stream_type,
            handler.id()
        );
        *self.handler.lock() = Some(handler);
    }

    /// Access the mutable parameters. Do not call handlers while holding it.
    pub fn params(&self) -> parking_lot::MutexGuard<'_, MediaParams> {
        self.params.lock()
    }

    pub fn transport(&self) -> Option<Arc<MediaTransport>> {
        self.params.lock().transport.clone()
    }

    pub fn set_transport(&self, transport: Option<Arc<MediaTransport>>) {
        self.params.lock().transport = transport;
    }

    pub fn is_remotely_held(&self) -> bool {
        self.params.lock().remotely_held
    }

    pub fn is_locally_held(&self) -> bool {
        self.params.lock().locally_held
    }

    pub fn set_locally_held(&self, held: bool) {
        self.params.lock().locally_held = held;
    }
}

impl fmt::Debug for SessionMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionMedia")
            .field("stream_type", &self.stream_type)
            .field("position", &self.position)
            .field("handler", &self.handler().map(|h| h.id().to_string()))
            .field("params", &*self.params.lock())
            .finish()
    }
}

/// A read callback registered for a stream's transport
#[derive(Clone)]
pub struct ReadCallback {
    pub name: String,
    pub media: Arc<SessionMedia>,
}

impl fmt::Debug for ReadCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadCallback")
            .field("name", &self.name)
            .field("position", &self.media.position())
            .finish()
    }
}

/// Ordered streams of one media configuration
#[derive(Debug, Clone, Default)]
pub struct MediaState {
    pub sessions: Vec<Arc<SessionMedia>>,
    /// First stream of each type
    pub default_session: HashMap<String, Arc<SessionMedia>>,
    pub read_callbacks: Vec<ReadCallback>,
}

impl MediaState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, position: usize) -> Option<&Arc<SessionMedia>> {
        self.sessions.get(position)
    }

    pub fn default_for(&self, stream_type: &str) -> Option<&Arc<SessionMedia>> {
        self.default_session.get(stream_type)
    }

    /// Get or create the stream at `position`.
    ///
    /// An existing stream at the position is returned as is. Otherwise the
    /// active state's stream is reused when it has the same type, so
    /// transports survive re-negotiation.
    pub fn add(
        &mut self,
        active: Option<&MediaState>,
        stream_type: &str,
        position: usize,
    ) -> Result<Arc<SessionMedia>> {
        if let Some(existing) = self.sessions.get(position) {
            if existing.stream_type() == stream_type {
                return Ok(existing.clone());
            }
        }
        if position > self.sessions.len() {
            return Err(SessionError::invalid_state(format!(
                "stream position {} skips past {} streams",
                position,
                self.sessions.len()
            )));
        }

        let media = active
            .and_then(|a| a.sessions.get(position))
            .filter(|m| m.stream_type() == stream_type)
            .cloned()
            .unwrap_or_else(|| SessionMedia::new(stream_type, position));

        if position == self.sessions.len() {
            self.sessions.push(media.clone());
        } else {
            let displaced = std::mem::replace(&mut self.sessions[position], media.clone());
            self.forget_stream(&displaced);
        }
        self.default_session
            .entry(stream_type.to_string())
            .or_insert_with(|| media.clone());
        Ok(media)
    }

    /// Drop what still points at a stream no longer in the list.
    /// Its type falls back to the next stream of that type, if any.
    fn forget_stream(&mut self, media: &Arc<SessionMedia>) {
        self.read_callbacks.retain(|cb| !Arc::ptr_eq(&cb.media, media));
        let stream_type = media.stream_type();
        let was_default = self
            .default_session
            .get(stream_type)
            .is_some_and(|d| Arc::ptr_eq(d, media));
        if !was_default {
            return;
        }
        self.default_session.remove(stream_type);
        if let Some(next) = self.sessions.iter().find(|m| m.stream_type() == stream_type) {
            self.default_session.insert(stream_type.to_string(), next.clone());
        }
    }

    /// Register a read callback for `media`. One per stream.
    pub fn add_read_callback(&mut self, name: impl Into<String>, media: &Arc<SessionMedia>) -> Result<()> {
        if self
            .read_callbacks
            .iter()
            .any(|cb| Arc::ptr_eq(&cb.media, media))
        {
            return Err(SessionError::invalid_state(format!(
                "stream {} already has a read callback",
                media.position()
            )));
        }
        self.read_callbacks.push(ReadCallback {
            name: name.into(),
            media: media.clone(),
        });
        Ok(())
    }

    /// Drop streams at and after `len`, with their defaults and read callbacks
    pub fn truncate(&mut self, len: usize) {
        if self.sessions.len() <= len {
            return;
        }
        self.sessions.truncate(len);
        let kept = &self.sessions;
        self.default_session
            .retain(|_, media| kept.iter().any(|m| Arc::ptr_eq(m, media)));
        self.read_callbacks
            .retain(|cb| kept.iter().any(|m| Arc::ptr_eq(m, &cb.media)));
        for media in kept {
            self.default_session
                .entry(media.stream_type().to_string())
                .or_insert_with(|| media.clone());
        }
    }

    /// Empty the state. Streams are released, not destroyed.
    pub fn reset(&mut self) {
        self.sessions.clear();
        self.default_session.clear();
        self.read_callbacks.clear();
    }

    /// Stream types in stream order
    pub fn stream_types(&self) -> Vec<&str> {
        self.sessions.iter().map(|m| m.stream_type()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_shares_streams_and_balances_refcounts() {
        let mut active = MediaState::new();
        let audio = active.add(None, "audio", 0).unwrap();
        active.add(None, "video", 1).unwrap();
        active.add_read_callback("rtp", &audio).unwrap();

        let before = Arc::strong_count(&audio);
        let clone = active.clone();
        assert!(Arc::ptr_eq(&clone.sessions[0], &audio));
        assert_eq!(clone.read_callbacks.len(), 1);
        assert!(Arc::strong_count(&audio) > before);
        drop(clone);
        assert_eq!(Arc::strong_count(&audio), before);
    }

    #[test]
    fn add_reuses_active_stream_of_same_type() {
        let mut active = MediaState::new();
        let audio = active.add(None, "audio", 0).unwrap();
        active.add(None, "video", 1).unwrap();

        let mut pending = MediaState::new();
        let reused = pending.add(Some(&active), "audio", 0).unwrap();
        let replaced = pending.add(Some(&active), "image", 1).unwrap();

        assert!(Arc::ptr_eq(&reused, &audio));
        assert!(!Arc::ptr_eq(&replaced, &active.sessions[1]));
        assert_eq!(replaced.stream_type(), "image");
        assert!(Arc::ptr_eq(pending.default_for("audio").unwrap(), &audio));
    }

    #[test]
    fn add_is_idempotent_for_a_position() {
        let mut state = MediaState::new();
        let first = state.add(None, "audio", 0).unwrap();
        let again = state.add(None, "audio", 0).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(state.len(), 1);
        assert!(state.add(None, "audio", 5).is_err());
    }

    #[test]
    fn overwritten_stream_gives_up_its_default() {
        let mut state = MediaState::new();
        let image = state.add(None, "image", 0).unwrap();
        state.add_read_callback("udptl", &image).unwrap();
        let audio = state.add(None, "audio", 0).unwrap();

        assert_eq!(state.stream_types(), vec!["audio"]);
        assert!(state.default_for("image").is_none());
        assert!(state.read_callbacks.is_empty());
        assert!(Arc::ptr_eq(state.default_for("audio").unwrap(), &audio));
    }

    #[test]
    fn overwritten_default_falls_back_to_next_stream_of_its_type() {
        let mut state = MediaState::new();
        state.add(None, "audio", 0).unwrap();
        let second = state.add(None, "audio", 1).unwrap();
        state.add(None, "image", 0).unwrap();

        assert_eq!(state.stream_types(), vec!["image", "audio"]);
        assert!(Arc::ptr_eq(state.default_for("audio").unwrap(), &second));
        assert_eq!(state.default_for("image").unwrap().position(), 0);
    }

    #[test]
    fn reset_releases_without_touching_streams() {
        let mut state = MediaState::new();
        let audio = state.add(None, "audio", 0).unwrap();
        audio.set_locally_held(true);
        state.reset();
        assert!(state.is_empty());
        assert!(state.default_for("audio").is_none());
        assert_eq!(Arc::strong_count(&audio), 1);
        assert!(audio.is_locally_held());
    }

    #[test]
    fn duplicate_read_callback_is_rejected() {
        let mut state = MediaState::new();
        let audio = state.add(None, "audio", 0).unwrap();
        state.add_read_callback("rtp", &audio).unwrap();
        assert!(state.add_read_callback("rtp", &audio).is_err());
    }
}
