//! Sessions
//!
//! A [`Session`] is one INVITE dialog together with everything the session
//! layer hangs off it: the supplement snapshot taken at creation, the
//! datastores, the bound channel, the active and pending media states and
//! the serializer every dialog-mutating operation runs on.
//!
//! The implementation is split by concern:
//!
//! - [`negotiation`]: SDP offer/answer against the handler chains
//! - [`invite`]: incoming requests and responses, re-INVITE deferral
//! - [`refresh`]: outgoing re-INVITE/UPDATE and the delayed request queue
//! - [`termination`]: terminate, deferred termination and teardown

pub mod events;
mod invite;
mod negotiation;
mod refresh;
mod termination;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use rvoip_infra_common::{DatastoreContainer, Datastore, ScheduledTask, Serializer};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::{Channel, ControlFrame, FrameHook};
use crate::config::EndpointConfig;
use crate::coordinator::registry::SessionRegistry;
use crate::dialog::{InviteSession, InviteState};
use crate::errors::{Result, SessionError};
use crate::media::{MediaState, SdpHandlerRegistry};
use crate::sdp::SessionDescription;
use crate::sip::{SipRequest, SipResponse, SipSender};
use crate::supplement::{method_matches, RequestDisposition, ResponsePriority, SessionSupplement};

pub use events::SessionEvent;
pub use refresh::{DelayedMethod, RefreshOptions};

/// Unique session identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(format!("session-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// T.38 fax state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum T38State {
    #[default]
    Disabled,
    /// We sent a re-INVITE switching to T.38
    LocalReinvite,
    /// The peer asked for T.38 and the application has not answered
    PeerReinvite,
    Enabled,
    Rejected,
}

/// Progress of an incoming re-INVITE whose answer had to wait
#[derive(Debug, Clone, Default)]
pub enum ReinviteState {
    #[default]
    Idle,
    /// Waiting for whoever deferred it to call `resume_reinvite`
    Suspended(SipRequest),
    /// Being processed again after a resume
    Resumed(SipRequest),
}

/// Caller identity as learned from or presented to the peer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyId {
    pub name: Option<String>,
    pub number: Option<String>,
    pub restricted: bool,
}

/// Per-session counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub reinvites_deferred: u32,
    pub reinvites_resumed: u32,
    pub requests_delayed: u32,
}

/// Called with a request right before it is sent; an error cancels the send
pub type RequestCreationCallback =
    Box<dyn FnOnce(&Arc<Session>, &mut SipRequest) -> Result<()> + Send>;
/// Called with freshly generated local SDP; an error cancels the refresh
pub type SdpCreationCallback =
    Box<dyn FnOnce(&Arc<Session>, &mut SessionDescription) -> Result<()> + Send>;
/// Called with the final response to a request sent by the session
pub type ResponseCallback = Box<dyn FnOnce(&Arc<Session>, &SipResponse) + Send>;

/// Engine-wide collaborators shared by every session
pub struct SessionContext {
    pub sender: Arc<dyn SipSender>,
    pub sdp_handlers: Arc<SdpHandlerRegistry>,
    pub registry: Arc<SessionRegistry>,
    pub events: broadcast::Sender<SessionEvent>,
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("sessions", &self.registry.len())
            .finish()
    }
}

/// One INVITE dialog and its session-layer state
pub struct Session {
    id: SessionId,
    weak_self: Weak<Session>,
    ctx: Arc<SessionContext>,
    endpoint: Arc<EndpointConfig>,
    serializer: Serializer,
    supplements: Vec<Arc<dyn SessionSupplement>>,
    datastores: DatastoreContainer,
    channel: RwLock<Option<Arc<dyn Channel>>>,
    frame_hooks: Mutex<Vec<Arc<dyn FrameHook>>>,
    inv: Mutex<InviteSession>,
    active_media: ArcSwap<MediaState>,
    pending_media: Mutex<MediaState>,
    reinvite: Mutex<ReinviteState>,
    delayed: Mutex<VecDeque<refresh::DelayedRequest>>,
    termination: Mutex<termination::TerminationState>,
    collision_timer: Mutex<Option<ScheduledTask>>,
    response_callbacks: Mutex<HashMap<(u32, String), ResponseCallback>>,
    t38_state: Mutex<T38State>,
    party_id: Mutex<PartyId>,
    exten: Mutex<Option<String>>,
    stats: Mutex<SessionStats>,
    ended: AtomicBool,
}

impl Session {
    /// Allocate a session. Must be called inside a tokio runtime.
    pub(crate) fn alloc(
        ctx: Arc<SessionContext>,
        endpoint: Arc<EndpointConfig>,
        supplements: Vec<Arc<dyn SessionSupplement>>,
        inv: InviteSession,
    ) -> Arc<Self> {
        let id = SessionId::new();
        let serializer = Serializer::new(format!("session/{}-{}", endpoint.id, &id.0[8..16]));
        let session = Arc::new_cyclic(|weak| Session {
            id,
            weak_self: weak.clone(),
            ctx,
            endpoint,
            serializer,
            supplements,
            datastores: DatastoreContainer::new(),
            channel: RwLock::new(None),
            frame_hooks: Mutex::new(Vec::new()),
            inv: Mutex::new(inv),
            active_media: ArcSwap::from_pointee(MediaState::new()),
            pending_media: Mutex::new(MediaState::new()),
            reinvite: Mutex::new(ReinviteState::Idle),
            delayed: Mutex::new(VecDeque::new()),
            termination: Mutex::new(termination::TerminationState::default()),
            collision_timer: Mutex::new(None),
            response_callbacks: Mutex::new(HashMap::new()),
            t38_state: Mutex::new(T38State::Disabled),
            party_id: Mutex::new(PartyId::default()),
            exten: Mutex::new(None),
            stats: Mutex::new(SessionStats::default()),
            ended: AtomicBool::new(false),
        });
        info!(
            "Allocated session {} for endpoint {} with {} supplements",
            session.id,
            session.endpoint.id,
            session.supplements.len()
        );
        session.emit(SessionEvent::Created {
            session_id: session.id.clone(),
        });
        session
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn endpoint(&self) -> &Arc<EndpointConfig> {
        &self.endpoint
    }

    pub fn serializer(&self) -> &Serializer {
        &self.serializer
    }

    pub(crate) fn context(&self) -> &Arc<SessionContext> {
        &self.ctx
    }

    /// Strong handle to this session, `None` while it is being dropped
    pub fn arc(&self) -> Option<Arc<Session>> {
        self.weak_self.upgrade()
    }

    pub fn supplements(&self) -> &[Arc<dyn SessionSupplement>] {
        &self.supplements
    }

    // Datastores

    pub fn datastores(&self) -> &DatastoreContainer {
        &self.datastores
    }

    pub fn add_datastore(&self, datastore: Arc<Datastore>) -> Result<()> {
        Ok(self.datastores.add(datastore)?)
    }

    pub fn get_datastore(&self, uid: &str) -> Option<Arc<Datastore>> {
        self.datastores.find(uid)
    }

    pub fn remove_datastore(&self, uid: &str) -> Option<Arc<Datastore>> {
        self.datastores.remove(uid)
    }

    // Channel

    pub fn channel(&self) -> Option<Arc<dyn Channel>> {
        self.channel.read().clone()
    }

    /// Bind a channel. The first binding runs `session_begin` on every supplement.
    pub fn set_channel(self: &Arc<Self>, channel: Arc<dyn Channel>) {
        let first = {
            let mut slot = self.channel.write();
            let first = slot.is_none();
            *slot = Some(channel.clone());
            first
        };
        debug!("Session {} bound to channel {}", self.id, channel.name());
        if first {
            for supplement in &self.supplements {
                supplement.session_begin(self);
            }
        }
    }

    /// Swap the channel after a masquerade, fixing up channel datastores
    pub fn replace_channel(&self, channel: Arc<dyn Channel>) -> Option<Arc<dyn Channel>> {
        let old = self.channel.write().replace(channel.clone());
        if let Some(old) = &old {
            old.datastores().fixup(old.name(), channel.name());
            old.datastores().inherit_into(channel.datastores());
        }
        old
    }

    pub fn attach_frame_hook(&self, hook: Arc<dyn FrameHook>) {
        debug!("Attached frame hook '{}' to session {}", hook.name(), self.id);
        self.frame_hooks.lock().push(hook);
    }

    /// Write a control frame toward the session's channel.
    ///
    /// Frame hooks see it first; a hook that consumes it stops delivery.
    pub fn write_control(self: &Arc<Self>, control: ControlFrame) -> Result<()> {
        let hooks = self.frame_hooks.lock().clone();
        for hook in hooks {
            if hook.on_write(self, &control) {
                return Ok(());
            }
        }
        let channel = self.channel().ok_or(SessionError::NoChannel)?;
        channel.queue_control(control)
    }

    // State

    pub fn invite_state(&self) -> InviteState {
        self.inv.lock().state
    }

    pub fn is_disconnected(&self) -> bool {
        self.inv.lock().is_disconnected()
    }

    /// Copy of the invite dialog model
    pub fn invite_session(&self) -> InviteSession {
        self.inv.lock().clone()
    }

    /// True when the peer's messages carry this Call-ID and From tag
    pub fn is_peer_dialog(&self, call_id: &str, remote_tag: Option<&str>) -> bool {
        let inv = self.inv.lock();
        inv.call_id == call_id && inv.remote_tag.as_deref() == remote_tag
    }

    pub(crate) fn set_invite_state(&self, state: InviteState) {
        {
            let mut inv = self.inv.lock();
            if inv.state == state {
                return;
            }
            debug!("Session {} state {} -> {}", self.id, inv.state, state);
            inv.state = state;
        }
        self.emit(SessionEvent::StateChanged {
            session_id: self.id.clone(),
            state,
        });
    }

    pub fn t38_state(&self) -> T38State {
        *self.t38_state.lock()
    }

    /// Record a T.38 state change. Returns the previous state.
    pub fn set_t38_state(&self, state: T38State) -> T38State {
        let previous = std::mem::replace(&mut *self.t38_state.lock(), state);
        if previous != state {
            info!("Session {} T.38 state {:?} -> {:?}", self.id, previous, state);
            self.emit(SessionEvent::T38StateChanged {
                session_id: self.id.clone(),
                from: previous,
                to: state,
            });
        }
        previous
    }

    pub fn party_id(&self) -> PartyId {
        self.party_id.lock().clone()
    }

    pub fn set_party_id(&self, id: PartyId) {
        *self.party_id.lock() = id;
    }

    /// Dialplan extension the session was routed to
    pub fn exten(&self) -> Option<String> {
        self.exten.lock().clone()
    }

    pub fn stats(&self) -> SessionStats {
        *self.stats.lock()
    }

    pub fn reinvite_state(&self) -> ReinviteState {
        self.reinvite.lock().clone()
    }

    // Media

    /// Snapshot of the active media state
    pub fn active_media(&self) -> Arc<MediaState> {
        self.active_media.load_full()
    }

    /// Copy of the pending media state
    pub fn pending_media(&self) -> MediaState {
        self.pending_media.lock().clone()
    }

    /// Replace the pending media state
    pub fn set_pending_media(&self, state: MediaState) {
        *self.pending_media.lock() = state;
    }

    /// Modify the pending media state in place. Do not call handlers from `f`.
    pub fn update_pending_media<R>(&self, f: impl FnOnce(&mut MediaState) -> R) -> R {
        f(&mut self.pending_media.lock())
    }

    pub fn reset_pending_media(&self) {
        self.pending_media.lock().reset();
    }

    fn take_pending_media(&self) -> MediaState {
        std::mem::take(&mut *self.pending_media.lock())
    }

    fn put_pending_media(&self, state: MediaState) {
        *self.pending_media.lock() = state;
    }

    // Tasks

    /// Queue work on the session serializer
    pub fn push_task<F>(self: &Arc<Self>, task: F) -> Result<()>
    where
        F: FnOnce(&Arc<Session>) + Send + 'static,
    {
        let session = self.clone();
        Ok(self.serializer.push_task(async move { task(&session) })?)
    }

    /// Run work on the serializer and wait for its result
    pub async fn push_task_synchronous<F, T>(self: &Arc<Self>, task: F) -> Result<T>
    where
        F: FnOnce(&Arc<Session>) -> T + Send + 'static,
        T: Send + 'static,
    {
        let session = self.clone();
        Ok(self
            .serializer
            .push_task_synchronous(async move { task(&session) })
            .await?)
    }

    /// Wait until everything queued so far has run
    pub async fn barrier(self: &Arc<Self>) -> Result<()> {
        self.push_task_synchronous(|_| ()).await
    }

    /// Hold the serializer so nothing else runs on it until the suspension is released
    pub async fn suspend(&self) -> Result<rvoip_infra_common::Suspension> {
        debug!("Suspending session {}", self.id);
        Ok(self.serializer.suspend().await?)
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        let _ = self.ctx.events.send(event);
    }

    pub(crate) fn bump_stats(&self, update: impl FnOnce(&mut SessionStats)) {
        update(&mut self.stats.lock());
    }

    // Supplement dispatch

    pub(crate) fn run_incoming_request_supplements(
        self: &Arc<Self>,
        request: &SipRequest,
    ) -> RequestDisposition {
        for supplement in &self.supplements {
            if !method_matches(supplement.method(), &request.method) {
                continue;
            }
            if supplement.incoming_request(self, request) == RequestDisposition::Handled {
                debug!(
                    "Supplement '{}' handled {} on session {}",
                    supplement.name(),
                    request.method,
                    self.id
                );
                return RequestDisposition::Handled;
            }
        }
        RequestDisposition::Continue
    }

    pub(crate) fn run_incoming_response_supplements(
        self: &Arc<Self>,
        response: &SipResponse,
        phase: ResponsePriority,
    ) {
        for supplement in &self.supplements {
            if supplement.response_priority() != phase
                || !method_matches(supplement.method(), &response.method)
            {
                continue;
            }
            supplement.incoming_response(self, response);
        }
    }

    fn run_outgoing_request_supplements(self: &Arc<Self>, request: &mut SipRequest) {
        for supplement in &self.supplements {
            if method_matches(supplement.method(), &request.method) {
                supplement.outgoing_request(self, request);
            }
        }
    }

    fn run_outgoing_response_supplements(self: &Arc<Self>, response: &mut SipResponse) {
        for supplement in &self.supplements {
            if method_matches(supplement.method(), &response.method) {
                supplement.outgoing_response(self, response);
            }
        }
    }

    // Transmission

    /// Send a request on the dialog
    pub fn send_request(self: &Arc<Self>, request: SipRequest) -> Result<()> {
        self.send_request_with_cb(request, None)
    }

    /// Send a request; `on_response` runs with its final response
    pub fn send_request_with_cb(
        self: &Arc<Self>,
        mut request: SipRequest,
        on_response: Option<ResponseCallback>,
    ) -> Result<()> {
        self.run_outgoing_request_supplements(&mut request);
        if let Some(sdp) = request.sdp.as_mut() {
            self.change_outgoing_media_addresses(sdp);
        }
        if let Some(cb) = on_response {
            self.response_callbacks
                .lock()
                .insert((request.cseq, request.method.to_string()), cb);
        }
        debug!("Session {} sending {} (CSeq {})", self.id, request.method, request.cseq);
        self.ctx.sender.send_request(&request)?;
        self.on_request_sent(&request);
        Ok(())
    }

    /// Send a response on the dialog
    pub fn send_response(self: &Arc<Self>, mut response: SipResponse) -> Result<()> {
        self.run_outgoing_response_supplements(&mut response);
        if let Some(sdp) = response.sdp.as_mut() {
            self.change_outgoing_media_addresses(sdp);
        }
        debug!(
            "Session {} sending {} response to {}",
            self.id, response.status, response.method
        );
        self.ctx.sender.send_response(&response)?;
        self.on_response_sent(&response);
        Ok(())
    }

    /// Answer a request without involving supplements or dialog state
    pub(crate) fn send_stateless_response(&self, request: &SipRequest, status: u16) {
        let response = self.inv.lock().create_response(request, status);
        if let Err(e) = self.ctx.sender.send_response(&response) {
            warn!("Session {} failed to send {}: {}", self.id, status, e);
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint.id)
            .field("state", &self.inv.lock().state)
            .field("t38_state", &self.t38_state())
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        debug!("Destroying session {}", self.id);
        for supplement in &self.supplements {
            supplement.session_destroy(self);
        }
        if !self.ended.load(Ordering::SeqCst) {
            debug!("Session {} dropped without ending", self.id);
        }
    }
}
