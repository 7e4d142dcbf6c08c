//! Outgoing re-INVITE/UPDATE and the delayed request queue
//!
//! A refresh that cannot go out right away (dialog not established, an
//! INVITE transaction in flight, an offer/answer exchange outstanding) is
//! parked in the session's delayed queue. The queue is drained when the
//! INVITE transaction proceeds or terminates, when an UPDATE completes, or
//! when the 491 collision timer expires.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rvoip_infra_common::schedule;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::dialog::{DialogRole, InviteState, NegotiatorState};
use crate::errors::{Result, SessionError};
use crate::media::MediaState;
use crate::session::{
    RequestCreationCallback, ResponseCallback, SdpCreationCallback, Session,
};
use crate::sip::Method;

/// Method of a delayed request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DelayedMethod {
    Invite,
    Update,
    Bye,
}

impl DelayedMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DelayedMethod::Invite => "INVITE",
            DelayedMethod::Update => "UPDATE",
            DelayedMethod::Bye => "BYE",
        }
    }
}

impl fmt::Display for DelayedMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of a session refresh
pub struct RefreshOptions {
    pub method: DelayedMethod,
    /// Generate a new offer from the pending media state
    pub generate_sdp: bool,
    /// Replaces the pending media state before the offer is built
    pub media_state: Option<MediaState>,
    pub on_request_creation: Option<RequestCreationCallback>,
    pub on_sdp_creation: Option<SdpCreationCallback>,
    pub on_response: Option<ResponseCallback>,
}

impl RefreshOptions {
    /// A re-INVITE carrying a fresh offer
    pub fn invite() -> Self {
        Self::new(DelayedMethod::Invite)
    }

    /// An UPDATE carrying a fresh offer
    pub fn update() -> Self {
        Self::new(DelayedMethod::Update)
    }

    fn new(method: DelayedMethod) -> Self {
        Self {
            method,
            generate_sdp: true,
            media_state: None,
            on_request_creation: None,
            on_sdp_creation: None,
            on_response: None,
        }
    }

    pub fn with_sdp(mut self, generate_sdp: bool) -> Self {
        self.generate_sdp = generate_sdp;
        self
    }

    pub fn with_media_state(mut self, state: MediaState) -> Self {
        self.media_state = Some(state);
        self
    }

    pub fn on_request_creation(mut self, cb: RequestCreationCallback) -> Self {
        self.on_request_creation = Some(cb);
        self
    }

    pub fn on_sdp_creation(mut self, cb: SdpCreationCallback) -> Self {
        self.on_sdp_creation = Some(cb);
        self
    }

    pub fn on_response(mut self, cb: ResponseCallback) -> Self {
        self.on_response = Some(cb);
        self
    }
}

impl fmt::Debug for RefreshOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshOptions")
            .field("method", &self.method)
            .field("generate_sdp", &self.generate_sdp)
            .field("media_state", &self.media_state.as_ref().map(|m| m.len()))
            .finish()
    }
}

/// A request waiting for the dialog to allow it
pub(crate) struct DelayedRequest {
    pub method: DelayedMethod,
    /// `None` for BYE
    pub options: Option<RefreshOptions>,
}

/// Base delay of the 491 retry timer when we own the Call-ID
const GLARE_UAC_BASE_MS: u64 = 2100;
const GLARE_SPREAD_MS: u64 = 2000;

impl Session {
    /// Send a re-INVITE or UPDATE, or queue it until the dialog allows it.
    ///
    /// A refresh on a disconnected session does nothing. An INVITE on an
    /// unconfirmed dialog with no INVITE transaction in flight is dropped.
    pub fn refresh(self: &Arc<Self>, mut options: RefreshOptions) -> Result<()> {
        if options.method == DelayedMethod::Bye {
            return Err(SessionError::other("BYE is not a refresh method"));
        }
        let (established, invite_in_flight, confirmed, negotiation_done) = {
            let inv = self.inv.lock();
            if inv.is_disconnected() {
                debug!("Session {}: refresh on a disconnected session ignored", self.id);
                return Ok(());
            }
            (
                inv.is_established(),
                inv.invite_tsx.is_some(),
                inv.state == InviteState::Confirmed,
                inv.sdp_negotiation_done(),
            )
        };

        if !established {
            self.delay_request(options.method, Some(options));
            return Ok(());
        }
        if options.method == DelayedMethod::Invite {
            if invite_in_flight {
                self.delay_request(DelayedMethod::Invite, Some(options));
                return Ok(());
            }
            if !confirmed {
                debug!("Session {}: not confirmed, dropping re-INVITE", self.id);
                return Ok(());
            }
        }

        let mut offer = None;
        if options.generate_sdp {
            if !negotiation_done {
                self.delay_request(options.method, Some(options));
                return Ok(());
            }
            if let Some(state) = options.media_state.take() {
                self.set_pending_media(state);
            }
            let previous = self.inv.lock().active_local_sdp.clone();
            let mut sdp = match self.create_local_sdp(None, previous.as_ref()) {
                Ok(sdp) => sdp,
                Err(e) => {
                    warn!("Session {}: could not create refresh offer: {}", self.id, e);
                    self.reset_pending_media();
                    return Err(e);
                }
            };
            if let Some(cb) = options.on_sdp_creation.take() {
                if let Err(e) = cb(self, &mut sdp) {
                    self.reset_pending_media();
                    return Err(e);
                }
            }
            offer = Some(sdp);
        }

        let method = match options.method {
            DelayedMethod::Update => Method::Update,
            _ => Method::Invite,
        };
        let mut request = {
            let mut inv = self.inv.lock();
            let mut request = inv.create_request(method);
            if let Some(sdp) = &offer {
                inv.pending_local_sdp = Some(sdp.clone());
                inv.negotiator = NegotiatorState::LocalOffer;
                request.sdp = Some(sdp.clone());
            }
            request
        };
        if let Some(cb) = options.on_request_creation.take() {
            if let Err(e) = cb(self, &mut request) {
                if offer.is_some() {
                    self.inv.lock().cancel_negotiation();
                    self.reset_pending_media();
                }
                return Err(e);
            }
        }
        info!("Session {}: sending {} refresh", self.id, request.method);
        self.send_request_with_cb(request, options.on_response.take())
    }

    /// Park a request. BYE goes to the head of the queue, the rest to the tail.
    pub(crate) fn delay_request(self: &Arc<Self>, method: DelayedMethod, options: Option<RefreshOptions>) {
        debug!("Session {}: delaying {}", self.id, method);
        let delayed = DelayedRequest { method, options };
        {
            let mut queue = self.delayed.lock();
            if method == DelayedMethod::Bye {
                queue.push_front(delayed);
            } else {
                queue.push_back(delayed);
            }
        }
        self.bump_stats(|s| s.requests_delayed += 1);
    }

    /// Methods currently parked, head first
    pub fn delayed_requests(&self) -> Vec<DelayedMethod> {
        self.delayed.lock().iter().map(|d| d.method).collect()
    }

    fn send_delayed_request(self: &Arc<Self>, delayed: DelayedRequest) -> Result<()> {
        debug!("Session {}: sending delayed {}", self.id, delayed.method);
        match (delayed.method, delayed.options) {
            (DelayedMethod::Bye, _) => self.terminate(0),
            (_, Some(options)) => self.refresh(options),
            (method, None) => Err(SessionError::other(format!("delayed {} without options", method))),
        }
    }

    /// Send the first delayed UPDATE, stopping at a delayed BYE
    pub(crate) fn invite_proceeding(self: &Arc<Self>) {
        let next = {
            let mut queue = self.delayed.lock();
            let mut found = None;
            for (index, delayed) in queue.iter().enumerate() {
                match delayed.method {
                    DelayedMethod::Invite => continue,
                    DelayedMethod::Update => {
                        found = Some(index);
                        break;
                    }
                    DelayedMethod::Bye => break,
                }
            }
            found.and_then(|index| queue.remove(index))
        };
        if let Some(delayed) = next {
            if let Err(e) = self.send_delayed_request(delayed) {
                warn!("Session {}: delayed UPDATE failed: {}", self.id, e);
            }
        }
    }

    /// Send the first delayed request the idle dialog allows
    pub(crate) fn invite_terminated(self: &Arc<Self>) {
        let collision_pending = self
            .collision_timer
            .lock()
            .as_ref()
            .is_some_and(|t| t.is_active());
        loop {
            let next = {
                let mut queue = self.delayed.lock();
                let index = queue.iter().position(|d| match d.method {
                    DelayedMethod::Invite => !collision_pending,
                    DelayedMethod::Update | DelayedMethod::Bye => true,
                });
                index.and_then(|i| queue.remove(i))
            };
            let Some(delayed) = next else {
                return;
            };
            match self.send_delayed_request(delayed) {
                Ok(()) => return,
                Err(e) => warn!("Session {}: delayed request failed: {}", self.id, e),
            }
        }
    }

    pub(crate) fn update_completed(self: &Arc<Self>) {
        if self.inv.lock().invite_tsx.is_some() {
            self.invite_proceeding();
        } else {
            self.invite_terminated();
        }
    }

    pub(crate) fn schedule_invite_proceeding(self: &Arc<Self>) {
        if let Err(e) = self.push_task(|s| s.invite_proceeding()) {
            debug!("Session {}: {}", self.id, e);
        }
    }

    pub(crate) fn schedule_invite_terminated(self: &Arc<Self>) {
        if let Err(e) = self.push_task(|s| s.invite_terminated()) {
            debug!("Session {}: {}", self.id, e);
        }
    }

    pub(crate) fn schedule_update_completed(self: &Arc<Self>) {
        if let Err(e) = self.push_task(|s| s.update_completed()) {
            debug!("Session {}: {}", self.id, e);
        }
    }

    /// Retry a re-INVITE the peer rejected with 491 after a random delay
    pub(crate) fn reschedule_reinvite(
        self: &Arc<Self>,
        media_state: MediaState,
        on_response: Option<ResponseCallback>,
    ) {
        let mut options = RefreshOptions::invite().with_media_state(media_state);
        options.on_response = on_response;
        self.delay_request(DelayedMethod::Invite, Some(options));

        let spread = rand::thread_rng().gen_range(0..GLARE_SPREAD_MS);
        let delay = match self.inv.lock().role {
            DialogRole::Uac => GLARE_UAC_BASE_MS + spread,
            DialogRole::Uas => spread,
        };
        info!("Session {}: 491 received, retrying re-INVITE in {} ms", self.id, delay);

        let weak = self.weak_self.clone();
        let timer = schedule(Duration::from_millis(delay), async move {
            let Some(session) = weak.upgrade() else {
                return;
            };
            if session.delayed.lock().is_empty() {
                return;
            }
            if let Err(e) = session.push_task(|s| s.invite_collision_timeout()) {
                debug!("Session {}: {}", session.id(), e);
            }
        });
        if let Some(previous) = self.collision_timer.lock().replace(timer) {
            previous.cancel();
        }
    }

    fn invite_collision_timeout(self: &Arc<Self>) {
        if self.inv.lock().invite_tsx.is_some() {
            debug!("Session {}: INVITE still in flight at collision timeout", self.id);
            return;
        }
        self.invite_terminated();
    }
}
