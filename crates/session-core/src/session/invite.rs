//! Incoming requests and responses on a session

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::channel::ControlFrame;
use crate::config::FeaturesConfig;
use crate::dialog::{DialogRole, InviteState, InviteTransaction, NegotiatorState};
use crate::errors::{Result, SessionError};
use crate::pbx::Dialplan;
use crate::sdp::MediaDirection;
use crate::session::{ReinviteState, ResponseCallback, Session, SessionEvent};
use crate::sip::{HeaderAccess, Method, NameAddr, SipRequest, SipResponse};
use crate::supplement::{RequestDisposition, ResponsePriority};

/// Outcome of routing the request URI of a new INVITE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Found,
    Partial,
    UnsupportedUri,
    NotFound,
}

/// Where an incoming re-INVITE stands against a deferred one
enum Gate {
    Retransmission,
    Busy,
    Resumed,
    Fresh,
}

impl Session {
    /// Route the request URI of a new INVITE against the dialplan
    pub(crate) fn get_destination(
        &self,
        request: &SipRequest,
        dialplan: &dyn Dialplan,
        features: &FeaturesConfig,
    ) -> Destination {
        match request.uri_scheme().as_deref() {
            Some("sip") | Some("sips") => {}
            _ => return Destination::UnsupportedUri,
        }
        let exten = request.uri_user().filter(|u| !u.is_empty()).unwrap_or("s").to_string();
        *self.exten.lock() = Some(exten.clone());

        let context = &self.endpoint.context;
        let pickup = &features.pickup_exten;
        if exten == *pickup || dialplan.exists_extension(context, &exten) {
            return Destination::Found;
        }
        if self.endpoint.allow_overlap
            && (pickup.starts_with(&exten) || dialplan.can_match_extension(context, &exten))
        {
            return Destination::Partial;
        }
        Destination::NotFound
    }

    /// Process a dialog-creating INVITE
    pub(crate) fn handle_new_invite(
        self: &Arc<Self>,
        request: &SipRequest,
        dialplan: &dyn Dialplan,
        features: &FeaturesConfig,
    ) {
        let status = match self.get_destination(request, dialplan, features) {
            Destination::Found => None,
            Destination::Partial => Some(484),
            Destination::UnsupportedUri => Some(416),
            Destination::NotFound => Some(404),
        };
        if let Some(status) = status {
            info!(
                "Session {}: no destination for '{}', answering {}",
                self.id, request.uri, status
            );
            self.respond_to_initial(status);
            return;
        }

        self.send_stateless_response(request, 100);

        let local = match &request.sdp {
            Some(offer) => {
                if let Err(e) = self.handle_incoming_sdp(offer) {
                    warn!("Session {}: rejecting offer: {}", self.id, e);
                    self.respond_to_initial(488);
                    return;
                }
                {
                    let mut inv = self.inv.lock();
                    inv.remote_offer = Some(offer.clone());
                    inv.negotiator = NegotiatorState::RemoteOffer;
                }
                self.create_local_sdp(Some(offer), None)
            }
            None => {
                self.inv.lock().negotiator = NegotiatorState::LocalOffer;
                self.create_local_sdp(None, None)
            }
        };
        match local {
            Ok(local) => self.inv.lock().pending_local_sdp = Some(local),
            Err(e) => {
                warn!("Session {}: could not create local SDP: {}", self.id, e);
                self.respond_to_initial(500);
                return;
            }
        }

        self.run_incoming_request_supplements(request);
    }

    /// Send a final or provisional response to the initial INVITE
    fn respond_to_initial(self: &Arc<Self>, status: u16) {
        if let Err(e) = self.answer(status) {
            warn!("Session {}: failed to send {}: {}", self.id, status, e);
            self.end();
        }
    }

    /// Respond to the initial INVITE. 183 and 2xx carry the local SDP.
    pub fn answer(self: &Arc<Self>, status: u16) -> Result<()> {
        let response = {
            let inv = self.inv.lock();
            if inv.answered {
                return Err(SessionError::invalid_state("initial INVITE already answered"));
            }
            let request = inv
                .initial_invite
                .clone()
                .filter(|_| inv.role == DialogRole::Uas)
                .ok_or_else(|| SessionError::invalid_state("no incoming INVITE to answer"))?;
            let mut response = inv.create_response(&request, status);
            if status == 183 || (200..300).contains(&status) {
                response.sdp = inv.pending_local_sdp.clone();
            }
            response
        };
        self.send_response(response)?;
        if (200..300).contains(&status) {
            self.complete_local_answer();
        }
        Ok(())
    }

    /// Our answer went out: commit the negotiation
    fn complete_local_answer(self: &Arc<Self>) {
        let pair = {
            let mut inv = self.inv.lock();
            if inv.negotiator != NegotiatorState::RemoteOffer {
                None
            } else {
                match (inv.pending_local_sdp.clone(), inv.remote_offer.clone()) {
                    (Some(local), Some(remote)) => {
                        inv.complete_negotiation(local.clone(), remote.clone(), false);
                        Some((local, remote))
                    }
                    _ => None,
                }
            }
        };
        if let Some((local, remote)) = pair {
            if let Err(e) = self.handle_negotiated_sdp(&local, &remote) {
                warn!("Session {}: applying negotiated SDP failed: {}", self.id, e);
                self.reset_pending_media();
            }
        }
    }

    /// Process a request received inside the dialog
    pub fn handle_in_dialog_request(self: &Arc<Self>, request: &SipRequest) {
        if self.is_ended() {
            self.send_stateless_response(request, 481);
            return;
        }
        match request.method {
            Method::Ack => self.handle_ack(request),
            Method::Invite => self.handle_reinvite(request),
            Method::Update => self.handle_update(request),
            Method::Bye => self.handle_bye(request),
            Method::Cancel => self.handle_cancel(request),
            _ => {
                if self.run_incoming_request_supplements(request) == RequestDisposition::Continue {
                    debug!(
                        "Session {}: nothing handled {}, answering 501",
                        self.id, request.method
                    );
                    self.respond(request, 501);
                }
            }
        }
    }

    /// Answer an in-dialog request through the supplements
    pub fn respond(self: &Arc<Self>, request: &SipRequest, status: u16) {
        let response = self.inv.lock().create_response(request, status);
        if let Err(e) = self.send_response(response) {
            warn!("Session {}: failed to send {}: {}", self.id, status, e);
        }
    }

    fn handle_ack(self: &Arc<Self>, request: &SipRequest) {
        let answer = {
            let mut inv = self.inv.lock();
            let is_ours = inv
                .invite_tsx
                .as_ref()
                .is_some_and(|t| t.role == DialogRole::Uas && t.request.cseq == request.cseq);
            if !is_ours {
                debug!("Session {}: ignoring stray ACK", self.id);
                return;
            }
            inv.invite_tsx = None;
            let answer = match (&request.sdp, inv.negotiator) {
                (Some(remote), NegotiatorState::LocalOffer) => inv
                    .pending_local_sdp
                    .clone()
                    .map(|local| (local, remote.clone())),
                _ => None,
            };
            if let Some((local, remote)) = &answer {
                inv.complete_negotiation(local.clone(), remote.clone(), true);
            }
            answer
        };
        if self.invite_state() == InviteState::Connecting {
            self.set_invite_state(InviteState::Confirmed);
        }
        if let Some((local, remote)) = answer {
            if let Err(e) = self.handle_negotiated_sdp(&local, &remote) {
                warn!("Session {}: answer in ACK could not be applied: {}", self.id, e);
                self.reset_pending_media();
            }
        }
        self.schedule_invite_terminated();
    }

    fn handle_bye(self: &Arc<Self>, request: &SipRequest) {
        self.run_incoming_request_supplements(request);
        self.respond(request, 200);
        self.end();
    }

    fn handle_cancel(self: &Arc<Self>, request: &SipRequest) {
        let pending_initial = {
            let inv = self.inv.lock();
            inv.role == DialogRole::Uas
                && !inv.answered
                && inv
                    .invite_tsx
                    .as_ref()
                    .is_some_and(|t| t.request.cseq == request.cseq)
        };
        if !pending_initial {
            self.send_stateless_response(request, 481);
            return;
        }
        self.send_stateless_response(request, 200);
        self.respond_to_initial(487);
    }

    fn handle_reinvite(self: &Arc<Self>, request: &SipRequest) {
        if self.channel().is_some() {
            let gate = match &*self.reinvite.lock() {
                ReinviteState::Suspended(saved)
                    if saved.transaction_key() == request.transaction_key() =>
                {
                    Gate::Retransmission
                }
                ReinviteState::Suspended(_) => Gate::Busy,
                ReinviteState::Resumed(_) => Gate::Resumed,
                ReinviteState::Idle => Gate::Fresh,
            };
            let resumed = match gate {
                Gate::Retransmission => {
                    debug!("Session {}: ignoring retransmitted deferred re-INVITE", self.id);
                    return;
                }
                Gate::Busy => {
                    debug!("Session {}: re-INVITE while one is deferred, answering 491", self.id);
                    self.respond(request, 491);
                    return;
                }
                Gate::Resumed => true,
                Gate::Fresh => false,
            };

            match &request.sdp {
                None => self.unhold_for_offerless_reinvite(),
                Some(offer) => {
                    if self.sdp_requires_deferral(offer) {
                        info!("Session {}: deferring re-INVITE", self.id);
                        *self.reinvite.lock() = ReinviteState::Suspended(request.clone());
                        self.bump_stats(|s| s.reinvites_deferred += 1);
                        self.emit(SessionEvent::ReinviteDeferred {
                            session_id: self.id.clone(),
                        });
                        if !resumed {
                            self.send_stateless_response(request, 100);
                        }
                        return;
                    }
                }
            }
        }

        let collision = {
            let mut inv = self.inv.lock();
            match &inv.invite_tsx {
                Some(tsx) if tsx.request.transaction_key() != request.transaction_key() => true,
                _ => {
                    inv.invite_tsx = Some(InviteTransaction {
                        role: DialogRole::Uas,
                        request: request.clone(),
                        completed: false,
                    });
                    false
                }
            }
        };
        if collision {
            debug!("Session {}: INVITE transaction in progress, answering 491", self.id);
            self.respond(request, 491);
            *self.reinvite.lock() = ReinviteState::Idle;
            return;
        }

        self.process_offer_request(request);
        let mut state = self.reinvite.lock();
        if matches!(*state, ReinviteState::Resumed(_)) {
            *state = ReinviteState::Idle;
        }
    }

    /// A re-INVITE without SDP takes the call off hold
    fn unhold_for_offerless_reinvite(self: &Arc<Self>) {
        if let Some(channel) = self.channel() {
            if let Err(e) = channel.queue_control(ControlFrame::Unhold) {
                warn!("Session {}: could not queue unhold: {}", self.id, e);
            }
        }
        let mut inv = self.inv.lock();
        if let Some(local) = inv.active_local_sdp.as_mut() {
            for media in local.media.iter_mut() {
                if matches!(
                    media.direction(),
                    Some(MediaDirection::RecvOnly) | Some(MediaDirection::Inactive)
                ) {
                    media.set_direction(MediaDirection::SendRecv);
                }
            }
        }
    }

    /// Answer an INVITE or UPDATE that may carry an offer
    fn process_offer_request(self: &Arc<Self>, request: &SipRequest) {
        match &request.sdp {
            Some(offer) => {
                if let Err(e) = self.handle_incoming_sdp(offer) {
                    warn!("Session {}: rejecting offer in {}: {}", self.id, request.method, e);
                    self.inv.lock().cancel_negotiation();
                    self.respond(request, 488);
                    return;
                }
                {
                    let mut inv = self.inv.lock();
                    inv.remote_offer = Some(offer.clone());
                    inv.negotiator = NegotiatorState::RemoteOffer;
                }
                match self.create_local_sdp(Some(offer), None) {
                    Ok(answer) => self.inv.lock().pending_local_sdp = Some(answer),
                    Err(e) => {
                        warn!("Session {}: could not build answer: {}", self.id, e);
                        self.inv.lock().cancel_negotiation();
                        self.reset_pending_media();
                        self.respond(request, 500);
                        return;
                    }
                }
            }
            None if request.method == Method::Invite => {
                let mut inv = self.inv.lock();
                if let Some(mut offer) = inv.active_local_sdp.clone() {
                    offer.origin.session_version += 1;
                    inv.pending_local_sdp = Some(offer);
                    inv.negotiator = NegotiatorState::LocalOffer;
                }
            }
            None => {}
        }

        if self.run_incoming_request_supplements(request) == RequestDisposition::Handled {
            return;
        }

        let response = {
            let inv = self.inv.lock();
            let mut response = inv.create_response(request, 200);
            if matches!(inv.negotiator, NegotiatorState::RemoteOffer | NegotiatorState::LocalOffer) {
                response.sdp = inv.pending_local_sdp.clone();
            }
            response
        };
        if let Err(e) = self.send_response(response) {
            warn!("Session {}: failed to answer {}: {}", self.id, request.method, e);
            return;
        }
        self.complete_local_answer();
    }

    fn handle_update(self: &Arc<Self>, request: &SipRequest) {
        self.process_offer_request(request);
    }

    /// Bookkeeping after a response left through `send_response`
    pub(crate) fn on_response_sent(self: &Arc<Self>, response: &SipResponse) {
        if response.method != Method::Invite || response.status == 100 {
            return;
        }
        enum After {
            Nothing,
            Early,
            Connecting,
            Ended,
            TransactionDone,
        }
        let after = {
            let mut inv = self.inv.lock();
            let ours = inv
                .invite_tsx
                .as_ref()
                .is_some_and(|t| t.role == DialogRole::Uas && t.request.cseq == response.cseq);
            if !ours {
                return;
            }
            let initial = matches!(inv.state, InviteState::Incoming | InviteState::Early);
            match (initial, response.status) {
                (true, 101..=199) => After::Early,
                (true, 200..=299) => {
                    if let Some(tsx) = inv.invite_tsx.as_mut() {
                        tsx.completed = true;
                    }
                    inv.answered = true;
                    After::Connecting
                }
                (true, _) => {
                    inv.answered = true;
                    inv.invite_tsx = None;
                    After::Ended
                }
                (false, 200..=299) => {
                    if let Some(tsx) = inv.invite_tsx.as_mut() {
                        tsx.completed = true;
                    }
                    After::Nothing
                }
                (false, 300..) => {
                    inv.invite_tsx = None;
                    After::TransactionDone
                }
                (false, _) => After::Nothing,
            }
        };
        match after {
            After::Nothing => {}
            After::Early => self.set_invite_state(InviteState::Early),
            After::Connecting => self.set_invite_state(InviteState::Connecting),
            After::Ended => self.end(),
            After::TransactionDone => self.schedule_invite_terminated(),
        }
    }

    /// Bookkeeping after a request left through `send_request`
    pub(crate) fn on_request_sent(self: &Arc<Self>, request: &SipRequest) {
        match request.method {
            Method::Invite => {
                let initial = {
                    let mut inv = self.inv.lock();
                    inv.invite_tsx = Some(InviteTransaction {
                        role: DialogRole::Uac,
                        request: request.clone(),
                        completed: false,
                    });
                    if inv.state == InviteState::Null {
                        inv.initial_invite = Some(request.clone());
                        true
                    } else {
                        false
                    }
                };
                if initial {
                    self.set_invite_state(InviteState::Calling);
                }
            }
            Method::Bye => self.end(),
            _ => {}
        }
    }

    /// Place the initial INVITE of an outgoing session
    pub fn send_invite(self: &Arc<Self>) -> Result<()> {
        if self.invite_state() != InviteState::Null {
            return Err(SessionError::invalid_state("INVITE already sent"));
        }
        let offer = self.create_local_sdp(None, None)?;
        let request = {
            let mut inv = self.inv.lock();
            inv.pending_local_sdp = Some(offer.clone());
            inv.negotiator = NegotiatorState::LocalOffer;
            let contact = format!("<{}>", inv.local_uri.uri);
            inv.create_request(Method::Invite)
                .with_header("Contact", contact)
                .with_sdp(offer)
        };
        self.send_request(request)
    }

    /// Process a response to a request this session sent
    pub fn handle_response(self: &Arc<Self>, response: &SipResponse) {
        let cb = if response.is_final() {
            self.response_callbacks
                .lock()
                .remove(&(response.cseq, response.method.to_string()))
        } else {
            None
        };

        self.run_incoming_response_supplements(response, ResponsePriority::BeforeRedirecting);
        self.run_incoming_response_supplements(response, ResponsePriority::BeforeMedia);

        let cb = match response.method {
            Method::Invite => self.process_invite_response(response, cb),
            Method::Update => self.process_update_response(response, cb),
            _ => cb,
        };

        self.run_incoming_response_supplements(response, ResponsePriority::AfterMedia);

        if let Some(cb) = cb {
            cb(self, response);
        }
    }

    fn process_invite_response(
        self: &Arc<Self>,
        response: &SipResponse,
        cb: Option<ResponseCallback>,
    ) -> Option<ResponseCallback> {
        let (initial, state) = {
            let mut inv = self.inv.lock();
            let ours = inv
                .invite_tsx
                .as_ref()
                .is_some_and(|t| t.role == DialogRole::Uac && t.request.cseq == response.cseq);
            if !ours {
                debug!("Session {}: response for unknown INVITE transaction", self.id);
                return cb;
            }
            let initial = matches!(inv.state, InviteState::Calling | InviteState::Early);
            if initial && inv.remote_tag.is_none() && response.status > 100 {
                inv.remote_tag = response.to_tag.clone();
            }
            (initial, inv.state)
        };

        if response.is_provisional() {
            if response.status > 100 {
                if initial && response.to_tag.is_some() {
                    self.set_invite_state(InviteState::Early);
                }
                self.schedule_invite_proceeding();
            }
            return cb;
        }

        if response.is_success() {
            let (answer, ack) = {
                let mut inv = self.inv.lock();
                if let Some(contact) = response.header("Contact") {
                    inv.remote_target = NameAddr::parse(contact).uri;
                }
                let answer = match (&response.sdp, inv.negotiator) {
                    (Some(remote), NegotiatorState::LocalOffer) => inv
                        .pending_local_sdp
                        .clone()
                        .map(|local| (local, remote.clone())),
                    _ => None,
                };
                if let Some((local, remote)) = &answer {
                    inv.complete_negotiation(local.clone(), remote.clone(), true);
                }
                let ack = inv.create_request(Method::Ack);
                inv.invite_tsx = None;
                (answer, ack)
            };
            if let Some((local, remote)) = answer {
                if let Err(e) = self.handle_negotiated_sdp(&local, &remote) {
                    warn!("Session {}: answer could not be applied: {}", self.id, e);
                    self.reset_pending_media();
                }
            }
            if let Err(e) = self.ctx.sender.send_request(&ack) {
                warn!("Session {}: failed to send ACK: {}", self.id, e);
            }
            self.set_invite_state(InviteState::Confirmed);
            self.schedule_invite_terminated();
            return cb;
        }

        {
            let mut inv = self.inv.lock();
            inv.invite_tsx = None;
            inv.cancel_negotiation();
        }
        // A glared re-INVITE is retried with the media state it offered
        let glare = !initial && response.status == 491;
        if !glare {
            self.reset_pending_media();
        }

        if initial {
            info!(
                "Session {}: INVITE failed with {}, ending session",
                self.id, response.status
            );
            self.end();
            return cb;
        }
        if glare {
            self.reschedule_reinvite(self.pending_media(), cb);
            return None;
        }
        if state == InviteState::Confirmed && response.status != 488 {
            warn!(
                "Session {}: re-INVITE failed with {}, ending session",
                self.id, response.status
            );
            if let Err(e) = self.send_bye() {
                warn!("Session {}: failed to send BYE: {}", self.id, e);
                self.end();
            }
            return cb;
        }
        self.schedule_invite_terminated();
        cb
    }

    fn process_update_response(
        self: &Arc<Self>,
        response: &SipResponse,
        cb: Option<ResponseCallback>,
    ) -> Option<ResponseCallback> {
        if !response.is_final() {
            return cb;
        }
        let answer = {
            let mut inv = self.inv.lock();
            if response.is_success() {
                let answer = match (&response.sdp, inv.negotiator) {
                    (Some(remote), NegotiatorState::LocalOffer) => inv
                        .pending_local_sdp
                        .clone()
                        .map(|local| (local, remote.clone())),
                    _ => None,
                };
                if let Some((local, remote)) = &answer {
                    inv.complete_negotiation(local.clone(), remote.clone(), true);
                }
                answer
            } else {
                inv.cancel_negotiation();
                None
            }
        };
        match answer {
            Some((local, remote)) => {
                if let Err(e) = self.handle_negotiated_sdp(&local, &remote) {
                    warn!("Session {}: UPDATE answer could not be applied: {}", self.id, e);
                    self.reset_pending_media();
                }
            }
            None if !response.is_success() => self.reset_pending_media(),
            None => {}
        }
        self.schedule_update_completed();
        cb
    }

    /// Process a deferred re-INVITE again.
    ///
    /// Without a saved request this does nothing. Without a channel the
    /// saved request is dropped.
    pub fn resume_reinvite(self: &Arc<Self>) {
        let saved = {
            let mut state = self.reinvite.lock();
            match std::mem::take(&mut *state) {
                ReinviteState::Suspended(request) => request,
                other => {
                    *state = other;
                    return;
                }
            }
        };
        if self.channel().is_none() {
            debug!("Session {}: dropping deferred re-INVITE, no channel", self.id);
            return;
        }
        info!("Session {}: resuming deferred re-INVITE", self.id);
        *self.reinvite.lock() = ReinviteState::Resumed(saved.clone());
        self.bump_stats(|s| s.reinvites_resumed += 1);
        self.emit(SessionEvent::ReinviteResumed {
            session_id: self.id.clone(),
        });
        self.handle_in_dialog_request(&saved);
    }
}
