//! Invite dialog model
//!
//! The session layer's view of the INVITE usage of a dialog: call state,
//! offer/answer negotiator state, the INVITE transaction in flight and the
//! SDP currently in effect on each side. The protocol engine owns the actual
//! transactions; this model tracks what the session needs to make decisions.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::sdp::SessionDescription;
use crate::sip::{new_branch, new_tag, HeaderAccess, Method, NameAddr, SipRequest, SipResponse};

/// Call state of the invite session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InviteState {
    /// Nothing sent or received yet
    Null,
    /// We sent the initial INVITE
    Calling,
    /// We received the initial INVITE
    Incoming,
    /// Provisional response with a tag exchanged
    Early,
    /// 2xx exchanged, waiting for the ACK
    Connecting,
    Confirmed,
    Disconnected,
}

impl fmt::Display for InviteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InviteState::Null => "NULL",
            InviteState::Calling => "CALLING",
            InviteState::Incoming => "INCOMING",
            InviteState::Early => "EARLY",
            InviteState::Connecting => "CONNECTING",
            InviteState::Confirmed => "CONFIRMED",
            InviteState::Disconnected => "DISCONNECTED",
        };
        f.write_str(name)
    }
}

/// Offer/answer negotiator state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NegotiatorState {
    /// No SDP exchanged yet
    Null,
    /// We sent an offer and wait for the answer
    LocalOffer,
    /// We received an offer and owe an answer
    RemoteOffer,
    Done,
}

/// Which side created the dialog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DialogRole {
    Uac,
    Uas,
}

/// INVITE transaction currently in flight
#[derive(Debug, Clone)]
pub struct InviteTransaction {
    pub role: DialogRole,
    pub request: SipRequest,
    /// A final response was sent or received
    pub completed: bool,
}

impl InviteTransaction {
    pub fn key(&self) -> String {
        self.request.transaction_key()
    }
}

/// INVITE usage state of one dialog
#[derive(Debug, Clone)]
pub struct InviteSession {
    pub state: InviteState,
    pub role: DialogRole,
    pub negotiator: NegotiatorState,
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: Option<String>,
    pub local_uri: NameAddr,
    pub remote_uri: NameAddr,
    /// Request URI for in-dialog requests
    pub remote_target: String,
    pub local_cseq: u32,
    pub invite_tsx: Option<InviteTransaction>,
    /// The request that created the dialog
    pub initial_invite: Option<SipRequest>,
    /// A final response to the initial INVITE was sent (UAS)
    pub answered: bool,
    pub active_local_sdp: Option<SessionDescription>,
    pub active_remote_sdp: Option<SessionDescription>,
    /// Our offer awaiting an answer, or our answer to `remote_offer`
    pub pending_local_sdp: Option<SessionDescription>,
    /// Offer received and not answered yet
    pub remote_offer: Option<SessionDescription>,
    /// The last completed negotiation had its answer from the peer
    pub answer_was_remote: bool,
}

impl InviteSession {
    /// Dialog for a received initial INVITE
    pub fn incoming(request: &SipRequest) -> Self {
        Self {
            state: InviteState::Incoming,
            role: DialogRole::Uas,
            negotiator: NegotiatorState::Null,
            call_id: request.call_id.clone(),
            local_tag: new_tag(),
            remote_tag: request.from_tag.clone(),
            local_uri: request.to.clone(),
            remote_uri: request.from.clone(),
            remote_target: request
                .header("Contact")
                .map(|c| NameAddr::parse(c).uri)
                .unwrap_or_else(|| request.from.uri.clone()),
            local_cseq: 0,
            invite_tsx: Some(InviteTransaction {
                role: DialogRole::Uas,
                request: request.clone(),
                completed: false,
            }),
            initial_invite: Some(request.clone()),
            answered: false,
            active_local_sdp: None,
            active_remote_sdp: None,
            pending_local_sdp: None,
            remote_offer: None,
            answer_was_remote: false,
        }
    }

    /// Dialog for a call we are about to place
    pub fn outgoing(local_uri: NameAddr, remote_uri: NameAddr) -> Self {
        Self {
            state: InviteState::Null,
            role: DialogRole::Uac,
            negotiator: NegotiatorState::Null,
            call_id: uuid::Uuid::new_v4().to_string(),
            local_tag: new_tag(),
            remote_tag: None,
            remote_target: remote_uri.uri.clone(),
            local_uri,
            remote_uri,
            local_cseq: 0,
            invite_tsx: None,
            initial_invite: None,
            answered: false,
            active_local_sdp: None,
            active_remote_sdp: None,
            pending_local_sdp: None,
            remote_offer: None,
            answer_was_remote: false,
        }
    }

    /// Key the engine uses to route in-dialog messages to the session
    pub fn dialog_key(&self) -> String {
        dialog_key(&self.call_id, &self.local_tag)
    }

    /// Both tags are known and the call has not ended
    pub fn is_established(&self) -> bool {
        self.remote_tag.is_some()
            && matches!(
                self.state,
                InviteState::Early | InviteState::Connecting | InviteState::Confirmed
            )
    }

    /// No offer/answer exchange is outstanding
    pub fn sdp_negotiation_done(&self) -> bool {
        matches!(self.negotiator, NegotiatorState::Null | NegotiatorState::Done)
    }

    pub fn is_disconnected(&self) -> bool {
        self.state == InviteState::Disconnected
    }

    /// Build an in-dialog request with the next CSeq
    pub fn create_request(&mut self, method: Method) -> SipRequest {
        let cseq = match method {
            Method::Ack | Method::Cancel => self
                .invite_tsx
                .as_ref()
                .map(|t| t.request.cseq)
                .unwrap_or(self.local_cseq),
            _ => {
                self.local_cseq += 1;
                self.local_cseq
            }
        };
        let branch = match (&method, &self.invite_tsx) {
            (Method::Cancel, Some(tsx)) => tsx.request.via_branch.clone(),
            _ => new_branch(),
        };
        SipRequest::new(method, self.remote_target.clone())
            .with_call_id(self.call_id.clone())
            .with_from(self.local_uri.clone(), Some(self.local_tag.clone()))
            .with_to(self.remote_uri.clone(), self.remote_tag.clone())
            .with_cseq(cseq)
            .with_branch(branch)
    }

    /// Build a response to a request received on this dialog
    pub fn create_response(&self, request: &SipRequest, status: u16) -> SipResponse {
        let mut response = SipResponse::for_request(request, status);
        if status > 100 {
            response = response.with_to_tag(Some(self.local_tag.clone()));
        }
        response
    }

    /// Record a completed offer/answer exchange
    pub fn complete_negotiation(
        &mut self,
        local: SessionDescription,
        remote: SessionDescription,
        answer_was_remote: bool,
    ) {
        self.active_local_sdp = Some(local);
        self.active_remote_sdp = Some(remote);
        self.pending_local_sdp = None;
        self.remote_offer = None;
        self.answer_was_remote = answer_was_remote;
        self.negotiator = NegotiatorState::Done;
    }

    /// Drop an unfinished exchange, keeping what was last agreed
    pub fn cancel_negotiation(&mut self) {
        self.pending_local_sdp = None;
        self.remote_offer = None;
        self.negotiator = if self.active_local_sdp.is_some() {
            NegotiatorState::Done
        } else {
            NegotiatorState::Null
        };
    }
}

pub fn dialog_key(call_id: &str, local_tag: &str) -> String {
    format!("{};{}", call_id, local_tag)
}
