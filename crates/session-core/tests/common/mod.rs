//! Shared fixtures for the session-core integration tests
//!
//! A [`Harness`] wires a [`SessionCoordinator`] to a recording transport, a
//! small static dialplan and a supplement that binds a [`MockChannel`] to
//! every incoming INVITE session, the way a PBX channel driver would.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rvoip_infra_common::DatastoreContainer;
use rvoip_session_core::channel::{Channel, ControlFrame, Frame, T38Request};
use rvoip_session_core::pbx::StaticDialplan;
use rvoip_session_core::sdp::{Connection, MediaDescription, Origin, SdpAttribute, SessionDescription};
use rvoip_session_core::session::SessionEvent;
use rvoip_session_core::sip::{Method, NameAddr, SipRequest, SipResponse, SipSender, new_branch};
use rvoip_session_core::{
    priority, EndpointConfig, RequestDisposition, Result, Session, SessionConfig,
    SessionCoordinator, SessionSupplement,
};
use tokio::sync::broadcast;

pub const ENDPOINT: &str = "alice";
pub const EXTEN: &str = "100";
pub const PEER_ADDRESS: &str = "192.0.2.10";

/// Captures everything the session layer hands to the protocol engine
#[derive(Debug, Default)]
pub struct RecordingSender {
    requests: Mutex<Vec<SipRequest>>,
    responses: Mutex<Vec<SipResponse>>,
}

impl RecordingSender {
    pub fn requests(&self) -> Vec<SipRequest> {
        self.requests.lock().clone()
    }

    pub fn responses(&self) -> Vec<SipResponse> {
        self.responses.lock().clone()
    }

    pub fn requests_with(&self, method: Method) -> Vec<SipRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.method == method)
            .cloned()
            .collect()
    }

    pub fn last_request(&self) -> Option<SipRequest> {
        self.requests.lock().last().cloned()
    }

    /// Responses with this status, in sending order
    pub fn responses_with(&self, status: u16) -> Vec<SipResponse> {
        self.responses
            .lock()
            .iter()
            .filter(|r| r.status == status)
            .cloned()
            .collect()
    }

    /// Final responses to the request with this CSeq and method
    pub fn final_response(&self, method: Method, cseq: u32) -> Option<SipResponse> {
        self.responses
            .lock()
            .iter()
            .rev()
            .find(|r| r.method == method && r.cseq == cseq && r.is_final())
            .cloned()
    }

    pub fn clear(&self) {
        self.requests.lock().clear();
        self.responses.lock().clear();
    }
}

impl SipSender for RecordingSender {
    fn send_request(&self, request: &SipRequest) -> Result<()> {
        self.requests.lock().push(request.clone());
        Ok(())
    }

    fn send_response(&self, response: &SipResponse) -> Result<()> {
        self.responses.lock().push(response.clone());
        Ok(())
    }
}

/// Channel that records the frames queued toward it
pub struct MockChannel {
    name: String,
    datastores: DatastoreContainer,
    frames: Mutex<Vec<Frame>>,
    variables: Mutex<HashMap<String, String>>,
}

impl MockChannel {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            datastores: DatastoreContainer::new(),
            frames: Mutex::new(Vec::new()),
            variables: Mutex::new(HashMap::new()),
        })
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.frames.lock().clone()
    }

    pub fn controls(&self) -> Vec<ControlFrame> {
        self.frames
            .lock()
            .iter()
            .filter_map(|f| match f {
                Frame::Control(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    /// The T.38 requests and replies queued to the channel, in order
    pub fn t38_requests(&self) -> Vec<T38Request> {
        self.controls()
            .into_iter()
            .filter_map(|c| match c {
                ControlFrame::T38Parameters(p) => Some(p.request_response),
                _ => None,
            })
            .collect()
    }
}

impl Channel for MockChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn queue_frame(&self, frame: Frame) -> Result<()> {
        self.frames.lock().push(frame);
        Ok(())
    }

    fn datastores(&self) -> &DatastoreContainer {
        &self.datastores
    }

    fn set_variable(&self, name: &str, value: &str) {
        self.variables.lock().insert(name.to_string(), value.to_string());
    }

    fn variable(&self, name: &str) -> Option<String> {
        self.variables.lock().get(name).cloned()
    }
}

/// Binds a new [`MockChannel`] to each session on its first INVITE
#[derive(Default)]
pub struct ChannelDriver {
    channels: Mutex<Vec<Arc<MockChannel>>>,
}

impl ChannelDriver {
    pub fn last(&self) -> Option<Arc<MockChannel>> {
        self.channels.lock().last().cloned()
    }

    pub fn count(&self) -> usize {
        self.channels.lock().len()
    }
}

impl SessionSupplement for ChannelDriver {
    fn name(&self) -> &str {
        "channel-driver"
    }

    fn method(&self) -> Option<&str> {
        Some("INVITE")
    }

    fn priority(&self) -> i32 {
        priority::CHANNEL
    }

    fn incoming_request(&self, session: &Arc<Session>, _request: &SipRequest) -> RequestDisposition {
        if session.channel().is_none() {
            let channel = MockChannel::new(format!("PJSIP/{}-{:04}", ENDPOINT, self.count() + 1));
            self.channels.lock().push(channel.clone());
            session.set_channel(channel);
        }
        RequestDisposition::Continue
    }
}

pub struct Harness {
    pub coordinator: Arc<SessionCoordinator>,
    pub sender: Arc<RecordingSender>,
    pub driver: Arc<ChannelDriver>,
    pub dialplan: Arc<StaticDialplan>,
}

impl Harness {
    pub fn new(endpoint: EndpointConfig) -> Self {
        let sender = Arc::new(RecordingSender::default());
        let dialplan = Arc::new(StaticDialplan::new().with_extension("default", EXTEN));
        let config = SessionConfig::new().with_endpoint(endpoint);
        let coordinator = SessionCoordinator::new(config, sender.clone(), dialplan.clone())
            .expect("coordinator");
        let driver = Arc::new(ChannelDriver::default());
        coordinator.register_supplement(driver.clone());
        Self {
            coordinator,
            sender,
            driver,
            dialplan,
        }
    }

    pub fn default_endpoint() -> Self {
        Self::new(EndpointConfig::new(ENDPOINT))
    }

    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.coordinator.subscribe_events()
    }

    pub async fn deliver(&self, request: SipRequest) -> bool {
        self.coordinator
            .on_rx_request(ENDPOINT, request)
            .await
            .expect("request routed")
    }

    pub async fn deliver_response(&self, response: SipResponse) -> bool {
        self.coordinator
            .on_rx_response(response)
            .await
            .expect("response routed")
    }

    /// The session created for the peer's INVITE
    pub fn session_for(&self, invite: &SipRequest) -> Option<Arc<Session>> {
        self.coordinator
            .registry()
            .find(|s| s.is_peer_dialog(&invite.call_id, invite.from_tag.as_deref()))
    }

    /// Deliver `invite`, answer it with 200 and ACK it
    pub async fn establish(&self, invite: SipRequest) -> Call {
        assert!(self.deliver(invite.clone()).await);
        let session = self.session_for(&invite).expect("session created");
        session
            .push_task_synchronous(|s| s.answer(200))
            .await
            .expect("serializer")
            .expect("answered");
        let local_tag = session.invite_session().local_tag;
        let call = Call {
            invite,
            session,
            local_tag,
            cseq: 1,
        };
        let ack = call.ack(1);
        assert!(self.deliver(ack).await);
        call
    }
}

/// An established call from the peer's point of view
pub struct Call {
    pub invite: SipRequest,
    pub session: Arc<Session>,
    pub local_tag: String,
    /// Last CSeq the peer used
    pub cseq: u32,
}

impl Call {
    /// A new in-dialog request from the peer
    pub fn request(&mut self, method: Method) -> SipRequest {
        self.cseq += 1;
        in_dialog(&self.invite, method, &self.local_tag, self.cseq)
    }

    pub fn ack(&self, cseq: u32) -> SipRequest {
        in_dialog(&self.invite, Method::Ack, &self.local_tag, cseq)
    }

    /// A peer response to a request the session sent
    pub fn respond(&self, request: &SipRequest, status: u16, sdp: Option<SessionDescription>) -> SipResponse {
        let mut response = SipResponse::for_request(request, status);
        response.sdp = sdp;
        response
    }
}

pub fn peer_origin() -> Origin {
    Origin::new("peer", 4242, 1, PEER_ADDRESS)
}

pub fn audio_stream(port: u16, formats: &[&str]) -> MediaDescription {
    let mut stream = MediaDescription::new("audio", port, "RTP/AVP");
    for format in formats {
        stream = stream.with_format(*format);
    }
    stream.with_attribute(SdpAttribute::flag("sendrecv"))
}

pub fn image_stream(port: u16) -> MediaDescription {
    MediaDescription::new("image", port, "udptl")
        .with_format("t38")
        .with_attribute(SdpAttribute::value("T38FaxVersion", "0"))
        .with_attribute(SdpAttribute::value("T38MaxBitRate", "14400"))
        .with_attribute(SdpAttribute::value("T38FaxRateManagement", "transferredTCF"))
        .with_attribute(SdpAttribute::value("T38FaxMaxDatagram", "400"))
        .with_attribute(SdpAttribute::flag("T38FaxFillBitRemoval"))
}

pub fn sdp_with(streams: Vec<MediaDescription>) -> SessionDescription {
    let mut sdp = SessionDescription::new(peer_origin(), "peer")
        .with_connection(Connection::new(PEER_ADDRESS));
    sdp.media = streams;
    sdp
}

/// Plain PCMU/PCMA audio offer
pub fn audio_offer() -> SessionDescription {
    sdp_with(vec![audio_stream(4000, &["0", "8"])])
}

/// Audio plus a T.38 image stream
pub fn t38_offer() -> SessionDescription {
    sdp_with(vec![audio_stream(4000, &["0", "8"]), image_stream(4002)])
}

/// A dialog-creating INVITE from the peer
pub fn invite(uri: &str, sdp: Option<SessionDescription>) -> SipRequest {
    let mut request = SipRequest::new(Method::Invite, uri)
        .with_from(
            NameAddr::parse("\"Alice\" <sip:alice@client.example.com>"),
            Some(format!("peer-{}", &new_branch()[7..15])),
        )
        .with_to(NameAddr::new(uri), None)
        .with_header("Contact", "<sip:alice@192.0.2.10:5060>")
        .with_cseq(1);
    request.sdp = sdp;
    request
}

pub fn invite_to_exten(sdp: Option<SessionDescription>) -> SipRequest {
    invite(&format!("sip:{}@pbx.example.com", EXTEN), sdp)
}

/// An in-dialog request the peer sends on the dialog `initial` created
pub fn in_dialog(initial: &SipRequest, method: Method, local_tag: &str, cseq: u32) -> SipRequest {
    SipRequest::new(method, initial.to.uri.clone())
        .with_call_id(initial.call_id.clone())
        .with_from(initial.from.clone(), initial.from_tag.clone())
        .with_to(initial.to.clone(), Some(local_tag.to_string()))
        .with_cseq(cseq)
}

/// Drain every event published so far
pub fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Give timers and queued serializer work a chance to run
pub async fn settle(session: &Arc<Session>, wait: Duration) {
    tokio::time::sleep(wait).await;
    session.barrier().await.expect("serializer");
}
