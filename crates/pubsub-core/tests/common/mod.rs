//! Shared fixtures for the pubsub-core integration tests
//!
//! A [`Harness`] wires a [`PubsubEngine`] to a recording transport and a
//! message-summary handler that records every callback it receives, the way
//! a voicemail notifier would use the engine.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rvoip_pubsub_core::summary::{MESSAGE_SUMMARY_BODY_TYPE, MESSAGE_SUMMARY_CONTENT_TYPE, MESSAGE_SUMMARY_EVENT};
use rvoip_pubsub_core::{
    MessageSummary, MessageSummaryGenerator, NewSubscribe, PubsubConfig, PubsubEngine, ResponseData,
    Subscription, SubscriptionHandler,
};
use rvoip_session_core::dialog::dialog_key;
use rvoip_session_core::sip::{Method, NameAddr, SipRequest, SipResponse, SipSender, new_branch};
use rvoip_session_core::Result;

pub const ENDPOINT: &str = "alice";
pub const MAILBOX_URI: &str = "sip:100@pbx.example.com";

/// Captures everything the engine hands to the protocol engine
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

    pub fn last_response(&self) -> Option<SipResponse> {
        self.responses.lock().last().cloned()
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

/// Message-summary handler that records its callbacks by name
pub struct MwiHandler {
    decision: Mutex<NewSubscribe>,
    summary: Mutex<MessageSummary>,
    calls: Mutex<Vec<String>>,
    notified_bodies: Mutex<Vec<String>>,
}

impl MwiHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            decision: Mutex::new(NewSubscribe::Accepted),
            summary: Mutex::new(MessageSummary::new(2, 5)),
            calls: Mutex::new(Vec::new()),
            notified_bodies: Mutex::new(Vec::new()),
        })
    }

    pub fn decide(&self, decision: NewSubscribe) {
        *self.decision.lock() = decision;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Bodies of the NOTIFYs received as a subscriber
    pub fn notified_bodies(&self) -> Vec<String> {
        self.notified_bodies.lock().clone()
    }

    fn record(&self, call: &str) {
        self.calls.lock().push(call.to_string());
    }
}

impl SubscriptionHandler for MwiHandler {
    fn event_name(&self) -> &str {
        MESSAGE_SUMMARY_EVENT
    }

    fn accept(&self) -> Vec<String> {
        vec![MESSAGE_SUMMARY_CONTENT_TYPE.to_string()]
    }

    fn body_type(&self) -> &str {
        MESSAGE_SUMMARY_BODY_TYPE
    }

    fn new_subscribe(&self, _subscription: &Arc<Subscription>, _request: &SipRequest) -> NewSubscribe {
        self.record("new_subscribe");
        *self.decision.lock()
    }

    fn subscription_established(&self, subscription: &Arc<Subscription>) {
        self.record("established");
        let data = self.summary.lock().clone().into_body_data();
        subscription.notify(Some(&data), false).expect("initial NOTIFY");
    }

    fn resubscribe(&self, _subscription: &Arc<Subscription>, _request: &SipRequest, _response: &mut ResponseData) {
        self.record("resubscribe");
    }

    fn subscription_timeout(&self, _subscription: &Arc<Subscription>) {
        self.record("timeout");
    }

    fn subscription_terminated(&self, _subscription: &Arc<Subscription>, request: Option<&SipRequest>) {
        self.record(if request.is_some() { "terminated(request)" } else { "terminated" });
    }

    fn subscription_shutdown(&self, _subscription: &Arc<Subscription>) {
        self.record("shutdown");
    }

    fn notify_response(&self, _subscription: &Arc<Subscription>, response: &SipResponse) {
        self.record(&format!("notify_response {}", response.status));
    }

    fn notify_request(&self, _subscription: &Arc<Subscription>, request: &SipRequest, _response: &mut ResponseData) {
        self.record("notify_request");
        if let Some(body) = &request.body {
            self.notified_bodies.lock().push(body.content.clone());
        }
    }

    fn refresh_subscription(&self, subscription: &Arc<Subscription>) {
        self.record("refresh");
        subscription.refresh().expect("refresh SUBSCRIBE");
    }
}

pub struct Harness {
    pub engine: Arc<PubsubEngine>,
    pub sender: Arc<RecordingSender>,
    pub handler: Arc<MwiHandler>,
}

impl Harness {
    pub fn new(config: PubsubConfig) -> Self {
        let sender = Arc::new(RecordingSender::default());
        let engine = PubsubEngine::new(config, sender.clone());
        let handler = MwiHandler::new();
        engine
            .register_subscription_handler(handler.clone())
            .expect("handler registered");
        engine
            .register_body_generator(Arc::new(MessageSummaryGenerator))
            .expect("generator registered");
        Self { engine, sender, handler }
    }

    pub fn default_config() -> Self {
        Self::new(PubsubConfig::new())
    }

    pub async fn deliver(&self, request: SipRequest) -> bool {
        self.engine
            .on_rx_request(ENDPOINT, request)
            .await
            .expect("request routed")
    }

    pub async fn deliver_response(&self, response: SipResponse) -> bool {
        self.engine
            .on_rx_response(response)
            .await
            .expect("response routed")
    }

    /// Deliver `subscribe`, expect a 200 and return the subscription it created
    pub async fn establish(&self, subscribe: SipRequest) -> Peer {
        assert!(self.deliver(subscribe.clone()).await);
        let ok = self.sender.last_response().expect("SUBSCRIBE answered");
        assert_eq!(ok.status, 200);
        let local_tag = ok.to_tag.clone().expect("to-tag");
        let subscription = self
            .engine
            .subscription(&dialog_key(&subscribe.call_id, &local_tag))
            .expect("subscription kept");
        subscription.barrier().await.expect("serializer");
        Peer {
            subscribe,
            subscription,
            local_tag,
            cseq: 1,
        }
    }
}

/// A subscriber peer of an established subscription
pub struct Peer {
    pub subscribe: SipRequest,
    pub subscription: Arc<Subscription>,
    pub local_tag: String,
    /// Last CSeq the peer used
    pub cseq: u32,
}

impl Peer {
    /// In-dialog SUBSCRIBE from the peer with the given Expires
    pub fn resubscribe(&mut self, expires: u32) -> SipRequest {
        self.cseq += 1;
        SipRequest::new(Method::Subscribe, self.subscribe.uri.clone())
            .with_call_id(self.subscribe.call_id.clone())
            .with_from(self.subscribe.from.clone(), self.subscribe.from_tag.clone())
            .with_to(self.subscribe.to.clone(), Some(self.local_tag.clone()))
            .with_cseq(self.cseq)
            .with_header("Event", MESSAGE_SUMMARY_EVENT)
            .with_header("Expires", expires.to_string())
    }
}

/// A dialog-creating SUBSCRIBE from the peer
pub fn subscribe(uri: &str, event: Option<&str>, expires: Option<u32>) -> SipRequest {
    let mut request = SipRequest::new(Method::Subscribe, uri)
        .with_from(
            NameAddr::parse("\"Alice\" <sip:alice@client.example.com>"),
            Some(format!("peer-{}", &new_branch()[7..15])),
        )
        .with_to(NameAddr::new(uri), None)
        .with_header("Contact", "<sip:alice@192.0.2.10:5060>")
        .with_cseq(1);
    if let Some(event) = event {
        request = request.with_header("Event", event);
    }
    if let Some(expires) = expires {
        request = request.with_header("Expires", expires.to_string());
    }
    request
}

pub fn mwi_subscribe(expires: u32) -> SipRequest {
    subscribe(MAILBOX_URI, Some(MESSAGE_SUMMARY_EVENT), Some(expires))
        .with_header("Accept", MESSAGE_SUMMARY_CONTENT_TYPE)
}

/// The peer's answer to a request the engine sent
pub fn answer(request: &SipRequest, status: u16) -> SipResponse {
    SipResponse::for_request(request, status).with_to_tag(Some("peer-answer".to_string()))
}

/// Give timers and queued serializer work a chance to run
pub async fn settle(subscription: &Arc<Subscription>, wait: Duration) {
    tokio::time::sleep(wait).await;
    let _ = subscription.barrier().await;
}
