//! Shared fixtures for the message-core integration tests
//!
//! A [`Harness`] wires a [`MessageRouter`] and the SIP technology to a
//! recording transport, a static dialplan and a scripted dialplan runner
//! that records every message it is handed, optionally answering it with
//! `MessageSend` the way a dialplan echo would.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rvoip_infra_common::DatastoreContainer;
use rvoip_message_core::functions::find_message;
use rvoip_message_core::{
    message_read, DialplanHandler, DialplanRunner, Message, MessageConfig, MessageHandler,
    MessageRouter, MessageTech, Result, SipMessaging,
};
use rvoip_session_core::channel::{Channel, Frame};
use rvoip_session_core::pbx::StaticDialplan;
use rvoip_session_core::sip::{Method, NameAddr, SipBody, SipRequest, SipResponse, SipSender};
use rvoip_session_core::{EndpointConfig, SessionConfig};

pub const ENDPOINT: &str = "alice";
pub const TRUNK: &str = "trunk";
pub const MESSAGE_CONTEXT: &str = "texts";
pub const EXTEN: &str = "100";

/// Captures everything handed to the protocol engine
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

    pub fn last_request(&self) -> Option<SipRequest> {
        self.requests.lock().last().cloned()
    }

    pub fn last_response(&self) -> Option<SipResponse> {
        self.responses.lock().last().cloned()
    }

    /// Final response to the request with this method and CSeq
    pub fn final_response(&self, method: Method, cseq: u32) -> Option<SipResponse> {
        self.responses
            .lock()
            .iter()
            .rev()
            .find(|r| r.method == method && r.cseq == cseq && r.status >= 200)
            .cloned()
    }
}

impl SipSender for RecordingSender {
    fn send_request(&self, request: &SipRequest) -> rvoip_session_core::Result<()> {
        self.requests.lock().push(request.clone());
        Ok(())
    }

    fn send_response(&self, response: &SipResponse) -> rvoip_session_core::Result<()> {
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
    refuse_frames: bool,
}

impl MockChannel {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::build(name.into(), false)
    }

    /// A channel whose frame queue always fails
    pub fn refusing(name: impl Into<String>) -> Arc<Self> {
        Self::build(name.into(), true)
    }

    fn build(name: String, refuse_frames: bool) -> Arc<Self> {
        Arc::new(Self {
            name,
            datastores: DatastoreContainer::new(),
            frames: Mutex::new(Vec::new()),
            variables: Mutex::new(HashMap::new()),
            refuse_frames,
        })
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.frames.lock().clone()
    }
}

impl Channel for MockChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn queue_frame(&self, frame: Frame) -> rvoip_session_core::Result<()> {
        if self.refuse_frames {
            return Err(rvoip_session_core::SessionError::other("channel is hung up"));
        }
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

/// What a dialplan run saw
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub channel: String,
    pub context: String,
    pub exten: String,
    pub message: Message,
}

/// Dialplan runner that records deliveries and can echo the body back to the sender
#[derive(Default)]
pub struct ScriptedRunner {
    deliveries: Mutex<Vec<Delivery>>,
    echo: Mutex<Option<Arc<MessageRouter>>>,
    statuses: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().clone()
    }

    /// Answer every message with `MessageSend(pjsip:<from endpoint>/<from uri>)`
    pub fn echo_through(&self, router: Arc<MessageRouter>) {
        *self.echo.lock() = Some(router);
    }

    /// `MESSAGE_SEND_STATUS` after each echo
    pub fn statuses(&self) -> Vec<String> {
        self.statuses.lock().clone()
    }
}

impl DialplanRunner for ScriptedRunner {
    fn run(&self, channel: Arc<dyn Channel>, context: &str, exten: &str) -> Result<()> {
        let message = find_message(channel.as_ref())
            .expect("message attached")
            .lock()
            .clone();
        self.deliveries.lock().push(Delivery {
            channel: channel.name().to_string(),
            context: context.to_string(),
            exten: exten.to_string(),
            message: message.clone(),
        });

        let Some(router) = self.echo.lock().clone() else {
            return Ok(());
        };
        let from = message_read(channel.as_ref(), "from")?;
        let destination = format!("pjsip:{}/{}", message.endpoint, NameAddr::parse(&from).uri);
        let to = message.to.clone();
        router.message_send(channel.as_ref(), &destination, Some(&to), Some(&from));
        let status = channel
            .variable(rvoip_message_core::MESSAGE_SEND_STATUS)
            .unwrap_or_default();
        self.statuses.lock().push(status);
        Ok(())
    }
}

/// Technology that records what it was asked to send
#[derive(Default)]
pub struct LoopbackTech {
    pub sent: Mutex<Vec<(Message, String, String)>>,
    pub fail: Mutex<bool>,
}

impl MessageTech for LoopbackTech {
    fn name(&self) -> &str {
        "testmsg"
    }

    fn msg_send(&self, msg: &Message, destination: &str, from: &str) -> Result<()> {
        if *self.fail.lock() {
            return Err(rvoip_message_core::MessageError::SendFailed("loopback down".to_string()));
        }
        self.sent
            .lock()
            .push((msg.clone(), destination.to_string(), from.to_string()));
        Ok(())
    }
}

/// Handler that takes every message addressed to `testmsg:`
#[derive(Default)]
pub struct RecordingHandler {
    pub handled: Mutex<Vec<Message>>,
}

impl MessageHandler for RecordingHandler {
    fn name(&self) -> &str {
        "recording"
    }

    fn has_destination(&self, msg: &Message) -> bool {
        msg.to.starts_with("testmsg:")
    }

    fn handle_msg(&self, msg: &Message) -> Result<()> {
        self.handled.lock().push(msg.clone());
        Ok(())
    }
}

pub struct Harness {
    pub router: Arc<MessageRouter>,
    pub sip: Arc<SipMessaging>,
    pub sender: Arc<RecordingSender>,
    pub dialplan: Arc<StaticDialplan>,
    pub runner: Arc<ScriptedRunner>,
}

impl Harness {
    pub fn new(config: MessageConfig) -> Self {
        let sender = Arc::new(RecordingSender::default());
        let router = MessageRouter::new();
        let sip = SipMessaging::new(config, sessions(), sender.clone(), router.clone());
        sip.register().expect("SIP technology registered");

        let dialplan = Arc::new(StaticDialplan::new().with_extension(MESSAGE_CONTEXT, EXTEN));
        let runner = Arc::new(ScriptedRunner::default());
        router
            .register_handler(Arc::new(DialplanHandler::new(dialplan.clone(), runner.clone())))
            .expect("dialplan handler registered");
        Self {
            router,
            sip,
            sender,
            dialplan,
            runner,
        }
    }

    pub fn default_config() -> Self {
        Self::new(
            MessageConfig::new()
                .with_default_outbound_endpoint(TRUNK)
                .with_contact("bob", "sip:bob@192.0.2.20:5070"),
        )
    }

    /// Deliver an out-of-dialog request from `alice` and return the response status
    pub fn deliver(&self, request: &SipRequest) -> u16 {
        assert!(self.sip.on_rx_request(ENDPOINT, request).expect("request routed"));
        self.sender.last_response().expect("answered").status
    }
}

/// Endpoints known to the messaging layer
pub fn sessions() -> SessionConfig {
    let mut alice = EndpointConfig::new(ENDPOINT).with_message_context(MESSAGE_CONTEXT);
    alice.caller_id.self_name = Some("Alice Desk".to_string());
    let mut trunk = EndpointConfig::new(TRUNK);
    trunk.from_domain = Some("pbx.example.com".to_string());
    SessionConfig::new()
        .with_endpoint(alice)
        .with_endpoint(trunk)
        .with_endpoint(EndpointConfig::new("bob"))
}

/// An out-of-dialog MESSAGE from alice's phone
pub fn message_to(uri: &str, body: Option<SipBody>) -> SipRequest {
    let mut request = SipRequest::new(Method::Message, uri)
        .with_from(
            NameAddr::parse("\"Alice\" <sip:alice@client.example.com>"),
            Some("alice-tag".to_string()),
        )
        .with_to(NameAddr::new(uri), None)
        .with_header("X-Account", "42");
    request.body = body;
    request.source = Some("192.0.2.10:5060".parse().expect("address"));
    request
}

pub fn text(body: &str) -> Option<SipBody> {
    Some(SipBody::new("text/plain", body))
}
