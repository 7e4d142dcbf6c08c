//! MESSAGE requests received inside an established call

mod common;

use std::sync::Arc;

use common::{MockChannel, RecordingSender, ENDPOINT, EXTEN};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use rvoip_message_core::MessagingSupplement;
use rvoip_session_core::channel::Frame;
use rvoip_session_core::pbx::StaticDialplan;
use rvoip_session_core::sdp::{Connection, MediaDescription, Origin, SdpAttribute, SessionDescription};
use rvoip_session_core::sip::{Method, NameAddr, SipBody, SipRequest};
use rvoip_session_core::{
    priority, EndpointConfig, RequestDisposition, Session, SessionConfig, SessionCoordinator,
    SessionSupplement,
};

/// Binds a channel to each session on its first INVITE
struct ChannelBinder {
    refuse_frames: bool,
    channels: Mutex<Vec<Arc<MockChannel>>>,
}

impl ChannelBinder {
    fn new(refuse_frames: bool) -> Arc<Self> {
        Arc::new(Self {
            refuse_frames,
            channels: Mutex::new(Vec::new()),
        })
    }

    fn last(&self) -> Arc<MockChannel> {
        self.channels.lock().last().cloned().expect("channel bound")
    }
}

impl SessionSupplement for ChannelBinder {
    fn name(&self) -> &str {
        "channel-binder"
    }

    fn method(&self) -> Option<&str> {
        Some("INVITE")
    }

    fn priority(&self) -> i32 {
        priority::CHANNEL
    }

    fn incoming_request(&self, session: &Arc<Session>, _request: &SipRequest) -> RequestDisposition {
        if session.channel().is_none() {
            let name = format!("PJSIP/{}-{:04}", ENDPOINT, self.channels.lock().len() + 1);
            let channel = if self.refuse_frames {
                MockChannel::refusing(name)
            } else {
                MockChannel::new(name)
            };
            self.channels.lock().push(channel.clone());
            session.set_channel(channel);
        }
        RequestDisposition::Continue
    }
}

struct Call {
    coordinator: Arc<SessionCoordinator>,
    sender: Arc<RecordingSender>,
    invite: SipRequest,
    local_tag: String,
    cseq: u32,
}

impl Call {
    /// Establish a call from alice, optionally binding channels and handling MESSAGE
    async fn establish(binder: Option<Arc<ChannelBinder>>, messaging: bool) -> Self {
        let sender = Arc::new(RecordingSender::default());
        let dialplan = Arc::new(StaticDialplan::new().with_extension("default", EXTEN));
        let config = SessionConfig::new().with_endpoint(EndpointConfig::new(ENDPOINT));
        let coordinator =
            SessionCoordinator::new(config, sender.clone(), dialplan).expect("coordinator");
        if let Some(binder) = binder {
            coordinator.register_supplement(binder);
        }
        if messaging {
            coordinator.register_supplement(Arc::new(MessagingSupplement::new()));
        }

        let uri = format!("sip:{}@pbx.example.com", EXTEN);
        let mut invite = SipRequest::new(Method::Invite, uri.clone())
            .with_from(
                NameAddr::parse("\"Alice\" <sip:alice@client.example.com>"),
                Some("peer-1".to_string()),
            )
            .with_to(NameAddr::new(uri), None)
            .with_header("Contact", "<sip:alice@192.0.2.10:5060>");
        invite.sdp = Some(audio_offer());
        assert!(coordinator
            .on_rx_request(ENDPOINT, invite.clone())
            .await
            .expect("routed"));

        let session = coordinator
            .registry()
            .find(|s| s.is_peer_dialog(&invite.call_id, invite.from_tag.as_deref()))
            .expect("session created");
        session
            .push_task_synchronous(|s| s.answer(200))
            .await
            .expect("serializer")
            .expect("answered");
        let local_tag = session.invite_session().local_tag;

        let mut call = Self {
            coordinator,
            sender,
            invite,
            local_tag,
            cseq: 0,
        };
        let ack = call.request(Method::Ack, None);
        assert!(call
            .coordinator
            .on_rx_request(ENDPOINT, ack)
            .await
            .expect("routed"));
        call
    }

    fn request(&mut self, method: Method, body: Option<SipBody>) -> SipRequest {
        self.cseq += 1;
        let mut request = SipRequest::new(method, self.invite.to.uri.clone())
            .with_call_id(self.invite.call_id.clone())
            .with_from(self.invite.from.clone(), self.invite.from_tag.clone())
            .with_to(self.invite.to.clone(), Some(self.local_tag.clone()))
            .with_cseq(self.cseq);
        request.body = body;
        request
    }

    /// Send an in-dialog MESSAGE and return the final response status
    async fn message(&mut self, body: Option<SipBody>) -> u16 {
        let request = self.request(Method::Message, body);
        let cseq = request.cseq;
        assert!(self
            .coordinator
            .on_rx_request(ENDPOINT, request)
            .await
            .expect("routed"));
        self.sender
            .final_response(Method::Message, cseq)
            .expect("answered")
            .status
    }
}

fn audio_offer() -> SessionDescription {
    let stream = MediaDescription::new("audio", 4000, "RTP/AVP")
        .with_format("0")
        .with_format("8")
        .with_attribute(SdpAttribute::flag("sendrecv"));
    let mut sdp = SessionDescription::new(Origin::new("peer", 4242, 1, "192.0.2.10"), "peer")
        .with_connection(Connection::new("192.0.2.10"));
    sdp.media = vec![stream];
    sdp
}

fn text_frames(channel: &MockChannel) -> Vec<(String, String)> {
    channel
        .frames()
        .into_iter()
        .filter_map(|f| match f {
            Frame::Text { content_type, body } => Some((content_type, body)),
            _ => None,
        })
        .collect()
}

#[test_log::test(tokio::test)]
async fn text_is_queued_to_the_channel() {
    let binder = ChannelBinder::new(false);
    let mut call = Call::establish(Some(binder.clone()), true).await;

    let status = call
        .message(Some(SipBody::new("text/plain;charset=UTF-8", "are you there?")))
        .await;
    assert_eq!(status, 202);
    assert_eq!(
        call.message(Some(SipBody::new("application/im-iscomposing+xml", "<state/>")))
            .await,
        202
    );
    assert_eq!(
        text_frames(&binder.last()),
        vec![
            ("text/plain".to_string(), "are you there?".to_string()),
            ("application/im-iscomposing+xml".to_string(), "<state/>".to_string()),
        ]
    );
}

#[tokio::test]
async fn unsupported_bodies_are_refused() {
    let binder = ChannelBinder::new(false);
    let mut call = Call::establish(Some(binder.clone()), true).await;

    assert_eq!(call.message(Some(SipBody::new("image/png", "PNG"))).await, 415);
    assert_eq!(call.message(Some(SipBody::new("text/plain", ""))).await, 415);
    assert_eq!(call.message(None).await, 415);
    assert!(text_frames(&binder.last()).is_empty());
}

#[tokio::test]
async fn channel_refusing_the_frame_is_a_server_error() {
    let mut call = Call::establish(Some(ChannelBinder::new(true)), true).await;
    assert_eq!(call.message(Some(SipBody::new("text/plain", "hello"))).await, 500);
}

#[tokio::test]
async fn session_without_channel_is_not_found() {
    let mut call = Call::establish(None, true).await;
    assert_eq!(call.message(Some(SipBody::new("text/plain", "hello"))).await, 404);
}

#[tokio::test]
async fn message_is_not_implemented_without_the_supplement() {
    let mut call = Call::establish(Some(ChannelBinder::new(false)), false).await;
    assert_eq!(call.message(Some(SipBody::new("text/plain", "hello"))).await, 501);
}
