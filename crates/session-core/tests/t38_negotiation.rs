//! T.38 fax negotiation
//!
//! Peer-initiated switches are deferred until the application answers
//! through a `T38Parameters` control frame or the auto-reject timer fires.
//! Local switches re-INVITE the peer onto a single image stream.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use pretty_assertions::assert_eq;
use rvoip_session_core::channel::{ControlFrame, T38Parameters, T38Request};
use rvoip_session_core::config::T38Config;
use rvoip_session_core::session::SessionEvent;
use rvoip_session_core::sip::Method;
use rvoip_session_core::t38;
use rvoip_session_core::{EndpointConfig, ReinviteState, SessionSupplement, T38State};

fn t38_harness(timeout: Duration) -> (Harness, Arc<dyn SessionSupplement>) {
    let endpoint = EndpointConfig::new(ENDPOINT)
        .with_t38(T38Config::enabled().with_auto_reject_timeout(timeout));
    let h = Harness::new(endpoint);
    let supplement = t38::load(&h.coordinator).expect("t38 loaded");
    (h, supplement)
}

fn request(kind: T38Request) -> ControlFrame {
    ControlFrame::T38Parameters(T38Parameters::default().with_request(kind))
}

#[tokio::test]
async fn peer_reinvite_is_deferred_until_accepted() {
    let (h, _t38) = t38_harness(Duration::from_secs(30));
    let mut call = h.establish(invite_to_exten(Some(audio_offer()))).await;
    let channel = h.driver.last().unwrap();
    let session = call.session.clone();

    let mut reinvite = call.request(Method::Invite);
    reinvite.sdp = Some(t38_offer());
    assert!(h.deliver(reinvite.clone()).await);

    assert_eq!(session.t38_state(), T38State::PeerReinvite);
    assert!(matches!(session.reinvite_state(), ReinviteState::Suspended(_)));
    assert!(h.sender.final_response(Method::Invite, reinvite.cseq).is_none());
    assert_eq!(channel.t38_requests(), vec![T38Request::RequestNegotiate]);
    let offered = t38::their_parameters(&session).unwrap();
    assert!(offered.fill_bit_removal);
    assert_eq!(offered.rate, 14400);

    session
        .write_control(request(T38Request::Negotiated))
        .expect("frame hook");
    session.barrier().await.unwrap();

    assert_eq!(session.t38_state(), T38State::Enabled);
    assert_eq!(t38::auto_reject_cancels(&session), 1);
    assert_eq!(
        channel.t38_requests(),
        vec![T38Request::RequestNegotiate, T38Request::Negotiated]
    );
    let ours = t38::our_parameters(&session).unwrap();
    assert!(!ours.fill_bit_removal);

    let ok = h.sender.final_response(Method::Invite, reinvite.cseq).unwrap();
    assert_eq!(ok.status, 200);
    let answer = ok.sdp.unwrap();
    let types: Vec<&str> = answer.media.iter().map(|m| m.media.as_str()).collect();
    assert_eq!(types, vec!["audio", "image"]);
    let image = &answer.media[1];
    assert_ne!(image.port, 0);
    assert_eq!(image.protocol, "udptl");
    assert_eq!(image.attribute_value("T38FaxVersion"), Some("0"));
    assert_eq!(image.attribute_value("T38FaxRateManagement"), Some("transferredTCF"));
    assert!(!image.has_attribute("T38FaxFillBitRemoval"));
    assert_eq!(session.active_media().stream_types(), vec!["audio", "image"]);
}

#[tokio::test]
async fn peer_reinvite_is_rejected_when_the_timer_fires() {
    let (h, _t38) = t38_harness(Duration::from_millis(50));
    let mut call = h.establish(invite_to_exten(Some(audio_offer()))).await;
    let channel = h.driver.last().unwrap();
    let session = call.session.clone();
    let mut events = h.events();

    let mut reinvite = call.request(Method::Invite);
    reinvite.sdp = Some(t38_offer());
    assert!(h.deliver(reinvite.clone()).await);
    assert_eq!(session.t38_state(), T38State::PeerReinvite);

    settle(&session, Duration::from_millis(300)).await;

    let ok = h.sender.final_response(Method::Invite, reinvite.cseq).unwrap();
    assert_eq!(ok.status, 200);
    let answer = ok.sdp.unwrap();
    assert_eq!(answer.media.len(), 2);
    assert_ne!(answer.media[0].port, 0);
    assert_eq!(answer.media[1].media, "image");
    assert_eq!(answer.media[1].port, 0);

    assert_eq!(session.t38_state(), T38State::Disabled);
    assert_eq!(t38::auto_reject_cancels(&session), 0);
    assert_eq!(channel.t38_requests(), vec![T38Request::RequestNegotiate]);

    assert_eq!(session.stats().reinvites_resumed, 1);
    let events = drain(&mut events);
    let resumed = events
        .iter()
        .filter(|e| matches!(e, SessionEvent::ReinviteResumed { .. }))
        .count();
    assert_eq!(resumed, 1);

    let transitions: Vec<(T38State, T38State)> = events
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::T38StateChanged { from, to, .. } => Some((from, to)),
            _ => None,
        })
        .collect();
    assert_eq!(
        transitions,
        vec![
            (T38State::Disabled, T38State::PeerReinvite),
            (T38State::PeerReinvite, T38State::Rejected),
            (T38State::Rejected, T38State::Disabled),
        ]
    );
}

#[tokio::test]
async fn accepted_peer_reinvite_is_not_rejected_later() {
    let (h, _t38) = t38_harness(Duration::from_millis(50));
    let mut call = h.establish(invite_to_exten(Some(audio_offer()))).await;
    let session = call.session.clone();

    let mut reinvite = call.request(Method::Invite);
    reinvite.sdp = Some(t38_offer());
    assert!(h.deliver(reinvite.clone()).await);

    session.write_control(request(T38Request::Negotiated)).unwrap();
    session.barrier().await.unwrap();
    assert_eq!(t38::auto_reject_cancels(&session), 1);

    settle(&session, Duration::from_millis(300)).await;

    assert_eq!(session.t38_state(), T38State::Enabled);
    assert_eq!(session.stats().reinvites_resumed, 1);
    let finals: Vec<u16> = h
        .sender
        .responses()
        .into_iter()
        .filter(|r| r.method == Method::Invite && r.cseq == reinvite.cseq && r.is_final())
        .map(|r| r.status)
        .collect();
    assert_eq!(finals, vec![200]);
}

#[tokio::test]
async fn application_refusal_resumes_with_image_declined() {
    let (h, _t38) = t38_harness(Duration::from_secs(30));
    let mut call = h.establish(invite_to_exten(Some(audio_offer()))).await;
    let session = call.session.clone();

    let mut reinvite = call.request(Method::Invite);
    reinvite.sdp = Some(t38_offer());
    assert!(h.deliver(reinvite.clone()).await);

    session.write_control(request(T38Request::Refused)).unwrap();
    session.barrier().await.unwrap();

    assert_eq!(t38::auto_reject_cancels(&session), 1);
    let answer = h
        .sender
        .final_response(Method::Invite, reinvite.cseq)
        .unwrap()
        .sdp
        .unwrap();
    assert_eq!(answer.media[1].port, 0);
    assert_eq!(session.t38_state(), T38State::Disabled);
}

#[tokio::test]
async fn parameters_request_is_answered_while_deciding() {
    let (h, _t38) = t38_harness(Duration::from_secs(30));
    let mut call = h.establish(invite_to_exten(Some(audio_offer()))).await;
    let channel = h.driver.last().unwrap();
    let session = call.session.clone();

    let mut reinvite = call.request(Method::Invite);
    reinvite.sdp = Some(t38_offer());
    assert!(h.deliver(reinvite).await);

    session.write_control(request(T38Request::RequestParms)).unwrap();
    session.barrier().await.unwrap();

    assert_eq!(
        channel.t38_requests(),
        vec![T38Request::RequestNegotiate, T38Request::RequestNegotiate]
    );
    assert_eq!(session.t38_state(), T38State::PeerReinvite);
}

#[tokio::test]
async fn local_switch_to_fax_and_back() {
    let (h, _t38) = t38_harness(Duration::from_secs(30));
    let call = h.establish(invite_to_exten(Some(audio_offer()))).await;
    let channel = h.driver.last().unwrap();
    let session = call.session.clone();

    session
        .write_control(request(T38Request::RequestNegotiate))
        .unwrap();
    session.barrier().await.unwrap();

    assert_eq!(session.t38_state(), T38State::LocalReinvite);
    let reinvite = h.sender.last_request().unwrap();
    assert_eq!(reinvite.method, Method::Invite);
    let offer = reinvite.sdp.clone().unwrap();
    assert_eq!(offer.media.len(), 1);
    assert_eq!(offer.media[0].media, "image");
    assert_eq!(offer.media[0].formats, vec!["t38"]);

    let answer = sdp_with(vec![image_stream(4010)]);
    assert!(h.deliver_response(call.respond(&reinvite, 200, Some(answer))).await);
    session.barrier().await.unwrap();

    assert_eq!(session.t38_state(), T38State::Enabled);
    assert_eq!(session.active_media().stream_types(), vec!["image"]);
    assert_eq!(channel.t38_requests(), vec![T38Request::Negotiated]);
    let ack = h.sender.last_request().unwrap();
    assert_eq!(ack.method, Method::Ack);
    assert_eq!(ack.cseq, reinvite.cseq);

    session
        .write_control(request(T38Request::RequestTerminate))
        .unwrap();
    session.barrier().await.unwrap();

    assert_eq!(session.t38_state(), T38State::Disabled);
    assert_eq!(
        channel.t38_requests(),
        vec![T38Request::Negotiated, T38Request::Terminated]
    );
    let back = h.sender.last_request().unwrap();
    assert_eq!(back.method, Method::Invite);
    assert!(back.cseq > reinvite.cseq);
    let types: Vec<String> = back.sdp.unwrap().media.into_iter().map(|m| m.media).collect();
    assert_eq!(types, vec!["audio"]);
}

#[tokio::test]
async fn local_switch_refused_by_peer() {
    let (h, _t38) = t38_harness(Duration::from_secs(30));
    let call = h.establish(invite_to_exten(Some(audio_offer()))).await;
    let channel = h.driver.last().unwrap();
    let session = call.session.clone();

    session
        .write_control(request(T38Request::RequestNegotiate))
        .unwrap();
    session.barrier().await.unwrap();
    let reinvite = h.sender.last_request().unwrap();

    assert!(h.deliver_response(call.respond(&reinvite, 488, None)).await);
    session.barrier().await.unwrap();

    assert_eq!(session.t38_state(), T38State::Rejected);
    assert_eq!(channel.t38_requests(), vec![T38Request::Refused]);
    assert_eq!(session.active_media().stream_types(), vec!["audio"]);
    assert!(session.pending_media().is_empty());
}

#[test_log::test(tokio::test)]
async fn glared_local_switch_retries_with_the_image_offer() {
    let (h, _t38) = t38_harness(Duration::from_secs(30));
    let call = h.establish(invite_to_exten(Some(audio_offer()))).await;
    let channel = h.driver.last().unwrap();
    let session = call.session.clone();

    session
        .write_control(request(T38Request::RequestNegotiate))
        .unwrap();
    session.barrier().await.unwrap();
    let first = h.sender.last_request().unwrap();
    assert_eq!(first.sdp.as_ref().unwrap().media[0].media, "image");

    assert!(h.deliver_response(call.respond(&first, 491, None)).await);
    session.barrier().await.unwrap();
    assert_eq!(session.t38_state(), T38State::LocalReinvite);
    assert_eq!(session.pending_media().stream_types(), vec!["image"]);
    assert!(channel.t38_requests().is_empty());

    // The callee side of the dialog retries within two seconds
    settle(&session, Duration::from_millis(2300)).await;

    let retry = h.sender.last_request().unwrap();
    assert_eq!(retry.method, Method::Invite);
    assert!(retry.cseq > first.cseq);
    let types: Vec<String> = retry.sdp.clone().unwrap().media.into_iter().map(|m| m.media).collect();
    assert_eq!(types, vec!["image"]);
    assert_eq!(session.t38_state(), T38State::LocalReinvite);

    let answer = sdp_with(vec![image_stream(4010)]);
    assert!(h.deliver_response(call.respond(&retry, 200, Some(answer))).await);
    session.barrier().await.unwrap();

    assert_eq!(session.t38_state(), T38State::Enabled);
    assert_eq!(session.active_media().stream_types(), vec!["image"]);
    assert_eq!(channel.t38_requests(), vec![T38Request::Negotiated]);
}

#[tokio::test]
async fn late_response_leaves_a_settled_switch_alone() {
    let (h, _t38) = t38_harness(Duration::from_secs(30));
    let call = h.establish(invite_to_exten(Some(audio_offer()))).await;
    let channel = h.driver.last().unwrap();
    let session = call.session.clone();

    session
        .write_control(request(T38Request::RequestNegotiate))
        .unwrap();
    session.barrier().await.unwrap();
    let reinvite = h.sender.last_request().unwrap();

    assert_eq!(session.t38_state(), T38State::LocalReinvite);
    session.set_t38_state(T38State::Rejected);

    let answer = sdp_with(vec![image_stream(4010)]);
    assert!(h.deliver_response(call.respond(&reinvite, 200, Some(answer))).await);
    session.barrier().await.unwrap();

    assert_eq!(session.t38_state(), T38State::Rejected);
    assert!(channel.t38_requests().is_empty());
}

#[tokio::test]
async fn frames_are_refused_when_t38_is_disabled() {
    let h = Harness::default_endpoint();
    let call = h.establish(invite_to_exten(Some(audio_offer()))).await;
    let channel = h.driver.last().unwrap();
    // The frame hook is only attached on endpoints with T.38 enabled
    call.session.attach_frame_hook(Arc::new(t38::T38FrameHook));

    call.session
        .write_control(request(T38Request::RequestNegotiate))
        .unwrap();
    call.session
        .write_control(request(T38Request::RequestTerminate))
        .unwrap();

    assert_eq!(
        channel.t38_requests(),
        vec![T38Request::Refused, T38Request::Terminated]
    );
    assert_eq!(call.session.t38_state(), T38State::Disabled);
}

#[tokio::test]
async fn image_offer_is_declined_without_t38() {
    let h = Harness::default_endpoint();
    let mut call = h.establish(invite_to_exten(Some(audio_offer()))).await;

    let mut reinvite = call.request(Method::Invite);
    reinvite.sdp = Some(t38_offer());
    assert!(h.deliver(reinvite.clone()).await);

    let answer = h
        .sender
        .final_response(Method::Invite, reinvite.cseq)
        .unwrap()
        .sdp
        .unwrap();
    assert_eq!(answer.media.len(), 2);
    assert_eq!(answer.media[1].port, 0);
    assert_eq!(call.session.stats().reinvites_deferred, 0);
}

#[tokio::test]
async fn unload_removes_the_image_handler() {
    let (h, supplement) = t38_harness(Duration::from_secs(30));
    assert!(h.coordinator.sdp_handlers().has_handlers(t38::T38_STREAM_TYPE));
    t38::unload(&h.coordinator, &supplement);
    assert!(!h.coordinator.sdp_handlers().has_handlers(t38::T38_STREAM_TYPE));
    assert!(!h.coordinator.unregister_supplement(&supplement));
}
