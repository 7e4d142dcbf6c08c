//! Header functions and caller identity on live sessions

mod common;

use std::sync::Arc;

use common::*;
use pretty_assertions::assert_eq;
use rvoip_session_core::channel::{Channel, ControlFrame};
use rvoip_session_core::config::CallerIdConfig;
use rvoip_session_core::sip::{HeaderAccess, Method, NameAddr};
use rvoip_session_core::supplements::caller_id::{
    CALLERID_NUM_VAR, CONNECTED_NAME_VAR, CONNECTED_NUM_VAR, PAI_HEADER,
};
use rvoip_session_core::supplements::header_funcs::{pjsip_header, HEADER_DATASTORE};
use rvoip_session_core::supplements::{CallerIdSupplement, HeaderFuncsSupplement};
use rvoip_session_core::{EndpointConfig, SessionError};

fn with_header_funcs(h: &Harness) {
    h.coordinator
        .register_supplement(Arc::new(HeaderFuncsSupplement));
}

fn with_caller_id(caller_id: CallerIdConfig) -> Harness {
    let h = Harness::new(EndpointConfig::new(ENDPOINT).with_caller_id(caller_id));
    h.coordinator.register_supplement(Arc::new(CallerIdSupplement));
    h
}

#[tokio::test]
async fn received_invite_headers_can_be_read() {
    let h = Harness::default_endpoint();
    with_header_funcs(&h);
    let invite = invite_to_exten(Some(audio_offer()))
        .with_header("X-Account", " a1 ")
        .with_header("x-account", "a2");
    let call = h.establish(invite).await;

    let first = pjsip_header(&call.session, "read,X-Account", None).await.unwrap();
    assert_eq!(first, "a1");
    let second = pjsip_header(&call.session, "read,X-ACCOUNT,2", None).await.unwrap();
    assert_eq!(second, "a2");

    let missing = pjsip_header(&call.session, "read,X-Missing", None).await;
    assert!(matches!(missing, Err(SessionError::HeaderNotFound(name)) if name == "X-Missing"));
}

#[tokio::test]
async fn read_without_stored_headers_fails() {
    let h = Harness::default_endpoint();
    let call = h.establish(invite_to_exten(Some(audio_offer()))).await;
    assert!(pjsip_header(&call.session, "read,X-Account", None).await.is_err());
}

#[tokio::test]
async fn added_headers_go_out_on_the_initial_invite_only() {
    let h = Harness::default_endpoint();
    with_header_funcs(&h);
    let session = h
        .coordinator
        .create_outgoing(
            ENDPOINT,
            NameAddr::new("sip:alice@pbx.example.com"),
            NameAddr::new("sip:bob@192.0.2.10"),
        )
        .unwrap();

    pjsip_header(&session, "add,X-Campaign", Some("spring")).await.unwrap();
    pjsip_header(&session, "add,X-Tag", Some("one")).await.unwrap();
    pjsip_header(&session, "add,X-Tagged", Some("two")).await.unwrap();
    pjsip_header(&session, "update,X-Campaign", Some("summer")).await.unwrap();
    let removed = pjsip_header(&session, "remove,X-Tag*", None).await.unwrap();
    assert_eq!(removed, "2");
    let err = pjsip_header(&session, "update,X-Nothing", Some("v")).await;
    assert!(matches!(err, Err(SessionError::HeaderNotFound(_))));

    session
        .push_task_synchronous(|s| s.send_invite())
        .await
        .unwrap()
        .unwrap();

    let invite = h.sender.last_request().unwrap();
    assert_eq!(invite.header("X-Campaign"), Some("summer"));
    assert!(!invite.has_header("X-Tag"));
    assert!(!invite.has_header("X-Tagged"));
    assert!(session.get_datastore(HEADER_DATASTORE).is_none());
}

#[tokio::test]
async fn header_function_arguments_are_validated() {
    let h = Harness::default_endpoint();
    let call = h.establish(invite_to_exten(Some(audio_offer()))).await;
    assert!(pjsip_header(&call.session, "add,X-Foo", None).await.is_err());
    assert!(pjsip_header(&call.session, "frob,X-Foo", None).await.is_err());
    assert!(pjsip_header(&call.session, "read", None).await.is_err());
}

#[tokio::test]
async fn trusted_identity_is_taken_from_pai() {
    let h = with_caller_id(CallerIdConfig {
        trust_inbound: true,
        ..CallerIdConfig::default()
    });
    let invite = invite_to_exten(Some(audio_offer()))
        .with_header(PAI_HEADER, "\"Front Desk\" <sip:2000@client.example.com>");
    assert!(h.deliver(invite.clone()).await);

    let id = h.session_for(&invite).unwrap().party_id();
    assert_eq!(id.name.as_deref(), Some("Front Desk"));
    assert_eq!(id.number.as_deref(), Some("2000"));
    assert!(!id.restricted);
}

#[tokio::test]
async fn untrusted_identity_comes_from_the_from_header() {
    let h = with_caller_id(CallerIdConfig::default());
    let invite = invite_to_exten(Some(audio_offer()))
        .with_header(PAI_HEADER, "\"Front Desk\" <sip:2000@client.example.com>");
    assert!(h.deliver(invite.clone()).await);

    let id = h.session_for(&invite).unwrap().party_id();
    assert_eq!(id.name.as_deref(), Some("Alice"));
    assert_eq!(id.number.as_deref(), Some("alice"));
}

#[tokio::test]
async fn identity_change_in_update_reaches_the_channel() {
    let h = with_caller_id(CallerIdConfig {
        trust_inbound: true,
        ..CallerIdConfig::default()
    });
    let invite = invite_to_exten(Some(audio_offer()))
        .with_header(PAI_HEADER, "<sip:2000@client.example.com>");
    let mut call = h.establish(invite).await;
    let channel = h.driver.last().unwrap();

    let update = call
        .request(Method::Update)
        .with_header(PAI_HEADER, "\"Transfer\" <sip:3000@client.example.com>");
    assert!(h.deliver(update.clone()).await);

    assert_eq!(h.sender.final_response(Method::Update, update.cseq).unwrap().status, 200);
    assert_eq!(call.session.party_id().number.as_deref(), Some("3000"));
    assert_eq!(channel.variable(CALLERID_NUM_VAR).as_deref(), Some("3000"));
    assert!(channel.controls().contains(&ControlFrame::ConnectedLine));

    // Same identity again is not an update
    let repeat = call
        .request(Method::Update)
        .with_header(PAI_HEADER, "\"Transfer\" <sip:3000@client.example.com>");
    assert!(h.deliver(repeat).await);
    let updates = channel
        .controls()
        .into_iter()
        .filter(|c| *c == ControlFrame::ConnectedLine)
        .count();
    assert_eq!(updates, 1);
}

#[tokio::test]
async fn answer_asserts_our_identity() {
    let h = with_caller_id(CallerIdConfig {
        send_pai: true,
        self_name: Some("PBX".into()),
        self_number: Some("555".into()),
        ..CallerIdConfig::default()
    });
    h.establish(invite_to_exten(Some(audio_offer()))).await;

    let ok = h.sender.final_response(Method::Invite, 1).unwrap();
    assert_eq!(ok.header(PAI_HEADER), Some("\"PBX\" <sip:555@pbx.example.com>"));
    assert!(!ok.has_header("Remote-Party-ID"));
}

#[tokio::test]
async fn outgoing_invite_presents_the_connected_line() {
    let h = with_caller_id(CallerIdConfig {
        send_pai: true,
        send_rpid: true,
        ..CallerIdConfig::default()
    });
    let session = h
        .coordinator
        .create_outgoing(
            ENDPOINT,
            NameAddr::new("sip:alice@pbx.example.com"),
            NameAddr::new("sip:bob@192.0.2.10"),
        )
        .unwrap();
    let channel = MockChannel::new("PJSIP/alice-out");
    channel.set_variable(CONNECTED_NAME_VAR, "Sales");
    channel.set_variable(CONNECTED_NUM_VAR, "4100");
    session.set_channel(channel);

    session
        .push_task_synchronous(|s| s.send_invite())
        .await
        .unwrap()
        .unwrap();

    let invite = h.sender.last_request().unwrap();
    assert_eq!(invite.from.uri, "sip:4100@pbx.example.com");
    assert_eq!(invite.from.display.as_deref(), Some("Sales"));
    assert_eq!(invite.header(PAI_HEADER), Some("\"Sales\" <sip:4100@pbx.example.com>"));
    assert_eq!(
        invite.header("Remote-Party-ID"),
        Some("\"Sales\" <sip:4100@pbx.example.com>;privacy=off;screen=no")
    );
}
