//! Routing of new SUBSCRIBE requests and the refusals sent before a handler sees them

mod common;

use common::*;
use pretty_assertions::assert_eq;
use rvoip_pubsub_core::summary::{MESSAGE_SUMMARY_CONTENT_TYPE, MESSAGE_SUMMARY_EVENT};
use rvoip_pubsub_core::{MessageSummary, NewSubscribe, PubsubConfig, SubscriptionRole, SubscriptionState};
use rvoip_session_core::sip::{HeaderAccess, Method, SipRequest};

async fn refusal(h: &Harness, request: SipRequest) -> u16 {
    assert!(h.deliver(request).await);
    let response = h.sender.last_response().expect("answered");
    assert!(response.to_tag.is_some());
    response.status
}

#[test_log::test(tokio::test)]
async fn refusals_before_the_handler() {
    let h = Harness::default_config();

    let tel = subscribe("tel:+15551234", Some(MESSAGE_SUMMARY_EVENT), Some(600));
    assert_eq!(refusal(&h, tel).await, 416);

    let no_event = subscribe(MAILBOX_URI, None, Some(600));
    assert_eq!(refusal(&h, no_event).await, 489);

    let unknown_event = subscribe(MAILBOX_URI, Some("presence"), Some(600));
    assert_eq!(refusal(&h, unknown_event).await, 489);

    let zero = subscribe(MAILBOX_URI, Some(MESSAGE_SUMMARY_EVENT), Some(0));
    assert_eq!(refusal(&h, zero).await, 400);

    let unacceptable = subscribe(MAILBOX_URI, Some(MESSAGE_SUMMARY_EVENT), Some(600))
        .with_header("Accept", "application/pidf+xml");
    assert_eq!(refusal(&h, unacceptable).await, 400);

    assert!(h.handler.calls().is_empty());
    assert_eq!(h.engine.subscription_count(), 0);
}

#[tokio::test]
async fn too_brief_expiry_names_the_minimum() {
    let h = Harness::default_config();
    assert!(h.deliver(mwi_subscribe(30)).await);
    let response = h.sender.last_response().unwrap();
    assert_eq!(response.status, 423);
    assert_eq!(response.header("Min-Expires"), Some("60"));
    assert_eq!(h.engine.subscription_count(), 0);
}

#[tokio::test]
async fn subscriptions_can_be_refused_per_endpoint() {
    let h = Harness::new(PubsubConfig::new().with_denied_endpoint(ENDPOINT));
    assert_eq!(refusal(&h, mwi_subscribe(600)).await, 603);

    let h = Harness::new(PubsubConfig::new().with_allow_subscribe(false));
    assert_eq!(refusal(&h, mwi_subscribe(600)).await, 603);
    assert!(h.handler.calls().is_empty());
}

#[tokio::test]
async fn handler_refusal_uses_its_status() {
    let h = Harness::default_config();

    h.handler.decide(NewSubscribe::Rejected(None));
    assert_eq!(refusal(&h, mwi_subscribe(600)).await, 500);

    h.handler.decide(NewSubscribe::Rejected(Some(403)));
    assert_eq!(refusal(&h, mwi_subscribe(600)).await, 403);

    h.handler.decide(NewSubscribe::Rejected(Some(180)));
    assert_eq!(refusal(&h, mwi_subscribe(600)).await, 500);

    assert_eq!(h.handler.calls(), vec!["new_subscribe"; 3]);
    assert_eq!(h.engine.subscription_count(), 0);
    assert!(h.sender.requests().is_empty());
}

#[tokio::test]
async fn accepted_subscription_gets_initial_notify() {
    let h = Harness::default_config();
    let peer = h.establish(mwi_subscribe(600)).await;

    let ok = h.sender.responses_with(200).remove(0);
    assert_eq!(ok.header("Expires"), Some("600"));
    assert_eq!(ok.header("Contact"), Some("<sip:100@pbx.example.com>"));

    let subscription = &peer.subscription;
    assert_eq!(subscription.role(), SubscriptionRole::Notifier);
    assert_eq!(subscription.state(), SubscriptionState::Active);
    assert_eq!(subscription.resource(), "100");
    assert_eq!(subscription.endpoint(), ENDPOINT);
    assert_eq!(subscription.body_subtype(), Some("simple-message-summary"));
    assert_eq!(h.handler.calls(), vec!["new_subscribe", "established"]);

    let notify = h.sender.last_request().expect("initial NOTIFY");
    assert_eq!(notify.method, Method::Notify);
    assert_eq!(notify.uri, "sip:alice@192.0.2.10:5060");
    assert_eq!(notify.to_tag, peer.subscribe.from_tag);
    assert_eq!(notify.from_tag.as_deref(), Some(peer.local_tag.as_str()));
    assert_eq!(notify.header("Event"), Some(MESSAGE_SUMMARY_EVENT));
    assert!(notify
        .header("Subscription-State")
        .unwrap()
        .starts_with("active;expires="));

    let body = notify.body.expect("summary body");
    assert_eq!(body.content_type, MESSAGE_SUMMARY_CONTENT_TYPE);
    assert_eq!(body.content, "Messages-Waiting: yes\r\nVoice-Message: 2/5 (0/0)\r\n");
    assert_eq!(MessageSummary::parse(&body.content), Some(MessageSummary::new(2, 5)));
}

#[tokio::test]
async fn missing_accept_uses_the_handler_default() {
    let h = Harness::default_config();
    let request = subscribe(MAILBOX_URI, Some("message-summary;id=1"), None);
    let peer = h.establish(request).await;
    assert_eq!(peer.subscription.expires(), 3600);
    assert_eq!(h.sender.requests_with(Method::Notify).len(), 1);
}

#[tokio::test]
async fn unrelated_requests_are_left_alone() {
    let h = Harness::default_config();

    let info = SipRequest::new(Method::Info, MAILBOX_URI);
    assert!(!h.deliver(info).await);

    let stray_notify = SipRequest::new(Method::Notify, MAILBOX_URI)
        .with_to(rvoip_session_core::sip::NameAddr::new(MAILBOX_URI), Some("nobody".to_string()))
        .with_header("Event", "refer");
    assert!(!h.deliver(stray_notify).await);
    assert!(h.sender.responses().is_empty());

    let stray_subscribe = subscribe(MAILBOX_URI, Some(MESSAGE_SUMMARY_EVENT), Some(600))
        .with_to(rvoip_session_core::sip::NameAddr::new(MAILBOX_URI), Some("nobody".to_string()));
    assert!(h.deliver(stray_subscribe).await);
    assert_eq!(h.sender.last_response().unwrap().status, 481);
}
