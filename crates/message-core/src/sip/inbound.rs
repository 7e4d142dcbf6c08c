//! Received MESSAGE requests

use std::sync::Arc;

use rvoip_session_core::channel::Frame;
use rvoip_session_core::sip::{uri_user, HeaderAccess, Method, SipBody, SipRequest, SipResponse, new_tag};
use rvoip_session_core::{priority, EndpointConfig, RequestDisposition, Session, SessionSupplement};
use tracing::{debug, warn};

use super::{is_sip_uri, SipMessaging, SIP_MESSAGE_TECH};
use crate::errors::Result;
use crate::message::Message;

/// Out-of-dialog MESSAGE bodies must be plain text
fn is_plain_text(request: &SipRequest) -> bool {
    match &request.body {
        Some(body) if !body.content.is_empty() => body.is_type("text", "plain"),
        _ => request
            .header("Content-Type")
            .is_some_and(|ct| SipBody::new(ct, "").is_type("text", "plain")),
    }
}

/// `sip:` becomes `pjsip:` so replies find the SIP technology
fn sip_to_pjsip(uri: &str) -> String {
    let uri = uri.trim().trim_start_matches('<');
    if uri.starts_with("sip") {
        format!("pj{}", uri)
    } else {
        format!("pjsip:{}", uri)
    }
}

fn message_from_request(endpoint: &EndpointConfig, request: &SipRequest) -> Message {
    let exten = uri_user(&request.uri).unwrap_or_default();
    let body = request
        .body
        .as_ref()
        .map(|b| b.content.trim_end_matches(['\r', '\n']).to_string())
        .unwrap_or_default();

    let mut msg = Message::new()
        .with_destination(endpoint.message_context(), exten)
        .with_to(sip_to_pjsip(&request.to.uri))
        .with_from(request.from.to_string())
        .with_body(body)
        .with_tech(SIP_MESSAGE_TECH, endpoint.id.clone());

    if let Some(source) = request.source {
        msg.set_var("PJSIP_RECVADDR", &source.to_string());
    }
    msg.set_var("PJSIP_TRANSPORT", &request.transport.to_ascii_lowercase());
    if let Some(name) = endpoint.caller_id.self_name.as_deref() {
        msg.set_var("PJSIP_ENDPOINT", name);
    }

    msg.set_var("From", &request.from.to_string());
    msg.set_var("To", &request.to.to_string());
    msg.set_var("Call-ID", &request.call_id);
    msg.set_var("CSeq", &format!("{} {}", request.cseq, request.method));
    for header in &request.headers {
        msg.set_var(&header.name, header.value.trim());
    }
    msg
}

impl SipMessaging {
    /// Answer outside of any dialog. Returns false when the response could not be sent.
    fn reply(&self, request: &SipRequest, status: u16) -> bool {
        let response = SipResponse::for_request(request, status).with_to_tag(Some(new_tag()));
        match self.sender.send_response(&response) {
            Ok(()) => true,
            Err(e) => {
                warn!("Unable to send {} to MESSAGE: {}", status, e);
                false
            }
        }
    }

    /// Take an out-of-dialog MESSAGE received on `endpoint_id`.
    ///
    /// Returns false for anything else so the caller can route it elsewhere.
    pub fn on_rx_request(&self, endpoint_id: &str, request: &SipRequest) -> Result<bool> {
        if request.method != Method::Message || request.is_in_dialog() {
            return Ok(false);
        }
        if !is_plain_text(request) {
            self.reply(request, 415);
            return Ok(true);
        }
        if !is_sip_uri(&request.uri) {
            self.reply(request, 416);
            return Ok(true);
        }
        let endpoint = self.endpoint(endpoint_id)?;
        let msg = message_from_request(&endpoint, request);

        if !self.router.has_destination(&msg) {
            debug!("MESSAGE request received, but no handler wanted it");
            self.reply(request, 404);
            return Ok(true);
        }
        // A response that cannot be sent usually means a retransmission
        if self.reply(request, 202) {
            self.router.queue(msg)?;
        }
        Ok(true)
    }
}

/// Queues in-dialog MESSAGE bodies to the session's channel as text frames
#[derive(Debug, Default)]
pub struct MessagingSupplement;

impl MessagingSupplement {
    pub fn new() -> Self {
        Self
    }
}

impl SessionSupplement for MessagingSupplement {
    fn name(&self) -> &str {
        "messaging"
    }

    fn method(&self) -> Option<&str> {
        Some("MESSAGE")
    }

    fn priority(&self) -> i32 {
        priority::CHANNEL
    }

    fn incoming_request(&self, session: &Arc<Session>, request: &SipRequest) -> RequestDisposition {
        let Some(channel) = session.channel() else {
            session.respond(request, 404);
            return RequestDisposition::Handled;
        };
        let Some(body) = request.body.as_ref().filter(|b| !b.content.is_empty()) else {
            session.respond(request, 415);
            return RequestDisposition::Handled;
        };
        let (kind, subtype) = body.media_type();
        if kind != "text" && kind != "application" {
            session.respond(request, 415);
            return RequestDisposition::Handled;
        }
        debug!(
            "Received in-dialog MESSAGE from '{}' on {}",
            request.from,
            channel.name()
        );
        let frame = Frame::Text {
            content_type: format!("{}/{}", kind, subtype),
            body: body.content.clone(),
        };
        match channel.queue_frame(frame) {
            Ok(()) => session.respond(request, 202),
            Err(e) => {
                warn!("Session {}: unable to queue MESSAGE: {}", session.id(), e);
                session.respond(request, 500);
            }
        }
        RequestDisposition::Handled
    }
}
