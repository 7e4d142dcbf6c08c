//! Outgoing MESSAGE and REFER requests

use rvoip_session_core::sip::{uri_host, HeaderAccess, Method, NameAddr, SipBody, SipRequest, new_tag};
use tracing::{debug, info, warn};

use super::{is_blocked_header, is_sip_uri, parse_addr, strip_uri_params, SipMessaging, SIP_TECH};
use crate::errors::{MessageError, Result};
use crate::message::Message;
use crate::refer::{Refer, DISPLAY_NAME_VAR};
use crate::tech::{MessageTech, ReferTech};

const DEFAULT_CONTENT_TYPE: &str = "text/plain";

/// Text after the technology prefix: `pjsip:bob` gives `bob`
fn strip_tech(destination: &str) -> Result<&str> {
    destination
        .split_once(':')
        .map(|(_, rest)| rest)
        .filter(|rest| !rest.is_empty())
        .ok_or_else(|| MessageError::InvalidUri(destination.to_string()))
}

/// Decremented Max-Forwards value, refusing to send once it reaches zero
fn decrement_max_forwards(value: &str) -> Result<u32> {
    match value.trim().parse::<u32>() {
        Ok(hops) if hops > 1 => Ok(hops - 1),
        _ => {
            warn!("Max-Forwards '{}' reached zero, not sending", value);
            Err(MessageError::MaxForwardsExceeded)
        }
    }
}

/// Address for an outgoing To or From header.
///
/// A `pjsip` prefix copied from a received message is turned back into a SIP
/// URI, URI parameters after the host are dropped and a bare user name is
/// placed on `host`.
fn outbound_addr(text: &str, host: &str) -> NameAddr {
    let mut addr = parse_addr(text);
    if addr.uri.starts_with("pjsip") {
        addr.uri = addr.uri[2..].to_string();
    }
    if !is_sip_uri(&addr.uri) {
        addr.uri = if addr.uri.contains('@') {
            format!("sip:{}", addr.uri)
        } else {
            format!("sip:{}@{}", addr.uri, host)
        };
    }
    addr.uri = strip_uri_params(&addr.uri).to_string();
    addr
}

impl SipMessaging {
    pub(crate) fn build_message(&self, msg: &Message, destination: &str, from: &str) -> Result<SipRequest> {
        let route = self.route(strip_tech(destination)?)?;
        debug!("Request URI: {}", route.uri);

        let host = uri_host(&route.uri).unwrap_or("localhost").to_string();
        let to = if msg.to.trim().is_empty() {
            NameAddr {
                display: route.display.clone(),
                uri: route.uri.clone(),
            }
        } else {
            outbound_addr(&msg.to, &host)
        };
        let from = if from.trim().is_empty() { msg.from.as_str() } else { from };
        let from = if from.trim().is_empty() {
            self.default_from(&route.endpoint, &route.uri)
        } else {
            outbound_addr(from, &host)
        };

        let content_type = msg.var("Content-Type").unwrap_or(DEFAULT_CONTENT_TYPE);
        let mut request = SipRequest::new(Method::Message, route.uri.clone())
            .with_to(to, None)
            .with_from(from, Some(new_tag()))
            .with_body(SipBody::new(content_type, msg.body.clone()));

        for (name, value) in msg.outbound_vars() {
            if name.eq_ignore_ascii_case("Max-Forwards") {
                let hops = decrement_max_forwards(value)?;
                request.add_header(name, hops.to_string());
            } else if !is_blocked_header(name) {
                request.add_header(name, value);
            }
        }
        debug!(
            "Sending message to '{}' (via endpoint {}) from '{}'",
            route.uri, route.endpoint.id, request.from.uri
        );
        Ok(request)
    }

    pub(crate) fn build_refer(&self, refer: &Refer) -> Result<SipRequest> {
        if refer.to.trim().is_empty() {
            return Err(MessageError::InvalidUri("a 'To' URI must be specified".to_string()));
        }
        let route = self.route(strip_tech(&refer.to)?)?;

        let target = parse_addr(&refer.refer_to);
        let refer_to = if is_sip_uri(&target.uri) {
            target.uri
        } else {
            self.route(&refer.refer_to)
                .map_err(|_| MessageError::InvalidUri(refer.refer_to.clone()))?
                .uri
        };
        let mut refer = refer.clone();
        let refer_to = match refer.take_var(DISPLAY_NAME_VAR) {
            Some(display) => format!(
                "\"{}\" <{}>",
                display.replace('\\', "\\\\").replace('"', "\\\""),
                refer_to
            ),
            None => format!("<{}>", refer_to),
        };
        if refer.to_self {
            debug!("Refer to '{}' targets one of our endpoints", refer_to);
        }

        let from = if refer.from.trim().is_empty() {
            self.default_from(&route.endpoint, &route.uri)
        } else {
            outbound_addr(&refer.from, uri_host(&route.uri).unwrap_or("localhost"))
        };
        let mut request = SipRequest::new(Method::Refer, route.uri.clone())
            .with_to(NameAddr::new(route.uri.clone()), None)
            .with_from(from, Some(new_tag()))
            .with_header("Refer-To", refer_to);
        for (name, value) in refer.outbound_vars() {
            if !is_blocked_header(name) {
                request.add_header(name, value);
            }
        }
        debug!(
            "Sending REFER to '{}' (via endpoint {}) from '{}'",
            route.uri, route.endpoint.id, request.from.uri
        );
        Ok(request)
    }
}

impl MessageTech for SipMessaging {
    fn name(&self) -> &str {
        SIP_TECH
    }

    fn msg_send(&self, msg: &Message, destination: &str, from: &str) -> Result<()> {
        let request = self.build_message(msg, destination, from)?;
        self.sender.send_request(&request).map_err(|e| {
            warn!("Could not send MESSAGE to '{}': {}", request.uri, e);
            MessageError::SendFailed(e.to_string())
        })
    }
}

impl ReferTech for SipMessaging {
    fn name(&self) -> &str {
        SIP_TECH
    }

    fn refer_send(&self, refer: &Refer) -> Result<()> {
        let request = self.build_refer(refer)?;
        self.sender.send_request(&request).map_err(|e| {
            warn!("Could not send REFER to '{}': {}", request.uri, e);
            MessageError::SendFailed(e.to_string())
        })?;
        info!("REFER sent to {}", request.uri);
        Ok(())
    }
}
