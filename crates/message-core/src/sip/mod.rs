//! SIP transport for messages and refers
//!
//! [`SipMessaging`] is the `pjsip` message and refer technology. It builds
//! out-of-dialog MESSAGE and REFER requests, turns received out-of-dialog
//! MESSAGE requests into queued [`Message`](crate::Message)s and, through
//! [`MessagingSupplement`], passes in-dialog MESSAGE bodies to the call's
//! channel.

mod inbound;
mod outbound;

pub use inbound::MessagingSupplement;

use std::sync::Arc;

use arc_swap::ArcSwap;
use rvoip_session_core::sip::{uri_host, uri_scheme, NameAddr, SipSender};
use rvoip_session_core::{EndpointConfig, SessionConfig};
use tracing::info;

use crate::config::MessageConfig;
use crate::errors::{MessageError, Result};
use crate::router::MessageRouter;

/// Technology name messages and refers are addressed with, `pjsip:bob`
pub const SIP_TECH: &str = "pjsip";
/// `tech` recorded on received messages
pub const SIP_MESSAGE_TECH: &str = "PJSIP";

/// Variables never copied to headers of an outgoing request
pub const BLOCKED_HEADERS: [&str; 11] = [
    "To",
    "From",
    "Via",
    "Route",
    "Contact",
    "Call-ID",
    "CSeq",
    "Allow",
    "Content-Length",
    "Content-Type",
    "Request-URI",
];

pub fn is_blocked_header(name: &str) -> bool {
    BLOCKED_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Where an outgoing request goes
#[derive(Debug, Clone)]
pub(crate) struct Route {
    pub endpoint: EndpointConfig,
    pub uri: String,
    pub display: Option<String>,
}

pub struct SipMessaging {
    config: ArcSwap<MessageConfig>,
    sessions: ArcSwap<SessionConfig>,
    sender: Arc<dyn SipSender>,
    router: Arc<MessageRouter>,
}

impl SipMessaging {
    pub fn new(
        config: MessageConfig,
        sessions: SessionConfig,
        sender: Arc<dyn SipSender>,
        router: Arc<MessageRouter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config: ArcSwap::from_pointee(config),
            sessions: ArcSwap::from_pointee(sessions),
            sender,
            router,
        })
    }

    /// Register as the `pjsip` message and refer technology
    pub fn register(self: &Arc<Self>) -> Result<()> {
        self.router.register_tech(self.clone())?;
        if let Err(e) = self.router.register_refer_tech(self.clone()) {
            let _ = self.router.unregister_tech(SIP_TECH);
            return Err(e);
        }
        info!("SIP messaging registered");
        Ok(())
    }

    pub fn unregister(&self) -> Result<()> {
        self.router.unregister_refer_tech(SIP_TECH)?;
        self.router.unregister_tech(SIP_TECH)
    }

    pub fn config(&self) -> Arc<MessageConfig> {
        self.config.load_full()
    }

    pub fn reload_config(&self, config: MessageConfig) {
        self.config.store(Arc::new(config));
    }

    /// Swap in new endpoint definitions
    pub fn reload_endpoints(&self, sessions: SessionConfig) {
        self.sessions.store(Arc::new(sessions));
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub(crate) fn endpoint(&self, id: &str) -> Result<EndpointConfig> {
        self.sessions
            .load()
            .endpoints
            .get(id)
            .cloned()
            .ok_or_else(|| MessageError::EndpointNotFound(id.to_string()))
    }

    fn default_endpoint(&self, destination: &str) -> Result<EndpointConfig> {
        let config = self.config.load();
        let id = config.default_outbound_endpoint.as_deref().ok_or_else(|| {
            MessageError::EndpointNotFound(format!(
                "no endpoint in '{}' and no default outbound endpoint",
                destination
            ))
        })?;
        self.endpoint(id)
    }

    /// Resolve a destination to an endpoint and request URI.
    ///
    /// Accepted forms are `endpoint/uri`, a sip or sips URI (optionally in
    /// name-addr form) sent through the default outbound endpoint,
    /// `endpoint` or `endpoint@domain` using the endpoint's configured
    /// contact, and a bare `host` or `user@host` through the default
    /// outbound endpoint.
    pub(crate) fn route(&self, destination: &str) -> Result<Route> {
        let destination = destination.trim();
        if destination.is_empty() {
            return Err(MessageError::InvalidUri(destination.to_string()));
        }
        if let Some((endpoint, target)) = destination.split_once('/') {
            let endpoint = self.endpoint(endpoint)?;
            let target = parse_addr(target);
            if target.uri.is_empty() {
                return Err(MessageError::InvalidUri(destination.to_string()));
            }
            return Ok(Route {
                endpoint,
                uri: with_sip_scheme(&target.uri),
                display: target.display,
            });
        }

        let target = parse_addr(destination);
        if is_sip_uri(&target.uri) {
            return Ok(Route {
                endpoint: self.default_endpoint(destination)?,
                uri: target.uri,
                display: target.display,
            });
        }

        let name = destination.split('@').next().unwrap_or(destination);
        if let Ok(endpoint) = self.endpoint(name) {
            let config = self.config.load();
            let contact = config.contact(name).ok_or_else(|| {
                MessageError::InvalidUri(format!("endpoint '{}' has no contact", name))
            })?;
            return Ok(Route {
                endpoint,
                uri: contact.to_string(),
                display: None,
            });
        }

        Ok(Route {
            endpoint: self.default_endpoint(destination)?,
            uri: with_sip_scheme(destination),
            display: None,
        })
    }

    /// From used when neither the caller nor the message gives one
    fn default_from(&self, endpoint: &EndpointConfig, request_uri: &str) -> NameAddr {
        let config = self.config.load();
        let user = endpoint
            .from_user
            .as_deref()
            .unwrap_or(&config.default_from_user);
        let host = endpoint
            .from_domain
            .as_deref()
            .or_else(|| uri_host(request_uri))
            .unwrap_or("localhost");
        NameAddr::new(format!("sip:{}@{}", user, host))
    }
}

/// Parse name-addr text, keeping bare URIs whole so user parameters survive
pub(crate) fn parse_addr(text: &str) -> NameAddr {
    let text = text.trim();
    if text.contains('<') {
        NameAddr::parse(text)
    } else {
        NameAddr::new(text)
    }
}

pub(crate) fn is_sip_uri(uri: &str) -> bool {
    matches!(uri_scheme(uri).as_deref(), Some("sip") | Some("sips"))
}

fn with_sip_scheme(uri: &str) -> String {
    if is_sip_uri(uri) {
        uri.to_string()
    } else {
        format!("sip:{}", uri)
    }
}

/// Drop URI parameters after the host part: `sip:user;opt@host;transport=tcp`
/// becomes `sip:user;opt@host`
pub(crate) fn strip_uri_params(uri: &str) -> &str {
    match uri.find('@') {
        Some(at) => match uri[at..].find(';') {
            Some(semi) => &uri[..at + semi],
            None => uri,
        },
        None => uri,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_headers_ignore_case() {
        assert!(is_blocked_header("call-id"));
        assert!(is_blocked_header("Content-Type"));
        assert!(!is_blocked_header("Max-Forwards"));
        assert!(!is_blocked_header("X-Account"));
    }

    #[test]
    fn uri_parameters_after_the_host_are_dropped() {
        assert_eq!(
            strip_uri_params("sip:alice;phone@example.com;transport=tcp"),
            "sip:alice;phone@example.com"
        );
        assert_eq!(strip_uri_params("sip:example.com;lr"), "sip:example.com;lr");
        assert_eq!(strip_uri_params("sip:bob@example.com"), "sip:bob@example.com");
    }

    #[test]
    fn bare_uris_keep_user_parameters() {
        let addr = parse_addr("sip:alice;phone@example.com");
        assert_eq!(addr.uri, "sip:alice;phone@example.com");
        let addr = parse_addr("\"Bob\" <sip:bob@example.com>");
        assert_eq!(addr.display.as_deref(), Some("Bob"));
        assert_eq!(addr.uri, "sip:bob@example.com");
    }
}
