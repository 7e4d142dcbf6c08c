//! Caller identity supplement
//!
//! Learns the caller's identity from P-Asserted-Identity, Remote-Party-ID or
//! From on incoming INVITE/UPDATE and presents ours in From, PAI and RPID on
//! the way out, honoring the endpoint's trust and privacy options.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::channel::{Channel, ControlFrame};
use crate::config::EndpointConfig;
use crate::dialog::InviteState;
use crate::session::{PartyId, Session};
use crate::sip::{HeaderAccess, NameAddr, SipRequest, SipResponse};
use crate::supplement::{priority, RequestDisposition, SessionSupplement};

pub const PAI_HEADER: &str = "P-Asserted-Identity";
pub const RPID_HEADER: &str = "Remote-Party-ID";
pub const PRIVACY_HEADER: &str = "Privacy";

/// Channel variables carrying the identity presented to the peer
pub const CONNECTED_NAME_VAR: &str = "CONNECTEDLINE(name)";
pub const CONNECTED_NUM_VAR: &str = "CONNECTEDLINE(num)";
/// Channel variables updated when the peer's identity changes
pub const CALLERID_NAME_VAR: &str = "CALLERID(name)";
pub const CALLERID_NUM_VAR: &str = "CALLERID(num)";

impl PartyId {
    /// An identity is usable once it has a number
    pub fn is_valid(&self) -> bool {
        self.number.as_deref().is_some_and(|n| !n.is_empty())
    }
}

/// `name` and `params` of a name-addr header value
fn parse_identity(value: &str) -> (NameAddr, Vec<(String, String)>) {
    let addr = NameAddr::parse(value);
    let tail = match value.rfind('>') {
        Some(close) => &value[close + 1..],
        None => value.split_once(';').map_or("", |(_, rest)| rest),
    };
    let params = tail
        .split(';')
        .filter(|p| !p.trim().is_empty())
        .map(|p| match p.split_once('=') {
            Some((k, v)) => (k.trim().to_ascii_lowercase(), v.trim().to_string()),
            None => (p.trim().to_ascii_lowercase(), String::new()),
        })
        .collect();
    (addr, params)
}

fn party_from_addr(addr: &NameAddr) -> PartyId {
    PartyId {
        name: addr.display.clone().filter(|n| !n.is_empty()),
        number: addr.user().map(str::to_string).filter(|n| !n.is_empty()),
        restricted: false,
    }
}

fn id_from_pai(request: &impl HeaderAccess) -> Option<PartyId> {
    let (addr, _) = parse_identity(request.header(PAI_HEADER)?);
    let mut id = party_from_addr(&addr);
    if !id.is_valid() {
        return None;
    }
    id.restricted = request
        .header(PRIVACY_HEADER)
        .is_some_and(|p| p.trim().eq_ignore_ascii_case("id"));
    Some(id)
}

fn id_from_rpid(request: &impl HeaderAccess) -> Option<PartyId> {
    let (addr, params) = parse_identity(request.header(RPID_HEADER)?);
    let mut id = party_from_addr(&addr);
    if !id.is_valid() {
        return None;
    }
    id.restricted = params
        .iter()
        .any(|(k, v)| k == "privacy" && v.eq_ignore_ascii_case("full"));
    Some(id)
}

fn id_from_from(request: &SipRequest) -> Option<PartyId> {
    Some(party_from_addr(&request.from)).filter(PartyId::is_valid)
}

fn trusted_id(message: &impl HeaderAccess) -> Option<PartyId> {
    id_from_pai(message).or_else(|| id_from_rpid(message))
}

fn self_id(endpoint: &EndpointConfig) -> PartyId {
    PartyId {
        name: endpoint.caller_id.self_name.clone(),
        number: endpoint.caller_id.self_number.clone(),
        restricted: endpoint.caller_id.self_restricted,
    }
}

/// A changed number, or the same number with a changed name
fn should_update(current: &PartyId, id: &PartyId) -> bool {
    if !id.is_valid() {
        return false;
    }
    if current.number.as_deref().is_none_or(str::is_empty) || current.number != id.number {
        return true;
    }
    if id.name.as_deref().is_none_or(str::is_empty) {
        return false;
    }
    current.name.as_deref().is_none_or(str::is_empty) || current.name != id.name
}

fn update_connected_line(session: &Arc<Session>, message: &impl HeaderAccess) {
    if !session.endpoint().caller_id.trust_inbound {
        return;
    }
    let Some(id) = trusted_id(message) else {
        return;
    };
    if !should_update(&session.party_id(), &id) {
        return;
    }
    debug!("Session {}: peer identity changed to {:?}", session.id(), id.number);
    session.set_party_id(id.clone());
    if let Some(channel) = session.channel() {
        channel.set_variable(CALLERID_NAME_VAR, id.name.as_deref().unwrap_or(""));
        channel.set_variable(CALLERID_NUM_VAR, id.number.as_deref().unwrap_or(""));
        if let Err(e) = channel.queue_control(ControlFrame::ConnectedLine) {
            warn!("Session {}: could not queue connected line update: {}", session.id(), e);
        }
    }
}

/// Identity we present: the channel's connected line, else the endpoint's own
fn connected_id(session: &Session, channel: &dyn Channel) -> PartyId {
    let fallback = self_id(session.endpoint());
    let number = channel
        .variable(CONNECTED_NUM_VAR)
        .filter(|n| !n.is_empty())
        .or(fallback.number);
    let name = channel
        .variable(CONNECTED_NAME_VAR)
        .filter(|n| !n.is_empty())
        .or(fallback.name);
    PartyId {
        name,
        number,
        restricted: fallback.restricted,
    }
}

fn replace_user(uri: &str, user: &str) -> String {
    let Some((scheme, rest)) = uri.split_once(':') else {
        return uri.to_string();
    };
    let host = rest.split_once('@').map_or(rest, |(_, host)| host);
    format!("{}:{}@{}", scheme, user, host)
}

fn identity_value(id: &PartyId, host: &str) -> Option<String> {
    let number = id.number.as_deref().filter(|n| !n.is_empty())?;
    let mut addr = NameAddr::new(format!("sip:{}@{}", number, host));
    addr.display = id.name.clone();
    Some(addr.to_string())
}

fn add_id_headers(endpoint: &EndpointConfig, message: &mut impl HeaderAccess, id: &PartyId, host: &str) {
    if id.restricted && !endpoint.caller_id.trust_outbound {
        return;
    }
    let Some(value) = identity_value(id, host) else {
        return;
    };
    if endpoint.caller_id.send_pai {
        message.remove_headers(PAI_HEADER);
        message.add_header(PAI_HEADER, value.clone());
        message.remove_headers(PRIVACY_HEADER);
        if id.restricted {
            message.add_header(PRIVACY_HEADER, "id");
        }
    }
    if endpoint.caller_id.send_rpid {
        let privacy = if id.restricted { "full" } else { "off" };
        message.remove_headers(RPID_HEADER);
        message.add_header(RPID_HEADER, format!("{};privacy={};screen=no", value, privacy));
    }
}

fn is_initial(session: &Session) -> bool {
    !matches!(
        session.invite_state(),
        InviteState::Confirmed | InviteState::Disconnected
    )
}

/// Runs just before the channel-creating supplements
#[derive(Debug, Default)]
pub struct CallerIdSupplement;

impl SessionSupplement for CallerIdSupplement {
    fn name(&self) -> &str {
        "caller-id"
    }

    fn method(&self) -> Option<&str> {
        Some("INVITE,UPDATE")
    }

    fn priority(&self) -> i32 {
        priority::CHANNEL - 1000
    }

    fn incoming_request(&self, session: &Arc<Session>, request: &SipRequest) -> RequestDisposition {
        if !is_initial(session) {
            update_connected_line(session, request);
            return RequestDisposition::Continue;
        }
        let endpoint = session.endpoint();
        if endpoint.caller_id.trust_inbound {
            if let Some(id) = trusted_id(request) {
                session.set_party_id(id);
                return RequestDisposition::Continue;
            }
        }
        let mut id = self_id(endpoint);
        if !id.is_valid() {
            if let Some(from) = id_from_from(request) {
                id = from;
            }
        }
        session.set_party_id(id);
        RequestDisposition::Continue
    }

    fn incoming_response(&self, session: &Arc<Session>, response: &SipResponse) {
        if session.channel().is_some() {
            update_connected_line(session, response);
        }
    }

    fn outgoing_request(&self, session: &Arc<Session>, request: &mut SipRequest) {
        let Some(channel) = session.channel() else {
            return;
        };
        let id = connected_id(session, channel.as_ref());
        let endpoint = session.endpoint();
        if is_initial(session)
            && endpoint.from_user.is_none()
            && (endpoint.caller_id.trust_outbound || !id.restricted)
        {
            if let Some(number) = id.number.as_deref().filter(|n| !n.is_empty()) {
                request.from.uri = replace_user(&request.from.uri, number);
            }
            if id.name.is_some() {
                request.from.display = id.name.clone();
            }
        }
        let host = request.from.host().unwrap_or("localhost").to_string();
        add_id_headers(endpoint, request, &id, &host);
    }

    fn outgoing_response(&self, session: &Arc<Session>, response: &mut SipResponse) {
        let Some(channel) = session.channel() else {
            return;
        };
        let id = connected_id(session, channel.as_ref());
        let host = response.to.host().unwrap_or("localhost").to_string();
        add_id_headers(session.endpoint(), response, &id, &host);
    }
}
