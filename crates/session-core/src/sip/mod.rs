//! SIP message model
//!
//! Parsed requests and responses as the session layer sees them. Wire
//! parsing and transactions belong to the protocol engine; this module only
//! carries the fields sessions, supplements and handlers inspect or modify,
//! plus the [`SipSender`] seam used to hand messages back to the engine.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use uuid::Uuid;

use crate::errors::Result;
use crate::sdp::SessionDescription;

/// SIP request method
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Invite,
    Ack,
    Bye,
    Cancel,
    Update,
    Info,
    Message,
    Refer,
    Notify,
    Subscribe,
    Publish,
    Options,
    Prack,
    Other(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Update => "UPDATE",
            Method::Info => "INFO",
            Method::Message => "MESSAGE",
            Method::Refer => "REFER",
            Method::Notify => "NOTIFY",
            Method::Subscribe => "SUBSCRIBE",
            Method::Publish => "PUBLISH",
            Method::Options => "OPTIONS",
            Method::Prack => "PRACK",
            Method::Other(name) => name,
        }
    }
}

impl FromStr for Method {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_uppercase().as_str() {
            "INVITE" => Method::Invite,
            "ACK" => Method::Ack,
            "BYE" => Method::Bye,
            "CANCEL" => Method::Cancel,
            "UPDATE" => Method::Update,
            "INFO" => Method::Info,
            "MESSAGE" => Method::Message,
            "REFER" => Method::Refer,
            "NOTIFY" => Method::Notify,
            "SUBSCRIBE" => Method::Subscribe,
            "PUBLISH" => Method::Publish,
            "OPTIONS" => Method::Options,
            "PRACK" => Method::Prack,
            other => Method::Other(other.to_string()),
        })
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single header line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipHeader {
    pub name: String,
    pub value: String,
}

impl SipHeader {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Display name plus URI, as carried in From, To and identity headers
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NameAddr {
    pub display: Option<String>,
    pub uri: String,
}

impl NameAddr {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            display: None,
            uri: uri.into(),
        }
    }

    pub fn with_display(mut self, display: impl Into<String>) -> Self {
        self.display = Some(display.into());
        self
    }

    /// Parse `"Display" <uri>;params`, `Display <uri>` or a bare URI
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        match (value.find('<'), value.find('>')) {
            (Some(open), Some(close)) if close > open => {
                let display = value[..open].trim().trim_matches('"').trim();
                NameAddr {
                    display: (!display.is_empty()).then(|| display.to_string()),
                    uri: value[open + 1..close].trim().to_string(),
                }
            }
            _ => NameAddr::new(value.split(';').next().unwrap_or_default().trim()),
        }
    }

    /// URI scheme in lower case ("sip", "sips", "tel", ...)
    pub fn scheme(&self) -> Option<String> {
        uri_scheme(&self.uri)
    }

    /// User part of a sip/sips URI
    pub fn user(&self) -> Option<&str> {
        uri_user(&self.uri)
    }

    pub fn host(&self) -> Option<&str> {
        uri_host(&self.uri)
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.display {
            Some(display) => write!(f, "\"{}\" <{}>", display, self.uri),
            None => write!(f, "<{}>", self.uri),
        }
    }
}

/// Lower-cased scheme of a URI
pub fn uri_scheme(uri: &str) -> Option<String> {
    let uri = uri.trim().trim_start_matches('<');
    let colon = uri.find(':')?;
    let scheme = &uri[..colon];
    (!scheme.is_empty() && scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.'))
        .then(|| scheme.to_ascii_lowercase())
}

/// User part of a URI, without user parameters (`;` options)
pub fn uri_user(uri: &str) -> Option<&str> {
    let uri = uri.trim().trim_start_matches('<');
    let rest = &uri[uri.find(':')? + 1..];
    let at = rest.find('@')?;
    let user = &rest[..at];
    Some(user.split(';').next().unwrap_or(user))
}

/// Host part of a URI
pub fn uri_host(uri: &str) -> Option<&str> {
    let uri = uri.trim().trim_start_matches('<').trim_end_matches('>');
    let rest = &uri[uri.find(':')? + 1..];
    let host_part = match rest.find('@') {
        Some(at) => &rest[at + 1..],
        None => rest,
    };
    host_part
        .split(|c| c == ';' || c == '?' || c == ':' || c == '>')
        .next()
        .filter(|h| !h.is_empty())
}

/// Message body with its content type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipBody {
    /// `type/subtype`, parameters allowed after `;`
    pub content_type: String,
    pub content: String,
}

impl SipBody {
    pub fn new(content_type: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            content: content.into(),
        }
    }

    /// Lower-cased `(type, subtype)` pair
    pub fn media_type(&self) -> (String, String) {
        let essence = self.content_type.split(';').next().unwrap_or_default().trim();
        let mut parts = essence.splitn(2, '/');
        let kind = parts.next().unwrap_or_default().trim().to_ascii_lowercase();
        let subtype = parts.next().unwrap_or_default().trim().to_ascii_lowercase();
        (kind, subtype)
    }

    pub fn is_type(&self, kind: &str, subtype: &str) -> bool {
        let (k, s) = self.media_type();
        k.eq_ignore_ascii_case(kind) && s.eq_ignore_ascii_case(subtype)
    }
}

/// Header helpers shared by requests and responses
pub trait HeaderAccess {
    fn headers(&self) -> &Vec<SipHeader>;
    fn headers_mut(&mut self) -> &mut Vec<SipHeader>;

    /// First header with the given name (case-insensitive)
    fn header(&self, name: &str) -> Option<&str> {
        self.headers()
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    fn headers_named<'a>(&'a self, name: &'a str) -> Box<dyn Iterator<Item = &'a SipHeader> + 'a> {
        Box::new(
            self.headers()
                .iter()
                .filter(move |h| h.name.eq_ignore_ascii_case(name)),
        )
    }

    fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers_mut().push(SipHeader::new(name, value));
    }

    /// Remove every header with the given name, returning how many went
    fn remove_headers(&mut self, name: &str) -> usize {
        let before = self.headers().len();
        self.headers_mut().retain(|h| !h.name.eq_ignore_ascii_case(name));
        before - self.headers().len()
    }

    fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }
}

/// A SIP request
#[derive(Debug, Clone, PartialEq)]
pub struct SipRequest {
    pub method: Method,
    pub uri: String,
    pub call_id: String,
    pub from: NameAddr,
    pub from_tag: Option<String>,
    pub to: NameAddr,
    pub to_tag: Option<String>,
    pub cseq: u32,
    pub via_branch: String,
    pub headers: Vec<SipHeader>,
    pub sdp: Option<SessionDescription>,
    pub body: Option<SipBody>,
    /// Where the request came from, for received requests
    pub source: Option<SocketAddr>,
    /// Transport name, "udp", "tcp" or "tls"
    pub transport: String,
}

impl SipRequest {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            call_id: Uuid::new_v4().to_string(),
            from: NameAddr::default(),
            from_tag: Some(new_tag()),
            to: NameAddr::default(),
            to_tag: None,
            cseq: 1,
            via_branch: new_branch(),
            headers: Vec::new(),
            sdp: None,
            body: None,
            source: None,
            transport: "udp".to_string(),
        }
    }

    pub fn with_call_id(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = call_id.into();
        self
    }

    pub fn with_from(mut self, from: NameAddr, tag: Option<String>) -> Self {
        self.from = from;
        self.from_tag = tag;
        self
    }

    pub fn with_to(mut self, to: NameAddr, tag: Option<String>) -> Self {
        self.to = to;
        self.to_tag = tag;
        self
    }

    pub fn with_cseq(mut self, cseq: u32) -> Self {
        self.cseq = cseq;
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.via_branch = branch.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_header(name, value);
        self
    }

    pub fn with_sdp(mut self, sdp: SessionDescription) -> Self {
        self.sdp = Some(sdp);
        self
    }

    pub fn with_body(mut self, body: SipBody) -> Self {
        self.body = Some(body);
        self
    }

    /// Key identifying the server transaction; retransmissions share it
    pub fn transaction_key(&self) -> String {
        format!("{}:{}:{}", self.via_branch, self.cseq, self.method)
    }

    pub fn uri_scheme(&self) -> Option<String> {
        uri_scheme(&self.uri)
    }

    pub fn uri_user(&self) -> Option<&str> {
        uri_user(&self.uri)
    }

    /// True for requests sent inside an existing dialog
    pub fn is_in_dialog(&self) -> bool {
        self.to_tag.is_some()
    }
}

impl HeaderAccess for SipRequest {
    fn headers(&self) -> &Vec<SipHeader> {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut Vec<SipHeader> {
        &mut self.headers
    }
}

/// A SIP response
#[derive(Debug, Clone, PartialEq)]
pub struct SipResponse {
    pub status: u16,
    pub reason: String,
    /// Method from the CSeq header
    pub method: Method,
    pub cseq: u32,
    pub call_id: String,
    pub from: NameAddr,
    pub from_tag: Option<String>,
    pub to: NameAddr,
    pub to_tag: Option<String>,
    pub via_branch: String,
    pub headers: Vec<SipHeader>,
    pub sdp: Option<SessionDescription>,
    pub body: Option<SipBody>,
}

impl SipResponse {
    /// Build a response to `request`, copying the dialog identifiers
    pub fn for_request(request: &SipRequest, status: u16) -> Self {
        Self {
            status,
            reason: reason_phrase(status).to_string(),
            method: request.method.clone(),
            cseq: request.cseq,
            call_id: request.call_id.clone(),
            from: request.from.clone(),
            from_tag: request.from_tag.clone(),
            to: request.to.clone(),
            to_tag: request.to_tag.clone(),
            via_branch: request.via_branch.clone(),
            headers: Vec::new(),
            sdp: None,
            body: None,
        }
    }

    pub fn with_to_tag(mut self, tag: Option<String>) -> Self {
        if self.to_tag.is_none() {
            self.to_tag = tag;
        }
        self
    }

    pub fn with_sdp(mut self, sdp: SessionDescription) -> Self {
        self.sdp = Some(sdp);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_header(name, value);
        self
    }

    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.status)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_final(&self) -> bool {
        self.status >= 200
    }
}

impl HeaderAccess for SipResponse {
    fn headers(&self) -> &Vec<SipHeader> {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut Vec<SipHeader> {
        &mut self.headers
    }
}

/// Standard reason phrase for a status code
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Trying",
        180 => "Ringing",
        183 => "Session Progress",
        200 => "OK",
        202 => "Accepted",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        412 => "Conditional Request Failed",
        415 => "Unsupported Media Type",
        416 => "Unsupported URI Scheme",
        423 => "Interval Too Brief",
        481 => "Call/Transaction Does Not Exist",
        484 => "Address Incomplete",
        486 => "Busy Here",
        487 => "Request Terminated",
        488 => "Not Acceptable Here",
        489 => "Bad Event",
        491 => "Request Pending",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        603 => "Decline",
        _ => "Unknown",
    }
}

pub fn new_tag() -> String {
    Uuid::new_v4().simple().to_string()[..10].to_string()
}

pub fn new_branch() -> String {
    format!("z9hG4bK{}", Uuid::new_v4().simple())
}

/// Hands messages to the protocol engine for transmission
pub trait SipSender: Send + Sync {
    fn send_request(&self, request: &SipRequest) -> Result<()>;

    fn send_response(&self, response: &SipResponse) -> Result<()>;
}
