//! SDP value types

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SessionError};

/// Stream direction attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl MediaDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaDirection::SendRecv => "sendrecv",
            MediaDirection::SendOnly => "sendonly",
            MediaDirection::RecvOnly => "recvonly",
            MediaDirection::Inactive => "inactive",
        }
    }

    pub fn from_attribute(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sendrecv" => Some(MediaDirection::SendRecv),
            "sendonly" => Some(MediaDirection::SendOnly),
            "recvonly" => Some(MediaDirection::RecvOnly),
            "inactive" => Some(MediaDirection::Inactive),
            _ => None,
        }
    }

    /// The direction we answer with when the peer offers `self`
    pub fn reversed(&self) -> Self {
        match self {
            MediaDirection::SendOnly => MediaDirection::RecvOnly,
            MediaDirection::RecvOnly => MediaDirection::SendOnly,
            other => *other,
        }
    }
}

impl fmt::Display for MediaDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `o=` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub username: String,
    pub session_id: u64,
    pub session_version: u64,
    pub net_type: String,
    pub addr_type: String,
    pub address: String,
}

impl Origin {
    pub fn new(username: impl Into<String>, session_id: u64, session_version: u64, address: &str) -> Self {
        Self {
            username: username.into(),
            session_id,
            session_version,
            net_type: "IN".to_string(),
            addr_type: addr_type_for(address).to_string(),
            address: address.to_string(),
        }
    }
}

/// `c=` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub net_type: String,
    pub addr_type: String,
    pub address: String,
}

impl Connection {
    pub fn new(address: &str) -> Self {
        Self {
            net_type: "IN".to_string(),
            addr_type: addr_type_for(address).to_string(),
            address: address.to_string(),
        }
    }
}

/// "IP6" for addresses containing a colon, otherwise "IP4"
pub fn addr_type_for(address: &str) -> &'static str {
    if address.contains(':') { "IP6" } else { "IP4" }
}

/// `a=name[:value]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpAttribute {
    pub name: String,
    pub value: Option<String>,
}

impl SdpAttribute {
    pub fn flag(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
        }
    }

    pub fn value(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }
}

/// One `m=` section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescription {
    /// Stream type: "audio", "video", "image", ...
    pub media: String,
    pub port: u16,
    pub protocol: String,
    pub formats: Vec<String>,
    pub connection: Option<Connection>,
    pub attributes: Vec<SdpAttribute>,
}

impl MediaDescription {
    pub fn new(media: impl Into<String>, port: u16, protocol: impl Into<String>) -> Self {
        Self {
            media: media.into(),
            port,
            protocol: protocol.into(),
            formats: Vec::new(),
            connection: None,
            attributes: Vec::new(),
        }
    }

    /// A rejected stream of the given type, as placed in an answer
    pub fn declined(media: impl Into<String>, protocol: impl Into<String>, formats: Vec<String>) -> Self {
        let mut declined = Self::new(media, 0, protocol);
        declined.formats = if formats.is_empty() { vec!["0".to_string()] } else { formats };
        declined
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.formats.push(format.into());
        self
    }

    pub fn with_connection(mut self, connection: Connection) -> Self {
        self.connection = Some(connection);
        self
    }

    pub fn with_attribute(mut self, attribute: SdpAttribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn is_declined(&self) -> bool {
        self.port == 0
    }

    pub fn attribute(&self, name: &str) -> Option<&SdpAttribute> {
        self.attributes
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(name))
    }

    /// Value of an attribute, `Some("")` for a flag attribute
    pub fn attribute_value(&self, name: &str) -> Option<&str> {
        self.attribute(name)
            .map(|a| a.value.as_deref().unwrap_or(""))
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attribute(name).is_some()
    }

    pub fn remove_attribute(&mut self, name: &str) {
        self.attributes.retain(|a| !a.name.eq_ignore_ascii_case(name));
    }

    pub fn direction(&self) -> Option<MediaDirection> {
        self.attributes
            .iter()
            .find_map(|a| MediaDirection::from_attribute(&a.name))
    }

    /// Replace any direction attribute with `direction`
    pub fn set_direction(&mut self, direction: MediaDirection) {
        self.attributes
            .retain(|a| MediaDirection::from_attribute(&a.name).is_none());
        self.attributes.push(SdpAttribute::flag(direction.as_str()));
    }
}

/// A parsed session description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub origin: Origin,
    pub session_name: String,
    pub connection: Option<Connection>,
    pub timing: (u64, u64),
    pub attributes: Vec<SdpAttribute>,
    pub media: Vec<MediaDescription>,
}

impl SessionDescription {
    pub fn new(origin: Origin, session_name: impl Into<String>) -> Self {
        Self {
            origin,
            session_name: session_name.into(),
            connection: None,
            timing: (0, 0),
            attributes: Vec::new(),
            media: Vec::new(),
        }
    }

    pub fn with_connection(mut self, connection: Connection) -> Self {
        self.connection = Some(connection);
        self
    }

    pub fn with_media(mut self, media: MediaDescription) -> Self {
        self.media.push(media);
        self
    }

    /// Connection in effect for stream `index`
    pub fn connection_for(&self, index: usize) -> Option<&Connection> {
        self.media
            .get(index)
            .and_then(|m| m.connection.as_ref())
            .or(self.connection.as_ref())
    }

    /// Parse SDP text. Unknown line types are ignored.
    pub fn parse(text: &str) -> Result<Self> {
        let mut origin = None;
        let mut session_name = String::from("-");
        let mut connection = None;
        let mut timing = (0, 0);
        let mut attributes = Vec::new();
        let mut media: Vec<MediaDescription> = Vec::new();

        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let (kind, value) = line
                .split_once('=')
                .ok_or_else(|| SessionError::NegotiationFailed(format!("bad SDP line '{}'", line)))?;
            match kind {
                "v" => {}
                "o" => origin = Some(parse_origin(value)?),
                "s" => session_name = value.to_string(),
                "c" => {
                    let c = parse_connection(value)?;
                    match media.last_mut() {
                        Some(m) => m.connection = Some(c),
                        None => connection = Some(c),
                    }
                }
                "t" => {
                    let mut parts = value.split_whitespace();
                    let start = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
                    let stop = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
                    timing = (start, stop);
                }
                "m" => media.push(parse_media(value)?),
                "a" => {
                    let attribute = match value.split_once(':') {
                        Some((name, v)) => SdpAttribute::value(name, v),
                        None => SdpAttribute::flag(value),
                    };
                    match media.last_mut() {
                        Some(m) => m.attributes.push(attribute),
                        None => attributes.push(attribute),
                    }
                }
                _ => {}
            }
        }

        let origin = origin.ok_or_else(|| SessionError::NegotiationFailed("SDP without origin".into()))?;
        Ok(Self {
            origin,
            session_name,
            connection,
            timing,
            attributes,
            media,
        })
    }
}

impl FromStr for SessionDescription {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn parse_origin(value: &str) -> Result<Origin> {
    let parts: Vec<&str> = value.split_whitespace().collect();
    if parts.len() != 6 {
        return Err(SessionError::NegotiationFailed(format!("bad origin '{}'", value)));
    }
    let number = |s: &str| {
        s.parse::<u64>()
            .map_err(|_| SessionError::NegotiationFailed(format!("bad origin number '{}'", s)))
    };
    Ok(Origin {
        username: parts[0].to_string(),
        session_id: number(parts[1])?,
        session_version: number(parts[2])?,
        net_type: parts[3].to_string(),
        addr_type: parts[4].to_string(),
        address: parts[5].to_string(),
    })
}

fn parse_connection(value: &str) -> Result<Connection> {
    let parts: Vec<&str> = value.split_whitespace().collect();
    if parts.len() != 3 {
        return Err(SessionError::NegotiationFailed(format!("bad connection '{}'", value)));
    }
    Ok(Connection {
        net_type: parts[0].to_string(),
        addr_type: parts[1].to_string(),
        address: parts[2].to_string(),
    })
}

fn parse_media(value: &str) -> Result<MediaDescription> {
    let mut parts = value.split_whitespace();
    let media = parts.next();
    let port = parts.next().and_then(|p| p.split('/').next()).and_then(|p| p.parse::<u16>().ok());
    let protocol = parts.next();
    match (media, port, protocol) {
        (Some(media), Some(port), Some(protocol)) => {
            let mut description = MediaDescription::new(media, port, protocol);
            description.formats = parts.map(str::to_string).collect();
            Ok(description)
        }
        _ => Err(SessionError::NegotiationFailed(format!("bad media line '{}'", value))),
    }
}

fn write_attribute(f: &mut fmt::Formatter<'_>, attribute: &SdpAttribute) -> fmt::Result {
    match &attribute.value {
        Some(value) => write!(f, "a={}:{}\r\n", attribute.name, value),
        None => write!(f, "a={}\r\n", attribute.name),
    }
}

fn write_connection(f: &mut fmt::Formatter<'_>, c: &Connection) -> fmt::Result {
    write!(f, "c={} {} {}\r\n", c.net_type, c.addr_type, c.address)
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.origin;
        write!(f, "v=0\r\n")?;
        write!(
            f,
            "o={} {} {} {} {} {}\r\n",
            o.username, o.session_id, o.session_version, o.net_type, o.addr_type, o.address
        )?;
        write!(f, "s={}\r\n", self.session_name)?;
        if let Some(c) = &self.connection {
            write_connection(f, c)?;
        }
        write!(f, "t={} {}\r\n", self.timing.0, self.timing.1)?;
        for attribute in &self.attributes {
            write_attribute(f, attribute)?;
        }
        for m in &self.media {
            write!(f, "m={} {} {}", m.media, m.port, m.protocol)?;
            for format in &m.formats {
                write!(f, " {}", format)?;
            }
            write!(f, "\r\n")?;
            if let Some(c) = &m.connection {
                write_connection(f, c)?;
            }
            for attribute in &m.attributes {
                write_attribute(f, attribute)?;
            }
        }
        Ok(())
    }
}
