//! Session layer configuration
//!
//! Endpoint, media, T.38, caller-id and features options, loaded from TOML
//! through the `config` crate. The engine keeps the loaded [`SessionConfig`]
//! as an immutable snapshot and swaps in a new one on reload.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use rvoip_infra_common::logging::LoggingConfig;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SessionError};

/// T.38 error correction scheme advertised in `T38FaxUdpEC`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum T38ErrorCorrection {
    #[default]
    None,
    Fec,
    Redundancy,
}

/// T.38 options for an endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct T38Config {
    pub enabled: bool,
    /// Local maximum datagram size, 0 means use the peer's value
    pub max_datagram: u32,
    pub error_correction: T38ErrorCorrection,
    pub nat: bool,
    pub ipv6: bool,
    /// How long a peer-initiated T.38 re-INVITE waits for the application
    pub auto_reject_timeout_ms: u64,
}

impl Default for T38Config {
    fn default() -> Self {
        Self {
            enabled: false,
            max_datagram: 0,
            error_correction: T38ErrorCorrection::None,
            nat: false,
            ipv6: false,
            auto_reject_timeout_ms: 5000,
        }
    }
}

impl T38Config {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    pub fn with_auto_reject_timeout(mut self, timeout: Duration) -> Self {
        self.auto_reject_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_datagram(mut self, max_datagram: u32) -> Self {
        self.max_datagram = max_datagram;
        self
    }

    pub fn with_error_correction(mut self, ec: T38ErrorCorrection) -> Self {
        self.error_correction = ec;
        self
    }

    pub fn auto_reject_timeout(&self) -> Duration {
        Duration::from_millis(self.auto_reject_timeout_ms)
    }
}

/// Media options for an endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Local address used in SDP and for binding media sockets
    pub address: String,
    /// Username placed in the SDP origin line
    pub sdp_owner: String,
    /// SDP `s=` line
    pub sdp_session: String,
    /// Payload formats offered for audio, in preference order
    pub codecs: Vec<String>,
    /// Payload formats offered for video, none by default
    pub video_codecs: Vec<String>,
    /// Address advertised instead of `address` when set
    pub external_media_address: Option<String>,
    pub ipv6: bool,
    pub t38: T38Config,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            sdp_owner: "-".to_string(),
            sdp_session: "rvoip".to_string(),
            codecs: vec!["0".to_string(), "8".to_string()],
            video_codecs: Vec::new(),
            external_media_address: None,
            ipv6: false,
            t38: T38Config::default(),
        }
    }
}

/// Caller identity options for an endpoint
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CallerIdConfig {
    pub trust_inbound: bool,
    pub trust_outbound: bool,
    pub send_pai: bool,
    pub send_rpid: bool,
    pub self_name: Option<String>,
    pub self_number: Option<String>,
    pub self_restricted: bool,
}

/// Configuration for one endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub id: String,
    /// Dialplan context for incoming calls
    pub context: String,
    /// Dialplan context for incoming out-of-dialog MESSAGE, `context` when unset
    pub message_context: Option<String>,
    /// Answer partial extension matches with 484 instead of 404
    pub allow_overlap: bool,
    pub from_user: Option<String>,
    pub from_domain: Option<String>,
    pub media: MediaConfig,
    pub caller_id: CallerIdConfig,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            id: "default".to_string(),
            context: "default".to_string(),
            message_context: None,
            allow_overlap: true,
            from_user: None,
            from_domain: None,
            media: MediaConfig::default(),
            caller_id: CallerIdConfig::default(),
        }
    }
}

impl EndpointConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn with_message_context(mut self, context: impl Into<String>) -> Self {
        self.message_context = Some(context.into());
        self
    }

    pub fn with_allow_overlap(mut self, allow: bool) -> Self {
        self.allow_overlap = allow;
        self
    }

    pub fn with_media_address(mut self, address: impl Into<String>) -> Self {
        self.media.address = address.into();
        self
    }

    pub fn with_t38(mut self, t38: T38Config) -> Self {
        self.media.t38 = t38;
        self
    }

    pub fn with_caller_id(mut self, caller_id: CallerIdConfig) -> Self {
        self.caller_id = caller_id;
        self
    }

    /// Context used for incoming out-of-dialog messages
    pub fn message_context(&self) -> &str {
        self.message_context.as_deref().unwrap_or(&self.context)
    }

    /// Address advertised in SDP
    pub fn advertised_media_address(&self) -> &str {
        self.media
            .external_media_address
            .as_deref()
            .unwrap_or(&self.media.address)
    }
}

/// Call features options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeaturesConfig {
    /// Extension that performs a call pickup
    pub pickup_exten: String,
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            pickup_exten: "*8".to_string(),
        }
    }
}

/// Top level configuration for the session engine
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub logging: LoggingConfig,
    pub features: FeaturesConfig,
    /// Endpoints keyed by id
    pub endpoints: HashMap<String, EndpointConfig>,
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_endpoint(mut self, endpoint: EndpointConfig) -> Self {
        self.endpoints.insert(endpoint.id.clone(), endpoint);
        self
    }

    pub fn with_features(mut self, features: FeaturesConfig) -> Self {
        self.features = features;
        self
    }

    pub fn endpoint(&self, id: &str) -> Result<&EndpointConfig> {
        self.endpoints
            .get(id)
            .ok_or_else(|| SessionError::EndpointNotFound(id.to_string()))
    }

    /// Load configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let loaded: SessionConfig = ::config::Config::builder()
            .add_source(::config::File::from_str(text, ::config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        loaded.normalized()
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let loaded: SessionConfig = ::config::Config::builder()
            .add_source(::config::File::from(path).format(::config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        loaded.normalized()
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Fill endpoint ids from their table keys and check option values
    fn normalized(mut self) -> Result<Self> {
        for (key, endpoint) in self.endpoints.iter_mut() {
            if endpoint.id.is_empty() || endpoint.id == "default" {
                endpoint.id = key.clone();
            }
            if endpoint.id != *key {
                return Err(SessionError::Config(format!(
                    "endpoint table '{}' declares id '{}'",
                    key, endpoint.id
                )));
            }
            if endpoint.context.is_empty() {
                return Err(SessionError::Config(format!(
                    "endpoint '{}' has an empty context",
                    key
                )));
            }
        }
        if self.features.pickup_exten.is_empty() {
            return Err(SessionError::Config("pickup_exten must not be empty".into()));
        }
        Ok(self)
    }
}
