//! Subscription and publication options

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::errors::{PubsubError, Result};

/// Expiry used when a SUBSCRIBE carries no Expires header
pub const DEFAULT_EXPIRES: u32 = 3600;
/// Expiry used when a PUBLISH carries no Expires header
pub const DEFAULT_PUBLISH_EXPIRES: u32 = 3600;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PubsubConfig {
    /// Accept SUBSCRIBE requests at all
    pub allow_subscribe: bool,
    /// Endpoints refused with 603 even when subscriptions are allowed
    pub deny_endpoints: HashSet<String>,
    /// Shortest expiry a subscriber may ask for, answered with 423 below it
    pub min_expiry: u32,
    pub default_expires: u32,
    pub default_publish_expires: u32,
    /// Seconds before expiry at which a subscriber refreshes
    pub refresh_margin: u32,
}

impl Default for PubsubConfig {
    fn default() -> Self {
        Self {
            allow_subscribe: true,
            deny_endpoints: HashSet::new(),
            min_expiry: 60,
            default_expires: DEFAULT_EXPIRES,
            default_publish_expires: DEFAULT_PUBLISH_EXPIRES,
            refresh_margin: 5,
        }
    }
}

impl PubsubConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_allow_subscribe(mut self, allow: bool) -> Self {
        self.allow_subscribe = allow;
        self
    }

    pub fn with_denied_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.deny_endpoints.insert(endpoint.into());
        self
    }

    pub fn with_min_expiry(mut self, seconds: u32) -> Self {
        self.min_expiry = seconds;
        self
    }

    pub fn with_default_expires(mut self, seconds: u32) -> Self {
        self.default_expires = seconds;
        self
    }

    /// True when `endpoint` may create subscriptions
    pub fn subscriptions_allowed(&self, endpoint: &str) -> bool {
        self.allow_subscribe && !self.deny_endpoints.contains(endpoint)
    }

    /// Load options from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let loaded: PubsubConfig = ::config::Config::builder()
            .add_source(::config::File::from_str(text, ::config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        if loaded.default_expires == 0 || loaded.default_publish_expires == 0 {
            return Err(PubsubError::Config(
                "default expiry must be greater than zero".to_string(),
            ));
        }
        Ok(loaded)
    }
}
