//! Messaging options

use std::collections::HashMap;

use rvoip_session_core::sip::uri_scheme;
use serde::{Deserialize, Serialize};

use crate::errors::{MessageError, Result};

/// User part of the From URI when neither the message nor the endpoint names one
pub const DEFAULT_FROM_USER: &str = "rvoip";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageConfig {
    /// Endpoint used for destinations that only name a URI or host
    pub default_outbound_endpoint: Option<String>,
    pub default_from_user: String,
    /// Contact URI per endpoint id, used when a destination names only the endpoint
    pub contacts: HashMap<String, String>,
}

impl Default for MessageConfig {
    fn default() -> Self {
        Self {
            default_outbound_endpoint: None,
            default_from_user: DEFAULT_FROM_USER.to_string(),
            contacts: HashMap::new(),
        }
    }
}

impl MessageConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_outbound_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.default_outbound_endpoint = Some(endpoint.into());
        self
    }

    pub fn with_default_from_user(mut self, user: impl Into<String>) -> Self {
        self.default_from_user = user.into();
        self
    }

    pub fn with_contact(mut self, endpoint: impl Into<String>, uri: impl Into<String>) -> Self {
        self.contacts.insert(endpoint.into(), uri.into());
        self
    }

    pub fn contact(&self, endpoint: &str) -> Option<&str> {
        self.contacts.get(endpoint).map(String::as_str)
    }

    /// Load options from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let loaded: MessageConfig = ::config::Config::builder()
            .add_source(::config::File::from_str(text, ::config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        loaded.validated()
    }

    fn validated(self) -> Result<Self> {
        if self.default_from_user.is_empty() {
            return Err(MessageError::Config("default_from_user is empty".to_string()));
        }
        for (endpoint, uri) in &self.contacts {
            if !matches!(uri_scheme(uri).as_deref(), Some("sip") | Some("sips")) {
                return Err(MessageError::Config(format!(
                    "contact '{}' for endpoint '{}' is not a SIP URI",
                    uri, endpoint
                )));
            }
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_contacts_from_toml() {
        let config = MessageConfig::from_toml_str(
            r#"
            default_outbound_endpoint = "trunk"

            [contacts]
            bob = "sip:bob@192.0.2.20:5060"
            "#,
        )
        .unwrap();
        assert_eq!(config.default_outbound_endpoint.as_deref(), Some("trunk"));
        assert_eq!(config.default_from_user, DEFAULT_FROM_USER);
        assert_eq!(config.contact("bob"), Some("sip:bob@192.0.2.20:5060"));
    }

    #[test]
    fn rejects_contacts_that_are_not_sip() {
        let err = MessageConfig::from_toml_str(
            r#"
            [contacts]
            bob = "tel:+15551234"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, MessageError::Config(_)));
    }
}
