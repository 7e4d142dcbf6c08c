//! Out-of-call transfer requests

use serde::{Deserialize, Serialize};

use crate::vars::VarStore;

/// Variable holding the display name put in front of the Refer-To URI
pub const DISPLAY_NAME_VAR: &str = "display_name";

/// A request asking `to` to contact `refer_to`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Refer {
    /// Technology-prefixed destination, `pjsip:bob`
    pub to: String,
    pub from: String,
    pub refer_to: String,
    pub endpoint: String,
    pub tech: String,
    /// The refer targets one of our own endpoints
    pub to_self: bool,
    vars: VarStore,
}

impl Refer {
    pub fn new(to: impl Into<String>, from: impl Into<String>, refer_to: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            from: from.into(),
            refer_to: refer_to.into(),
            ..Self::default()
        }
    }

    pub fn with_tech(mut self, tech: impl Into<String>, endpoint: impl Into<String>) -> Self {
        self.tech = tech.into();
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_to_self(mut self, to_self: bool) -> Self {
        self.to_self = to_self;
        self
    }

    pub fn set_var(&mut self, name: &str, value: &str) {
        self.vars.set(name, value, false);
    }

    pub fn set_var_outbound(&mut self, name: &str, value: &str) {
        self.vars.set(name, value, true);
    }

    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars.get(name)
    }

    /// Remove a variable and hand back its value
    pub fn take_var(&mut self, name: &str) -> Option<String> {
        self.vars.take(name)
    }

    pub fn outbound_vars(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.outbound()
    }
}
