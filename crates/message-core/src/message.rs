//! Out-of-call text messages

use serde::{Deserialize, Serialize};

use crate::vars::VarStore;

/// A text message routed outside of any call
///
/// `to` and `from` are URIs prefixed with the technology that carried the
/// message (`pjsip:alice@pbx.example.com`). `context` and `exten` say where
/// the dialplan handler delivers it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub to: String,
    pub from: String,
    pub body: String,
    pub context: String,
    pub exten: String,
    /// Technology the message arrived on, "PJSIP" for SIP MESSAGE
    pub tech: String,
    /// Endpoint the message arrived from
    pub endpoint: String,
    vars: VarStore,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.to = to.into();
        self
    }

    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = from.into();
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_destination(mut self, context: impl Into<String>, exten: impl Into<String>) -> Self {
        self.context = context.into();
        self.exten = exten.into();
        self
    }

    pub fn with_tech(mut self, tech: impl Into<String>, endpoint: impl Into<String>) -> Self {
        self.tech = tech.into();
        self.endpoint = endpoint.into();
        self
    }

    /// Set a received variable. An empty value removes it.
    pub fn set_var(&mut self, name: &str, value: &str) {
        self.vars.set(name, value, false);
    }

    /// Set a variable sent along when the message goes out
    pub fn set_var_outbound(&mut self, name: &str, value: &str) {
        self.vars.set(name, value, true);
    }

    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars.get(name)
    }

    pub fn outbound_vars(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.outbound()
    }

    pub fn received_vars(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.received()
    }

    /// Flip every variable to outbound or back to received
    pub fn set_all_outbound(&mut self, outbound: bool) {
        self.vars.set_all_outbound(outbound);
    }

    pub fn vars(&self) -> &VarStore {
        &self.vars
    }

    /// Dialplan extension, `s` when none was given
    pub fn exten_or_start(&self) -> &str {
        if self.exten.is_empty() { "s" } else { &self.exten }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn received_variable_becomes_outbound_when_set_again() {
        let mut msg = Message::new().with_to("testmsg:foo").with_from("testmsg:bar");
        msg.set_var("foo", "bar");
        msg.set_var("foo", "new_bar");
        assert_eq!(msg.outbound_vars().count(), 0);

        msg.set_var_outbound("foo", "outbound_bar");
        let outbound: Vec<_> = msg.outbound_vars().collect();
        assert_eq!(outbound, vec![("foo", "outbound_bar")]);
        assert_eq!(msg.received_vars().count(), 0);
    }

    #[test]
    fn missing_exten_starts_at_s() {
        let msg = Message::new().with_destination("default", "");
        assert_eq!(msg.exten_or_start(), "s");
        let msg = msg.with_destination("default", "100");
        assert_eq!(msg.exten_or_start(), "100");
    }
}
