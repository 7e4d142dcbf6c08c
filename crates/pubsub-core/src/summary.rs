//! `application/simple-message-summary` bodies for the message-summary event

use std::fmt::Write;

use crate::body::{Body, BodyData, BodyGenerator};
use crate::errors::{PubsubError, Result};

/// Body type name for [`MessageSummary`] data
pub const MESSAGE_SUMMARY_BODY_TYPE: &str = "message_accumulator";
pub const MESSAGE_SUMMARY_EVENT: &str = "message-summary";
pub const MESSAGE_SUMMARY_CONTENT_TYPE: &str = "application/simple-message-summary";

/// Voice mailbox counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageSummary {
    pub new_messages: u32,
    pub old_messages: u32,
    pub urgent_new: u32,
    pub urgent_old: u32,
    pub message_account: Option<String>,
}

impl MessageSummary {
    pub fn new(new_messages: u32, old_messages: u32) -> Self {
        Self {
            new_messages,
            old_messages,
            ..Self::default()
        }
    }

    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.message_account = Some(account.into());
        self
    }

    pub fn into_body_data(self) -> BodyData {
        BodyData::new(MESSAGE_SUMMARY_BODY_TYPE, self)
    }

    /// Parse a received body. `None` unless a Voice-Message line is present.
    pub fn parse(body: &str) -> Option<Self> {
        let mut summary = MessageSummary::default();
        let mut found_counts = false;
        for line in body.lines() {
            let line = line.trim();
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            if name.trim().eq_ignore_ascii_case("voice-message") {
                if let Some(counts) = parse_counts(value) {
                    (
                        summary.new_messages,
                        summary.old_messages,
                        summary.urgent_new,
                        summary.urgent_old,
                    ) = counts;
                    found_counts = true;
                }
            } else if name.trim().eq_ignore_ascii_case("message-account") && !value.is_empty() {
                summary.message_account = Some(value.to_string());
            }
        }
        found_counts.then_some(summary)
    }
}

/// `new/old` with an optional `(urgent_new/urgent_old)`
fn parse_counts(value: &str) -> Option<(u32, u32, u32, u32)> {
    let (main, urgent) = match value.split_once('(') {
        Some((main, rest)) => (main, Some(rest.trim_end_matches(')'))),
        None => (value, None),
    };
    let pair = |text: &str| -> Option<(u32, u32)> {
        let (a, b) = text.trim().split_once('/')?;
        Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
    };
    let (new, old) = pair(main)?;
    let (urgent_new, urgent_old) = match urgent {
        Some(text) => pair(text)?,
        None => (0, 0),
    };
    Some((new, old, urgent_new, urgent_old))
}

/// Generator for `application/simple-message-summary`
#[derive(Debug, Default)]
pub struct MessageSummaryGenerator;

impl BodyGenerator for MessageSummaryGenerator {
    fn media_type(&self) -> &str {
        "application"
    }

    fn subtype(&self) -> &str {
        "simple-message-summary"
    }

    fn body_type(&self) -> &str {
        MESSAGE_SUMMARY_BODY_TYPE
    }

    fn allocate_body(&self, _data: &BodyData) -> Result<Body> {
        Ok(Box::new(String::new()))
    }

    fn generate_body_content(&self, body: &mut Body, data: &BodyData) -> Result<()> {
        let out = body
            .downcast_mut::<String>()
            .ok_or_else(|| PubsubError::body("message summary body is not text"))?;
        let summary = data
            .get::<MessageSummary>()
            .ok_or_else(|| PubsubError::body("data is not a message summary"))?;

        let waiting = if summary.new_messages > 0 { "yes" } else { "no" };
        let _ = write!(out, "Messages-Waiting: {}\r\n", waiting);
        if let Some(account) = &summary.message_account {
            let _ = write!(out, "Message-Account: {}\r\n", account);
        }
        let _ = write!(
            out,
            "Voice-Message: {}/{} ({}/{})\r\n",
            summary.new_messages, summary.old_messages, summary.urgent_new, summary.urgent_old
        );
        Ok(())
    }

    fn body_to_string(&self, body: &Body) -> Result<String> {
        body.downcast_ref::<String>()
            .cloned()
            .ok_or_else(|| PubsubError::body("message summary body is not text"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::BodyRegistry;
    use std::sync::Arc;

    #[test]
    fn generates_counts_and_account() {
        let registry = BodyRegistry::new();
        registry.register_generator(Arc::new(MessageSummaryGenerator)).unwrap();
        let data = MessageSummary::new(2, 5)
            .with_account("sip:vm@pbx.example.com")
            .into_body_data();
        let body = registry
            .generate_body_content("application", "simple-message-summary", &data)
            .unwrap();
        assert_eq!(
            body,
            "Messages-Waiting: yes\r\nMessage-Account: sip:vm@pbx.example.com\r\nVoice-Message: 2/5 (0/0)\r\n"
        );
    }

    #[test]
    fn parses_received_summary() {
        let summary = MessageSummary::parse(
            "Messages-Waiting: yes\r\nmessage-account: sip:vm@pbx\r\nVoice-Message: 3/1 (1/0)\r\n",
        )
        .unwrap();
        assert_eq!(summary.new_messages, 3);
        assert_eq!(summary.old_messages, 1);
        assert_eq!(summary.urgent_new, 1);
        assert_eq!(summary.message_account.as_deref(), Some("sip:vm@pbx"));

        assert!(MessageSummary::parse("Messages-Waiting: no\r\n").is_none());
    }
}
