//! Normalized email types shared across the pipeline.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single inbound or historical email, as handed to the engine.
///
/// Provider adapters convert their native format into this struct before
/// the pipeline sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailMessage {
    /// Provider-native message id.
    pub id: String,
    /// Provider-native thread id.
    pub thread_id: String,
    /// Sender address.
    pub from: String,
    /// Human-readable sender name, if available.
    pub from_name: Option<String>,
    /// Recipient addresses.
    pub to: Vec<String>,
    /// Reply-To header, if present.
    pub reply_to: Option<String>,
    /// Subject line.
    pub subject: String,
    /// Plain-text body.
    pub body: String,
    /// When the message was received.
    pub received_at: DateTime<Utc>,
}

/// An email plus everything the downstream stages need to know about it:
/// normalized fields, category membership, and the closed fact set the
/// argument resolver is allowed to draw from.
#[derive(Debug, Clone)]
pub struct EmailContext {
    pub email: EmailMessage,
    /// Lowercased sender for case-insensitive matching.
    pub sender_lower: String,
    /// Category memberships from the external categorizer.
    pub categories: Vec<String>,
}

impl EmailContext {
    /// Build a context from an email and its categories.
    pub fn new(email: EmailMessage, categories: Vec<String>) -> Self {
        let sender_lower = email.from.to_lowercase();
        Self {
            email,
            sender_lower,
            categories,
        }
    }

    /// Case-insensitive category membership check.
    pub fn in_category(&self, name: &str) -> bool {
        self.categories.iter().any(|c| c.eq_ignore_ascii_case(name))
    }

    /// The closed set of facts an argument may be resolved from.
    ///
    /// Keys are the well-known placeholder names; values come verbatim
    /// from the email. Nothing outside this map is ever a legal
    /// resolution result.
    pub fn fact_set(&self) -> BTreeMap<&'static str, String> {
        let mut facts = BTreeMap::new();
        facts.insert("sender", self.email.from.clone());
        if let Some(ref name) = self.email.from_name {
            facts.insert("sender_name", name.clone());
        }
        facts.insert("subject", self.email.subject.clone());
        facts.insert("thread_id", self.email.thread_id.clone());
        if let Some(ref reply_to) = self.email.reply_to {
            facts.insert("reply_to", reply_to.clone());
        }
        if let Some(first) = self.email.to.first() {
            facts.insert("recipient", first.clone());
        }
        facts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EmailMessage {
        EmailMessage {
            id: "m-1".into(),
            thread_id: "t-1".into(),
            from: "Alice@Example.com".into(),
            from_name: Some("Alice".into()),
            to: vec!["me@corp.com".into()],
            reply_to: None,
            subject: "Quarterly Report".into(),
            body: "Please find attached.".into(),
            received_at: Utc::now(),
        }
    }

    #[test]
    fn context_normalizes_case() {
        let ctx = EmailContext::new(sample(), vec!["Newsletter".into()]);
        assert_eq!(ctx.sender_lower, "alice@example.com");
        assert!(ctx.in_category("newsletter"));
        assert!(!ctx.in_category("receipts"));
    }

    #[test]
    fn fact_set_is_closed_over_email_fields() {
        let ctx = EmailContext::new(sample(), vec![]);
        let facts = ctx.fact_set();
        assert_eq!(facts.get("sender").unwrap(), "Alice@Example.com");
        assert_eq!(facts.get("sender_name").unwrap(), "Alice");
        assert_eq!(facts.get("recipient").unwrap(), "me@corp.com");
        // Absent headers produce no fact at all
        assert!(!facts.contains_key("reply_to"));
    }
}
