//! Rule data model — conditions, actions, and the rule record itself.
//!
//! `Condition` and `Action` are closed tagged enums so the matcher and
//! executor can exhaustively match; adding a variant is a compile-time
//! checked change everywhere it is handled.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Patterns ────────────────────────────────────────────────────────

/// How a pattern value is compared against an email field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    Exact,
    Contains,
    Regex,
}

/// A text pattern with its comparison mode.
///
/// `Exact` and `Contains` compare case-insensitively. `Regex` patterns
/// are compiled as written; authors opt into `(?i)` themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub value: String,
    pub mode: MatchMode,
}

impl Pattern {
    pub fn exact(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            mode: MatchMode::Exact,
        }
    }

    pub fn contains(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            mode: MatchMode::Contains,
        }
    }

    pub fn regex(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            mode: MatchMode::Regex,
        }
    }

    /// Test the pattern against a field value.
    ///
    /// Returns `Err` when a regex pattern fails to compile — the caller
    /// treats that as a malformed rule, not a non-match.
    pub fn matches(&self, haystack: &str) -> Result<bool, String> {
        match self.mode {
            MatchMode::Exact => Ok(haystack.eq_ignore_ascii_case(&self.value)),
            MatchMode::Contains => Ok(haystack
                .to_lowercase()
                .contains(&self.value.to_lowercase())),
            MatchMode::Regex => {
                let re = Regex::new(&self.value)
                    .map_err(|e| format!("invalid pattern '{}': {e}", self.value))?;
                Ok(re.is_match(haystack))
            }
        }
    }
}

// ── Conditions ──────────────────────────────────────────────────────

/// A predicate evaluated against a normalized email. All conditions in a
/// rule are AND-ed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    From { pattern: Pattern },
    Subject { pattern: Pattern },
    Body { pattern: Pattern },
    Category { name: String },
    /// Natural-language predicate. Evaluates trivially true during
    /// deterministic matching; final acceptance is deferred to the
    /// selector.
    AiMatch { instruction: String },
}

impl Condition {
    /// Whether this condition requires AI confirmation downstream.
    pub fn needs_ai(&self) -> bool {
        matches!(self, Self::AiMatch { .. })
    }

    /// Short label for logging and prompts.
    pub fn label(&self) -> &'static str {
        match self {
            Self::From { .. } => "from",
            Self::Subject { .. } => "subject",
            Self::Body { .. } => "body",
            Self::Category { .. } => "category",
            Self::AiMatch { .. } => "ai_match",
        }
    }
}

// ── Actions ─────────────────────────────────────────────────────────

/// A side-effecting operation against the provider or a webhook.
///
/// String parameters may carry `{{placeholder}}` templates, filled by the
/// argument resolver before execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Archive,
    Label {
        name: String,
    },
    Draft {
        content: String,
    },
    Send {
        content: String,
        /// Track the outbound thread for reply nudging.
        #[serde(default)]
        track: bool,
    },
    Forward {
        to: String,
    },
    MarkSpam,
    MarkRead,
    Webhook {
        url: String,
    },
    /// Track the email's thread without sending anything.
    TrackThread,
}

impl Action {
    /// Short label for logging and audit records.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Archive => "archive",
            Self::Label { .. } => "label",
            Self::Draft { .. } => "draft",
            Self::Send { .. } => "send",
            Self::Forward { .. } => "forward",
            Self::MarkSpam => "mark_spam",
            Self::MarkRead => "mark_read",
            Self::Webhook { .. } => "webhook",
            Self::TrackThread => "track_thread",
        }
    }

    /// Actions that emit outbound mail and therefore pass the guardrail
    /// gate before anything runs.
    pub fn is_send_class(&self) -> bool {
        matches!(self, Self::Send { .. } | Self::Forward { .. })
    }

    /// The outgoing content a guardrail classifies, if any.
    pub fn outgoing_content(&self) -> Option<&str> {
        match self {
            Self::Send { content, .. } => Some(content),
            Self::Forward { to } => Some(to),
            _ => None,
        }
    }
}

// ── Rule ────────────────────────────────────────────────────────────

/// A user-defined automation unit: conditions + ordered actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: Uuid,
    /// Owner scope (user or org id).
    pub owner: String,
    /// Human-readable name shown in history views.
    pub name: String,
    /// AND-ed predicates, in declaration order.
    pub conditions: Vec<Condition>,
    /// Actions executed strictly in this order.
    pub actions: Vec<Action>,
    /// Explicit priority; higher ranks first among candidates.
    pub priority: i32,
    /// Disabled rules are never matched but are kept for audit.
    pub enabled: bool,
    pub created_by: String,
    /// Visible to the whole owner scope, not just the creator.
    pub shared: bool,
    pub created_at: DateTime<Utc>,
}

impl Rule {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        let owner = owner.into();
        Self {
            id: Uuid::new_v4(),
            created_by: owner.clone(),
            owner,
            name: name.into(),
            conditions: Vec::new(),
            actions: Vec::new(),
            priority: 0,
            enabled: true,
            shared: false,
            created_at: Utc::now(),
        }
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// A rule with any `AiMatch` condition always defers final acceptance
    /// to the selector, even when every other condition holds.
    pub fn needs_ai_confirmation(&self) -> bool {
        self.conditions.iter().any(Condition::needs_ai)
    }

    /// Whether any action emits outbound mail.
    pub fn has_send_class_action(&self) -> bool {
        self.actions.iter().any(Action::is_send_class)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_exact_is_case_insensitive() {
        let p = Pattern::exact("Alice@Example.com");
        assert!(p.matches("alice@example.com").unwrap());
        assert!(!p.matches("bob@example.com").unwrap());
    }

    #[test]
    fn pattern_contains_is_case_insensitive() {
        let p = Pattern::contains("Invoice");
        assert!(p.matches("your invoice #42 is ready").unwrap());
        assert!(!p.matches("receipt attached").unwrap());
    }

    #[test]
    fn pattern_regex_matches() {
        let p = Pattern::regex(r"(?i)^no[\-_.]?reply@");
        assert!(p.matches("noreply@company.com").unwrap());
        assert!(p.matches("No-Reply@service.io").unwrap());
        assert!(!p.matches("alice@company.com").unwrap());
    }

    #[test]
    fn pattern_bad_regex_is_an_error_not_a_nonmatch() {
        let p = Pattern::regex("([unclosed");
        assert!(p.matches("anything").is_err());
    }

    #[test]
    fn rule_detects_ai_condition() {
        let rule = Rule::new("u-1", "vendor invoices")
            .with_condition(Condition::From {
                pattern: Pattern::contains("@vendor.com"),
            })
            .with_condition(Condition::AiMatch {
                instruction: "the email is an invoice".into(),
            })
            .with_action(Action::Archive);
        assert!(rule.needs_ai_confirmation());
        assert!(!rule.has_send_class_action());
    }

    #[test]
    fn send_class_actions() {
        assert!(Action::Send {
            content: "hi".into(),
            track: false
        }
        .is_send_class());
        assert!(Action::Forward {
            to: "x@y.com".into()
        }
        .is_send_class());
        assert!(!Action::Draft {
            content: "hi".into()
        }
        .is_send_class());
        assert!(!Action::Archive.is_send_class());
    }

    #[test]
    fn action_serde_is_snake_case_tagged() {
        let action = Action::Forward {
            to: "{{reply_to}}".into(),
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["type"], "forward");
        assert_eq!(json["to"], "{{reply_to}}");

        let parsed: Action = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, action);
    }

    #[test]
    fn send_track_defaults_false() {
        let parsed: Action =
            serde_json::from_str(r#"{"type": "send", "content": "thanks!"}"#).unwrap();
        assert_eq!(
            parsed,
            Action::Send {
                content: "thanks!".into(),
                track: false
            }
        );
    }

    #[test]
    fn condition_roundtrip() {
        let c = Condition::Category {
            name: "Newsletter".into(),
        };
        let json = serde_json::to_string(&c).unwrap();
        let back: Condition = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
    }
}
