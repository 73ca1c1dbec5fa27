//! Execution ledger records — the durable audit trail of what a rule did
//! to an email.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of an executed rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Claimed but not yet finished.
    Pending,
    /// Every action succeeded.
    Applied,
    /// At least one action permanently failed.
    Failed,
    /// A guardrail blocked execution before any action ran.
    Skipped,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// The only legal transitions are Pending -> terminal.
    pub fn can_transition_to(&self, target: ExecutionStatus) -> bool {
        matches!(self, Self::Pending) && target.is_terminal()
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Applied => "applied",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

/// Outcome of a single action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Success,
    Failed,
    Skipped,
}

/// One action's result within an executed rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionOutcome {
    /// Action label (`archive`, `forward`, ...).
    pub action: String,
    pub status: ActionStatus,
    /// Human-readable reason for failed/skipped items.
    pub reason: Option<String>,
}

impl ActionOutcome {
    pub fn success(action: &str) -> Self {
        Self {
            action: action.to_string(),
            status: ActionStatus::Success,
            reason: None,
        }
    }

    pub fn failed(action: &str, reason: impl Into<String>) -> Self {
        Self {
            action: action.to_string(),
            status: ActionStatus::Failed,
            reason: Some(reason.into()),
        }
    }

    pub fn skipped(action: &str, reason: impl Into<String>) -> Self {
        Self {
            action: action.to_string(),
            status: ActionStatus::Skipped,
            reason: Some(reason.into()),
        }
    }
}

/// Audit record of one rule's outcome for one email.
///
/// At most one terminal record exists per (email_id, rule_id); the store's
/// check-and-insert claim guarantees it. Terminal records are immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutedRule {
    pub email_id: String,
    pub rule_id: Uuid,
    pub status: ExecutionStatus,
    pub action_items: Vec<ActionOutcome>,
    /// Applied by the engine rather than a manual user action.
    pub automated: bool,
    /// Rule-level reason (guardrail name for skips, summary for failures).
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ExecutedRule {
    /// A freshly claimed, not-yet-executed record.
    pub fn pending(email_id: impl Into<String>, rule_id: Uuid, automated: bool) -> Self {
        Self {
            email_id: email_id.into(),
            rule_id,
            status: ExecutionStatus::Pending,
            action_items: Vec::new(),
            automated,
            reason: None,
            created_at: Utc::now(),
        }
    }

    /// Derive the rule-level status from per-action outcomes.
    ///
    /// Applied only when every action succeeded; Failed as soon as any
    /// action permanently failed.
    pub fn status_from_outcomes(outcomes: &[ActionOutcome]) -> ExecutionStatus {
        if outcomes.iter().any(|o| o.status == ActionStatus::Failed) {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Applied
        }
    }
}
