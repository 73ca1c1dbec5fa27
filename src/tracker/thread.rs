//! Tracked-thread state machine.
//!
//! A thread enters tracking when a send-class action flags it (or an
//! explicit track action runs) and leaves it exactly once, when a reply
//! from the original recipient arrives. Between those points the nudge
//! sweep may reschedule it forward any number of times.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

/// Which side sent the last tracked message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadDirection {
    Sent,
    Received,
}

/// Status of a tracked thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    AwaitingReply,
    /// Terminal. A resolved thread never nudges again.
    Resolved,
}

impl ThreadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved)
    }
}

/// State record for an outbound thread awaiting a reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedThread {
    pub thread_id: String,
    /// Counterparty we expect a reply from.
    pub recipient: String,
    pub direction: ThreadDirection,
    pub last_message_at: DateTime<Utc>,
    /// When the next nudge becomes due. Only ever moves forward.
    pub due_at: DateTime<Utc>,
    pub status: ThreadStatus,
    pub nudge_count: u32,
}

impl TrackedThread {
    /// Start tracking a thread, due after `interval`.
    pub fn awaiting(
        thread_id: impl Into<String>,
        recipient: impl Into<String>,
        direction: ThreadDirection,
        interval: std::time::Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            thread_id: thread_id.into(),
            recipient: recipient.into(),
            direction,
            last_message_at: now,
            due_at: now + ChronoDuration::from_std(interval).unwrap_or(ChronoDuration::days(3)),
            status: ThreadStatus::AwaitingReply,
            nudge_count: 0,
        }
    }

    /// Whether the thread is past due and still awaiting a reply.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ThreadStatus::AwaitingReply && self.due_at <= now
    }

    /// Record a generated nudge: bump the count and push `due_at` forward
    /// by `interval`. Rejects backward movement and terminal threads.
    pub fn record_nudge(
        &mut self,
        now: DateTime<Utc>,
        interval: std::time::Duration,
    ) -> Result<(), String> {
        if self.status.is_terminal() {
            return Err("thread is resolved".into());
        }
        let next = now + ChronoDuration::from_std(interval).unwrap_or(ChronoDuration::days(3));
        if next <= self.due_at {
            return Err(format!(
                "due_at may only advance (current {}, proposed {})",
                self.due_at, next
            ));
        }
        self.nudge_count += 1;
        self.due_at = next;
        Ok(())
    }

    /// Resolve the thread if `from` is the tracked counterparty.
    ///
    /// Returns true when the thread transitioned; false when the sender
    /// doesn't match. Resolving an already-resolved thread is a no-op.
    pub fn resolve_if_reply_from(&mut self, from: &str) -> bool {
        if !self.recipient.eq_ignore_ascii_case(from) {
            return false;
        }
        if self.status.is_terminal() {
            return false;
        }
        self.status = ThreadStatus::Resolved;
        true
    }
}
