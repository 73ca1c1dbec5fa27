//! Unified `Database` trait — single async interface for all persistence.
//!
//! Covers rules, the execution ledger, selector decisions, guardrails,
//! tracked threads, and bulk checkpoints. Two backends: `MemoryStore`
//! (tests, default) and `LibSqlBackend` (durable).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::engine::bulk::BulkCheckpoint;
use crate::engine::guardrail::Guardrail;
use crate::engine::ledger::ExecutedRule;
use crate::error::StoreError;
use crate::rules::model::Rule;
use crate::rules::selector::SelectionDecision;
use crate::tracker::thread::TrackedThread;

/// Result of the executor's atomic check-and-insert claim.
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// The (email, rule) pair was unclaimed; a Pending record now exists
    /// and the caller owns execution.
    Claimed,
    /// Another execution already claimed the pair; its record is returned
    /// and the caller must do nothing.
    Existing(ExecutedRule),
}

/// Backend-agnostic persistence for the automation engine.
#[async_trait]
pub trait Database: Send + Sync {
    // ── Rules ───────────────────────────────────────────────────────

    /// Insert a new rule.
    async fn insert_rule(&self, rule: &Rule) -> Result<(), StoreError>;

    /// Get a rule by id.
    async fn get_rule(&self, id: Uuid) -> Result<Option<Rule>, StoreError>;

    /// All enabled rules for an owner scope, in creation order.
    async fn list_enabled_rules(&self, owner: &str) -> Result<Vec<Rule>, StoreError>;

    /// Replace a rule's conditions/actions/priority (fix/diff tooling).
    async fn update_rule(&self, rule: &Rule) -> Result<(), StoreError>;

    /// Enable or disable a rule. Rules are never hard-deleted.
    async fn set_rule_enabled(&self, id: Uuid, enabled: bool) -> Result<(), StoreError>;

    // ── Execution ledger ────────────────────────────────────────────

    /// Atomically claim (email_id, rule_id) by inserting a Pending record
    /// if and only if none exists.
    async fn claim_execution(
        &self,
        email_id: &str,
        rule_id: Uuid,
        automated: bool,
    ) -> Result<ClaimOutcome, StoreError>;

    /// Move a claimed record to its terminal state. Rejects mutation of a
    /// record that is already terminal.
    async fn finalize_execution(&self, record: &ExecutedRule) -> Result<(), StoreError>;

    /// Fetch the record for one (email, rule) pair.
    async fn get_execution(
        &self,
        email_id: &str,
        rule_id: Uuid,
    ) -> Result<Option<ExecutedRule>, StoreError>;

    /// All records for an email (history views).
    async fn list_executions_for_email(
        &self,
        email_id: &str,
    ) -> Result<Vec<ExecutedRule>, StoreError>;

    // ── Selector decisions ──────────────────────────────────────────

    /// Cached decision for an email, if any.
    async fn get_selection(
        &self,
        email_id: &str,
    ) -> Result<Option<SelectionDecision>, StoreError>;

    /// Cache a decision (match or no-match) for an email.
    async fn put_selection(&self, decision: &SelectionDecision) -> Result<(), StoreError>;

    /// Most recent decisions for a sender, newest first.
    async fn selection_history(
        &self,
        sender: &str,
        limit: usize,
    ) -> Result<Vec<SelectionDecision>, StoreError>;

    // ── Guardrails ──────────────────────────────────────────────────

    async fn insert_guardrail(&self, guardrail: &Guardrail) -> Result<(), StoreError>;

    /// Enabled guardrails for an owner scope.
    async fn list_enabled_guardrails(&self, owner: &str) -> Result<Vec<Guardrail>, StoreError>;

    // ── Tracked threads ─────────────────────────────────────────────

    /// Start tracking a thread. Inserting an already-tracked thread id is
    /// a no-op (the original tracking record wins).
    async fn insert_tracked_thread(&self, thread: &TrackedThread) -> Result<(), StoreError>;

    async fn get_tracked_thread(
        &self,
        thread_id: &str,
    ) -> Result<Option<TrackedThread>, StoreError>;

    /// Threads past due and still awaiting a reply.
    async fn due_threads(&self, now: DateTime<Utc>) -> Result<Vec<TrackedThread>, StoreError>;

    /// Persist an updated thread. Rejects updates to a resolved thread.
    async fn update_tracked_thread(&self, thread: &TrackedThread) -> Result<(), StoreError>;

    // ── Bulk checkpoints ────────────────────────────────────────────

    async fn get_checkpoint(&self, run_id: Uuid) -> Result<Option<BulkCheckpoint>, StoreError>;

    async fn save_checkpoint(&self, checkpoint: &BulkCheckpoint) -> Result<(), StoreError>;
}
