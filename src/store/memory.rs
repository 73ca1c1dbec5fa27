//! In-memory `Database` backend.
//!
//! Used by tests and as the default store when no database path is
//! configured. The claim path takes a single write lock across
//! check-and-insert, which is what makes it atomic under concurrent
//! delivery.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::engine::bulk::BulkCheckpoint;
use crate::engine::guardrail::Guardrail;
use crate::engine::ledger::ExecutedRule;
use crate::error::StoreError;
use crate::rules::model::Rule;
use crate::rules::selector::SelectionDecision;
use crate::store::traits::{ClaimOutcome, Database};
use crate::tracker::thread::{ThreadStatus, TrackedThread};

#[derive(Default)]
struct Inner {
    rules: HashMap<Uuid, Rule>,
    executions: HashMap<(String, Uuid), ExecutedRule>,
    selections: HashMap<String, SelectionDecision>,
    guardrails: HashMap<Uuid, Guardrail>,
    threads: HashMap<String, TrackedThread>,
    checkpoints: HashMap<Uuid, BulkCheckpoint>,
}

/// In-memory store behind a single `RwLock`.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Database for MemoryStore {
    async fn insert_rule(&self, rule: &Rule) -> Result<(), StoreError> {
        self.inner.write().await.rules.insert(rule.id, rule.clone());
        Ok(())
    }

    async fn get_rule(&self, id: Uuid) -> Result<Option<Rule>, StoreError> {
        Ok(self.inner.read().await.rules.get(&id).cloned())
    }

    async fn list_enabled_rules(&self, owner: &str) -> Result<Vec<Rule>, StoreError> {
        let inner = self.inner.read().await;
        let mut rules: Vec<Rule> = inner
            .rules
            .values()
            .filter(|r| r.enabled && (r.owner == owner || r.shared))
            .cloned()
            .collect();
        rules.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(rules)
    }

    async fn update_rule(&self, rule: &Rule) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.rules.contains_key(&rule.id) {
            return Err(StoreError::NotFound {
                entity: "rule".into(),
                id: rule.id.to_string(),
            });
        }
        inner.rules.insert(rule.id, rule.clone());
        Ok(())
    }

    async fn set_rule_enabled(&self, id: Uuid, enabled: bool) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let rule = inner.rules.get_mut(&id).ok_or_else(|| StoreError::NotFound {
            entity: "rule".into(),
            id: id.to_string(),
        })?;
        rule.enabled = enabled;
        Ok(())
    }

    async fn claim_execution(
        &self,
        email_id: &str,
        rule_id: Uuid,
        automated: bool,
    ) -> Result<ClaimOutcome, StoreError> {
        let mut inner = self.inner.write().await;
        let key = (email_id.to_string(), rule_id);
        if let Some(existing) = inner.executions.get(&key) {
            return Ok(ClaimOutcome::Existing(existing.clone()));
        }
        inner
            .executions
            .insert(key, ExecutedRule::pending(email_id, rule_id, automated));
        Ok(ClaimOutcome::Claimed)
    }

    async fn finalize_execution(&self, record: &ExecutedRule) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let key = (record.email_id.clone(), record.rule_id);
        let existing = inner.executions.get(&key).ok_or_else(|| StoreError::NotFound {
            entity: "executed_rule".into(),
            id: format!("{}/{}", record.email_id, record.rule_id),
        })?;
        if existing.status.is_terminal() {
            return Err(StoreError::TerminalImmutable {
                entity: "executed_rule".into(),
                id: format!("{}/{}", record.email_id, record.rule_id),
            });
        }
        if !record.status.is_terminal() {
            return Err(StoreError::Query(
                "finalize requires a terminal status".into(),
            ));
        }
        inner.executions.insert(key, record.clone());
        Ok(())
    }

    async fn get_execution(
        &self,
        email_id: &str,
        rule_id: Uuid,
    ) -> Result<Option<ExecutedRule>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .executions
            .get(&(email_id.to_string(), rule_id))
            .cloned())
    }

    async fn list_executions_for_email(
        &self,
        email_id: &str,
    ) -> Result<Vec<ExecutedRule>, StoreError> {
        let inner = self.inner.read().await;
        let mut records: Vec<ExecutedRule> = inner
            .executions
            .values()
            .filter(|r| r.email_id == email_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    async fn get_selection(
        &self,
        email_id: &str,
    ) -> Result<Option<SelectionDecision>, StoreError> {
        Ok(self.inner.read().await.selections.get(email_id).cloned())
    }

    async fn put_selection(&self, decision: &SelectionDecision) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .selections
            .insert(decision.email_id.clone(), decision.clone());
        Ok(())
    }

    async fn selection_history(
        &self,
        sender: &str,
        limit: usize,
    ) -> Result<Vec<SelectionDecision>, StoreError> {
        let inner = self.inner.read().await;
        let mut decisions: Vec<SelectionDecision> = inner
            .selections
            .values()
            .filter(|d| d.sender == sender)
            .cloned()
            .collect();
        decisions.sort_by(|a, b| b.decided_at.cmp(&a.decided_at));
        decisions.truncate(limit);
        Ok(decisions)
    }

    async fn insert_guardrail(&self, guardrail: &Guardrail) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .guardrails
            .insert(guardrail.id, guardrail.clone());
        Ok(())
    }

    async fn list_enabled_guardrails(&self, owner: &str) -> Result<Vec<Guardrail>, StoreError> {
        let inner = self.inner.read().await;
        let mut guardrails: Vec<Guardrail> = inner
            .guardrails
            .values()
            .filter(|g| g.enabled && g.owner == owner)
            .cloned()
            .collect();
        guardrails.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(guardrails)
    }

    async fn insert_tracked_thread(&self, thread: &TrackedThread) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        // First tracking record wins; duplicate sends don't reset due_at.
        inner
            .threads
            .entry(thread.thread_id.clone())
            .or_insert_with(|| thread.clone());
        Ok(())
    }

    async fn get_tracked_thread(
        &self,
        thread_id: &str,
    ) -> Result<Option<TrackedThread>, StoreError> {
        Ok(self.inner.read().await.threads.get(thread_id).cloned())
    }

    async fn due_threads(&self, now: DateTime<Utc>) -> Result<Vec<TrackedThread>, StoreError> {
        let inner = self.inner.read().await;
        let mut due: Vec<TrackedThread> = inner
            .threads
            .values()
            .filter(|t| t.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| a.due_at.cmp(&b.due_at));
        Ok(due)
    }

    async fn update_tracked_thread(&self, thread: &TrackedThread) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let existing = inner.threads.get(&thread.thread_id).ok_or_else(|| {
            StoreError::NotFound {
                entity: "tracked_thread".into(),
                id: thread.thread_id.clone(),
            }
        })?;
        if existing.status == ThreadStatus::Resolved {
            return Err(StoreError::TerminalImmutable {
                entity: "tracked_thread".into(),
                id: thread.thread_id.clone(),
            });
        }
        inner.threads.insert(thread.thread_id.clone(), thread.clone());
        Ok(())
    }

    async fn get_checkpoint(&self, run_id: Uuid) -> Result<Option<BulkCheckpoint>, StoreError> {
        Ok(self.inner.read().await.checkpoints.get(&run_id).cloned())
    }

    async fn save_checkpoint(&self, checkpoint: &BulkCheckpoint) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .checkpoints
            .insert(checkpoint.run_id, checkpoint.clone());
        Ok(())
    }
}
