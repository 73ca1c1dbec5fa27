//! Action executor — claims the (email, rule) pair, gates sends behind
//! guardrails, then runs the rule's actions in order.
//!
//! The claim is an atomic check-and-insert in the store; whoever gets
//! `Claimed` owns execution, everyone else receives the existing record.
//! Actions fail independently: a failed action is recorded and its
//! siblings still run. Transient provider failures are retried with
//! jittered exponential backoff before being recorded as failed.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::email::EmailContext;
use crate::engine::guardrail::{GuardrailEvaluator, GuardrailVerdict};
use crate::engine::ledger::{ActionOutcome, ExecutedRule, ExecutionStatus};
use crate::engine::resolver::ArgumentResolver;
use crate::error::{ProviderError, Result};
use crate::llm::{LlmCapability, LlmContext};
use crate::provider::{EmailProvider, WebhookCaller};
use crate::rules::model::{Action, Rule};
use crate::store::traits::{ClaimOutcome, Database};
use crate::tracker::thread::{ThreadDirection, TrackedThread};

pub struct ActionExecutor {
    provider: Arc<dyn EmailProvider>,
    webhooks: Arc<dyn WebhookCaller>,
    store: Arc<dyn Database>,
    resolver: ArgumentResolver,
    guardrails: GuardrailEvaluator,
    config: EngineConfig,
}

impl ActionExecutor {
    pub fn new(
        provider: Arc<dyn EmailProvider>,
        webhooks: Arc<dyn WebhookCaller>,
        store: Arc<dyn Database>,
        llm: Arc<dyn LlmCapability>,
        config: EngineConfig,
    ) -> Self {
        Self {
            provider,
            webhooks,
            store,
            resolver: ArgumentResolver::new(llm.clone()),
            guardrails: GuardrailEvaluator::new(llm),
            config,
        }
    }

    /// Execute `rule` against `ctx` exactly once.
    ///
    /// Returns the terminal ledger record. A second call for the same
    /// (email, rule) pair returns the existing record without touching the
    /// provider.
    pub async fn execute(
        &self,
        ctx: &EmailContext,
        rule: &Rule,
        automated: bool,
        llm_ctx: &LlmContext,
    ) -> Result<ExecutedRule> {
        let email_id = ctx.email.id.as_str();

        match self
            .store
            .claim_execution(email_id, rule.id, automated)
            .await?
        {
            ClaimOutcome::Claimed => {}
            ClaimOutcome::Existing(record) => {
                debug!(email_id, rule_id = %rule.id, status = %record.status, "Execution already recorded");
                return Ok(record);
            }
        }

        // Fill action arguments up front; per-action failures are carried
        // into execution instead of aborting the rule.
        let mut resolved: Vec<std::result::Result<Action, String>> =
            Vec::with_capacity(rule.actions.len());
        for action in &rule.actions {
            resolved.push(self.resolver.resolve(ctx, action, llm_ctx).await);
        }

        // Guardrail gate: anything outbound is classified before a single
        // provider call happens.
        if rule.has_send_class_action()
            && let Some(record) = self
                .guardrail_gate(ctx, rule, &resolved, automated, llm_ctx)
                .await?
        {
            return Ok(record);
        }

        let mut outcomes = Vec::with_capacity(rule.actions.len());
        for (action, resolution) in rule.actions.iter().zip(resolved) {
            let label = action.label();
            let outcome = match resolution {
                Err(reason) => {
                    warn!(email_id, action = label, reason, "Action argument unresolved");
                    ActionOutcome::failed(label, reason)
                }
                Ok(concrete) => match self.run_action(ctx, rule, &concrete).await {
                    Ok(()) => ActionOutcome::success(label),
                    Err(e) => {
                        warn!(email_id, action = label, error = %e, "Action failed");
                        ActionOutcome::failed(label, e.to_string())
                    }
                },
            };
            outcomes.push(outcome);
        }

        let status = ExecutedRule::status_from_outcomes(&outcomes);
        let reason = match status {
            ExecutionStatus::Failed => Some(
                outcomes
                    .iter()
                    .filter(|o| o.reason.is_some())
                    .map(|o| format!("{}: {}", o.action, o.reason.as_deref().unwrap_or("")))
                    .collect::<Vec<_>>()
                    .join("; "),
            ),
            _ => None,
        };

        let record = ExecutedRule {
            email_id: email_id.to_string(),
            rule_id: rule.id,
            status,
            action_items: outcomes,
            automated,
            reason,
            created_at: chrono::Utc::now(),
        };
        self.store.finalize_execution(&record).await?;

        info!(email_id, rule_id = %rule.id, status = %record.status, "Rule executed");
        Ok(record)
    }

    /// Classify resolved outgoing content against the applicable
    /// guardrails. Returns the finalized Skipped record when a Block
    /// guardrail fires.
    ///
    /// A shared rule can execute on behalf of a user other than its
    /// owner, so both owners' guardrails apply: the rule owner's and the
    /// evaluating user's (from `llm_ctx`).
    async fn guardrail_gate(
        &self,
        ctx: &EmailContext,
        rule: &Rule,
        resolved: &[std::result::Result<Action, String>],
        automated: bool,
        llm_ctx: &LlmContext,
    ) -> Result<Option<ExecutedRule>> {
        let mut guardrails = self.store.list_enabled_guardrails(&rule.owner).await?;
        if !llm_ctx.user_id.is_empty() && llm_ctx.user_id != rule.owner {
            let theirs = self
                .store
                .list_enabled_guardrails(&llm_ctx.user_id)
                .await?;
            for guardrail in theirs {
                if guardrails.iter().all(|g| g.id != guardrail.id) {
                    guardrails.push(guardrail);
                }
            }
        }
        if guardrails.is_empty() {
            return Ok(None);
        }

        for action in resolved.iter().filter_map(|r| r.as_ref().ok()) {
            let Some(outgoing) = action.outgoing_content() else {
                continue;
            };
            let verdict = self
                .guardrails
                .check(ctx, outgoing, &guardrails, llm_ctx)
                .await;
            if let GuardrailVerdict::Blocked {
                guardrail,
                on_trigger,
            } = verdict
            {
                info!(
                    email_id = %ctx.email.id,
                    rule_id = %rule.id,
                    guardrail,
                    ?on_trigger,
                    "Guardrail blocked rule before execution"
                );
                let skip_reason = format!("guardrail '{guardrail}' blocked send");
                let record = ExecutedRule {
                    email_id: ctx.email.id.clone(),
                    rule_id: rule.id,
                    status: ExecutionStatus::Skipped,
                    action_items: rule
                        .actions
                        .iter()
                        .map(|a| ActionOutcome::skipped(a.label(), skip_reason.clone()))
                        .collect(),
                    automated,
                    reason: Some(skip_reason),
                    created_at: chrono::Utc::now(),
                };
                self.store.finalize_execution(&record).await?;
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    async fn run_action(
        &self,
        ctx: &EmailContext,
        rule: &Rule,
        action: &Action,
    ) -> std::result::Result<(), ProviderError> {
        // Store-side actions don't go through provider retry.
        if matches!(action, Action::TrackThread) {
            let thread = TrackedThread::awaiting(
                &ctx.email.thread_id,
                &ctx.email.from,
                ThreadDirection::Received,
                self.config.nudge_interval,
            );
            return self
                .store
                .insert_tracked_thread(&thread)
                .await
                .map_err(|e| ProviderError::Fatal {
                    op: "track_thread".into(),
                    reason: e.to_string(),
                });
        }

        self.apply_with_retry(ctx, rule, action).await?;

        // A tracked send starts awaiting the counterparty's reply.
        if let Action::Send { track: true, .. } = action {
            let thread = TrackedThread::awaiting(
                &ctx.email.thread_id,
                &ctx.email.from,
                ThreadDirection::Sent,
                self.config.nudge_interval,
            );
            if let Err(e) = self.store.insert_tracked_thread(&thread).await {
                // The send already happened; tracking failure must not
                // fail the action.
                warn!(thread_id = %ctx.email.thread_id, error = %e, "Could not track sent thread");
            }
        }
        Ok(())
    }

    async fn apply_with_retry(
        &self,
        ctx: &EmailContext,
        rule: &Rule,
        action: &Action,
    ) -> std::result::Result<(), ProviderError> {
        let mut attempt: u32 = 0;
        loop {
            let result =
                tokio::time::timeout(self.config.call_timeout, self.apply_once(ctx, rule, action))
                    .await;
            let error = match result {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => e,
                Err(_) => ProviderError::Timeout {
                    timeout: self.config.call_timeout,
                },
            };

            if !error.is_transient() || attempt >= self.config.max_retries {
                return Err(error);
            }

            let backoff = self.config.retry_base_delay * 2u32.saturating_pow(attempt);
            let jitter =
                Duration::from_millis(rand::thread_rng().gen_range(0..=self.jitter_cap(backoff)));
            warn!(
                action = action.label(),
                attempt,
                error = %error,
                backoff_ms = (backoff + jitter).as_millis() as u64,
                "Transient failure, retrying"
            );
            tokio::time::sleep(backoff + jitter).await;
            attempt += 1;
        }
    }

    fn jitter_cap(&self, backoff: Duration) -> u64 {
        (backoff.as_millis() as u64 / 2).max(1)
    }

    async fn apply_once(
        &self,
        ctx: &EmailContext,
        rule: &Rule,
        action: &Action,
    ) -> std::result::Result<(), ProviderError> {
        let email = &ctx.email;
        match action {
            Action::Archive => self.provider.archive(&email.id).await,
            Action::Label { name } => self.provider.apply_label(&email.id, name).await,
            Action::Draft { content } => self.provider.create_draft(email, content).await,
            Action::Send { content, .. } => self.provider.send(email, content).await,
            Action::Forward { to } => self.provider.forward(email, to).await,
            Action::MarkSpam => self.provider.mark_spam(&email.id).await,
            Action::MarkRead => self.provider.mark_read(&email.id).await,
            Action::Webhook { url } => {
                let payload = json!({
                    "email_id": email.id,
                    "thread_id": email.thread_id,
                    "from": email.from,
                    "subject": email.subject,
                    "rule_id": rule.id,
                    "rule_name": rule.name,
                });
                self.webhooks.post(url, &payload).await
            }
            // Handled in run_action
            Action::TrackThread => Ok(()),
        }
    }
}
