//! The automation engine: match, select, execute, and audit.

pub mod bulk;
pub mod executor;
pub mod guardrail;
pub mod ledger;
pub mod resolver;

use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::email::{EmailContext, EmailMessage};
use crate::engine::bulk::PlannedMatch;
use crate::engine::executor::ActionExecutor;
use crate::engine::ledger::ExecutedRule;
use crate::error::Result;
use crate::llm::{LlmCapability, LlmContext};
use crate::provider::{Categorizer, EmailProvider, WebhookCaller};
use crate::rules::matcher::Matcher;
use crate::rules::model::Rule;
use crate::rules::selector::Selector;
use crate::store::traits::Database;

pub use bulk::{BulkCheckpoint, BulkRunReport, BulkRunner};
pub use guardrail::{Guardrail, GuardrailEvaluator, GuardrailSeverity, GuardrailTrigger, GuardrailVerdict};
pub use ledger::{ActionOutcome, ActionStatus, ExecutionStatus};

/// One email in, at most one executed rule out.
pub struct AutomationEngine {
    store: Arc<dyn Database>,
    categorizer: Arc<dyn Categorizer>,
    matcher: Matcher,
    selector: Selector,
    executor: ActionExecutor,
}

impl AutomationEngine {
    pub fn new(
        store: Arc<dyn Database>,
        provider: Arc<dyn EmailProvider>,
        categorizer: Arc<dyn Categorizer>,
        webhooks: Arc<dyn WebhookCaller>,
        llm: Arc<dyn LlmCapability>,
        config: EngineConfig,
    ) -> Self {
        Self {
            matcher: Matcher::new(config.tie_break),
            selector: Selector::new(llm.clone(), store.clone()),
            executor: ActionExecutor::new(provider, webhooks, store.clone(), llm, config),
            store,
            categorizer,
        }
    }

    /// Full pipeline for one inbound email.
    ///
    /// Returns the executed rule's ledger record, or `None` when no rule
    /// applies. Re-delivering the same email returns the existing record.
    pub async fn evaluate(&self, owner: &str, email: EmailMessage) -> Result<Option<ExecutedRule>> {
        self.evaluate_with_rules(owner, email, None).await
    }

    /// Like [`AutomationEngine::evaluate`] restricted to a subset of the
    /// owner's rules. The bulk runner uses this to re-run just one new
    /// rule over history.
    pub async fn evaluate_with_rules(
        &self,
        owner: &str,
        email: EmailMessage,
        rule_filter: Option<&[Uuid]>,
    ) -> Result<Option<ExecutedRule>> {
        let llm_ctx = LlmContext::for_user(owner);
        let ctx = self.context_for(email).await;

        let rules = self.rules_for(owner, rule_filter).await?;
        let candidates = self.matcher.candidates(&ctx, &rules);
        debug!(
            email_id = %ctx.email.id,
            rules = rules.len(),
            candidates = candidates.len(),
            "Matched rule candidates"
        );

        let Some(rule_id) = self.selector.select(&ctx, &candidates, &llm_ctx).await? else {
            return Ok(None);
        };
        // The selector only ever returns a rule from the candidate list.
        let Some(candidate) = candidates.iter().find(|c| c.rule.id == rule_id) else {
            return Ok(None);
        };

        let record = self
            .executor
            .execute(&ctx, &candidate.rule, true, &llm_ctx)
            .await?;
        Ok(Some(record))
    }

    /// Dry-run pipeline: report which rule would fire without claiming,
    /// executing, or caching anything.
    pub async fn plan(&self, owner: &str, email: EmailMessage) -> Result<Option<PlannedMatch>> {
        self.plan_with_rules(owner, email, None).await
    }

    /// [`AutomationEngine::plan`] restricted to a subset of the owner's
    /// rules.
    pub async fn plan_with_rules(
        &self,
        owner: &str,
        email: EmailMessage,
        rule_filter: Option<&[Uuid]>,
    ) -> Result<Option<PlannedMatch>> {
        let llm_ctx = LlmContext::for_user(owner);
        let ctx = self.context_for(email).await;

        let rules = self.rules_for(owner, rule_filter).await?;
        let candidates = self.matcher.candidates(&ctx, &rules);

        let Some(rule_id) = self.selector.preview(&ctx, &candidates, &llm_ctx).await? else {
            return Ok(None);
        };
        let planned = candidates
            .iter()
            .find(|c| c.rule.id == rule_id)
            .map(|c| PlannedMatch {
                email_id: ctx.email.id.clone(),
                rule_id: c.rule.id,
                rule_name: c.rule.name.clone(),
            });
        Ok(planned)
    }

    async fn rules_for(&self, owner: &str, filter: Option<&[Uuid]>) -> Result<Vec<Rule>> {
        let rules = self.store.list_enabled_rules(owner).await?;
        Ok(match filter {
            Some(ids) => rules.into_iter().filter(|r| ids.contains(&r.id)).collect(),
            None => rules,
        })
    }

    /// Categorize the email; a categorizer outage degrades to no
    /// categories rather than stalling the pipeline.
    async fn context_for(&self, email: EmailMessage) -> EmailContext {
        let categories = match self.categorizer.categories(&email).await {
            Ok(c) => c,
            Err(e) => {
                warn!(email_id = %email.id, error = %e, "Categorizer failed; matching without categories");
                Vec::new()
            }
        };
        EmailContext::new(email, categories)
    }
}
