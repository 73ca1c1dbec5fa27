//! AI-assisted rule selection.
//!
//! Invoked only when matching leaves real ambiguity: more than one
//! candidate, or any candidate tagged `AiMatch`. A single deterministic
//! candidate is selected without touching the AI capability at all. On
//! low-confidence or unparseable model output the selector returns the
//! no-match sentinel — it never guesses a rule.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::email::EmailContext;
use crate::error::{Result, StoreError};
use crate::llm::{json::extract_json_object, CompletionRequest, LlmCapability, LlmContext};
use crate::rules::matcher::Candidate;
use crate::rules::model::Condition;
use crate::store::Database;

/// Confidence below which a model pick is discarded in favor of no-match.
const MIN_CONFIDENCE: f32 = 0.5;

/// How many prior decisions for the sender are offered as soft context.
const HISTORY_LIMIT: usize = 5;

/// A cached selection decision for one email.
///
/// `rule_id = None` is the explicit no-match sentinel; caching it too
/// means duplicate delivery never re-invokes the AI capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionDecision {
    pub email_id: String,
    pub sender: String,
    pub rule_id: Option<Uuid>,
    /// Rule name at decision time, for history prompts.
    pub rule_name: Option<String>,
    pub decided_at: DateTime<Utc>,
}

/// Rule selector with a per-email decision cache.
pub struct Selector {
    llm: Arc<dyn LlmCapability>,
    store: Arc<dyn Database>,
}

#[derive(Debug, Deserialize)]
struct SelectionResponse {
    /// Selected rule id, or null for no match.
    rule_id: Option<String>,
    #[serde(default)]
    confidence: f32,
}

impl Selector {
    pub fn new(llm: Arc<dyn LlmCapability>, store: Arc<dyn Database>) -> Self {
        Self { llm, store }
    }

    /// Pick exactly one rule for the email, or return `None`.
    ///
    /// The decision (not the model text) is cached per email id, so
    /// repeated delivery of the same email is answered from the cache.
    pub async fn select(
        &self,
        ctx: &EmailContext,
        candidates: &[Candidate],
        llm_ctx: &LlmContext,
    ) -> Result<Option<Uuid>> {
        self.select_inner(ctx, candidates, llm_ctx, true).await
    }

    /// Like [`Selector::select`] but never writes the decision cache —
    /// dry runs use this so previewing an email leaves no trace. Cache
    /// reads still apply.
    pub async fn preview(
        &self,
        ctx: &EmailContext,
        candidates: &[Candidate],
        llm_ctx: &LlmContext,
    ) -> Result<Option<Uuid>> {
        self.select_inner(ctx, candidates, llm_ctx, false).await
    }

    async fn select_inner(
        &self,
        ctx: &EmailContext,
        candidates: &[Candidate],
        llm_ctx: &LlmContext,
        cache: bool,
    ) -> Result<Option<Uuid>> {
        if candidates.is_empty() {
            return Ok(None);
        }

        // Cached decision wins, match or no-match alike.
        if let Some(cached) = self.store.get_selection(&ctx.email.id).await? {
            debug!(
                email_id = %ctx.email.id,
                rule_id = ?cached.rule_id,
                "Selection answered from cache"
            );
            return Ok(cached.rule_id);
        }

        // One deterministic candidate needs no AI and is fully reproducible.
        let decision = if candidates.len() == 1 && !candidates[0].needs_ai {
            Some(&candidates[0])
        } else {
            self.disambiguate(ctx, candidates, llm_ctx).await
        };

        let (rule_id, rule_name) = match decision {
            Some(c) => (Some(c.rule.id), Some(c.rule.name.clone())),
            None => (None, None),
        };

        if cache {
            self.cache_decision(ctx, rule_id, rule_name).await?;
        }
        Ok(rule_id)
    }

    /// Ask the model to pick one candidate or none. Any ambiguity maps to
    /// no-match.
    async fn disambiguate<'a>(
        &self,
        ctx: &EmailContext,
        candidates: &'a [Candidate],
        llm_ctx: &LlmContext,
    ) -> Option<&'a Candidate> {
        let history = self
            .store
            .selection_history(&ctx.sender_lower, HISTORY_LIMIT)
            .await
            .unwrap_or_default();

        let prompt = build_selection_prompt(ctx, candidates, &history);
        let request = CompletionRequest::new(prompt)
            .with_system(build_selection_system_prompt())
            .with_max_tokens(256)
            .with_temperature(0.0)
            .with_context(llm_ctx.clone());

        let raw = match self.llm.complete(request).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(email_id = %ctx.email.id, error = %e, "Selector LLM call failed — no match");
                return None;
            }
        };

        let response: SelectionResponse =
            match serde_json::from_str(&extract_json_object(&raw)) {
                Ok(r) => r,
                Err(e) => {
                    warn!(
                        email_id = %ctx.email.id,
                        error = %e,
                        "Unparseable selection output — no match"
                    );
                    return None;
                }
            };

        let Some(id_str) = response.rule_id else {
            info!(email_id = %ctx.email.id, "Selector: explicit no match");
            return None;
        };

        if response.confidence < MIN_CONFIDENCE {
            info!(
                email_id = %ctx.email.id,
                confidence = response.confidence,
                "Selector confidence too low — no match"
            );
            return None;
        }

        let Ok(rule_id) = Uuid::parse_str(&id_str) else {
            warn!(email_id = %ctx.email.id, rule_id = %id_str, "Selector returned a malformed id");
            return None;
        };

        // The pick must be one of the offered candidates.
        let picked = candidates.iter().find(|c| c.rule.id == rule_id);
        if picked.is_none() {
            warn!(
                email_id = %ctx.email.id,
                rule_id = %rule_id,
                "Selector picked a rule outside the candidate list — no match"
            );
        }
        picked
    }

    async fn cache_decision(
        &self,
        ctx: &EmailContext,
        rule_id: Option<Uuid>,
        rule_name: Option<String>,
    ) -> std::result::Result<(), StoreError> {
        self.store
            .put_selection(&SelectionDecision {
                email_id: ctx.email.id.clone(),
                sender: ctx.sender_lower.clone(),
                rule_id,
                rule_name,
                decided_at: Utc::now(),
            })
            .await
    }
}

// ── Prompt construction ─────────────────────────────────────────────

fn build_selection_system_prompt() -> String {
    "You match emails to automation rules. You are given an email and a ranked \
     list of candidate rules; pick the single best-fitting rule or none.\n\n\
     Respond with ONLY a JSON object:\n\
     {\"rule_id\": \"<uuid>\" | null, \"confidence\": 0.0}\n\n\
     Rules:\n\
     - rule_id must be one of the listed candidate ids, or null\n\
     - When no rule clearly fits, return null — never guess\n\
     - High confidence (>0.8) only when the fit is unmistakable"
        .to_string()
}

fn build_selection_prompt(
    ctx: &EmailContext,
    candidates: &[Candidate],
    history: &[SelectionDecision],
) -> String {
    let mut prompt = String::with_capacity(1024);

    prompt.push_str(&format!("From: {}\n", ctx.email.from));
    prompt.push_str(&format!("Subject: {}\n", ctx.email.subject));
    if !ctx.categories.is_empty() {
        prompt.push_str(&format!("Categories: {}\n", ctx.categories.join(", ")));
    }

    let body_preview: String = ctx.email.body.chars().take(1000).collect();
    prompt.push_str(&format!("\nEmail body:\n{body_preview}\n"));

    prompt.push_str("\nCandidate rules (ranked):\n");
    for (i, candidate) in candidates.iter().enumerate() {
        prompt.push_str(&format!(
            "  [{}] id={} \"{}\" — {}\n",
            i + 1,
            candidate.rule.id,
            candidate.rule.name,
            describe_conditions(&candidate.rule.conditions)
        ));
    }

    // Soft context only; the model may ignore it.
    let prior: Vec<String> = history
        .iter()
        .filter_map(|d| d.rule_name.clone())
        .collect();
    if !prior.is_empty() {
        prompt.push_str(&format!(
            "\nPreviously applied for this sender: {}\n",
            prior.join(", ")
        ));
    }

    prompt
}

fn describe_conditions(conditions: &[Condition]) -> String {
    conditions
        .iter()
        .map(|c| match c {
            Condition::From { pattern } => format!("from ~ {}", pattern.value),
            Condition::Subject { pattern } => format!("subject ~ {}", pattern.value),
            Condition::Body { pattern } => format!("body ~ {}", pattern.value),
            Condition::Category { name } => format!("category {name}"),
            Condition::AiMatch { instruction } => format!("matches: {instruction}"),
        })
        .collect::<Vec<_>>()
        .join("; ")
}
