//! Argument resolver — fills templated action parameters from email
//! context.
//!
//! Resolution draws strictly from the closed fact set built off the
//! email (`EmailContext::fact_set`). Well-known placeholders resolve
//! deterministically; free-form placeholders (`{{infer}}` and friends)
//! ask the AI capability to pick a fact, and any answer not present
//! verbatim in the fact set is rejected. The resolver never fabricates a
//! value.

use std::sync::Arc;

use regex::{NoExpand, Regex};
use tracing::{debug, warn};

use crate::email::EmailContext;
use crate::llm::{CompletionRequest, LlmCapability, LlmContext};
use crate::rules::model::Action;

/// Reason string recorded on actions whose arguments could not be filled.
pub const UNRESOLVED_ARGUMENT: &str = "unresolved_argument";

/// Fills `{{placeholder}}` parameters for one action at a time, so one
/// action's failure never blocks its siblings.
pub struct ArgumentResolver {
    llm: Arc<dyn LlmCapability>,
}

impl ArgumentResolver {
    pub fn new(llm: Arc<dyn LlmCapability>) -> Self {
        Self { llm }
    }

    /// Resolve all templated parameters of `action`.
    ///
    /// Returns the concrete action, or `Err(UNRESOLVED_ARGUMENT)` when a
    /// required value cannot be derived from the email context.
    pub async fn resolve(
        &self,
        ctx: &EmailContext,
        action: &Action,
        llm_ctx: &LlmContext,
    ) -> Result<Action, String> {
        let resolved = match action {
            Action::Label { name } => Action::Label {
                name: self.resolve_template(ctx, name, "label", llm_ctx).await?,
            },
            Action::Draft { content } => Action::Draft {
                content: self.resolve_template(ctx, content, "draft", llm_ctx).await?,
            },
            Action::Send { content, track } => Action::Send {
                content: self.resolve_template(ctx, content, "send", llm_ctx).await?,
                track: *track,
            },
            Action::Forward { to } => Action::Forward {
                to: self.resolve_template(ctx, to, "forward", llm_ctx).await?,
            },
            Action::Webhook { url } => Action::Webhook {
                url: self.resolve_template(ctx, url, "webhook", llm_ctx).await?,
            },
            // No templated parameters
            Action::Archive | Action::MarkSpam | Action::MarkRead | Action::TrackThread => {
                action.clone()
            }
        };
        Ok(resolved)
    }

    async fn resolve_template(
        &self,
        ctx: &EmailContext,
        text: &str,
        intent: &str,
        llm_ctx: &LlmContext,
    ) -> Result<String, String> {
        // Not a template — nothing to do.
        if !text.contains("{{") {
            return Ok(text.to_string());
        }

        let placeholder_re =
            Regex::new(r"\{\{\s*([a-zA-Z_][a-zA-Z0-9_]*)\s*\}\}").expect("static regex");
        let facts = ctx.fact_set();
        let mut result = text.to_string();

        // Collect first to avoid borrowing `result` while rewriting it.
        let keys: Vec<String> = placeholder_re
            .captures_iter(text)
            .map(|c| c[1].to_string())
            .collect();

        for key in keys {
            let value = if let Some(fact) = facts.get(key.as_str()) {
                fact.clone()
            } else {
                self.infer_from_facts(ctx, &key, intent, llm_ctx).await?
            };

            let pattern = Regex::new(&format!(r"\{{\{{\s*{key}\s*\}}\}}"))
                .map_err(|e| format!("{UNRESOLVED_ARGUMENT}: bad placeholder '{key}': {e}"))?;
            result = pattern.replace_all(&result, NoExpand(&value)).into_owned();
        }

        Ok(result)
    }

    /// Ask the model to pick one fact value for a free-form placeholder.
    /// The answer must be one of the fact values verbatim, or "unknown".
    async fn infer_from_facts(
        &self,
        ctx: &EmailContext,
        key: &str,
        intent: &str,
        llm_ctx: &LlmContext,
    ) -> Result<String, String> {
        let facts = ctx.fact_set();
        if facts.is_empty() {
            return Err(format!("{UNRESOLVED_ARGUMENT}: '{key}' (no facts available)"));
        }

        let fact_lines: Vec<String> = facts
            .iter()
            .map(|(k, v)| format!("  {k}: {v}"))
            .collect();

        let system = "You fill one parameter of an email automation action. You may ONLY \
                      answer with one of the listed fact values, copied exactly, or the \
                      word unknown. Never invent a value.";
        let prompt = format!(
            "Action: {intent}\nParameter: {key}\n\nKnown facts about the email:\n{}\n\n\
             Answer with exactly one fact value, or unknown.",
            fact_lines.join("\n")
        );

        let request = CompletionRequest::new(prompt)
            .with_system(system)
            .with_max_tokens(64)
            .with_temperature(0.0)
            .with_context(llm_ctx.clone());

        let raw = match self.llm.complete(request).await {
            Ok(raw) => raw.trim().trim_matches('"').to_string(),
            Err(e) => {
                warn!(key, error = %e, "Argument inference failed");
                return Err(format!("{UNRESOLVED_ARGUMENT}: '{key}'"));
            }
        };

        if raw.eq_ignore_ascii_case("unknown") {
            return Err(format!("{UNRESOLVED_ARGUMENT}: '{key}'"));
        }

        // The model's answer is only accepted if it is a fact, verbatim.
        if facts.values().any(|v| v == &raw) {
            debug!(key, value = %raw, "Inferred argument from fact set");
            Ok(raw)
        } else {
            warn!(key, value = %raw, "Model answer not in fact set — rejecting");
            Err(format!("{UNRESOLVED_ARGUMENT}: '{key}'"))
        }
    }
}
