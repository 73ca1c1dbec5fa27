//! Guardrails — natural-language policy gates applied before auto-send
//! actions.
//!
//! Each guardrail is a plain-English policy plus a severity. Evaluation
//! is a narrow AI-backed boolean classification of the candidate outgoing
//! content against the policy text. Block severity halts the send;
//! Warn/Info only log.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::email::EmailContext;
use crate::error::LlmError;
use crate::llm::{json::extract_json_object, CompletionRequest, LlmCapability, LlmContext};

/// How severely a triggered guardrail is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailSeverity {
    /// Halts the send; the rule is skipped.
    Block,
    Warn,
    Info,
}

/// What happens to a blocked send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailTrigger {
    HoldForReview,
    AskUser,
    LogOnly,
}

/// A persisted pre-send policy gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Guardrail {
    pub id: Uuid,
    pub owner: String,
    pub name: String,
    /// Natural-language policy the outgoing content is classified against.
    pub description: String,
    pub severity: GuardrailSeverity,
    pub on_trigger: GuardrailTrigger,
    /// Evaluated in descending priority order.
    pub priority: i32,
    pub enabled: bool,
}

impl Guardrail {
    pub fn new(
        owner: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        severity: GuardrailSeverity,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner: owner.into(),
            name: name.into(),
            description: description.into(),
            severity,
            on_trigger: GuardrailTrigger::HoldForReview,
            priority: 0,
            enabled: true,
        }
    }
}

/// Verdict for one candidate send.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardrailVerdict {
    /// No blocking guardrail fired. Warnings were logged, if any.
    Clear,
    /// A Block-severity guardrail fired; the rule must be skipped.
    Blocked {
        guardrail: String,
        on_trigger: GuardrailTrigger,
    },
}

/// AI-backed guardrail evaluator.
pub struct GuardrailEvaluator {
    llm: Arc<dyn LlmCapability>,
}

/// Classification returned by the model.
#[derive(Debug, Deserialize)]
struct GuardrailResponse {
    triggered: bool,
    #[serde(default)]
    #[allow(dead_code)]
    reason: String,
}

impl GuardrailEvaluator {
    pub fn new(llm: Arc<dyn LlmCapability>) -> Self {
        Self { llm }
    }

    /// Evaluate enabled guardrails against candidate outgoing content, in
    /// descending priority order. Returns on the first Block-severity
    /// trigger.
    ///
    /// An evaluation failure on a Block-severity guardrail blocks the
    /// send: an unverifiable policy must not let mail out.
    pub async fn check(
        &self,
        ctx: &EmailContext,
        outgoing: &str,
        guardrails: &[Guardrail],
        llm_ctx: &LlmContext,
    ) -> GuardrailVerdict {
        let mut ordered: Vec<&Guardrail> = guardrails.iter().filter(|g| g.enabled).collect();
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority));

        for guardrail in ordered {
            let triggered = match self.classify(ctx, outgoing, guardrail, llm_ctx).await {
                Ok(t) => t,
                Err(e) => {
                    if guardrail.severity == GuardrailSeverity::Block {
                        warn!(
                            guardrail = %guardrail.name,
                            error = %e,
                            "Guardrail evaluation failed — blocking send"
                        );
                        return GuardrailVerdict::Blocked {
                            guardrail: guardrail.name.clone(),
                            on_trigger: guardrail.on_trigger,
                        };
                    }
                    warn!(guardrail = %guardrail.name, error = %e, "Guardrail evaluation failed");
                    continue;
                }
            };

            if !triggered {
                continue;
            }

            match guardrail.severity {
                GuardrailSeverity::Block => {
                    info!(
                        guardrail = %guardrail.name,
                        email_id = %ctx.email.id,
                        "Guardrail blocked send"
                    );
                    return GuardrailVerdict::Blocked {
                        guardrail: guardrail.name.clone(),
                        on_trigger: guardrail.on_trigger,
                    };
                }
                GuardrailSeverity::Warn => {
                    warn!(
                        guardrail = %guardrail.name,
                        email_id = %ctx.email.id,
                        "Guardrail warning on outgoing content"
                    );
                }
                GuardrailSeverity::Info => {
                    info!(
                        guardrail = %guardrail.name,
                        email_id = %ctx.email.id,
                        "Guardrail note on outgoing content"
                    );
                }
            }
        }

        GuardrailVerdict::Clear
    }

    async fn classify(
        &self,
        ctx: &EmailContext,
        outgoing: &str,
        guardrail: &Guardrail,
        llm_ctx: &LlmContext,
    ) -> Result<bool, LlmError> {
        let system = "You are a send-policy classifier. Decide whether the outgoing \
                      email content violates the stated policy.\n\
                      Respond with ONLY a JSON object: {\"triggered\": true|false, \"reason\": \"...\"}";

        let outgoing_preview: String = outgoing.chars().take(1500).collect();
        let prompt = format!(
            "Policy: {}\n\nReplying to: {} (subject: {})\n\nOutgoing content:\n{}",
            guardrail.description, ctx.email.from, ctx.email.subject, outgoing_preview
        );

        let request = CompletionRequest::new(prompt)
            .with_system(system)
            .with_max_tokens(128)
            .with_temperature(0.0)
            .with_context(llm_ctx.clone());

        let raw = self.llm.complete(request).await?;
        let parsed: GuardrailResponse = serde_json::from_str(&extract_json_object(&raw))
            .map_err(|e| LlmError::InvalidResponse {
                provider: self.llm.model_name().to_string(),
                reason: format!("guardrail verdict parse failed: {e}"),
            })?;
        Ok(parsed.triggered)
    }
}
