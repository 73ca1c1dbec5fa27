//! LLM capability — the single AI seam the engine consumes.
//!
//! The compiler, selector, resolver, guardrail evaluator, and nudge
//! generator all go through [`LlmCapability::complete`]. Everything model
//! specific (per-user fine-tuned models included) travels explicitly in
//! the request's [`LlmContext`] — never in ambient state — so tests can
//! substitute a deterministic stub.

pub mod anthropic;
pub(crate) mod json;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::LlmError;

/// Invocation context carried on every completion request.
#[derive(Debug, Clone, Default)]
pub struct LlmContext {
    /// Owner scope the call is made on behalf of.
    pub user_id: String,
    /// Per-user model override (e.g. a fine-tuned model). Falls back to
    /// the provider's configured model when `None`.
    pub model_override: Option<String>,
    /// Free-form metadata for logging/attribution.
    pub metadata: HashMap<String, String>,
}

impl LlmContext {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model_override = Some(model.into());
        self
    }
}

/// A single completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub context: LlmContext,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            system: None,
            prompt: prompt.into(),
            max_tokens: 512,
            temperature: 0.1,
            context: LlmContext::default(),
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_context(mut self, context: LlmContext) -> Self {
        self.context = context;
        self
    }
}

/// The LLM capability: `complete(prompt, context) -> text`.
#[async_trait]
pub trait LlmCapability: Send + Sync {
    /// Default model this capability is configured with.
    fn model_name(&self) -> &str;

    /// Run one completion and return the raw text.
    async fn complete(&self, request: CompletionRequest) -> Result<String, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_builder_chains() {
        let req = CompletionRequest::new("classify this")
            .with_system("you are a classifier")
            .with_max_tokens(128)
            .with_temperature(0.0)
            .with_context(LlmContext::for_user("u-1").with_model("ft-model-1"));
        assert_eq!(req.prompt, "classify this");
        assert_eq!(req.max_tokens, 128);
        assert_eq!(req.context.user_id, "u-1");
        assert_eq!(req.context.model_override.as_deref(), Some("ft-model-1"));
    }
}
