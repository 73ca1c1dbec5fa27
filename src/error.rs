//! Error types for the automation engine.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persistence errors. These are infrastructure-level and propagate
/// as fatal — per-email failures are recorded on records instead.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Terminal record is immutable: {entity} {id}")]
    TerminalImmutable { entity: String, id: String },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// LLM capability errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("LLM call timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LlmError {
    /// Whether the call may succeed if retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Timeout { .. })
    }
}

/// Email-provider and webhook capability errors.
///
/// The executor retries transient failures with bounded backoff and
/// records fatal ones on the action outcome.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Transient network fault: {0}")]
    Transient(String),

    #[error("Call timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Operation {op} failed: {reason}")]
    Fatal { op: String, reason: String },

    #[error("Message not found: {0}")]
    NotFound(String),
}

impl ProviderError {
    /// Whether the executor should retry this failure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Transient(_) | Self::Timeout { .. }
        )
    }
}

/// Pipeline-stage errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Condition evaluation failed for rule {rule_id}: {reason}")]
    Condition { rule_id: Uuid, reason: String },

    #[error("Rule selection failed: {0}")]
    Selection(String),

    #[error("Rule compilation failed: {0}")]
    Compile(#[from] CompileError),

    #[error("Execution already claimed for email {email_id} rule {rule_id}")]
    AlreadyClaimed { email_id: String, rule_id: Uuid },

    #[error("Bulk run {run_id} batch {batch} failed: {reason}")]
    BulkBatch {
        run_id: Uuid,
        batch: usize,
        reason: String,
    },
}

/// Natural-language rule compilation errors.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("Model output was not a rule object: {0}")]
    NotARule(String),

    #[error("Unknown condition type: {0}")]
    UnknownCondition(String),

    #[error("Unknown action type: {0}")]
    UnknownAction(String),

    #[error("Rule has no actions")]
    NoActions,

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_transient_classification() {
        assert!(ProviderError::RateLimited { retry_after: None }.is_transient());
        assert!(ProviderError::Transient("conn reset".into()).is_transient());
        assert!(
            ProviderError::Timeout {
                timeout: Duration::from_secs(10)
            }
            .is_transient()
        );
        assert!(
            !ProviderError::Fatal {
                op: "send".into(),
                reason: "invalid recipient".into()
            }
            .is_transient()
        );
        assert!(!ProviderError::NotFound("msg-1".into()).is_transient());
    }

    #[test]
    fn llm_transient_classification() {
        assert!(
            LlmError::Timeout {
                timeout: Duration::from_secs(30)
            }
            .is_transient()
        );
        assert!(
            !LlmError::InvalidResponse {
                provider: "anthropic".into(),
                reason: "empty".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn errors_convert_to_top_level() {
        let e: Error = StoreError::Query("boom".into()).into();
        assert!(matches!(e, Error::Store(_)));
        let e: Error = EngineError::Selection("ambiguous".into()).into();
        assert!(matches!(e, Error::Engine(_)));
    }
}
