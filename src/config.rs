//! Configuration types.

use std::time::Duration;

/// How the matcher breaks ties among candidates with equal priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TieBreak {
    /// Earlier-created rule wins (default).
    #[default]
    CreationOrder,
    /// Rule with more conditions wins; creation order is the final tier.
    MostSpecific,
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Tie-break policy for equal-priority candidates.
    pub tie_break: TieBreak,
    /// Maximum retry attempts for transient provider/LLM failures.
    pub max_retries: u32,
    /// Base delay for exponential backoff (doubles per attempt, jittered).
    pub retry_base_delay: Duration,
    /// Per-call timeout applied to every provider, LLM, and webhook call.
    pub call_timeout: Duration,
    /// Default bulk batch size.
    pub batch_size: usize,
    /// Bounded parallelism within a bulk batch.
    pub batch_concurrency: usize,
    /// Interval before the first follow-up nudge on a tracked thread.
    pub nudge_interval: Duration,
    /// Nudges stop being scheduled after this many have been sent.
    pub max_nudges: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tie_break: TieBreak::CreationOrder,
            max_retries: 3,
            retry_base_delay: Duration::from_millis(250),
            call_timeout: Duration::from_secs(30),
            batch_size: 25,
            batch_concurrency: 4,
            nudge_interval: Duration::from_secs(3 * 24 * 3600), // 3 days
            max_nudges: 3,
        }
    }
}

impl EngineConfig {
    /// Load overrides from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("AUTOPILOT_MAX_RETRIES")
            && let Ok(n) = v.parse()
        {
            cfg.max_retries = n;
        }
        if let Ok(v) = std::env::var("AUTOPILOT_BATCH_SIZE")
            && let Ok(n) = v.parse()
        {
            cfg.batch_size = n;
        }
        if let Ok(v) = std::env::var("AUTOPILOT_NUDGE_INTERVAL_HOURS")
            && let Ok(n) = v.parse::<u64>()
        {
            cfg.nudge_interval = Duration::from_secs(n * 3600);
        }
        if let Ok(v) = std::env::var("AUTOPILOT_CALL_TIMEOUT_SECS")
            && let Ok(n) = v.parse::<u64>()
        {
            cfg.call_timeout = Duration::from_secs(n);
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.tie_break, TieBreak::CreationOrder);
        assert!(cfg.max_retries >= 1);
        assert!(cfg.batch_size > 0);
        assert!(cfg.batch_concurrency > 0);
        assert!(cfg.nudge_interval > Duration::from_secs(3600));
    }
}
