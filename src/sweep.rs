//! Background nudge sweep — runs the reply tracker on a cron schedule.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::{ConfigError, Result};
use crate::llm::LlmContext;
use crate::tracker::nudge::ReplyTracker;

/// How often the sweeper re-checks the schedule at minimum.
const MAX_SLEEP: Duration = Duration::from_secs(60);

/// Parse a cron expression and compute the next fire time from now.
pub fn next_fire(schedule: &cron::Schedule) -> Option<chrono::DateTime<Utc>> {
    schedule.upcoming(Utc).next()
}

/// Spawn a background task that sweeps due threads per `schedule`
/// (a cron expression, e.g. `"0 0 9 * * *"` for 09:00 daily).
///
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop the
/// sweeper; it is checked at least every [`MAX_SLEEP`].
pub fn spawn_nudge_sweeper(
    tracker: Arc<ReplyTracker>,
    owner: String,
    schedule: &str,
) -> Result<(JoinHandle<()>, Arc<AtomicBool>)> {
    let schedule = cron::Schedule::from_str(schedule).map_err(|e| ConfigError::InvalidValue {
        key: "nudge_schedule".into(),
        message: e.to_string(),
    })?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(owner, "Nudge sweeper started");
        let llm_ctx = LlmContext::for_user(&owner);

        loop {
            let Some(fire_at) = next_fire(&schedule) else {
                warn!("Cron schedule has no upcoming fire time; sweeper exiting");
                return;
            };

            // Sleep in bounded slices so shutdown is observed promptly.
            while Utc::now() < fire_at {
                if shutdown.load(Ordering::Relaxed) {
                    info!("Nudge sweeper shutting down");
                    return;
                }
                let remaining = (fire_at - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO)
                    .min(MAX_SLEEP);
                tokio::time::sleep(remaining).await;
            }

            if shutdown.load(Ordering::Relaxed) {
                info!("Nudge sweeper shutting down");
                return;
            }

            match tracker.sweep(Utc::now(), &llm_ctx).await {
                Ok(report) => {
                    if report.due > 0 {
                        info!(
                            due = report.due,
                            nudged = report.nudged,
                            exhausted = report.exhausted,
                            failed = report.failed,
                            "Nudge sweep pass done"
                        );
                    }
                }
                Err(e) => error!("Nudge sweep failed: {e}"),
            }
        }
    });

    Ok((handle, shutdown_flag))
}
