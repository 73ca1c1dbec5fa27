//! Bulk runner — applies the rule set to a mailbox backlog in resumable
//! batches.
//!
//! Progress is checkpointed after every committed batch, keyed by run id,
//! so a crashed or cancelled run picks up where it stopped. Emails inside
//! a batch run with bounded parallelism and fail independently; already
//! executed (email, rule) pairs are absorbed by the executor's claim.
//! Dry runs report what would fire and persist nothing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::engine::ledger::ExecutionStatus;
use crate::engine::AutomationEngine;
use crate::error::{EngineError, Result};
use crate::provider::EmailProvider;
use crate::store::traits::Database;

/// Durable progress marker for one bulk run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkCheckpoint {
    pub run_id: Uuid,
    pub owner: String,
    /// Last email id of the most recent committed batch; the next batch
    /// starts after it.
    pub last_email_id: Option<String>,
    pub batches_done: usize,
    pub emails_seen: u64,
    pub updated_at: DateTime<Utc>,
}

impl BulkCheckpoint {
    pub fn start(run_id: Uuid, owner: impl Into<String>) -> Self {
        Self {
            run_id,
            owner: owner.into(),
            last_email_id: None,
            batches_done: 0,
            emails_seen: 0,
            updated_at: Utc::now(),
        }
    }
}

/// What a dry run says would happen to one email.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedMatch {
    pub email_id: String,
    pub rule_id: Uuid,
    pub rule_name: String,
}

/// Summary of one bulk run (or one resumed leg of it).
#[derive(Debug, Default)]
pub struct BulkRunReport {
    pub run_id: Uuid,
    pub dry_run: bool,
    pub emails_scanned: u64,
    pub applied: u64,
    pub failed: u64,
    pub skipped: u64,
    pub no_match: u64,
    /// Dry-run only: the matches that would have executed.
    pub planned: Vec<PlannedMatch>,
    pub batch_errors: Vec<EngineError>,
    /// True when the run stopped at a batch boundary on request.
    pub cancelled: bool,
}

enum EmailOutcome {
    Applied,
    Failed,
    Skipped,
    NoMatch,
    Planned(PlannedMatch),
    Error(String),
}

pub struct BulkRunner {
    engine: Arc<AutomationEngine>,
    provider: Arc<dyn EmailProvider>,
    store: Arc<dyn Database>,
    config: EngineConfig,
}

impl BulkRunner {
    pub fn new(
        engine: Arc<AutomationEngine>,
        provider: Arc<dyn EmailProvider>,
        store: Arc<dyn Database>,
        config: EngineConfig,
    ) -> Self {
        Self {
            engine,
            provider,
            store,
            config,
        }
    }

    /// Run (or resume) a bulk pass over the owner's backlog.
    ///
    /// `rule_filter` restricts the pass to the named rules, which is how
    /// a newly created rule gets applied retroactively without re-running
    /// everything else. `cancel` is observed between batches only, so
    /// cancellation never tears a batch in half.
    pub async fn run(
        &self,
        owner: &str,
        run_id: Uuid,
        rule_filter: Option<&[Uuid]>,
        dry_run: bool,
        cancel: &AtomicBool,
    ) -> Result<BulkRunReport> {
        let mut checkpoint = match self.store.get_checkpoint(run_id).await? {
            Some(cp) => {
                info!(
                    %run_id,
                    batches_done = cp.batches_done,
                    last_email_id = ?cp.last_email_id,
                    "Resuming bulk run from checkpoint"
                );
                cp
            }
            None => BulkCheckpoint::start(run_id, owner),
        };

        let mut report = BulkRunReport {
            run_id,
            dry_run,
            ..Default::default()
        };

        loop {
            if cancel.load(Ordering::SeqCst) {
                info!(%run_id, "Bulk run cancelled at batch boundary");
                report.cancelled = true;
                break;
            }

            let page = match self
                .provider
                .list_emails(checkpoint.last_email_id.as_deref(), self.config.batch_size)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    // Listing failure ends this leg; the checkpoint lets
                    // a later invocation resume.
                    warn!(%run_id, error = %e, "Bulk page fetch failed");
                    report.batch_errors.push(EngineError::BulkBatch {
                        run_id,
                        batch: checkpoint.batches_done,
                        reason: e.to_string(),
                    });
                    break;
                }
            };

            if page.is_empty() {
                break;
            }

            let batch_len = page.len() as u64;
            let last_id = page.last().map(|e| e.id.clone());

            let outcomes: Vec<EmailOutcome> = stream::iter(page)
                .map(|email| {
                    let engine = self.engine.clone();
                    let owner = owner.to_string();
                    async move {
                        if dry_run {
                            match engine.plan_with_rules(&owner, email, rule_filter).await {
                                Ok(Some(planned)) => EmailOutcome::Planned(planned),
                                Ok(None) => EmailOutcome::NoMatch,
                                Err(e) => EmailOutcome::Error(e.to_string()),
                            }
                        } else {
                            match engine.evaluate_with_rules(&owner, email, rule_filter).await {
                                Ok(Some(record)) => match record.status {
                                    ExecutionStatus::Failed => EmailOutcome::Failed,
                                    ExecutionStatus::Skipped => EmailOutcome::Skipped,
                                    _ => EmailOutcome::Applied,
                                },
                                Ok(None) => EmailOutcome::NoMatch,
                                Err(e) => EmailOutcome::Error(e.to_string()),
                            }
                        }
                    }
                })
                .buffer_unordered(self.config.batch_concurrency)
                .collect()
                .await;

            report.emails_scanned += batch_len;
            for outcome in outcomes {
                match outcome {
                    EmailOutcome::Applied => report.applied += 1,
                    EmailOutcome::Failed => report.failed += 1,
                    EmailOutcome::Skipped => report.skipped += 1,
                    EmailOutcome::NoMatch => report.no_match += 1,
                    EmailOutcome::Planned(p) => report.planned.push(p),
                    EmailOutcome::Error(reason) => {
                        report.failed += 1;
                        report.batch_errors.push(EngineError::BulkBatch {
                            run_id,
                            batch: checkpoint.batches_done,
                            reason,
                        });
                    }
                }
            }

            checkpoint.last_email_id = last_id;
            checkpoint.batches_done += 1;
            checkpoint.emails_seen += batch_len;
            checkpoint.updated_at = Utc::now();

            // Dry runs persist nothing, checkpoints included.
            if !dry_run {
                self.store.save_checkpoint(&checkpoint).await?;
            }
        }

        info!(
            %run_id,
            dry_run,
            scanned = report.emails_scanned,
            applied = report.applied,
            failed = report.failed,
            skipped = report.skipped,
            no_match = report.no_match,
            cancelled = report.cancelled,
            "Bulk run finished"
        );
        Ok(report)
    }
}
