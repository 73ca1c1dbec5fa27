//! Reply tracking sweep — finds overdue threads and drafts follow-up
//! nudges.
//!
//! Nudges are always drafts, never auto-sent; the user reviews them in
//! their own mailbox. Each nudge pushes the thread's due time forward,
//! and a thread stops being nudged once the configured cap is reached or
//! the counterparty replies.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::email::EmailMessage;
use crate::error::Result;
use crate::llm::{CompletionRequest, LlmCapability, LlmContext};
use crate::provider::EmailProvider;
use crate::store::traits::Database;
use crate::tracker::thread::TrackedThread;

/// Outcome counts for one sweep pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct NudgeReport {
    /// Threads past due at sweep time.
    pub due: usize,
    /// Nudge drafts created.
    pub nudged: usize,
    /// Threads at the nudge cap, left alone.
    pub exhausted: usize,
    /// Threads whose nudge could not be drafted this pass.
    pub failed: usize,
}

pub struct ReplyTracker {
    store: Arc<dyn Database>,
    provider: Arc<dyn EmailProvider>,
    llm: Arc<dyn LlmCapability>,
    config: EngineConfig,
}

impl ReplyTracker {
    pub fn new(
        store: Arc<dyn Database>,
        provider: Arc<dyn EmailProvider>,
        llm: Arc<dyn LlmCapability>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            provider,
            llm,
            config,
        }
    }

    /// Resolve the email's thread if it is tracked and this reply comes
    /// from the awaited counterparty. Returns whether a thread resolved.
    pub async fn record_inbound(&self, email: &EmailMessage) -> Result<bool> {
        let Some(mut thread) = self.store.get_tracked_thread(&email.thread_id).await? else {
            return Ok(false);
        };
        if !thread.resolve_if_reply_from(&email.from) {
            debug!(
                thread_id = %email.thread_id,
                from = %email.from,
                "Reply on tracked thread from a different sender"
            );
            return Ok(false);
        }
        self.store.update_tracked_thread(&thread).await?;
        info!(thread_id = %email.thread_id, "Tracked thread resolved by reply");
        Ok(true)
    }

    /// One sweep pass: draft a nudge for every overdue thread under the
    /// nudge cap. Failures are per-thread; the sweep continues.
    pub async fn sweep(&self, now: DateTime<Utc>, llm_ctx: &LlmContext) -> Result<NudgeReport> {
        let due = self.store.due_threads(now).await?;
        let mut report = NudgeReport {
            due: due.len(),
            ..Default::default()
        };

        for mut thread in due {
            if thread.nudge_count >= self.config.max_nudges {
                debug!(
                    thread_id = %thread.thread_id,
                    nudges = thread.nudge_count,
                    "Thread at nudge cap"
                );
                report.exhausted += 1;
                continue;
            }

            match self.nudge_thread(&thread, now, llm_ctx).await {
                Ok(()) => {
                    if let Err(reason) = thread.record_nudge(now, self.config.nudge_interval) {
                        warn!(thread_id = %thread.thread_id, reason, "Could not advance nudge state");
                        report.failed += 1;
                        continue;
                    }
                    self.store.update_tracked_thread(&thread).await?;
                    report.nudged += 1;
                }
                Err(e) => {
                    warn!(thread_id = %thread.thread_id, error = %e, "Nudge draft failed");
                    report.failed += 1;
                }
            }
        }

        info!(
            due = report.due,
            nudged = report.nudged,
            exhausted = report.exhausted,
            failed = report.failed,
            "Nudge sweep complete"
        );
        Ok(report)
    }

    async fn nudge_thread(
        &self,
        thread: &TrackedThread,
        now: DateTime<Utc>,
        llm_ctx: &LlmContext,
    ) -> Result<()> {
        let content = self.draft_nudge_text(thread, now, llm_ctx).await;

        // The provider drafts onto the thread; only thread-level fields
        // carry meaning here.
        let anchor = EmailMessage {
            id: thread.thread_id.clone(),
            thread_id: thread.thread_id.clone(),
            from: thread.recipient.clone(),
            from_name: None,
            to: Vec::new(),
            reply_to: None,
            subject: String::new(),
            body: String::new(),
            received_at: thread.last_message_at,
        };
        self.provider.create_draft(&anchor, &content).await?;
        Ok(())
    }

    /// Generate friendly follow-up text; a model outage degrades to a
    /// fixed template rather than skipping the nudge.
    async fn draft_nudge_text(
        &self,
        thread: &TrackedThread,
        now: DateTime<Utc>,
        llm_ctx: &LlmContext,
    ) -> String {
        let days_waiting = (now - thread.last_message_at).num_days().max(0);
        let prompt = format!(
            "Write a brief, polite follow-up nudge for an email thread.\n\
             Recipient: {}\nDays since our last message: {}\nFollow-ups already sent: {}\n\n\
             Two sentences at most. No subject line, no signature.",
            thread.recipient, days_waiting, thread.nudge_count
        );
        let request = CompletionRequest::new(prompt)
            .with_max_tokens(160)
            .with_context(llm_ctx.clone());

        match self.llm.complete(request).await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) | Err(_) => format!(
                "Just following up on this thread — it has been {days_waiting} day(s) \
                 since my last message. Any update?"
            ),
        }
    }
}
