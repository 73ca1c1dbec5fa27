use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use secrecy::SecretString;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use mail_autopilot::config::EngineConfig;
use mail_autopilot::engine::AutomationEngine;
use mail_autopilot::llm::anthropic::AnthropicCapability;
use mail_autopilot::provider::{
    EmailProvider, HttpWebhookCaller, KeywordCategorizer, SpoolProvider,
};
use mail_autopilot::store::LibSqlBackend;
use mail_autopilot::sweep::spawn_nudge_sweeper;
use mail_autopilot::tracker::ReplyTracker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let api_key = std::env::var("ANTHROPIC_API_KEY").unwrap_or_else(|_| {
        eprintln!("ANTHROPIC_API_KEY must be set");
        std::process::exit(1);
    });
    let model = std::env::var("AUTOPILOT_MODEL")
        .unwrap_or_else(|_| "claude-sonnet-4-20250514".to_string());
    let db_path = std::env::var("AUTOPILOT_DB_PATH")
        .unwrap_or_else(|_| "./data/mail-autopilot.db".to_string());
    let spool_path =
        std::env::var("AUTOPILOT_SPOOL").unwrap_or_else(|_| "./data/spool".to_string());
    let owner = std::env::var("AUTOPILOT_OWNER").unwrap_or_else(|_| "local".to_string());
    let nudge_cron =
        std::env::var("AUTOPILOT_NUDGE_CRON").unwrap_or_else(|_| "0 0 9 * * *".to_string());
    let poll_secs: u64 = std::env::var("AUTOPILOT_POLL_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(60);
    let config = EngineConfig::from_env();

    eprintln!("mail-autopilot");
    eprintln!("  model:  {model}");
    eprintln!("  db:     {db_path}");
    eprintln!("  spool:  {spool_path}");
    eprintln!("  owner:  {owner}");

    let store = Arc::new(
        LibSqlBackend::new_local(&PathBuf::from(&db_path))
            .await
            .unwrap_or_else(|e| {
                eprintln!("Failed to open database at {db_path}: {e}");
                std::process::exit(1);
            }),
    );
    let provider = Arc::new(SpoolProvider::open(&spool_path).unwrap_or_else(|e| {
        eprintln!("Failed to open spool at {spool_path}: {e}");
        std::process::exit(1);
    }));
    let categorizer = Arc::new(match std::env::var("AUTOPILOT_CATEGORIES") {
        Ok(spec) => KeywordCategorizer::from_spec(&spec),
        Err(_) => KeywordCategorizer::empty(),
    });
    let webhooks = Arc::new(HttpWebhookCaller::new(
        std::env::var("AUTOPILOT_WEBHOOK_TOKEN").ok(),
    ));
    let llm = Arc::new(AnthropicCapability::new(
        SecretString::from(api_key),
        model.clone(),
    ));

    let engine = Arc::new(AutomationEngine::new(
        store.clone(),
        provider.clone(),
        categorizer,
        webhooks,
        llm.clone(),
        config.clone(),
    ));
    let tracker = Arc::new(ReplyTracker::new(
        store.clone(),
        provider.clone(),
        llm,
        config,
    ));

    let (sweeper, sweeper_shutdown) =
        spawn_nudge_sweeper(tracker.clone(), owner.clone(), &nudge_cron)?;
    info!(cron = %nudge_cron, "Nudge sweeper started");

    let mut cursor: Option<String> = None;
    let mut poll = tokio::time::interval(Duration::from_secs(poll_secs));
    info!(poll_secs, "Watching inbox");

    loop {
        tokio::select! {
            _ = poll.tick() => {
                let page = match provider.list_emails(cursor.as_deref(), 50).await {
                    Ok(page) => page,
                    Err(e) => {
                        warn!(error = %e, "Inbox poll failed, will retry");
                        continue;
                    }
                };
                for email in page {
                    cursor = Some(email.id.clone());
                    match tracker.record_inbound(&email).await {
                        Ok(true) => {
                            info!(thread_id = %email.thread_id, "Tracked thread resolved by reply");
                        }
                        Ok(false) => {}
                        Err(e) => warn!(email_id = %email.id, error = %e, "Reply tracking failed"),
                    }
                    match engine.evaluate(&owner, email.clone()).await {
                        Ok(Some(record)) => {
                            info!(
                                email_id = %email.id,
                                rule_id = %record.rule_id,
                                status = %record.status,
                                "Rule executed"
                            );
                        }
                        Ok(None) => {}
                        Err(e) => error!(email_id = %email.id, error = %e, "Evaluation failed"),
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    sweeper_shutdown.store(true, Ordering::SeqCst);
    let _ = sweeper.await;
    Ok(())
}
