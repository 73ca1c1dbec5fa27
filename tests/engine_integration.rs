//! End-to-end pipeline tests: inbound email through matching, selection,
//! execution, and the ledger, against the in-memory store and mock
//! mailbox/model implementations.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use uuid::Uuid;

use mail_autopilot::config::EngineConfig;
use mail_autopilot::email::EmailMessage;
use mail_autopilot::engine::{
    AutomationEngine, BulkRunner, ExecutionStatus, Guardrail, GuardrailSeverity,
};
use mail_autopilot::error::{LlmError, ProviderError};
use mail_autopilot::llm::{CompletionRequest, LlmCapability, LlmContext};
use mail_autopilot::provider::{EmailProvider, KeywordCategorizer, WebhookCaller};
use mail_autopilot::rules::{Action, Condition, Pattern, Rule};
use mail_autopilot::store::{Database, MemoryStore};
use mail_autopilot::tracker::{ReplyTracker, ThreadStatus};

// ── Mocks ───────────────────────────────────────────────────────────

/// Mailbox mock: a fixed set of emails plus a log of mutating calls.
struct MockMailbox {
    emails: Vec<EmailMessage>,
    calls: Mutex<Vec<String>>,
}

impl MockMailbox {
    fn new(emails: Vec<EmailMessage>) -> Arc<Self> {
        Arc::new(Self {
            emails,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl EmailProvider for MockMailbox {
    async fn list_emails(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<EmailMessage>, ProviderError> {
        let mut page: Vec<EmailMessage> = self
            .emails
            .iter()
            .filter(|e| after.is_none_or(|a| e.id.as_str() > a))
            .cloned()
            .collect();
        page.sort_by(|a, b| a.id.cmp(&b.id));
        page.truncate(limit);
        Ok(page)
    }

    async fn get_email(&self, email_id: &str) -> Result<EmailMessage, ProviderError> {
        self.emails
            .iter()
            .find(|e| e.id == email_id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(email_id.to_string()))
    }

    async fn apply_label(&self, email_id: &str, label: &str) -> Result<(), ProviderError> {
        self.record(format!("label:{email_id}:{label}"));
        Ok(())
    }

    async fn archive(&self, email_id: &str) -> Result<(), ProviderError> {
        self.record(format!("archive:{email_id}"));
        Ok(())
    }

    async fn create_draft(
        &self,
        email: &EmailMessage,
        _content: &str,
    ) -> Result<(), ProviderError> {
        self.record(format!("draft:{}", email.thread_id));
        Ok(())
    }

    async fn send(&self, email: &EmailMessage, _content: &str) -> Result<(), ProviderError> {
        self.record(format!("send:{}", email.id));
        Ok(())
    }

    async fn forward(&self, email: &EmailMessage, to: &str) -> Result<(), ProviderError> {
        self.record(format!("forward:{}:{to}", email.id));
        Ok(())
    }

    async fn mark_spam(&self, email_id: &str) -> Result<(), ProviderError> {
        self.record(format!("mark_spam:{email_id}"));
        Ok(())
    }

    async fn mark_read(&self, email_id: &str) -> Result<(), ProviderError> {
        self.record(format!("mark_read:{email_id}"));
        Ok(())
    }
}

struct NoopWebhooks;

#[async_trait]
impl WebhookCaller for NoopWebhooks {
    async fn post(&self, _url: &str, _payload: &Value) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// Fixed-response model that counts invocations.
struct ScriptedLlm {
    response: String,
    calls: AtomicUsize,
}

impl ScriptedLlm {
    fn new(response: &str) -> Arc<Self> {
        Arc::new(Self {
            response: response.into(),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl LlmCapability for ScriptedLlm {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.response.clone())
    }
}

// ── Fixtures ────────────────────────────────────────────────────────

fn email(id: &str, from: &str, subject: &str, body: &str) -> EmailMessage {
    EmailMessage {
        id: id.into(),
        thread_id: format!("t-{id}"),
        from: from.into(),
        from_name: None,
        to: vec!["me@corp.com".into()],
        reply_to: None,
        subject: subject.into(),
        body: body.into(),
        received_at: Utc::now(),
    }
}

fn invoice_email(id: &str) -> EmailMessage {
    email(id, "billing@vendor.com", "Invoice #42", "Your invoice is attached.")
}

fn engine_with(
    provider: Arc<MockMailbox>,
    store: Arc<MemoryStore>,
    llm: Arc<ScriptedLlm>,
) -> Arc<AutomationEngine> {
    Arc::new(AutomationEngine::new(
        store,
        provider,
        Arc::new(KeywordCategorizer::from_spec("Receipts:invoice,receipt")),
        Arc::new(NoopWebhooks),
        llm,
        EngineConfig::default(),
    ))
}

async fn file_invoices_rule(store: &MemoryStore) -> Rule {
    let rule = Rule::new("u-1", "file invoices")
        .with_condition(Condition::From {
            pattern: Pattern::contains("@vendor.com"),
        })
        .with_condition(Condition::Category {
            name: "Receipts".into(),
        })
        .with_action(Action::Label {
            name: "Invoices".into(),
        })
        .with_action(Action::Archive);
    store.insert_rule(&rule).await.unwrap();
    rule
}

// ── Pipeline ────────────────────────────────────────────────────────

#[tokio::test]
async fn deterministic_rule_applies_without_model_calls() {
    let provider = MockMailbox::new(vec![]);
    let store = Arc::new(MemoryStore::new());
    let llm = ScriptedLlm::new("unused");
    let engine = engine_with(provider.clone(), store.clone(), llm.clone());

    let rule = file_invoices_rule(&store).await;
    let record = engine
        .evaluate("u-1", invoice_email("m-1"))
        .await
        .unwrap()
        .expect("rule should fire");

    assert_eq!(record.rule_id, rule.id);
    assert_eq!(record.status, ExecutionStatus::Applied);
    assert_eq!(
        provider.calls(),
        vec!["label:m-1:Invoices", "archive:m-1"]
    );
    assert_eq!(llm.calls.load(Ordering::SeqCst), 0, "no model call needed");
}

#[tokio::test]
async fn duplicate_delivery_yields_one_record_and_one_side_effect() {
    let provider = MockMailbox::new(vec![]);
    let store = Arc::new(MemoryStore::new());
    let engine = engine_with(provider.clone(), store.clone(), ScriptedLlm::new("unused"));

    let rule = file_invoices_rule(&store).await;
    let first = engine.evaluate("u-1", invoice_email("m-1")).await.unwrap();
    let second = engine.evaluate("u-1", invoice_email("m-1")).await.unwrap();

    assert_eq!(
        first.as_ref().map(|r| r.status),
        second.as_ref().map(|r| r.status)
    );
    assert_eq!(provider.calls().len(), 2, "label + archive, exactly once");
    let ledger = store.list_executions_for_email("m-1").await.unwrap();
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].rule_id, rule.id);
}

#[tokio::test]
async fn ai_no_match_leaves_no_trace() {
    let provider = MockMailbox::new(vec![]);
    let store = Arc::new(MemoryStore::new());
    let engine = engine_with(
        provider.clone(),
        store.clone(),
        ScriptedLlm::new(r#"{"rule_id": null}"#),
    );

    let rule = Rule::new("u-1", "urgent customer issues")
        .with_condition(Condition::AiMatch {
            instruction: "is an urgent customer complaint".into(),
        })
        .with_action(Action::Forward {
            to: "support@corp.com".into(),
        });
    store.insert_rule(&rule).await.unwrap();

    let outcome = engine
        .evaluate("u-1", email("m-2", "bob@y.com", "question", "just wondering"))
        .await
        .unwrap();

    assert!(outcome.is_none());
    assert!(provider.calls().is_empty());
    assert!(store.list_executions_for_email("m-2").await.unwrap().is_empty());
}

#[tokio::test]
async fn guardrail_blocks_send_before_any_provider_call() {
    let provider = MockMailbox::new(vec![]);
    let store = Arc::new(MemoryStore::new());
    store
        .insert_guardrail(&Guardrail::new(
            "u-1",
            "no-legal",
            "Never auto-reply to anything that reads like a legal matter",
            GuardrailSeverity::Block,
        ))
        .await
        .unwrap();

    // The only model call in this pipeline is the guardrail classifier.
    let engine = engine_with(
        provider.clone(),
        store.clone(),
        ScriptedLlm::new(r#"{"triggered": true, "reason": "legal topic"}"#),
    );

    let rule = Rule::new("u-1", "ack vendor mail")
        .with_condition(Condition::From {
            pattern: Pattern::contains("@vendor.com"),
        })
        .with_action(Action::Send {
            content: "Received, thanks.".into(),
            track: false,
        });
    store.insert_rule(&rule).await.unwrap();

    let record = engine
        .evaluate("u-1", invoice_email("m-3"))
        .await
        .unwrap()
        .expect("a skipped record is still a record");

    assert_eq!(record.status, ExecutionStatus::Skipped);
    assert!(provider.calls().is_empty());
    assert!(record.reason.as_deref().unwrap().contains("no-legal"));
}

// ── Bulk runs ───────────────────────────────────────────────────────

#[tokio::test]
async fn bulk_run_processes_backlog_and_checkpoints() {
    let provider = MockMailbox::new(vec![
        invoice_email("m-1"),
        invoice_email("m-2"),
        email("m-3", "friend@y.com", "lunch?", "tacos"),
    ]);
    let store = Arc::new(MemoryStore::new());
    let engine = engine_with(provider.clone(), store.clone(), ScriptedLlm::new("unused"));
    file_invoices_rule(&store).await;

    let runner = BulkRunner::new(
        engine,
        provider.clone(),
        store.clone(),
        EngineConfig::default(),
    );
    let run_id = Uuid::new_v4();
    let report = runner
        .run("u-1", run_id, None, false, &AtomicBool::new(false))
        .await
        .unwrap();

    assert_eq!(report.emails_scanned, 3);
    assert_eq!(report.applied, 2);
    assert_eq!(report.no_match, 1);
    assert!(!report.cancelled);

    let checkpoint = store.get_checkpoint(run_id).await.unwrap().unwrap();
    assert_eq!(checkpoint.last_email_id.as_deref(), Some("m-3"));
}

#[tokio::test]
async fn rule_filter_limits_a_bulk_run_to_the_named_rules() {
    let provider = MockMailbox::new(vec![
        invoice_email("m-1"),
        email("m-2", "friend@y.com", "lunch?", "tacos"),
    ]);
    let store = Arc::new(MemoryStore::new());
    let engine = engine_with(provider.clone(), store.clone(), ScriptedLlm::new("unused"));

    let invoices = file_invoices_rule(&store).await;
    let personal = Rule::new("u-1", "file personal mail")
        .with_condition(Condition::From {
            pattern: Pattern::contains("@y.com"),
        })
        .with_action(Action::Label {
            name: "Personal".into(),
        });
    store.insert_rule(&personal).await.unwrap();

    let runner = BulkRunner::new(
        engine,
        provider.clone(),
        store.clone(),
        EngineConfig::default(),
    );
    let filter = vec![invoices.id];
    let report = runner
        .run("u-1", Uuid::new_v4(), Some(filter.as_slice()), false, &AtomicBool::new(false))
        .await
        .unwrap();

    // Only the filtered rule runs; the lunch email counts as no match
    // even though the personal rule would have labelled it.
    assert_eq!(report.applied, 1);
    assert_eq!(report.no_match, 1);
    assert_eq!(
        provider.calls(),
        vec!["label:m-1:Invoices", "archive:m-1"]
    );
}

#[tokio::test]
async fn dry_run_reports_matches_with_zero_side_effects() {
    let provider = MockMailbox::new(vec![invoice_email("m-1"), invoice_email("m-2")]);
    let store = Arc::new(MemoryStore::new());
    let engine = engine_with(provider.clone(), store.clone(), ScriptedLlm::new("unused"));
    let rule = file_invoices_rule(&store).await;

    let runner = BulkRunner::new(
        engine,
        provider.clone(),
        store.clone(),
        EngineConfig::default(),
    );
    let run_id = Uuid::new_v4();
    let report = runner
        .run("u-1", run_id, None, true, &AtomicBool::new(false))
        .await
        .unwrap();

    assert!(report.dry_run);
    assert_eq!(report.planned.len(), 2);
    assert!(report.planned.iter().all(|p| p.rule_id == rule.id));

    // Nothing was touched: no provider calls, no ledger, no selection
    // cache, no checkpoint.
    assert!(provider.calls().is_empty());
    assert!(store.list_executions_for_email("m-1").await.unwrap().is_empty());
    assert!(store.get_selection("m-1").await.unwrap().is_none());
    assert!(store.get_checkpoint(run_id).await.unwrap().is_none());
}

#[tokio::test]
async fn cancelled_bulk_run_stops_at_a_batch_boundary() {
    let provider = MockMailbox::new(vec![invoice_email("m-1"), invoice_email("m-2")]);
    let store = Arc::new(MemoryStore::new());
    let engine = engine_with(provider.clone(), store.clone(), ScriptedLlm::new("unused"));
    file_invoices_rule(&store).await;

    let runner = BulkRunner::new(
        engine,
        provider.clone(),
        store.clone(),
        EngineConfig::default(),
    );
    let report = runner
        .run("u-1", Uuid::new_v4(), None, false, &AtomicBool::new(true))
        .await
        .unwrap();

    assert!(report.cancelled);
    assert_eq!(report.emails_scanned, 0);
    assert!(provider.calls().is_empty());
}

// ── Reply tracking ──────────────────────────────────────────────────

#[tokio::test]
async fn tracked_send_is_nudged_then_resolved_by_reply() {
    let provider = MockMailbox::new(vec![]);
    let store = Arc::new(MemoryStore::new());
    let llm = ScriptedLlm::new("Following up on my earlier note.");
    let engine = engine_with(provider.clone(), store.clone(), llm.clone());

    let rule = Rule::new("u-1", "chase vendors")
        .with_condition(Condition::From {
            pattern: Pattern::contains("@vendor.com"),
        })
        .with_action(Action::Send {
            content: "Any update on this?".into(),
            track: true,
        });
    store.insert_rule(&rule).await.unwrap();

    let record = engine
        .evaluate("u-1", invoice_email("m-1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, ExecutionStatus::Applied);

    let tracker = ReplyTracker::new(
        store.clone(),
        provider.clone(),
        llm,
        EngineConfig::default(),
    );

    // Past the reply window: the sweep drafts exactly one nudge.
    let later = Utc::now() + ChronoDuration::days(4);
    let report = tracker.sweep(later, &LlmContext::for_user("u-1")).await.unwrap();
    assert_eq!(report.due, 1);
    assert_eq!(report.nudged, 1);
    assert!(provider.calls().contains(&"draft:t-m-1".to_string()));
    assert!(
        !provider.calls().iter().any(|c| c.starts_with("send:t-")),
        "nudges are drafted, never sent"
    );

    // The counterparty replies on the thread.
    let mut reply = email("m-9", "billing@vendor.com", "Re: Invoice #42", "Paid!");
    reply.thread_id = "t-m-1".into();
    assert!(tracker.record_inbound(&reply).await.unwrap());

    let thread = store.get_tracked_thread("t-m-1").await.unwrap().unwrap();
    assert_eq!(thread.status, ThreadStatus::Resolved);

    // A resolved thread never comes due again.
    let report = tracker
        .sweep(later + ChronoDuration::days(30), &LlmContext::for_user("u-1"))
        .await
        .unwrap();
    assert_eq!(report.due, 0);
}
