//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. The idempotency claim is
//! an `INSERT OR IGNORE` against the `(email_id, rule_id)` primary key;
//! the row count tells us whether we won the claim.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{params, Connection, Database as LibSqlDatabase};
use tracing::{debug, info};
use uuid::Uuid;

use crate::engine::bulk::BulkCheckpoint;
use crate::engine::guardrail::{Guardrail, GuardrailSeverity, GuardrailTrigger};
use crate::engine::ledger::{ActionOutcome, ExecutedRule, ExecutionStatus};
use crate::error::StoreError;
use crate::rules::model::Rule;
use crate::rules::selector::SelectionDecision;
use crate::store::traits::{ClaimOutcome, Database};
use crate::tracker::thread::{ThreadDirection, ThreadStatus, TrackedThread};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and initialize the schema.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Connection(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                StoreError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Connection(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS rules (
                id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                name TEXT NOT NULL,
                conditions TEXT NOT NULL,
                actions TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_by TEXT NOT NULL,
                shared INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_rules_owner ON rules(owner, enabled)",
            "CREATE TABLE IF NOT EXISTS executed_rules (
                email_id TEXT NOT NULL,
                rule_id TEXT NOT NULL,
                status TEXT NOT NULL,
                action_items TEXT NOT NULL DEFAULT '[]',
                automated INTEGER NOT NULL DEFAULT 1,
                reason TEXT,
                created_at TEXT NOT NULL,
                PRIMARY KEY (email_id, rule_id)
            )",
            "CREATE INDEX IF NOT EXISTS idx_executed_email ON executed_rules(email_id)",
            "CREATE TABLE IF NOT EXISTS selections (
                email_id TEXT PRIMARY KEY,
                sender TEXT NOT NULL,
                rule_id TEXT,
                rule_name TEXT,
                decided_at TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_selections_sender ON selections(sender, decided_at)",
            "CREATE TABLE IF NOT EXISTS guardrails (
                id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT NOT NULL,
                severity TEXT NOT NULL,
                on_trigger TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                enabled INTEGER NOT NULL DEFAULT 1
            )",
            "CREATE TABLE IF NOT EXISTS tracked_threads (
                thread_id TEXT PRIMARY KEY,
                recipient TEXT NOT NULL,
                direction TEXT NOT NULL,
                last_message_at TEXT NOT NULL,
                due_at TEXT NOT NULL,
                status TEXT NOT NULL,
                nudge_count INTEGER NOT NULL DEFAULT 0
            )",
            "CREATE INDEX IF NOT EXISTS idx_threads_due ON tracked_threads(status, due_at)",
            "CREATE TABLE IF NOT EXISTS bulk_checkpoints (
                run_id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                last_email_id TEXT,
                batches_done INTEGER NOT NULL DEFAULT 0,
                emails_seen INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            )",
        ];
        for sql in statements {
            self.conn()
                .execute(sql, ())
                .await
                .map_err(|e| StoreError::Query(format!("init_schema: {e}")))?;
        }
        Ok(())
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn exec_status_to_str(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::Pending => "pending",
        ExecutionStatus::Applied => "applied",
        ExecutionStatus::Failed => "failed",
        ExecutionStatus::Skipped => "skipped",
    }
}

fn str_to_exec_status(s: &str) -> ExecutionStatus {
    match s {
        "applied" => ExecutionStatus::Applied,
        "failed" => ExecutionStatus::Failed,
        "skipped" => ExecutionStatus::Skipped,
        _ => ExecutionStatus::Pending,
    }
}

fn thread_status_to_str(status: ThreadStatus) -> &'static str {
    match status {
        ThreadStatus::AwaitingReply => "awaiting_reply",
        ThreadStatus::Resolved => "resolved",
    }
}

fn str_to_thread_status(s: &str) -> ThreadStatus {
    match s {
        "resolved" => ThreadStatus::Resolved,
        _ => ThreadStatus::AwaitingReply,
    }
}

fn direction_to_str(direction: ThreadDirection) -> &'static str {
    match direction {
        ThreadDirection::Sent => "sent",
        ThreadDirection::Received => "received",
    }
}

fn str_to_direction(s: &str) -> ThreadDirection {
    match s {
        "received" => ThreadDirection::Received,
        _ => ThreadDirection::Sent,
    }
}

fn severity_to_str(severity: GuardrailSeverity) -> &'static str {
    match severity {
        GuardrailSeverity::Block => "block",
        GuardrailSeverity::Warn => "warn",
        GuardrailSeverity::Info => "info",
    }
}

fn str_to_severity(s: &str) -> GuardrailSeverity {
    match s {
        "warn" => GuardrailSeverity::Warn,
        "info" => GuardrailSeverity::Info,
        _ => GuardrailSeverity::Block,
    }
}

fn trigger_to_str(trigger: GuardrailTrigger) -> &'static str {
    match trigger {
        GuardrailTrigger::HoldForReview => "hold_for_review",
        GuardrailTrigger::AskUser => "ask_user",
        GuardrailTrigger::LogOnly => "log_only",
    }
}

fn str_to_trigger(s: &str) -> GuardrailTrigger {
    match s {
        "ask_user" => GuardrailTrigger::AskUser,
        "log_only" => GuardrailTrigger::LogOnly,
        _ => GuardrailTrigger::HoldForReview,
    }
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn json_err(context: &str, e: serde_json::Error) -> StoreError {
    StoreError::Serialization(format!("{context}: {e}"))
}

// ── Row mappers ─────────────────────────────────────────────────────

const RULE_COLUMNS: &str =
    "id, owner, name, conditions, actions, priority, enabled, created_by, shared, created_at";

fn row_to_rule(row: &libsql::Row) -> Result<Rule, StoreError> {
    let id_str: String = row.get(0).map_err(|e| StoreError::Query(e.to_string()))?;
    let owner: String = row.get(1).map_err(|e| StoreError::Query(e.to_string()))?;
    let name: String = row.get(2).map_err(|e| StoreError::Query(e.to_string()))?;
    let conditions_json: String = row.get(3).map_err(|e| StoreError::Query(e.to_string()))?;
    let actions_json: String = row.get(4).map_err(|e| StoreError::Query(e.to_string()))?;
    let priority: i64 = row.get(5).map_err(|e| StoreError::Query(e.to_string()))?;
    let enabled: i64 = row.get(6).map_err(|e| StoreError::Query(e.to_string()))?;
    let created_by: String = row.get(7).map_err(|e| StoreError::Query(e.to_string()))?;
    let shared: i64 = row.get(8).map_err(|e| StoreError::Query(e.to_string()))?;
    let created_str: String = row.get(9).map_err(|e| StoreError::Query(e.to_string()))?;

    Ok(Rule {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        owner,
        name,
        conditions: serde_json::from_str(&conditions_json)
            .map_err(|e| json_err("rule conditions", e))?,
        actions: serde_json::from_str(&actions_json).map_err(|e| json_err("rule actions", e))?,
        priority: priority as i32,
        enabled: enabled != 0,
        created_by,
        shared: shared != 0,
        created_at: parse_datetime(&created_str),
    })
}

const EXECUTION_COLUMNS: &str =
    "email_id, rule_id, status, action_items, automated, reason, created_at";

fn row_to_execution(row: &libsql::Row) -> Result<ExecutedRule, StoreError> {
    let email_id: String = row.get(0).map_err(|e| StoreError::Query(e.to_string()))?;
    let rule_id_str: String = row.get(1).map_err(|e| StoreError::Query(e.to_string()))?;
    let status_str: String = row.get(2).map_err(|e| StoreError::Query(e.to_string()))?;
    let items_json: String = row.get(3).map_err(|e| StoreError::Query(e.to_string()))?;
    let automated: i64 = row.get(4).map_err(|e| StoreError::Query(e.to_string()))?;
    let reason: Option<String> = row.get(5).ok();
    let created_str: String = row.get(6).map_err(|e| StoreError::Query(e.to_string()))?;

    let action_items: Vec<ActionOutcome> =
        serde_json::from_str(&items_json).map_err(|e| json_err("action items", e))?;

    Ok(ExecutedRule {
        email_id,
        rule_id: Uuid::parse_str(&rule_id_str).unwrap_or_else(|_| Uuid::nil()),
        status: str_to_exec_status(&status_str),
        action_items,
        automated: automated != 0,
        reason,
        created_at: parse_datetime(&created_str),
    })
}

fn row_to_selection(row: &libsql::Row) -> Result<SelectionDecision, StoreError> {
    let email_id: String = row.get(0).map_err(|e| StoreError::Query(e.to_string()))?;
    let sender: String = row.get(1).map_err(|e| StoreError::Query(e.to_string()))?;
    let rule_id_str: Option<String> = row.get(2).ok();
    let rule_name: Option<String> = row.get(3).ok();
    let decided_str: String = row.get(4).map_err(|e| StoreError::Query(e.to_string()))?;

    Ok(SelectionDecision {
        email_id,
        sender,
        rule_id: rule_id_str.and_then(|s| Uuid::parse_str(&s).ok()),
        rule_name,
        decided_at: parse_datetime(&decided_str),
    })
}

fn row_to_guardrail(row: &libsql::Row) -> Result<Guardrail, StoreError> {
    let id_str: String = row.get(0).map_err(|e| StoreError::Query(e.to_string()))?;
    let owner: String = row.get(1).map_err(|e| StoreError::Query(e.to_string()))?;
    let name: String = row.get(2).map_err(|e| StoreError::Query(e.to_string()))?;
    let description: String = row.get(3).map_err(|e| StoreError::Query(e.to_string()))?;
    let severity_str: String = row.get(4).map_err(|e| StoreError::Query(e.to_string()))?;
    let trigger_str: String = row.get(5).map_err(|e| StoreError::Query(e.to_string()))?;
    let priority: i64 = row.get(6).map_err(|e| StoreError::Query(e.to_string()))?;
    let enabled: i64 = row.get(7).map_err(|e| StoreError::Query(e.to_string()))?;

    Ok(Guardrail {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        owner,
        name,
        description,
        severity: str_to_severity(&severity_str),
        on_trigger: str_to_trigger(&trigger_str),
        priority: priority as i32,
        enabled: enabled != 0,
    })
}

fn row_to_thread(row: &libsql::Row) -> Result<TrackedThread, StoreError> {
    let thread_id: String = row.get(0).map_err(|e| StoreError::Query(e.to_string()))?;
    let recipient: String = row.get(1).map_err(|e| StoreError::Query(e.to_string()))?;
    let direction_str: String = row.get(2).map_err(|e| StoreError::Query(e.to_string()))?;
    let last_str: String = row.get(3).map_err(|e| StoreError::Query(e.to_string()))?;
    let due_str: String = row.get(4).map_err(|e| StoreError::Query(e.to_string()))?;
    let status_str: String = row.get(5).map_err(|e| StoreError::Query(e.to_string()))?;
    let nudge_count: i64 = row.get(6).map_err(|e| StoreError::Query(e.to_string()))?;

    Ok(TrackedThread {
        thread_id,
        recipient,
        direction: str_to_direction(&direction_str),
        last_message_at: parse_datetime(&last_str),
        due_at: parse_datetime(&due_str),
        status: str_to_thread_status(&status_str),
        nudge_count: nudge_count as u32,
    })
}

fn row_to_checkpoint(row: &libsql::Row) -> Result<BulkCheckpoint, StoreError> {
    let run_id_str: String = row.get(0).map_err(|e| StoreError::Query(e.to_string()))?;
    let owner: String = row.get(1).map_err(|e| StoreError::Query(e.to_string()))?;
    let last_email_id: Option<String> = row.get(2).ok();
    let batches_done: i64 = row.get(3).map_err(|e| StoreError::Query(e.to_string()))?;
    let emails_seen: i64 = row.get(4).map_err(|e| StoreError::Query(e.to_string()))?;
    let updated_str: String = row.get(5).map_err(|e| StoreError::Query(e.to_string()))?;

    Ok(BulkCheckpoint {
        run_id: Uuid::parse_str(&run_id_str).unwrap_or_else(|_| Uuid::nil()),
        owner,
        last_email_id,
        batches_done: batches_done as usize,
        emails_seen: emails_seen as u64,
        updated_at: parse_datetime(&updated_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn insert_rule(&self, rule: &Rule) -> Result<(), StoreError> {
        let conditions = serde_json::to_string(&rule.conditions)
            .map_err(|e| json_err("rule conditions", e))?;
        let actions =
            serde_json::to_string(&rule.actions).map_err(|e| json_err("rule actions", e))?;

        self.conn()
            .execute(
                "INSERT INTO rules (id, owner, name, conditions, actions, priority, enabled, created_by, shared, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    rule.id.to_string(),
                    rule.owner.clone(),
                    rule.name.clone(),
                    conditions,
                    actions,
                    rule.priority as i64,
                    i64::from(rule.enabled),
                    rule.created_by.clone(),
                    i64::from(rule.shared),
                    rule.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("insert_rule: {e}")))?;

        debug!(rule_id = %rule.id, owner = %rule.owner, "Rule inserted");
        Ok(())
    }

    async fn get_rule(&self, id: Uuid) -> Result<Option<Rule>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {RULE_COLUMNS} FROM rules WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_rule: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_rule(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_rule: {e}"))),
        }
    }

    async fn list_enabled_rules(&self, owner: &str) -> Result<Vec<Rule>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RULE_COLUMNS} FROM rules \
                     WHERE enabled = 1 AND (owner = ?1 OR shared = 1) \
                     ORDER BY created_at ASC, id ASC"
                ),
                params![owner],
            )
            .await
            .map_err(|e| StoreError::Query(format!("list_enabled_rules: {e}")))?;

        let mut rules = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_rule(&row) {
                Ok(rule) => rules.push(rule),
                Err(e) => tracing::warn!("Skipping rule row: {e}"),
            }
        }
        Ok(rules)
    }

    async fn update_rule(&self, rule: &Rule) -> Result<(), StoreError> {
        let conditions = serde_json::to_string(&rule.conditions)
            .map_err(|e| json_err("rule conditions", e))?;
        let actions =
            serde_json::to_string(&rule.actions).map_err(|e| json_err("rule actions", e))?;

        let affected = self
            .conn()
            .execute(
                "UPDATE rules SET name = ?1, conditions = ?2, actions = ?3, priority = ?4, \
                 enabled = ?5, shared = ?6 WHERE id = ?7",
                params![
                    rule.name.clone(),
                    conditions,
                    actions,
                    rule.priority as i64,
                    i64::from(rule.enabled),
                    i64::from(rule.shared),
                    rule.id.to_string(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("update_rule: {e}")))?;

        if affected == 0 {
            return Err(StoreError::NotFound {
                entity: "rule".into(),
                id: rule.id.to_string(),
            });
        }
        Ok(())
    }

    async fn set_rule_enabled(&self, id: Uuid, enabled: bool) -> Result<(), StoreError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE rules SET enabled = ?1 WHERE id = ?2",
                params![i64::from(enabled), id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("set_rule_enabled: {e}")))?;

        if affected == 0 {
            return Err(StoreError::NotFound {
                entity: "rule".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn claim_execution(
        &self,
        email_id: &str,
        rule_id: Uuid,
        automated: bool,
    ) -> Result<ClaimOutcome, StoreError> {
        // The primary key makes this a first-writer-wins claim.
        let affected = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO executed_rules \
                 (email_id, rule_id, status, action_items, automated, reason, created_at) \
                 VALUES (?1, ?2, 'pending', '[]', ?3, NULL, ?4)",
                params![
                    email_id,
                    rule_id.to_string(),
                    i64::from(automated),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("claim_execution: {e}")))?;

        if affected == 1 {
            debug!(email_id, %rule_id, "Execution claimed");
            return Ok(ClaimOutcome::Claimed);
        }

        let existing = self
            .get_execution(email_id, rule_id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "executed_rule".into(),
                id: format!("{email_id}/{rule_id}"),
            })?;
        Ok(ClaimOutcome::Existing(existing))
    }

    async fn finalize_execution(&self, record: &ExecutedRule) -> Result<(), StoreError> {
        if !record.status.is_terminal() {
            return Err(StoreError::Query(
                "finalize requires a terminal status".into(),
            ));
        }
        let items = serde_json::to_string(&record.action_items)
            .map_err(|e| json_err("action items", e))?;

        // Only a pending row may be finalized.
        let affected = self
            .conn()
            .execute(
                "UPDATE executed_rules SET status = ?1, action_items = ?2, reason = ?3 \
                 WHERE email_id = ?4 AND rule_id = ?5 AND status = 'pending'",
                params![
                    exec_status_to_str(record.status),
                    items,
                    opt_text_owned(record.reason.clone()),
                    record.email_id.clone(),
                    record.rule_id.to_string(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("finalize_execution: {e}")))?;

        if affected == 0 {
            return match self.get_execution(&record.email_id, record.rule_id).await? {
                Some(_) => Err(StoreError::TerminalImmutable {
                    entity: "executed_rule".into(),
                    id: format!("{}/{}", record.email_id, record.rule_id),
                }),
                None => Err(StoreError::NotFound {
                    entity: "executed_rule".into(),
                    id: format!("{}/{}", record.email_id, record.rule_id),
                }),
            };
        }
        Ok(())
    }

    async fn get_execution(
        &self,
        email_id: &str,
        rule_id: Uuid,
    ) -> Result<Option<ExecutedRule>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {EXECUTION_COLUMNS} FROM executed_rules \
                     WHERE email_id = ?1 AND rule_id = ?2"
                ),
                params![email_id, rule_id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_execution: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_execution(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_execution: {e}"))),
        }
    }

    async fn list_executions_for_email(
        &self,
        email_id: &str,
    ) -> Result<Vec<ExecutedRule>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {EXECUTION_COLUMNS} FROM executed_rules \
                     WHERE email_id = ?1 ORDER BY created_at ASC"
                ),
                params![email_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("list_executions_for_email: {e}")))?;

        let mut records = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_execution(&row) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("Skipping execution row: {e}"),
            }
        }
        Ok(records)
    }

    async fn get_selection(&self, email_id: &str) -> Result<Option<SelectionDecision>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT email_id, sender, rule_id, rule_name, decided_at \
                 FROM selections WHERE email_id = ?1",
                params![email_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_selection: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_selection(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_selection: {e}"))),
        }
    }

    async fn put_selection(&self, decision: &SelectionDecision) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO selections (email_id, sender, rule_id, rule_name, decided_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    decision.email_id.clone(),
                    decision.sender.clone(),
                    opt_text_owned(decision.rule_id.map(|id| id.to_string())),
                    opt_text_owned(decision.rule_name.clone()),
                    decision.decided_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("put_selection: {e}")))?;
        Ok(())
    }

    async fn selection_history(
        &self,
        sender: &str,
        limit: usize,
    ) -> Result<Vec<SelectionDecision>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT email_id, sender, rule_id, rule_name, decided_at FROM selections \
                 WHERE sender = ?1 ORDER BY decided_at DESC LIMIT ?2",
                params![sender, limit as i64],
            )
            .await
            .map_err(|e| StoreError::Query(format!("selection_history: {e}")))?;

        let mut decisions = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_selection(&row) {
                Ok(decision) => decisions.push(decision),
                Err(e) => tracing::warn!("Skipping selection row: {e}"),
            }
        }
        Ok(decisions)
    }

    async fn insert_guardrail(&self, guardrail: &Guardrail) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO guardrails (id, owner, name, description, severity, on_trigger, priority, enabled) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    guardrail.id.to_string(),
                    guardrail.owner.clone(),
                    guardrail.name.clone(),
                    guardrail.description.clone(),
                    severity_to_str(guardrail.severity),
                    trigger_to_str(guardrail.on_trigger),
                    guardrail.priority as i64,
                    i64::from(guardrail.enabled),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("insert_guardrail: {e}")))?;
        Ok(())
    }

    async fn list_enabled_guardrails(&self, owner: &str) -> Result<Vec<Guardrail>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, owner, name, description, severity, on_trigger, priority, enabled \
                 FROM guardrails WHERE enabled = 1 AND owner = ?1 ORDER BY priority DESC",
                params![owner],
            )
            .await
            .map_err(|e| StoreError::Query(format!("list_enabled_guardrails: {e}")))?;

        let mut guardrails = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_guardrail(&row) {
                Ok(guardrail) => guardrails.push(guardrail),
                Err(e) => tracing::warn!("Skipping guardrail row: {e}"),
            }
        }
        Ok(guardrails)
    }

    async fn insert_tracked_thread(&self, thread: &TrackedThread) -> Result<(), StoreError> {
        // First tracking record wins; duplicate sends don't reset due_at.
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO tracked_threads \
                 (thread_id, recipient, direction, last_message_at, due_at, status, nudge_count) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    thread.thread_id.clone(),
                    thread.recipient.clone(),
                    direction_to_str(thread.direction),
                    thread.last_message_at.to_rfc3339(),
                    thread.due_at.to_rfc3339(),
                    thread_status_to_str(thread.status),
                    thread.nudge_count as i64,
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("insert_tracked_thread: {e}")))?;
        Ok(())
    }

    async fn get_tracked_thread(&self, thread_id: &str) -> Result<Option<TrackedThread>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT thread_id, recipient, direction, last_message_at, due_at, status, nudge_count \
                 FROM tracked_threads WHERE thread_id = ?1",
                params![thread_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_tracked_thread: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_thread(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_tracked_thread: {e}"))),
        }
    }

    async fn due_threads(&self, now: DateTime<Utc>) -> Result<Vec<TrackedThread>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT thread_id, recipient, direction, last_message_at, due_at, status, nudge_count \
                 FROM tracked_threads \
                 WHERE status = 'awaiting_reply' AND due_at <= ?1 ORDER BY due_at ASC",
                params![now.to_rfc3339()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("due_threads: {e}")))?;

        let mut threads = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_thread(&row) {
                Ok(thread) => threads.push(thread),
                Err(e) => tracing::warn!("Skipping thread row: {e}"),
            }
        }
        Ok(threads)
    }

    async fn update_tracked_thread(&self, thread: &TrackedThread) -> Result<(), StoreError> {
        // Resolved rows are terminal.
        let affected = self
            .conn()
            .execute(
                "UPDATE tracked_threads SET recipient = ?1, direction = ?2, last_message_at = ?3, \
                 due_at = ?4, status = ?5, nudge_count = ?6 \
                 WHERE thread_id = ?7 AND status != 'resolved'",
                params![
                    thread.recipient.clone(),
                    direction_to_str(thread.direction),
                    thread.last_message_at.to_rfc3339(),
                    thread.due_at.to_rfc3339(),
                    thread_status_to_str(thread.status),
                    thread.nudge_count as i64,
                    thread.thread_id.clone(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("update_tracked_thread: {e}")))?;

        if affected == 0 {
            return match self.get_tracked_thread(&thread.thread_id).await? {
                Some(_) => Err(StoreError::TerminalImmutable {
                    entity: "tracked_thread".into(),
                    id: thread.thread_id.clone(),
                }),
                None => Err(StoreError::NotFound {
                    entity: "tracked_thread".into(),
                    id: thread.thread_id.clone(),
                }),
            };
        }
        Ok(())
    }

    async fn get_checkpoint(&self, run_id: Uuid) -> Result<Option<BulkCheckpoint>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT run_id, owner, last_email_id, batches_done, emails_seen, updated_at \
                 FROM bulk_checkpoints WHERE run_id = ?1",
                params![run_id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_checkpoint: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_checkpoint(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_checkpoint: {e}"))),
        }
    }

    async fn save_checkpoint(&self, checkpoint: &BulkCheckpoint) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO bulk_checkpoints \
                 (run_id, owner, last_email_id, batches_done, emails_seen, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    checkpoint.run_id.to_string(),
                    checkpoint.owner.clone(),
                    opt_text_owned(checkpoint.last_email_id.clone()),
                    checkpoint.batches_done as i64,
                    checkpoint.emails_seen as i64,
                    checkpoint.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("save_checkpoint: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::model::{Action, Condition, Pattern};

    async fn backend() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    #[tokio::test]
    async fn rule_roundtrip() {
        let db = backend().await;
        let rule = Rule::new("u-1", "archive newsletters")
            .with_condition(Condition::From {
                pattern: Pattern::contains("newsletter"),
            })
            .with_action(Action::Archive)
            .with_priority(5);
        db.insert_rule(&rule).await.unwrap();

        let loaded = db.get_rule(rule.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "archive newsletters");
        assert_eq!(loaded.priority, 5);
        assert_eq!(loaded.conditions, rule.conditions);
        assert_eq!(loaded.actions, rule.actions);
    }

    #[tokio::test]
    async fn claim_is_first_writer_wins() {
        let db = backend().await;
        let rule_id = Uuid::new_v4();

        let first = db.claim_execution("m-1", rule_id, true).await.unwrap();
        assert!(matches!(first, ClaimOutcome::Claimed));

        let second = db.claim_execution("m-1", rule_id, true).await.unwrap();
        assert!(matches!(second, ClaimOutcome::Existing(_)));
    }

    #[tokio::test]
    async fn finalize_is_terminal_once() {
        let db = backend().await;
        let rule_id = Uuid::new_v4();
        db.claim_execution("m-1", rule_id, true).await.unwrap();

        let mut record = ExecutedRule::pending("m-1", rule_id, true);
        record.status = ExecutionStatus::Applied;
        record.action_items.push(ActionOutcome::success("archive"));
        db.finalize_execution(&record).await.unwrap();

        record.status = ExecutionStatus::Failed;
        assert!(matches!(
            db.finalize_execution(&record).await,
            Err(StoreError::TerminalImmutable { .. })
        ));

        let stored = db.get_execution("m-1", rule_id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Applied);
        assert_eq!(stored.action_items.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_thread_insert_keeps_original() {
        let db = backend().await;
        let t1 = TrackedThread::awaiting(
            "t-1",
            "bob@x.com",
            ThreadDirection::Sent,
            std::time::Duration::from_secs(3600),
        );
        db.insert_tracked_thread(&t1).await.unwrap();

        let mut t2 = t1.clone();
        t2.recipient = "other@x.com".into();
        db.insert_tracked_thread(&t2).await.unwrap();

        let stored = db.get_tracked_thread("t-1").await.unwrap().unwrap();
        assert_eq!(stored.recipient, "bob@x.com");
    }

    #[tokio::test]
    async fn due_threads_and_resolution() {
        let db = backend().await;
        let mut thread = TrackedThread::awaiting(
            "t-1",
            "bob@x.com",
            ThreadDirection::Sent,
            std::time::Duration::from_secs(60),
        );
        db.insert_tracked_thread(&thread).await.unwrap();

        let later = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(db.due_threads(later).await.unwrap().len(), 1);

        assert!(thread.resolve_if_reply_from("bob@x.com"));
        db.update_tracked_thread(&thread).await.unwrap();
        assert!(db.due_threads(later).await.unwrap().is_empty());

        // Terminal
        thread.nudge_count = 5;
        assert!(matches!(
            db.update_tracked_thread(&thread).await,
            Err(StoreError::TerminalImmutable { .. })
        ));
    }

    #[tokio::test]
    async fn checkpoint_roundtrip() {
        let db = backend().await;
        let run_id = Uuid::new_v4();
        assert!(db.get_checkpoint(run_id).await.unwrap().is_none());

        let mut cp = BulkCheckpoint::start(run_id, "u-1");
        cp.last_email_id = Some("m-42".into());
        cp.batches_done = 3;
        cp.emails_seen = 75;
        db.save_checkpoint(&cp).await.unwrap();

        let loaded = db.get_checkpoint(run_id).await.unwrap().unwrap();
        assert_eq!(loaded.last_email_id.as_deref(), Some("m-42"));
        assert_eq!(loaded.batches_done, 3);
        assert_eq!(loaded.emails_seen, 75);
    }

    #[tokio::test]
    async fn selection_cache_roundtrip() {
        let db = backend().await;
        let decision = SelectionDecision {
            email_id: "m-1".into(),
            sender: "alice@x.com".into(),
            rule_id: None,
            rule_name: None,
            decided_at: Utc::now(),
        };
        db.put_selection(&decision).await.unwrap();

        // A no-match decision is a cache hit, not an absence
        let cached = db.get_selection("m-1").await.unwrap().unwrap();
        assert!(cached.rule_id.is_none());

        let history = db.selection_history("alice@x.com", 5).await.unwrap();
        assert_eq!(history.len(), 1);
    }
}
