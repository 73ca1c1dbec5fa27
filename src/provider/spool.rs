//! File-spool `EmailProvider` for local and dev deployments.
//!
//! The mailbox is a directory tree:
//!
//! ```text
//! spool/
//!   inbox/    one JSON file per email ("<id>.json", EmailMessage shape)
//!   archive/  archived emails
//!   spam/     emails marked as spam
//!   drafts/   generated draft replies (plain text)
//!   outbox/   sends and forwards, picked up by an external transport
//! ```
//!
//! Side effects are file moves and writes, so a run's effects can be
//! inspected with `ls`. Real mailbox adapters implement the same trait
//! against their provider's API.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::email::EmailMessage;
use crate::error::ProviderError;
use crate::provider::EmailProvider;

pub struct SpoolProvider {
    root: PathBuf,
}

impl SpoolProvider {
    /// Open a spool rooted at `root`, creating the directory tree.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, ProviderError> {
        let root = root.into();
        for dir in ["inbox", "archive", "spam", "drafts", "outbox"] {
            std::fs::create_dir_all(root.join(dir)).map_err(|e| ProviderError::Fatal {
                op: "open_spool".into(),
                reason: format!("{}: {e}", root.join(dir).display()),
            })?;
        }
        Ok(Self { root })
    }

    fn inbox(&self) -> PathBuf {
        self.root.join("inbox")
    }

    fn email_path(&self, dir: &str, email_id: &str) -> PathBuf {
        self.root.join(dir).join(format!("{email_id}.json"))
    }

    async fn read_email(path: &Path) -> Result<EmailMessage, ProviderError> {
        let bytes = tokio::fs::read(path).await.map_err(io_err("read_email"))?;
        serde_json::from_slice(&bytes).map_err(|e| ProviderError::Fatal {
            op: "read_email".into(),
            reason: format!("{}: {e}", path.display()),
        })
    }

    /// Locate an email by id across inbox/archive/spam.
    async fn find(&self, email_id: &str) -> Result<(PathBuf, EmailMessage), ProviderError> {
        for dir in ["inbox", "archive", "spam"] {
            let path = self.email_path(dir, email_id);
            if tokio::fs::try_exists(&path)
                .await
                .map_err(io_err("find_email"))?
            {
                let email = Self::read_email(&path).await?;
                return Ok((path, email));
            }
        }
        Err(ProviderError::NotFound(email_id.to_string()))
    }

    async fn move_to(&self, email_id: &str, dir: &str) -> Result<(), ProviderError> {
        let (path, _) = self.find(email_id).await?;
        let dest = self.email_path(dir, email_id);
        tokio::fs::rename(&path, &dest)
            .await
            .map_err(io_err("move_email"))?;
        debug!(email_id, dir, "Spool email moved");
        Ok(())
    }

    async fn write_outbox(
        &self,
        kind: &str,
        email: &EmailMessage,
        header: &str,
        content: &str,
    ) -> Result<(), ProviderError> {
        let name = format!("{kind}-{}-{}.txt", email.thread_id, Utc::now().timestamp_millis());
        let path = self.root.join("outbox").join(name);
        let body = format!("{header}\nThread: {}\n\n{content}\n", email.thread_id);
        tokio::fs::write(&path, body)
            .await
            .map_err(io_err("write_outbox"))?;
        Ok(())
    }

    /// Drop an email file into the inbox (test/dev ingestion helper).
    pub async fn deliver(&self, email: &EmailMessage) -> Result<(), ProviderError> {
        let path = self.email_path("inbox", &email.id);
        let json = serde_json::to_vec_pretty(email).map_err(|e| ProviderError::Fatal {
            op: "deliver".into(),
            reason: e.to_string(),
        })?;
        tokio::fs::write(&path, json)
            .await
            .map_err(io_err("deliver"))?;
        Ok(())
    }
}

fn io_err(op: &'static str) -> impl Fn(std::io::Error) -> ProviderError {
    move |e| ProviderError::Fatal {
        op: op.into(),
        reason: e.to_string(),
    }
}

#[async_trait]
impl EmailProvider for SpoolProvider {
    async fn list_emails(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<EmailMessage>, ProviderError> {
        let mut ids: Vec<String> = Vec::new();
        let mut entries = tokio::fs::read_dir(self.inbox())
            .await
            .map_err(io_err("list_emails"))?;
        while let Some(entry) = entries.next_entry().await.map_err(io_err("list_emails"))? {
            let name = entry.file_name();
            if let Some(id) = name.to_string_lossy().strip_suffix(".json") {
                ids.push(id.to_string());
            }
        }
        // Filename order stands in for delivery order.
        ids.sort();

        let mut emails = Vec::new();
        for id in ids
            .into_iter()
            .filter(|id| after.is_none_or(|a| id.as_str() > a))
            .take(limit)
        {
            emails.push(Self::read_email(&self.email_path("inbox", &id)).await?);
        }
        Ok(emails)
    }

    async fn get_email(&self, email_id: &str) -> Result<EmailMessage, ProviderError> {
        let (_, email) = self.find(email_id).await?;
        Ok(email)
    }

    async fn apply_label(&self, email_id: &str, label: &str) -> Result<(), ProviderError> {
        // Labels live in a sidecar log next to the mailbox.
        let (_, _) = self.find(email_id).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join("labels.log"))
            .await
            .map_err(io_err("apply_label"))?;
        file.write_all(format!("{email_id}\t{label}\n").as_bytes())
            .await
            .map_err(io_err("apply_label"))?;
        Ok(())
    }

    async fn archive(&self, email_id: &str) -> Result<(), ProviderError> {
        self.move_to(email_id, "archive").await
    }

    async fn create_draft(
        &self,
        email: &EmailMessage,
        content: &str,
    ) -> Result<(), ProviderError> {
        let name = format!("{}-{}.txt", email.thread_id, Utc::now().timestamp_millis());
        let path = self.root.join("drafts").join(name);
        tokio::fs::write(&path, content)
            .await
            .map_err(io_err("create_draft"))?;
        Ok(())
    }

    async fn send(&self, email: &EmailMessage, content: &str) -> Result<(), ProviderError> {
        self.write_outbox("reply", email, &format!("To: {}", email.from), content)
            .await
    }

    async fn forward(&self, email: &EmailMessage, to: &str) -> Result<(), ProviderError> {
        self.write_outbox("forward", email, &format!("To: {to}"), &email.body)
            .await
    }

    async fn mark_spam(&self, email_id: &str) -> Result<(), ProviderError> {
        self.move_to(email_id, "spam").await
    }

    async fn mark_read(&self, email_id: &str) -> Result<(), ProviderError> {
        // The spool has no unread state; existence in inbox is "unread
        // enough" for local use.
        let _ = self.find(email_id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn email(id: &str) -> EmailMessage {
        EmailMessage {
            id: id.into(),
            thread_id: format!("t-{id}"),
            from: "alice@x.com".into(),
            from_name: None,
            to: vec!["me@corp.com".into()],
            reply_to: None,
            subject: "hello".into(),
            body: "world".into(),
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn list_pages_in_id_order() {
        let dir = tempfile::tempdir().unwrap();
        let spool = SpoolProvider::open(dir.path()).unwrap();
        for id in ["m-3", "m-1", "m-2"] {
            spool.deliver(&email(id)).await.unwrap();
        }

        let first = spool.list_emails(None, 2).await.unwrap();
        assert_eq!(
            first.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(),
            vec!["m-1", "m-2"]
        );

        let next = spool.list_emails(Some("m-2"), 2).await.unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].id, "m-3");
    }

    #[tokio::test]
    async fn archive_moves_out_of_inbox() {
        let dir = tempfile::tempdir().unwrap();
        let spool = SpoolProvider::open(dir.path()).unwrap();
        spool.deliver(&email("m-1")).await.unwrap();

        spool.archive("m-1").await.unwrap();
        assert!(spool.list_emails(None, 10).await.unwrap().is_empty());
        // Still fetchable by id
        assert_eq!(spool.get_email("m-1").await.unwrap().id, "m-1");
    }

    #[tokio::test]
    async fn missing_email_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let spool = SpoolProvider::open(dir.path()).unwrap();
        assert!(matches!(
            spool.archive("nope").await,
            Err(ProviderError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn send_lands_in_outbox() {
        let dir = tempfile::tempdir().unwrap();
        let spool = SpoolProvider::open(dir.path()).unwrap();
        let e = email("m-1");
        spool.deliver(&e).await.unwrap();
        spool.send(&e, "thanks!").await.unwrap();

        let mut outbox = std::fs::read_dir(dir.path().join("outbox"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect::<Vec<_>>();
        outbox.sort();
        assert_eq!(outbox.len(), 1);
        let content = std::fs::read_to_string(&outbox[0]).unwrap();
        assert!(content.contains("To: alice@x.com"));
        assert!(content.contains("thanks!"));
    }
}
