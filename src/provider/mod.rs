//! External capabilities consumed at the interface level.
//!
//! The engine never talks to Gmail/IMAP/HTTP directly; it goes through
//! these traits. Adapters are pure I/O — all decision logic stays in the
//! pipeline.

pub mod spool;

use async_trait::async_trait;
use serde_json::Value;

use crate::email::EmailMessage;
use crate::error::ProviderError;

pub use spool::SpoolProvider;

/// Email provider capability: list/get plus the side-effecting operations
/// the executor drives.
#[async_trait]
pub trait EmailProvider: Send + Sync {
    /// Page through historical emails, oldest first. `after` is the last
    /// email id of the previous page (the bulk runner's checkpoint).
    async fn list_emails(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<EmailMessage>, ProviderError>;

    async fn get_email(&self, email_id: &str) -> Result<EmailMessage, ProviderError>;

    async fn apply_label(&self, email_id: &str, label: &str) -> Result<(), ProviderError>;

    async fn archive(&self, email_id: &str) -> Result<(), ProviderError>;

    /// Create a draft reply on the email's thread without sending.
    async fn create_draft(&self, email: &EmailMessage, content: &str)
        -> Result<(), ProviderError>;

    /// Send a reply on the email's thread.
    async fn send(&self, email: &EmailMessage, content: &str) -> Result<(), ProviderError>;

    /// Forward the email to another address.
    async fn forward(&self, email: &EmailMessage, to: &str) -> Result<(), ProviderError>;

    async fn mark_spam(&self, email_id: &str) -> Result<(), ProviderError>;

    async fn mark_read(&self, email_id: &str) -> Result<(), ProviderError>;
}

/// Category-membership lookup for `Category` conditions.
#[async_trait]
pub trait Categorizer: Send + Sync {
    /// Category names the email belongs to.
    async fn categories(&self, email: &EmailMessage) -> Result<Vec<String>, ProviderError>;
}

/// Arbitrary authenticated HTTP POST for `Webhook` actions.
#[async_trait]
pub trait WebhookCaller: Send + Sync {
    async fn post(&self, url: &str, payload: &Value) -> Result<(), ProviderError>;
}

/// reqwest-backed webhook caller with a bearer token.
pub struct HttpWebhookCaller {
    client: reqwest::Client,
    auth_token: Option<String>,
}

impl HttpWebhookCaller {
    pub fn new(auth_token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            auth_token,
        }
    }
}

#[async_trait]
impl WebhookCaller for HttpWebhookCaller {
    async fn post(&self, url: &str, payload: &Value) -> Result<(), ProviderError> {
        let mut request = self.client.post(url).json(payload);
        if let Some(ref token) = self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                ProviderError::Transient(e.to_string())
            } else {
                ProviderError::Fatal {
                    op: "webhook".into(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ProviderError::RateLimited { retry_after: None });
        }
        if status.is_server_error() {
            return Err(ProviderError::Transient(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(ProviderError::Fatal {
                op: "webhook".into(),
                reason: format!("HTTP {status}"),
            });
        }
        Ok(())
    }
}

/// Keyword-based categorizer for local/dev deployments.
///
/// Parsed from a config string like
/// `"Newsletter:unsubscribe,digest;Receipts:receipt,invoice"`. The email
/// belongs to a category when any keyword appears in its subject or body,
/// case-insensitively.
pub struct KeywordCategorizer {
    categories: Vec<(String, Vec<String>)>,
}

impl KeywordCategorizer {
    pub fn from_spec(config: &str) -> Self {
        let categories = config
            .split(';')
            .filter_map(|entry| {
                let (name, keywords) = entry.split_once(':')?;
                let keywords: Vec<String> = keywords
                    .split(',')
                    .map(|k| k.trim().to_lowercase())
                    .filter(|k| !k.is_empty())
                    .collect();
                (!keywords.is_empty()).then(|| (name.trim().to_string(), keywords))
            })
            .collect();
        Self { categories }
    }

    pub fn empty() -> Self {
        Self {
            categories: Vec::new(),
        }
    }
}

#[async_trait]
impl Categorizer for KeywordCategorizer {
    async fn categories(&self, email: &EmailMessage) -> Result<Vec<String>, ProviderError> {
        let haystack = format!("{}\n{}", email.subject, email.body).to_lowercase();
        Ok(self
            .categories
            .iter()
            .filter(|(_, keywords)| keywords.iter().any(|k| haystack.contains(k.as_str())))
            .map(|(name, _)| name.clone())
            .collect())
    }
}
