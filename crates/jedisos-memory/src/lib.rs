//! Thin adapter for retain/recall/reflect against the external memory
//! service. The service is authoritative — this client keeps no local cache
//! and tolerates outage by degrading (empty context on recall, a logged
//! warning on retain).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("memory service request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("memory service returned an error status: {0}")]
    Status(reqwest::StatusCode),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub content: String,
}

/// The bundle returned by recall/reflect: whatever context the memory
/// service judged relevant to the query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryContext {
    #[serde(default)]
    pub records: Vec<MemoryRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRecord {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetainResponse {
    pub id: String,
}

#[derive(Serialize)]
struct RetainRequest<'a> {
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a str>,
}

#[derive(Serialize)]
struct ReflectRequest<'a> {
    query: &'a str,
}

/// Derives the memory service's per-user namespace from a channel tag and
/// user id, unless the caller supplies its own bank id.
pub fn bank_id_for(channel: &str, user_id: &str) -> String {
    format!("{channel}-{user_id}")
}

pub struct MemoryClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl MemoryClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Posts a memory item. A failure here is non-fatal to the caller: the
    /// agent logs it as a warning and continues.
    pub async fn retain(
        &self,
        bank_id: &str,
        content: &str,
        context: Option<&str>,
    ) -> Result<RetainResponse, MemoryError> {
        let url = format!("{}/v1/default/banks/{bank_id}/memories", self.base_url);
        let body = RetainRequest { content, context };
        let response = self
            .http
            .post(url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(MemoryError::Status(response.status()));
        }
        Ok(response.json().await?)
    }

    /// Convenience wrapper: retains, logging (not propagating) a failure.
    pub async fn retain_best_effort(&self, bank_id: &str, content: &str, context: Option<&str>) {
        if let Err(err) = self.retain(bank_id, content, context).await {
            warn!(%bank_id, error = %err, "memory retain failed; continuing");
        }
    }

    /// Requests a memory context bundle for a query. Per the Open Question
    /// in the source material, recall and reflect are the same underlying
    /// operation (query → context); both call the `/reflect` endpoint.
    pub async fn recall(&self, bank_id: &str, query: &str) -> Result<MemoryContext, MemoryError> {
        self.reflect(bank_id, query).await
    }

    /// Requests consolidation, or (uniformly with recall) a context bundle
    /// for an arbitrary query/instruction string.
    pub async fn reflect(&self, bank_id: &str, query: &str) -> Result<MemoryContext, MemoryError> {
        let url = format!("{}/v1/default/banks/{bank_id}/reflect", self.base_url);
        let body = ReflectRequest { query };
        let response = self
            .http
            .post(url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(MemoryError::Status(response.status()));
        }
        Ok(response.json().await?)
    }

    /// Convenience wrapper: recalls, degrading to an empty context on
    /// failure rather than propagating the error.
    pub async fn recall_or_empty(&self, bank_id: &str, query: &str) -> MemoryContext {
        match self.recall(bank_id, query).await {
            Ok(ctx) => ctx,
            Err(err) => {
                warn!(%bank_id, error = %err, "memory recall failed; continuing with empty context");
                MemoryContext::default()
            }
        }
    }

    pub async fn entities(&self, bank_id: &str) -> Result<Vec<EntityRecord>, MemoryError> {
        let url = format!("{}/v1/default/banks/{bank_id}/entities", self.base_url);
        let response = self.http.get(url).timeout(self.timeout).send().await?;
        if !response.status().is_success() {
            return Err(MemoryError::Status(response.status()));
        }
        Ok(response.json().await?)
    }

    pub async fn health(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        matches!(
            self.http.get(url).timeout(self.timeout).send().await,
            Ok(resp) if resp.status().is_success()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bank_id_derivation() {
        assert_eq!(bank_id_for("telegram", "u42"), "telegram-u42");
    }

    #[tokio::test]
    async fn recall_or_empty_degrades_on_unreachable_host() {
        // Port 1 is reserved and nothing listens there in test environments.
        let client = MemoryClient::new("http://127.0.0.1:1").with_timeout(Duration::from_millis(200));
        let ctx = client.recall_or_empty("telegram-u1", "hello").await;
        assert!(ctx.records.is_empty());
    }

    #[tokio::test]
    async fn retain_best_effort_does_not_panic_on_unreachable_host() {
        let client = MemoryClient::new("http://127.0.0.1:1").with_timeout(Duration::from_millis(200));
        client.retain_best_effort("telegram-u1", "hello", None).await;
    }

    #[tokio::test]
    async fn health_false_on_unreachable_host() {
        let client = MemoryClient::new("http://127.0.0.1:1").with_timeout(Duration::from_millis(200));
        assert!(!client.health().await);
    }
}
