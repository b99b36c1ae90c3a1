pub mod dto;
pub mod session;

use std::borrow::Cow;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use tracing::debug;

use crate::error::SyncError;

pub use dto::{PullResponse, PushRequest, PushResponse, TaskRecord};
pub use session::{CursorStore, SyncPhase, SyncSession};

/// Remote half of the protocol. Each call is one request and either fully
/// succeeds or fails; retry and timeout policy belong to the implementation.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn push(&self, records: &[TaskRecord]) -> Result<PushResponse, SyncError>;
    async fn pull(&self, user_id: &str, since: &str) -> Result<PullResponse, SyncError>;
}

pub struct HttpSyncTransport {
    client: Client,
    base_url: String,
}

impl HttpSyncTransport {
    pub fn new(base_url: &str, timeout: Option<Duration>) -> Result<Self, SyncError> {
        let base_url = normalize_base_url(base_url)?;
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build()?;
        Ok(Self { client, base_url })
    }

    async fn read_body<T>(response: reqwest::Response) -> Result<T, SyncError>
    where
        T: serde::de::DeserializeOwned,
    {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(SyncError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(serde_json::from_str::<T>(&body)?)
    }
}

#[async_trait]
impl SyncTransport for HttpSyncTransport {
    async fn push(&self, records: &[TaskRecord]) -> Result<PushResponse, SyncError> {
        let url = format!("{}/sync/push", self.base_url);
        debug!(records = records.len(), %url, "sending push");

        let response = self
            .client
            .post(&url)
            .json(&PushRequest {
                records: Cow::Borrowed(records),
            })
            .send()
            .await?;

        Self::read_body(response).await
    }

    async fn pull(&self, user_id: &str, since: &str) -> Result<PullResponse, SyncError> {
        let url = Url::parse_with_params(
            &format!("{}/sync/pull", self.base_url),
            &[("userID", user_id), ("last_sync", since)],
        )
        .map_err(|e| SyncError::InvalidConfig(format!("bad pull URL: {e}")))?;
        debug!(%user_id, %since, %url, "sending pull");

        let response = self.client.get(url).send().await?;

        Self::read_body(response).await
    }
}

/// Stands in when no sync server is configured: accepts every push and
/// never reports remote changes.
pub struct NoopSyncTransport;

#[async_trait]
impl SyncTransport for NoopSyncTransport {
    async fn push(&self, _records: &[TaskRecord]) -> Result<PushResponse, SyncError> {
        Ok(PushResponse {
            status: "ok".to_string(),
        })
    }

    async fn pull(&self, _user_id: &str, since: &str) -> Result<PullResponse, SyncError> {
        Ok(PullResponse {
            records: Vec::new(),
            server_time: since.to_string(),
        })
    }
}

fn normalize_base_url(raw: &str) -> Result<String, SyncError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SyncError::InvalidConfig(
            "sync base URL must not be empty".to_string(),
        ));
    }
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(SyncError::InvalidConfig(format!(
            "sync base URL must include http:// or https://, got {trimmed}"
        )));
    }
    Ok(trimmed.trim_end_matches('/').to_string())
}
