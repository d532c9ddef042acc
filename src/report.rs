//! Reporting — check state updates and raw result uploads.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ReportConfig;
use crate::error::ReportError;
use crate::retry::Retryer;

/// Lifecycle status of a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckStatus {
    Running,
    Finished,
    Failed,
    Timeout,
    Aborted,
    Inconclusive,
}

impl CheckStatus {
    /// Every status except `RUNNING` ends the check.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// State of a check as sent to the state endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckState {
    pub check_id: String,
    pub status: CheckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f32>,
    /// Link to the uploaded raw output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

impl CheckState {
    pub fn new(check_id: impl Into<String>, status: CheckStatus) -> Self {
        Self {
            check_id: check_id.into(),
            status,
            progress: None,
            raw: None,
        }
    }

    pub fn with_raw(mut self, raw: Option<String>) -> Self {
        self.raw = raw;
        self
    }
}

/// Receives check state changes.
#[async_trait]
pub trait StateUpdater: Send + Sync {
    async fn update_state(&self, state: &CheckState) -> Result<(), ReportError>;
}

/// Stores the raw output of a check and returns a link to it.
#[async_trait]
pub trait ResultsUploader: Send + Sync {
    async fn upload_raw(
        &self,
        check_id: &str,
        start_time: DateTime<Utc>,
        raw: &[u8],
    ) -> Result<String, ReportError>;
}

#[derive(Serialize)]
struct RawUpload<'a> {
    check_id: &'a str,
    scan_start_time: DateTime<Utc>,
    raw: String,
}

#[derive(Deserialize)]
struct RawLink {
    url: String,
}

/// HTTP client for the state and results services.
pub struct HttpReporter {
    client: reqwest::Client,
    state_endpoint: String,
    raw_endpoint: String,
    retryer: Retryer,
}

impl HttpReporter {
    pub fn new(config: &ReportConfig, retryer: Retryer) -> Result<Self, ReportError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|source| ReportError::Request {
                endpoint: config.state_endpoint.clone(),
                source,
            })?;
        Ok(Self {
            client,
            state_endpoint: config.state_endpoint.clone(),
            raw_endpoint: format!("{}/raw", config.results_endpoint.trim_end_matches('/')),
            retryer,
        })
    }

    async fn post<B: Serialize + Sync>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<reqwest::Response, ReportError> {
        let resp = self
            .client
            .post(endpoint)
            .json(body)
            .send()
            .await
            .map_err(|source| ReportError::Request {
                endpoint: endpoint.to_string(),
                source,
            })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ReportError::UnexpectedStatus {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(resp)
    }
}

#[async_trait]
impl StateUpdater for HttpReporter {
    async fn update_state(&self, state: &CheckState) -> Result<(), ReportError> {
        self.retryer
            .with_retries("UpdateCheckState", || self.post(&self.state_endpoint, state))
            .await?;
        debug!(check_id = %state.check_id, status = ?state.status, "Check state reported");
        Ok(())
    }
}

#[async_trait]
impl ResultsUploader for HttpReporter {
    async fn upload_raw(
        &self,
        check_id: &str,
        start_time: DateTime<Utc>,
        raw: &[u8],
    ) -> Result<String, ReportError> {
        let body = RawUpload {
            check_id,
            scan_start_time: start_time,
            raw: String::from_utf8_lossy(raw).into_owned(),
        };
        self.retryer
            .with_retries("UploadRawResults", || async {
                let resp = self.post(&self.raw_endpoint, &body).await?;
                let link: RawLink = resp.json().await.map_err(|e| ReportError::InvalidResponse {
                    endpoint: self.raw_endpoint.clone(),
                    reason: e.to_string(),
                })?;
                Ok::<_, ReportError>(link.url)
            })
            .await
    }
}
