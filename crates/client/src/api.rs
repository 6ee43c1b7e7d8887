//! REST client for the server node's job endpoints.
//!
//! Wraps job claiming and the per-job source/parameter downloads using
//! [`reqwest`].

use crdata_core::job::{self, JobDescriptor, JobParam};
use crdata_core::types::JobId;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;

use crate::error::ApiError;
use crate::normalize_base_url;

/// HTTP client for one server node.
#[derive(Debug, Clone)]
pub struct ServerApi {
    client: reqwest::Client,
    base_url: String,
}

impl ServerApi {
    /// Create a client for `server` (`host:port` or a full URL).
    pub fn new(server: &str) -> Self {
        Self::with_client(reqwest::Client::new(), server)
    }

    /// Create a client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, server: &str) -> Self {
        Self {
            client,
            base_url: normalize_base_url(server),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Claim the next queued job.
    ///
    /// Sends `PUT /jobs_queues/run_next_job` with an empty XML body.
    /// Returns `Ok(None)` when the server answers `404`, which is how it
    /// signals an empty queue.
    pub async fn claim_next_job(&self) -> Result<Option<JobDescriptor>, ApiError> {
        let response = self
            .client
            .put(format!("{}/jobs_queues/run_next_job", self.base_url))
            .header(CONTENT_TYPE, "text/xml")
            .body("")
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            tracing::debug!("No queued job");
            return Ok(None);
        }

        let body = Self::read_text(response).await?;
        let descriptor = job::parse_job(&body)?;
        tracing::debug!(job_id = descriptor.id, "Claimed job");
        Ok(Some(descriptor))
    }

    /// Download the job's script source (`GET /jobs/{id}/source_code`).
    pub async fn fetch_source_code(&self, job_id: JobId) -> Result<String, ApiError> {
        let response = self
            .client
            .get(format!("{}/jobs/{}/source_code", self.base_url, job_id))
            .send()
            .await?;

        Self::read_text(response).await
    }

    /// Download the job's parameters (`GET /jobs/{id}/params.xml`).
    pub async fn fetch_params(&self, job_id: JobId) -> Result<Vec<JobParam>, ApiError> {
        let response = self
            .client
            .get(format!("{}/jobs/{}/params.xml", self.base_url, job_id))
            .send()
            .await?;

        let body = Self::read_text(response).await?;
        Ok(job::parse_params(&body)?)
    }

    // ---- private helpers ----

    /// Return the body text of a successful response, or an
    /// [`ApiError::Status`] carrying the status and body on failure.
    async fn read_text(response: reqwest::Response) -> Result<String, ApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ApiError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.text().await?)
    }
}
