//! Job completion reporting.
//!
//! [`StatusReporter`] marks a job done on the server with
//! `PUT /jobs/{id}/done.xml?success=true|false`. It owns its own
//! [`reqwest::Client`] so a stuck polling connection never blocks a report.

use std::time::Duration;

use crdata_core::types::JobId;

use crate::error::ApiError;
use crate::normalize_base_url;

/// HTTP request timeout for a single report.
pub const REPORT_TIMEOUT: Duration = Duration::from_secs(30);

/// Reports job outcomes to the server node.
#[derive(Debug, Clone)]
pub struct StatusReporter {
    client: reqwest::Client,
    base_url: String,
}

impl StatusReporter {
    /// Create a reporter with its own HTTP client and [`REPORT_TIMEOUT`].
    pub fn new(server: &str) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(REPORT_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: normalize_base_url(server),
        })
    }

    /// Mark `job_id` done, successful or not. A single attempt; no retry.
    pub async fn report(&self, job_id: JobId, success: bool) -> Result<(), ApiError> {
        let flag = if success { "true" } else { "false" };

        let response = self
            .client
            .put(format!("{}/jobs/{}/done.xml", self.base_url, job_id))
            .query(&[("success", flag)])
            .body("")
            .send()
            .await?;

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

        Ok(())
    }
}
