use crdata_client::ApiError;
use crdata_core::scripting::executor::ScriptError;
use crdata_core::types::JobId;

use crate::store::StoreError;

/// Errors from one job lifecycle on the processing node.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// Claiming the job or fetching its source/parameters failed.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// The completion report to the server failed.
    #[error("Status report failed: {0}")]
    Report(ApiError),

    /// The interpreter could not run the job to completion.
    #[error("Script execution failed: {0}")]
    Script(#[from] ScriptError),

    /// Uploading results, logs, or data failed.
    #[error("Result storage failed: {0}")]
    Store(#[from] StoreError),

    /// A lifecycle step ran before the step it depends on.
    #[error("Job {0} has no source code to run")]
    SourceMissing(JobId),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl NodeError {
    /// Whether the error came from the final completion report rather than
    /// from the job's own work.
    pub fn is_report_failure(&self) -> bool {
        matches!(self, NodeError::Report(_))
    }
}
