//! Result storage backends.
//!
//! A [`ResultStore`] receives the files a job produces (logs, the result
//! summary, data files, the manifest) keyed by job id and a relative path.
//! [`local::LocalResultStore`] writes them under the results directory;
//! [`s3::S3ResultStore`] uploads them to a bucket.

pub mod local;
pub mod s3;

use std::path::{Component, Path};
use std::sync::Arc;

use async_trait::async_trait;
use crdata_core::types::JobId;

use crate::config::{NodeConfig, ResultsBackend};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Storage backend type selectable from the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum StorageBackendType {
    Local,
    S3,
}

impl StorageBackendType {
    /// Where results end up, for log lines.
    pub fn label(self) -> &'static str {
        match self {
            Self::Local => "local results directory",
            Self::S3 => "S3 bucket",
        }
    }

    /// Value accepted by `--results-backend`.
    pub fn name(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::S3 => "s3",
        }
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid result path '{0}'")]
    InvalidPath(String),

    #[error("S3 upload failed: {0}")]
    S3(String),
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Destination for a job's results, logs, and data files.
#[async_trait]
pub trait ResultStore: Send + Sync {
    fn backend(&self) -> StorageBackendType;

    /// Store `contents` at `relative_path` under the job's prefix and return
    /// the location it was written to.
    async fn put(
        &self,
        job_id: JobId,
        relative_path: &str,
        contents: Vec<u8>,
    ) -> Result<String, StoreError>;
}

/// Build the store selected by the configuration.
pub async fn from_config(config: &NodeConfig) -> Arc<dyn ResultStore> {
    match &config.results {
        ResultsBackend::Local { dir } => Arc::new(local::LocalResultStore::new(dir.clone())),
        ResultsBackend::S3 { bucket, prefix } => {
            Arc::new(s3::S3ResultStore::from_env(bucket.clone(), prefix.clone()).await)
        }
    }
}

/// Ensure `relative_path` stays inside the job's prefix: non-empty,
/// relative, and free of `..` components.
pub fn validate_relative_path(relative_path: &str) -> Result<(), StoreError> {
    let path = Path::new(relative_path);
    let escapes = path.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });

    if relative_path.trim().is_empty() || escapes {
        return Err(StoreError::InvalidPath(relative_path.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_are_accepted() {
        assert!(validate_relative_path("result.json").is_ok());
        assert!(validate_relative_path("logs/stdout.log").is_ok());
        assert!(validate_relative_path("data/plots/fit.png").is_ok());
    }

    #[test]
    fn escaping_paths_are_rejected() {
        assert!(validate_relative_path("").is_err());
        assert!(validate_relative_path("/etc/passwd").is_err());
        assert!(validate_relative_path("../other_job/result.json").is_err());
        assert!(validate_relative_path("data/../../x").is_err());
    }

    #[test]
    fn backend_names_and_labels() {
        assert_eq!(StorageBackendType::Local.name(), "local");
        assert_eq!(StorageBackendType::S3.name(), "s3");
        assert_eq!(StorageBackendType::Local.label(), "local results directory");
        assert_eq!(StorageBackendType::S3.label(), "S3 bucket");
    }
}
