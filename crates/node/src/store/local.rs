//! Results directory on the local filesystem.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use crdata_core::types::JobId;

use super::{validate_relative_path, ResultStore, StorageBackendType, StoreError};

/// Writes job files to `<root>/<job_id>/<relative_path>`.
#[derive(Debug, Clone)]
pub struct LocalResultStore {
    root: PathBuf,
}

impl LocalResultStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding everything stored for `job_id`.
    pub fn job_dir(&self, job_id: JobId) -> PathBuf {
        self.root.join(job_id.to_string())
    }
}

#[async_trait]
impl ResultStore for LocalResultStore {
    fn backend(&self) -> StorageBackendType {
        StorageBackendType::Local
    }

    async fn put(
        &self,
        job_id: JobId,
        relative_path: &str,
        contents: Vec<u8>,
    ) -> Result<String, StoreError> {
        validate_relative_path(relative_path)?;

        let target = self.job_dir(job_id).join(relative_path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, contents).await?;

        Ok(target.display().to_string())
    }
}
