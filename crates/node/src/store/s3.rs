//! S3 result store.
//!
//! Uploads each job file as one object at
//! `<prefix>/<job_id>/<relative_path>` using the default AWS credential
//! chain and region.

use async_trait::async_trait;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use crdata_core::types::JobId;

use super::{validate_relative_path, ResultStore, StorageBackendType, StoreError};

/// Uploads job files to an S3 (or S3-compatible) bucket.
#[derive(Debug, Clone)]
pub struct S3ResultStore {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
}

impl S3ResultStore {
    pub fn new(client: aws_sdk_s3::Client, bucket: String, prefix: String) -> Self {
        Self {
            client,
            bucket,
            prefix,
        }
    }

    /// Build a client from the environment (`AWS_REGION`, credentials
    /// chain, `AWS_ENDPOINT_URL` for compatible stores).
    pub async fn from_env(bucket: String, prefix: String) -> Self {
        let config = aws_config::load_from_env().await;
        Self::new(aws_sdk_s3::Client::new(&config), bucket, prefix)
    }
}

/// Object key for a job file. Empty prefixes and stray slashes collapse.
pub fn object_key(prefix: &str, job_id: JobId, relative_path: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{job_id}/{relative_path}")
    } else {
        format!("{prefix}/{job_id}/{relative_path}")
    }
}

#[async_trait]
impl ResultStore for S3ResultStore {
    fn backend(&self) -> StorageBackendType {
        StorageBackendType::S3
    }

    async fn put(
        &self,
        job_id: JobId,
        relative_path: &str,
        contents: Vec<u8>,
    ) -> Result<String, StoreError> {
        validate_relative_path(relative_path)?;

        let key = object_key(&self.prefix, job_id, relative_path);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(contents))
            .send()
            .await
            .map_err(|e| StoreError::S3(DisplayErrorContext(&e).to_string()))?;

        Ok(format!("s3://{}/{}", self.bucket, key))
    }
}
