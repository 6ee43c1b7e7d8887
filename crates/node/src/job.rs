//! One claimed job and its lifecycle on this node.
//!
//! A [`Job`] is created per poll cycle and dropped after its status is
//! reported, which also removes its temporary working directory. The steps
//! run in this order:
//!
//! 1. [`Job::fetch_source_code`] saves the script into the working directory.
//! 2. [`Job::fetch_params`] downloads the parameters and saves `params.json`.
//! 3. [`Job::run`] hands the script to the interpreter.
//! 4. [`Job::store_results_and_logs`] uploads stdout, stderr and `result.json`.
//! 5. [`Job::store_data`] uploads whatever files the script left behind,
//!    plus a `manifest.json` with their sizes and SHA-256 digests.

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crdata_client::ServerApi;
use crdata_core::hashing::sha256_hex;
use crdata_core::job::{param_env_name, params_to_json, JobDescriptor, JobParam, JobStatus};
use crdata_core::scripting::executor::{ScriptExecutor, ScriptInput, ScriptOutput};
use crdata_core::types::JobId;
use serde::Serialize;
use tempfile::TempDir;

use crate::error::NodeError;
use crate::store::ResultStore;

/// File name the parameters are saved under in the working directory.
pub const PARAMS_FILE: &str = "params.json";

/// Environment variable carrying the job id.
pub const JOB_ID_ENV: &str = "CRDATA_JOB_ID";

/// Environment variable carrying the job's working directory.
pub const WORK_DIR_ENV: &str = "CRDATA_WORK_DIR";

/// Summary uploaded as `result.json`.
#[derive(Debug, Serialize)]
pub struct JobSummary<'a> {
    pub job_id: JobId,
    pub name: &'a str,
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    pub duration_ms: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<&'a str>,
    /// Stdout parsed as JSON, when the script printed JSON.
    pub output: Option<&'a serde_json::Value>,
}

/// One entry of `manifest.json`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DataFile {
    pub path: String,
    pub size_bytes: u64,
    pub sha256: String,
}

/// A claimed job being processed.
#[derive(Debug)]
pub struct Job {
    descriptor: JobDescriptor,
    workdir: TempDir,
    source_path: Option<PathBuf>,
    params: Vec<JobParam>,
    output: Option<ScriptOutput>,
    status: JobStatus,
    error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create the job and its private working directory under `root_dir`.
    pub fn new(descriptor: JobDescriptor, root_dir: &Path) -> Result<Self, NodeError> {
        let workdir = tempfile::Builder::new()
            .prefix(&format!("job_{}_", descriptor.id))
            .tempdir_in(root_dir)?;

        Ok(Self {
            descriptor,
            workdir,
            source_path: None,
            params: Vec::new(),
            output: None,
            status: JobStatus::Pending,
            error: None,
            started_at: None,
            finished_at: None,
        })
    }

    pub fn id(&self) -> JobId {
        self.descriptor.id
    }

    pub fn descriptor(&self) -> &JobDescriptor {
        &self.descriptor
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn workdir(&self) -> &Path {
        self.workdir.path()
    }

    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    pub fn params(&self) -> &[JobParam] {
        &self.params
    }

    pub fn output(&self) -> Option<&ScriptOutput> {
        self.output.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Mark the job failed, keeping the first error message recorded.
    pub fn mark_failed(&mut self, error: impl Display) {
        self.status = JobStatus::Failed;
        if self.error.is_none() {
            self.error = Some(error.to_string());
        }
        if self.started_at.is_some() && self.finished_at.is_none() {
            self.finished_at = Some(Utc::now());
        }
    }

    /// Download the script and save it as `job_<id>.<extension>`.
    pub async fn fetch_source_code(
        &mut self,
        api: &ServerApi,
        extension: &str,
    ) -> Result<(), NodeError> {
        let source = api.fetch_source_code(self.id()).await?;

        let path = self
            .workdir
            .path()
            .join(format!("job_{}.{}", self.id(), extension));
        tokio::fs::write(&path, source.as_bytes()).await?;

        tracing::debug!(path = %path.display(), bytes = source.len(), "Saved job source");
        self.source_path = Some(path);
        Ok(())
    }

    /// Download the parameters and save them as [`PARAMS_FILE`].
    pub async fn fetch_params(&mut self, api: &ServerApi) -> Result<(), NodeError> {
        let params = api.fetch_params(self.id()).await?;

        let json = serde_json::to_vec_pretty(&params_to_json(&params))?;
        tokio::fs::write(self.workdir.path().join(PARAMS_FILE), json).await?;

        tracing::debug!(count = params.len(), "Fetched job parameters");
        self.params = params;
        Ok(())
    }

    /// Run the script through `executor` in the job's working directory.
    ///
    /// A non-zero exit marks the job failed but is not an error; the
    /// remaining steps still upload its logs. Failing to run the
    /// interpreter at all is an error; output printed before a timeout is
    /// kept for the fallback upload.
    pub async fn run<E: ScriptExecutor>(
        &mut self,
        executor: &E,
        timeout: Option<Duration>,
    ) -> Result<(), NodeError> {
        let source = self
            .source_path
            .clone()
            .ok_or(NodeError::SourceMissing(self.id()))?;

        let mut env = vec![
            (JOB_ID_ENV.to_string(), self.id().to_string()),
            (
                WORK_DIR_ENV.to_string(),
                self.workdir.path().display().to_string(),
            ),
        ];
        env.extend(
            self.params
                .iter()
                .map(|p| (param_env_name(&p.name), p.value.clone())),
        );

        let input = ScriptInput {
            stdin: params_to_json(&self.params),
            env,
            current_dir: Some(self.workdir.path().to_path_buf()),
            timeout,
        };

        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
        tracing::info!(name = %self.descriptor.name, "Running job script");

        match executor.execute(&source, input).await {
            Ok(output) => {
                self.finished_at = Some(Utc::now());
                if output.succeeded() {
                    self.status = JobStatus::Successful;
                    tracing::info!(duration_ms = output.duration_ms, "Job script succeeded");
                } else {
                    self.mark_failed(format!(
                        "interpreter exited with code {}",
                        output.exit_code
                    ));
                    tracing::warn!(
                        exit_code = output.exit_code,
                        duration_ms = output.duration_ms,
                        stderr = %output.stderr.trim(),
                        "Job script failed"
                    );
                }
                self.output = Some(output);
                Ok(())
            }
            Err(e) => {
                self.finished_at = Some(Utc::now());
                self.output = e.partial_output();
                self.mark_failed(&e);
                Err(e.into())
            }
        }
    }

    /// Upload stdout, stderr and the `result.json` summary.
    pub async fn store_results_and_logs(&self, store: &dyn ResultStore) -> Result<(), NodeError> {
        let (stdout, stderr) = match &self.output {
            Some(output) => (output.stdout.clone(), output.stderr.clone()),
            None => (String::new(), String::new()),
        };

        store
            .put(self.id(), "logs/stdout.log", stdout.into_bytes())
            .await?;
        store
            .put(self.id(), "logs/stderr.log", stderr.into_bytes())
            .await?;

        let summary = self.summary();
        let location = store
            .put(self.id(), "result.json", serde_json::to_vec_pretty(&summary)?)
            .await?;

        tracing::info!(
            backend = store.backend().name(),
            location = %location,
            status = %self.status,
            "Stored job results and logs"
        );
        Ok(())
    }

    /// Upload every file the script produced under `data/`, then the
    /// manifest describing them.
    pub async fn store_data(&self, store: &dyn ResultStore) -> Result<Vec<DataFile>, NodeError> {
        let mut skip = vec![self.workdir.path().join(PARAMS_FILE)];
        if let Some(source) = &self.source_path {
            skip.push(source.clone());
        }

        let files = collect_files(self.workdir.path(), &skip).await?;
        let mut manifest = Vec::with_capacity(files.len());

        for path in files {
            let relative = relative_slash_path(self.workdir.path(), &path);
            let contents = tokio::fs::read(&path).await?;
            let entry = DataFile {
                path: relative.clone(),
                size_bytes: contents.len() as u64,
                sha256: sha256_hex(&contents),
            };
            store
                .put(self.id(), &format!("data/{relative}"), contents)
                .await?;
            manifest.push(entry);
        }

        store
            .put(
                self.id(),
                "manifest.json",
                serde_json::to_vec_pretty(&manifest)?,
            )
            .await?;

        tracing::info!(files = manifest.len(), "Stored job data");
        Ok(manifest)
    }

    pub fn summary(&self) -> JobSummary<'_> {
        JobSummary {
            job_id: self.id(),
            name: &self.descriptor.name,
            status: self.status,
            exit_code: self.output.as_ref().map(|o| o.exit_code),
            duration_ms: self.output.as_ref().map(|o| o.duration_ms),
            started_at: self.started_at,
            finished_at: self.finished_at,
            error: self.error.as_deref(),
            output: self.output.as_ref().and_then(|o| o.parsed_output.as_ref()),
        }
    }
}

/// All regular files under `root`, recursively, minus `skip`. Sorted.
async fn collect_files(root: &Path, skip: &[PathBuf]) -> std::io::Result<Vec<PathBuf>> {
    let mut pending = vec![root.to_path_buf()];
    let mut files = Vec::new();

    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let path = entry.path();
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() && !skip.contains(&path) {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}

/// `path` relative to `root`, joined with `/` regardless of platform.
fn relative_slash_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
