//! The processing node's polling loop.
//!
//! Each iteration claims at most one job and runs its whole lifecycle
//! before the next poll. Nothing that goes wrong inside an iteration stops
//! the loop: a failed or panicking lifecycle is reported to the server as a
//! failed job (best effort), a failed poll is logged, and a panic outside a
//! job is caught and logged. Only the cancellation token ends [`ProcessingNode::run`].

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crdata_client::{ApiError, ServerApi, StatusReporter};
use crdata_core::job::{JobDescriptor, JobStatus};
use crdata_core::scripting::executor::ScriptExecutor;
use crdata_core::types::JobId;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::job::Job;
use crate::poll::{Backoff, PollPolicy};
use crate::store::ResultStore;

/// What one loop iteration did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    /// The server had no queued job.
    Idle,
    /// Claiming a job failed.
    PollFailed { error: String },
    /// A job ran through every step; `status` is what was reported.
    Completed { job_id: JobId, status: JobStatus },
    /// A job's lifecycle failed part way; failure was reported best effort.
    Failed { job_id: JobId, error: String },
    /// The iteration panicked.
    Panicked,
}

impl IterationOutcome {
    /// Whether the next delay should back off.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::PollFailed { .. } | Self::Failed { .. } | Self::Panicked
        )
    }
}

/// Worker that claims jobs from one server node and runs them one at a time.
pub struct ProcessingNode<E> {
    api: ServerApi,
    reporter: StatusReporter,
    executor: E,
    store: Arc<dyn ResultStore>,
    root_dir: PathBuf,
    job_timeout: Option<Duration>,
    poll: PollPolicy,
}

impl<E: ScriptExecutor> ProcessingNode<E> {
    pub fn new(
        config: &NodeConfig,
        executor: E,
        store: Arc<dyn ResultStore>,
    ) -> Result<Self, NodeError> {
        Ok(Self {
            api: ServerApi::new(&config.server),
            reporter: StatusReporter::new(&config.server)?,
            executor,
            store,
            root_dir: config.root_dir.clone(),
            job_timeout: config.job_timeout,
            poll: config.poll.clone(),
        })
    }

    pub fn server(&self) -> &str {
        self.api.base_url()
    }

    /// Run the loop until `cancel` fires.
    ///
    /// Cancellation is only observed between iterations, so a running job
    /// always finishes its lifecycle first.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            server = %self.server(),
            root_dir = %self.root_dir.display(),
            backend = self.store.backend().label(),
            interval_secs = self.poll.interval.as_secs_f64(),
            "Processing node started",
        );

        let mut backoff = Backoff::new(self.poll.clone());

        loop {
            let outcome = self.run_guarded().await;

            let delay = if outcome.is_failure() {
                backoff.on_failure()
            } else {
                backoff.on_success()
            };
            tracing::debug!(?outcome, delay_ms = delay.as_millis() as u64, "Sleeping before next poll");

            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Processing node stopping");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// [`run_once`](Self::run_once) with panics caught and logged.
    async fn run_guarded(&self) -> IterationOutcome {
        match AssertUnwindSafe(self.run_once()).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::error!("Poll iteration panicked");
                IterationOutcome::Panicked
            }
        }
    }

    /// One iteration: claim a job and, if there is one, run it to the end.
    pub async fn run_once(&self) -> IterationOutcome {
        let descriptor = match self.claim().await {
            Ok(Some(descriptor)) => descriptor,
            Ok(None) => return IterationOutcome::Idle,
            Err(e) => {
                return IterationOutcome::PollFailed {
                    error: e.to_string(),
                }
            }
        };

        let job_id = descriptor.id;
        let span = tracing::info_span!("job", job_id);
        self.process_claimed(descriptor).instrument(span).await
    }

    /// Claim the next queued job.
    ///
    /// `None` both when the queue is empty and when the claim fails; a
    /// failure is logged, an empty queue is not.
    pub async fn fetch_next_job(&self) -> Option<JobDescriptor> {
        self.claim().await.ok().flatten()
    }

    async fn claim(&self) -> Result<Option<JobDescriptor>, ApiError> {
        let result = self.api.claim_next_job().await;
        if let Err(e) = &result {
            tracing::error!(server = %self.server(), error = %e, "Failed to fetch next job");
        }
        result
    }

    /// Report `job`'s status to the server: `success=true` only for a
    /// successful job. A single attempt.
    pub async fn job_completed(&self, job: &Job) -> Result<(), NodeError> {
        let success = job.status().is_successful();
        if success {
            tracing::info!(job_id = job.id(), "Completed job, marking job successful");
        } else {
            tracing::info!(job_id = job.id(), "Failed job, marking job failure");
        }

        self.reporter
            .report(job.id(), success)
            .await
            .map_err(NodeError::Report)
    }

    async fn process_claimed(&self, descriptor: JobDescriptor) -> IterationOutcome {
        let job_id = descriptor.id;

        let mut job = match Job::new(descriptor, &self.root_dir) {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(error = %e, "Failed to create job working directory");
                if let Err(report_err) = self.reporter.report(job_id, false).await {
                    tracing::error!(error = %report_err, "Failed to report job failure");
                }
                return IterationOutcome::Failed {
                    job_id,
                    error: e.to_string(),
                };
            }
        };

        let result = AssertUnwindSafe(self.process(&mut job)).catch_unwind().await;
        let error = match result {
            Ok(Ok(())) => {
                return IterationOutcome::Completed {
                    job_id,
                    status: job.status(),
                }
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Job lifecycle failed");
                // A failed report leaves the job's own outcome intact.
                if !e.is_report_failure() {
                    job.mark_failed(&e);
                }
                e.to_string()
            }
            Err(payload) => {
                let error = format!(
                    "job lifecycle panicked: {}",
                    panic_message(payload.as_ref())
                );
                tracing::error!(error = %error, "Job lifecycle panicked");
                job.mark_failed(&error);
                error
            }
        };

        self.salvage(&job).await;
        IterationOutcome::Failed { job_id, error }
    }

    /// The lifecycle steps in order, stopping at the first error.
    async fn process(&self, job: &mut Job) -> Result<(), NodeError> {
        job.fetch_source_code(&self.api, self.executor.source_extension())
            .await?;
        job.fetch_params(&self.api).await?;
        job.run(&self.executor, self.job_timeout).await?;
        job.store_results_and_logs(self.store.as_ref()).await?;
        job.store_data(self.store.as_ref()).await?;
        self.job_completed(job).await?;
        Ok(())
    }

    /// Best-effort cleanup after a failed lifecycle: report the job and
    /// upload whatever logs exist. Errors are logged and dropped.
    async fn salvage(&self, job: &Job) {
        if let Err(e) = self.job_completed(job).await {
            tracing::error!(error = %e, "Failed to report job after lifecycle failure");
        }
        if let Err(e) = job.store_results_and_logs(self.store.as_ref()).await {
            tracing::error!(error = %e, "Failed to store logs after lifecycle failure");
        }
    }
}

/// The message a panic was raised with, when it is a string.
fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
