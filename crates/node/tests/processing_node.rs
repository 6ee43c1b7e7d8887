//! Integration tests for the processing node loop.
//!
//! A wiremock server stands in for the crdata server node, `sh` stands in
//! for the R interpreter, and results go to a local temp directory.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use crdata_core::job::JobStatus;
use crdata_core::scripting::executor::{ScriptError, ScriptExecutor, ScriptInput, ScriptOutput};
use crdata_core::scripting::interpreter::InterpreterExecutor;
use crdata_core::types::JobId;
use crdata_node::config::NodeConfig;
use crdata_node::node::{IterationOutcome, ProcessingNode};
use crdata_node::poll::PollPolicy;
use crdata_node::store::local::LocalResultStore;
use crdata_node::store::{ResultStore, StorageBackendType, StoreError};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness<E = InterpreterExecutor> {
    server: MockServer,
    root: TempDir,
    results: TempDir,
    node: ProcessingNode<E>,
}

fn sh() -> InterpreterExecutor {
    InterpreterExecutor::new("sh").with_extension("sh")
}

async fn harness() -> Harness {
    harness_with(sh()).await
}

async fn harness_with<E: ScriptExecutor>(executor: E) -> Harness<E> {
    build(executor, None, None).await
}

/// A node against a fresh mock server. Results go to a local temp dir
/// unless `store` is given.
async fn build<E: ScriptExecutor>(
    executor: E,
    store: Option<Arc<dyn ResultStore>>,
    job_timeout: Option<Duration>,
) -> Harness<E> {
    let server = MockServer::start().await;
    let root = TempDir::new().expect("root dir");
    let results = TempDir::new().expect("results dir");

    let mut config = NodeConfig::new(
        server.uri(),
        root.path().to_path_buf(),
        results.path().to_path_buf(),
    );
    config.poll = PollPolicy {
        interval: Duration::from_millis(50),
        max_delay: Duration::from_millis(50),
        multiplier: 1.0,
    };
    config.job_timeout = job_timeout;

    let store: Arc<dyn ResultStore> = match store {
        Some(store) => store,
        None => Arc::new(LocalResultStore::new(results.path().to_path_buf())),
    };
    let node = ProcessingNode::new(&config, executor, store).expect("node");

    Harness {
        server,
        root,
        results,
        node,
    }
}

/// Executor whose interpreter binding crashes mid-run.
struct PanickingExecutor;

impl ScriptExecutor for PanickingExecutor {
    fn source_extension(&self) -> &str {
        "R"
    }

    async fn execute(
        &self,
        _source: &Path,
        _input: ScriptInput,
    ) -> Result<ScriptOutput, ScriptError> {
        panic!("interpreter binding crashed")
    }
}

/// Store that refuses every upload, like a bucket without write access.
struct RejectingStore;

#[async_trait]
impl ResultStore for RejectingStore {
    fn backend(&self) -> StorageBackendType {
        StorageBackendType::S3
    }

    async fn put(
        &self,
        _job_id: JobId,
        _relative_path: &str,
        _contents: Vec<u8>,
    ) -> Result<String, StoreError> {
        Err(StoreError::S3("AccessDenied".into()))
    }
}

async fn run_for(node: &ProcessingNode<impl ScriptExecutor>, duration: Duration) {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(duration).await;
        trigger.cancel();
    });

    tokio::time::timeout(Duration::from_secs(10), node.run(cancel))
        .await
        .expect("run returns after cancellation");
}

async fn count_requests(server: &MockServer, request_path: &str) -> usize {
    server
        .received_requests()
        .await
        .expect("recording on")
        .iter()
        .filter(|request| request.url.path() == request_path)
        .count()
}

async fn mount_claim(server: &MockServer, response: ResponseTemplate) {
    Mock::given(method("PUT"))
        .and(path("/jobs_queues/run_next_job"))
        .respond_with(response)
        .mount(server)
        .await;
}

async fn mount_job(server: &MockServer, id: i64, source: &str, params_xml: &str) {
    mount_claim(
        server,
        ResponseTemplate::new(200).set_body_string(format!(
            "<job><id>{id}</id><name>integration</name></job>"
        )),
    )
    .await;
    Mock::given(method("GET"))
        .and(path(format!("/jobs/{id}/source_code")))
        .respond_with(ResponseTemplate::new(200).set_body_string(source))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/jobs/{id}/params.xml")))
        .respond_with(ResponseTemplate::new(200).set_body_string(params_xml))
        .mount(server)
        .await;
}

async fn expect_report(server: &MockServer, id: i64, success: &str, status: u16, times: u64) {
    Mock::given(method("PUT"))
        .and(path(format!("/jobs/{id}/done.xml")))
        .and(query_param("success", success))
        .respond_with(ResponseTemplate::new(status))
        .expect(times)
        .mount(server)
        .await;
}

fn read_json(path: &Path) -> serde_json::Value {
    let text = std::fs::read_to_string(path).expect("read json file");
    serde_json::from_str(&text).expect("valid json")
}

const NO_PARAMS: &str = "<params></params>";

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn empty_queue_runs_nothing() {
    let h = harness().await;
    mount_claim(&h.server, ResponseTemplate::new(404)).await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&h.server)
        .await;

    assert_eq!(h.node.run_once().await, IterationOutcome::Idle);
    assert!(h.node.fetch_next_job().await.is_none());
}

#[tokio::test]
async fn successful_job_reports_success_and_stores_results() {
    let h = harness().await;
    let source = "echo \"$CRDATA_PARAM_ALPHA\" > alpha.txt\n\
                  mkdir -p plots && echo png > plots/fit.png\n\
                  echo '{\"mean\": 1}'\n";
    mount_job(
        &h.server,
        42,
        source,
        "<params><param><name>alpha</name><value>0.05</value></param></params>",
    )
    .await;
    expect_report(&h.server, 42, "true", 200, 1).await;

    let outcome = h.node.run_once().await;
    assert_eq!(
        outcome,
        IterationOutcome::Completed {
            job_id: 42,
            status: JobStatus::Successful,
        }
    );

    let job_dir = h.results.path().join("42");
    let summary = read_json(&job_dir.join("result.json"));
    assert_eq!(summary["job_id"], 42);
    assert_eq!(summary["status"], "successful");
    assert_eq!(summary["exit_code"], 0);
    assert_eq!(summary["output"]["mean"], 1);

    let alpha = std::fs::read_to_string(job_dir.join("data").join("alpha.txt")).expect("alpha");
    assert_eq!(alpha.trim(), "0.05");
    assert!(job_dir.join("data").join("plots").join("fit.png").exists());
    assert!(!job_dir.join("data").join("params.json").exists());
    assert!(!job_dir.join("data").join("job_42.sh").exists());

    let manifest = read_json(&job_dir.join("manifest.json"));
    let paths: Vec<&str> = manifest
        .as_array()
        .expect("manifest array")
        .iter()
        .map(|entry| entry["path"].as_str().expect("path"))
        .collect();
    assert_eq!(paths, vec!["alpha.txt", "plots/fit.png"]);

    // The working directory is gone once the job is discarded.
    let leftovers = std::fs::read_dir(h.root.path()).expect("read root").count();
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn wrapped_claim_body_is_accepted() {
    let h = harness().await;
    mount_claim(
        &h.server,
        ResponseTemplate::new(200)
            .set_body_string("<response><job><id>8</id></job></response>"),
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/jobs/8/source_code"))
        .respond_with(ResponseTemplate::new(200).set_body_string("true\n"))
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/jobs/8/params.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(NO_PARAMS))
        .mount(&h.server)
        .await;
    expect_report(&h.server, 8, "true", 200, 1).await;

    assert_matches!(
        h.node.run_once().await,
        IterationOutcome::Completed { job_id: 8, .. }
    );
}

#[tokio::test]
async fn failing_script_reports_failure() {
    let h = harness().await;
    mount_job(&h.server, 43, "echo 'object not found' >&2\nexit 3\n", NO_PARAMS).await;
    expect_report(&h.server, 43, "false", 200, 1).await;

    let outcome = h.node.run_once().await;
    assert_eq!(
        outcome,
        IterationOutcome::Completed {
            job_id: 43,
            status: JobStatus::Failed,
        }
    );

    let job_dir = h.results.path().join("43");
    let summary = read_json(&job_dir.join("result.json"));
    assert_eq!(summary["status"], "failed");
    assert_eq!(summary["exit_code"], 3);
    let stderr = std::fs::read_to_string(job_dir.join("logs").join("stderr.log")).expect("stderr");
    assert!(stderr.contains("object not found"));
}

#[tokio::test]
async fn unrunnable_interpreter_still_reports_failure() {
    let h = harness_with(InterpreterExecutor::new("crdata-no-such-interpreter")).await;
    mount_job(&h.server, 44, "print(1)\n", NO_PARAMS).await;
    expect_report(&h.server, 44, "false", 200, 1).await;

    let outcome = h.node.run_once().await;
    assert_matches!(outcome, IterationOutcome::Failed { job_id: 44, .. });

    // Logs are uploaded by the fallback path.
    let summary = read_json(&h.results.path().join("44").join("result.json"));
    assert_eq!(summary["status"], "failed");
    assert!(summary["error"].as_str().expect("error").contains("Could not start interpreter"));
}

#[tokio::test]
async fn source_download_failure_reports_failure() {
    let h = harness().await;
    mount_claim(
        &h.server,
        ResponseTemplate::new(200).set_body_string("<job><id>45</id></job>"),
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/jobs/45/source_code"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&h.server)
        .await;
    expect_report(&h.server, 45, "false", 200, 1).await;

    let outcome = h.node.run_once().await;
    assert_matches!(outcome, IterationOutcome::Failed { job_id: 45, .. });
}

#[tokio::test]
async fn failed_report_is_retried_once_by_fallback() {
    let h = harness().await;
    mount_job(&h.server, 46, "true\n", NO_PARAMS).await;
    // The job itself succeeded, so both attempts report success.
    expect_report(&h.server, 46, "true", 500, 2).await;

    let outcome = h.node.run_once().await;
    assert_matches!(outcome, IterationOutcome::Failed { job_id: 46, .. });
}

#[tokio::test]
async fn claim_server_error_is_contained() {
    let h = harness().await;
    mount_claim(&h.server, ResponseTemplate::new(503)).await;

    assert_matches!(h.node.run_once().await, IterationOutcome::PollFailed { .. });
    assert!(h.node.fetch_next_job().await.is_none());
}

#[tokio::test]
async fn unparseable_claim_is_contained() {
    let h = harness().await;
    mount_claim(
        &h.server,
        ResponseTemplate::new(200).set_body_string("not xml at all"),
    )
    .await;

    assert_matches!(h.node.run_once().await, IterationOutcome::PollFailed { .. });
}

#[tokio::test]
async fn loop_keeps_polling_until_cancelled() {
    let h = harness().await;
    mount_claim(&h.server, ResponseTemplate::new(500)).await;

    run_for(&h.node, Duration::from_millis(400)).await;

    let claims = count_requests(&h.server, "/jobs_queues/run_next_job").await;
    assert!(claims >= 3, "expected repeated polls, got {claims}");
}

#[tokio::test]
async fn store_failure_reports_failure_once() {
    let h = build(sh(), Some(Arc::new(RejectingStore)), None).await;
    mount_job(&h.server, 47, "echo fitted\n", NO_PARAMS).await;
    expect_report(&h.server, 47, "false", 200, 1).await;
    expect_report(&h.server, 47, "true", 200, 0).await;

    let outcome = h.node.run_once().await;
    assert_matches!(outcome, IterationOutcome::Failed { job_id: 47, ref error }
        if error.contains("AccessDenied"));
}

#[tokio::test]
async fn panic_in_execution_still_reports_failure() {
    let h = harness_with(PanickingExecutor).await;
    mount_job(&h.server, 9, "print(1)\n", NO_PARAMS).await;
    expect_report(&h.server, 9, "false", 200, 1).await;

    let outcome = h.node.run_once().await;
    assert_matches!(outcome, IterationOutcome::Failed { job_id: 9, ref error }
        if error.contains("interpreter binding crashed"));

    let summary = read_json(&h.results.path().join("9").join("result.json"));
    assert_eq!(summary["status"], "failed");
    assert!(summary["error"].as_str().expect("error").contains("panicked"));
}

#[tokio::test]
async fn loop_survives_panicking_jobs_and_reports_each() {
    let h = harness_with(PanickingExecutor).await;
    mount_job(&h.server, 9, "print(1)\n", NO_PARAMS).await;
    Mock::given(method("PUT"))
        .and(path("/jobs/9/done.xml"))
        .and(query_param("success", "false"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2..)
        .mount(&h.server)
        .await;

    run_for(&h.node, Duration::from_millis(500)).await;

    let claims = count_requests(&h.server, "/jobs_queues/run_next_job").await;
    let reports = count_requests(&h.server, "/jobs/9/done.xml").await;
    assert!(claims >= 2, "expected the loop to keep polling, got {claims} claims");
    // Cancellation lands between iterations, so every claimed job was reported.
    assert_eq!(reports, claims);
}

#[tokio::test]
async fn timed_out_job_uploads_partial_logs() {
    let h = build(sh(), None, Some(Duration::from_millis(500))).await;
    mount_job(
        &h.server,
        48,
        "echo 'iteration 1'\necho 'not converging' >&2\nsleep 30\n",
        NO_PARAMS,
    )
    .await;
    expect_report(&h.server, 48, "false", 200, 1).await;

    let outcome = h.node.run_once().await;
    assert_matches!(outcome, IterationOutcome::Failed { job_id: 48, .. });

    let job_dir = h.results.path().join("48");
    let stdout = std::fs::read_to_string(job_dir.join("logs").join("stdout.log")).expect("stdout");
    let stderr = std::fs::read_to_string(job_dir.join("logs").join("stderr.log")).expect("stderr");
    assert_eq!(stdout.trim(), "iteration 1");
    assert_eq!(stderr.trim(), "not converging");

    let summary = read_json(&job_dir.join("result.json"));
    assert_eq!(summary["status"], "failed");
    assert_eq!(summary["exit_code"], -1);
}
