//! The [`ScriptExecutor`] seam between a job and the process that runs it.
//!
//! The node hands an executor the path of a downloaded job source plus a
//! [`ScriptInput`] and gets back a [`ScriptOutput`]. Exit codes are data,
//! not errors: only failing to run the interpreter at all is a
//! [`ScriptError`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

/// How to run one job source.
#[derive(Debug, Clone, Default)]
pub struct ScriptInput {
    /// Written to the interpreter's stdin as JSON, then stdin is closed.
    pub stdin: Value,
    /// Extra environment for the interpreter process.
    pub env: Vec<(String, String)>,
    /// Directory the interpreter runs in; inherits the node's when `None`.
    pub current_dir: Option<PathBuf>,
    /// Kill the interpreter after this long. `None` never kills it.
    pub timeout: Option<Duration>,
}

/// What the interpreter left behind.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScriptOutput {
    pub stdout: String,
    pub stderr: String,
    /// `-1` when the process ended without an exit code (killed by a signal).
    pub exit_code: i32,
    pub duration_ms: u64,
    /// `stdout` as JSON, if it parses as JSON.
    pub parsed_output: Option<Value>,
}

impl ScriptOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("Job source not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The interpreter ran past its timeout and was killed. Carries what it
    /// printed before the kill.
    #[error("Interpreter killed after {elapsed_ms}ms")]
    Timeout {
        elapsed_ms: u64,
        stdout: String,
        stderr: String,
    },

    #[error("Could not start interpreter: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Lost track of interpreter process: {0}")]
    Wait(#[source] std::io::Error),
}

impl ScriptError {
    /// Output captured before the interpreter stopped, if any was.
    pub fn partial_output(&self) -> Option<ScriptOutput> {
        match self {
            Self::Timeout {
                elapsed_ms,
                stdout,
                stderr,
            } => Some(ScriptOutput {
                stdout: stdout.clone(),
                stderr: stderr.clone(),
                exit_code: -1,
                duration_ms: *elapsed_ms,
                parsed_output: None,
            }),
            _ => None,
        }
    }
}

/// Runs a job source file to completion.
pub trait ScriptExecutor: Send + Sync {
    /// Extension (no dot) job sources are saved with before running.
    fn source_extension(&self) -> &str;

    fn execute(
        &self,
        source: &Path,
        input: ScriptInput,
    ) -> impl std::future::Future<Output = Result<ScriptOutput, ScriptError>> + Send;
}
