//! Interpreter executor.
//!
//! Runs a job's source file through an interpreter binary, `Rscript
//! --vanilla <file>` by default. Any other interpreter that takes the
//! source path as its last argument works the same way.

use std::path::Path;

use super::executor::{ScriptError, ScriptExecutor, ScriptInput, ScriptOutput};
use super::subprocess;

/// Default interpreter for job sources.
pub const DEFAULT_INTERPRETER: &str = "Rscript";

/// Executor that hands the source file to an interpreter binary.
#[derive(Debug, Clone)]
pub struct InterpreterExecutor {
    program: String,
    args: Vec<String>,
    extension: String,
}

impl InterpreterExecutor {
    /// An executor for `program` with no extra arguments. Sources are saved
    /// with the extension `txt` unless overridden.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            extension: "txt".to_string(),
        }
    }

    /// `Rscript --vanilla`, sources saved as `.R`.
    pub fn rscript() -> Self {
        Self::new(DEFAULT_INTERPRETER)
            .with_args(["--vanilla"])
            .with_extension("R")
    }

    /// Pick the executor for a configured interpreter name. `Rscript` (or a
    /// path ending in it) gets the R defaults.
    pub fn for_interpreter(program: &str) -> Self {
        let is_rscript = Path::new(program)
            .file_name()
            .is_some_and(|name| name == DEFAULT_INTERPRETER);
        if is_rscript {
            Self {
                program: program.to_string(),
                ..Self::rscript()
            }
        } else {
            Self::new(program)
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl ScriptExecutor for InterpreterExecutor {
    fn source_extension(&self) -> &str {
        &self.extension
    }

    async fn execute(
        &self,
        script_path: &Path,
        input: ScriptInput,
    ) -> Result<ScriptOutput, ScriptError> {
        if tokio::fs::metadata(script_path).await.is_err() {
            return Err(ScriptError::NotFound(script_path.to_path_buf()));
        }

        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args).arg(script_path);
        subprocess::run_command(cmd, input).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
