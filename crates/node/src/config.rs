use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use crdata_core::scripting::interpreter::DEFAULT_INTERPRETER;

use crate::poll::PollPolicy;
use crate::store::StorageBackendType;

/// Command line for the `crdata-node` binary.
///
/// Every option can also be given through the environment (a `.env` file
/// is loaded first):
///
/// | Flag                   | Env                         | Default                               |
/// |------------------------|-----------------------------|---------------------------------------|
/// | `<SERVER>`             | `CRDATA_SERVER`             | required                              |
/// | `--log-file`           | `CRDATA_LOG_FILE`           | `/var/log/crdata/processing_node.log` |
/// | `--log-json`           | `CRDATA_LOG_JSON`           | off                                   |
/// | `--root-dir`           | `CRDATA_ROOT_DIR`           | `/var/lib/crdata/jobs`                |
/// | `--results-dir`        | `CRDATA_RESULTS_DIR`        | `/var/lib/crdata/results`             |
/// | `--interpreter`        | `CRDATA_INTERPRETER`        | `Rscript`                             |
/// | `--poll-interval-secs` | `CRDATA_POLL_INTERVAL_SECS` | `10`                                  |
/// | `--backoff-multiplier` | `CRDATA_BACKOFF_MULTIPLIER` | `1.0`                                 |
/// | `--max-backoff-secs`   | `CRDATA_MAX_BACKOFF_SECS`   | `300`                                 |
/// | `--job-timeout-secs`   | `CRDATA_JOB_TIMEOUT_SECS`   | none                                  |
/// | `--results-backend`    | `CRDATA_RESULTS_BACKEND`    | `local`                               |
/// | `--s3-bucket`          | `CRDATA_S3_BUCKET`          | none                                  |
/// | `--s3-prefix`          | `CRDATA_S3_PREFIX`          | `results`                             |
#[derive(Parser, Debug)]
#[command(name = "crdata-node")]
#[command(version)]
#[command(about = "Processing node: runs queued jobs from a crdata server")]
pub struct Cli {
    /// Server node address (`host:port` or URL)
    #[arg(env = "CRDATA_SERVER")]
    pub server: String,

    /// Log file, appended to
    #[arg(long, env = "CRDATA_LOG_FILE", default_value = "/var/log/crdata/processing_node.log")]
    pub log_file: PathBuf,

    /// Write the log file as JSON lines
    #[arg(long, env = "CRDATA_LOG_JSON")]
    pub log_json: bool,

    /// Directory under which per-job working directories are created
    #[arg(long, env = "CRDATA_ROOT_DIR", default_value = "/var/lib/crdata/jobs")]
    pub root_dir: PathBuf,

    /// Results directory for the local backend
    #[arg(long, env = "CRDATA_RESULTS_DIR", default_value = "/var/lib/crdata/results")]
    pub results_dir: PathBuf,

    /// Interpreter the job source is run with
    #[arg(long, env = "CRDATA_INTERPRETER", default_value = DEFAULT_INTERPRETER)]
    pub interpreter: String,

    /// Seconds between polls
    #[arg(long, env = "CRDATA_POLL_INTERVAL_SECS", default_value = "10")]
    pub poll_interval_secs: u64,

    /// Growth factor of the delay after consecutive failed iterations
    #[arg(long, env = "CRDATA_BACKOFF_MULTIPLIER", default_value = "1.0")]
    pub backoff_multiplier: f64,

    /// Upper bound on the failure delay, in seconds
    #[arg(long, env = "CRDATA_MAX_BACKOFF_SECS", default_value = "300")]
    pub max_backoff_secs: u64,

    /// Kill the interpreter after this many seconds (no limit if unset)
    #[arg(long, env = "CRDATA_JOB_TIMEOUT_SECS")]
    pub job_timeout_secs: Option<u64>,

    /// Where job results are stored
    #[arg(long, env = "CRDATA_RESULTS_BACKEND", value_enum, default_value = "local")]
    pub results_backend: StorageBackendType,

    /// Bucket for the s3 backend
    #[arg(long, env = "CRDATA_S3_BUCKET")]
    pub s3_bucket: Option<String>,

    /// Key prefix for the s3 backend
    #[arg(long, env = "CRDATA_S3_PREFIX", default_value = "results")]
    pub s3_prefix: String,
}

/// Configuration errors detected before the node starts.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Server address must not be empty")]
    EmptyServer,

    #[error("Poll interval must be at least one second")]
    InvalidPollInterval,

    #[error("Backoff multiplier must be a finite number >= 1.0, got {0}")]
    InvalidMultiplier(f64),

    #[error("The s3 results backend requires a bucket (--s3-bucket / CRDATA_S3_BUCKET)")]
    MissingBucket,
}

/// Where job results go.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultsBackend {
    Local { dir: PathBuf },
    S3 { bucket: String, prefix: String },
}

impl ResultsBackend {
    pub fn backend_type(&self) -> StorageBackendType {
        match self {
            Self::Local { .. } => StorageBackendType::Local,
            Self::S3 { .. } => StorageBackendType::S3,
        }
    }
}

/// Resolved processing node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub server: String,
    pub log_file: PathBuf,
    pub log_json: bool,
    pub root_dir: PathBuf,
    pub interpreter: String,
    pub poll: PollPolicy,
    pub job_timeout: Option<Duration>,
    pub results: ResultsBackend,
}

impl NodeConfig {
    /// A configuration with defaults for everything but the server, the
    /// job root and a local results directory.
    pub fn new(server: impl Into<String>, root_dir: PathBuf, results_dir: PathBuf) -> Self {
        Self {
            server: server.into(),
            log_file: PathBuf::from("processing_node.log"),
            log_json: false,
            root_dir,
            interpreter: DEFAULT_INTERPRETER.to_string(),
            poll: PollPolicy::default(),
            job_timeout: None,
            results: ResultsBackend::Local { dir: results_dir },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.trim().is_empty() {
            return Err(ConfigError::EmptyServer);
        }
        if self.poll.interval.is_zero() {
            return Err(ConfigError::InvalidPollInterval);
        }
        if !self.poll.multiplier.is_finite() || self.poll.multiplier < 1.0 {
            return Err(ConfigError::InvalidMultiplier(self.poll.multiplier));
        }
        if let ResultsBackend::S3 { bucket, .. } = &self.results {
            if bucket.trim().is_empty() {
                return Err(ConfigError::MissingBucket);
            }
        }
        Ok(())
    }
}

impl TryFrom<Cli> for NodeConfig {
    type Error = ConfigError;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let results = match cli.results_backend {
            StorageBackendType::Local => ResultsBackend::Local {
                dir: cli.results_dir,
            },
            StorageBackendType::S3 => ResultsBackend::S3 {
                bucket: cli.s3_bucket.ok_or(ConfigError::MissingBucket)?,
                prefix: cli.s3_prefix,
            },
        };

        let interval = Duration::from_secs(cli.poll_interval_secs);
        let config = Self {
            server: cli.server,
            log_file: cli.log_file,
            log_json: cli.log_json,
            root_dir: cli.root_dir,
            interpreter: cli.interpreter,
            poll: PollPolicy {
                interval,
                max_delay: Duration::from_secs(cli.max_backoff_secs).max(interval),
                multiplier: cli.backoff_multiplier,
            },
            job_timeout: cli.job_timeout_secs.map(Duration::from_secs),
            results,
        };

        config.validate()?;
        Ok(config)
    }
}
