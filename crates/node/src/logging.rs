//! Tracing subscriber setup.
//!
//! Logs go to stdout and are appended to the configured log file. The
//! filter comes from `RUST_LOG`, falling back to [`DEFAULT_FILTER`].

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "crdata_node=info,crdata_client=info,crdata_core=info";

/// Install the global subscriber. Creates the log file's parent directory
/// if needed.
pub fn init(log_file: &Path, json: bool) -> std::io::Result<()> {
    if let Some(parent) = log_file.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let file = OpenOptions::new().create(true).append(true).open(log_file)?;
    let writer = Mutex::new(file);

    // Only one of the two file layers is installed.
    let (plain_file, json_file) = if json {
        (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer),
            ),
        )
    } else {
        (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(writer),
            ),
            None,
        )
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(plain_file)
        .with(json_file)
        .init();

    Ok(())
}
