//! `crdata-node` -- processing node daemon.
//!
//! Polls a crdata server for queued jobs, runs each job's script through
//! the configured interpreter, stores its results, and reports the outcome.
//! Runs until SIGINT or SIGTERM. See [`crdata_node::config::Cli`] for the
//! options and their environment variables.

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use crdata_core::scripting::interpreter::InterpreterExecutor;
use crdata_node::config::{Cli, NodeConfig, ResultsBackend};
use crdata_node::node::ProcessingNode;
use crdata_node::{logging, store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = NodeConfig::try_from(cli).context("Invalid configuration")?;

    logging::init(&config.log_file, config.log_json)
        .with_context(|| format!("Failed to open log file {}", config.log_file.display()))?;

    // --- Working directories ---
    tokio::fs::create_dir_all(&config.root_dir)
        .await
        .with_context(|| format!("Failed to create root dir {}", config.root_dir.display()))?;
    if let ResultsBackend::Local { dir } = &config.results {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create results dir {}", dir.display()))?;
    }

    tracing::info!(
        server = %config.server,
        interpreter = %config.interpreter,
        backend = config.results.backend_type().name(),
        job_timeout_secs = config.job_timeout.map(|t| t.as_secs()),
        "Starting crdata-node",
    );

    let store = store::from_config(&config).await;
    let executor = InterpreterExecutor::for_interpreter(&config.interpreter);
    let node = ProcessingNode::new(&config, executor, store)?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_cancel.cancel();
    });

    node.run(cancel).await;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Wait for SIGINT (Ctrl-C) or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl-C, finishing current iteration"),
        _ = terminate => tracing::info!("Received SIGTERM, finishing current iteration"),
    }
}
