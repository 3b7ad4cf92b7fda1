//! Export fan-out worker - Main entry point

use anyhow::Result;
use export_common::logging::{init_logging, LogConfig};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use export_fanout::config::{FileProcessorConfig, LocalConfig};
use export_fanout::local;
use export_fanout::FileProcessor;

#[tokio::main]
async fn main() -> Result<()> {
    let log_config = LogConfig::builder()
        .log_file_prefix("export-fanout")
        .filter_directives("export_fanout=debug,export_common=info")
        .build()
        .merge_env()?;

    let _guard = init_logging(&log_config)?;

    info!("Starting export fan-out worker");

    let config = FileProcessorConfig::from_env()?;
    let local_config = LocalConfig::from_env()?;
    info!(
        instances = config.instance_count,
        data_root = %local_config.data_root.display(),
        output_dir = %local_config.output_dir.display(),
        "Configuration loaded"
    );

    let backends = local::collaborators(&config, &local_config).await?;
    local::seed_inbox(
        &local_config.data_root,
        backends.queue.as_ref(),
        &config.size_thresholds,
    )
    .await?;

    let processor = Arc::new(FileProcessor::new(config, backends.collaborators)?);
    info!(
        instances = processor.assignment().instance_count(),
        "File processor starting"
    );

    let cancel = CancellationToken::new();
    let handles = processor.clone().start(cancel.clone());

    shutdown_signal().await;
    cancel.cancel();

    for result in futures::future::join_all(handles).await {
        if let Err(e) = result {
            error!(error = %e, "File processor task panicked");
        }
    }

    let completed = backends.completions.records().await.len();
    info!(completed, "Export fan-out worker shut down gracefully");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }
}
