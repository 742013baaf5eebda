use anyhow::Result;
use n6_config::Config;

/// Initialize the logging system.
pub fn init_logging(config: &Config) {
    n6_log::init(config.logging());
}

/// Print spawn infos to the log.
pub fn dump_spawn_infos(config: &Config) {
    let aggregator = config.aggregator();

    n6_log::info!(
        "launching {} from config folder {}",
        n6_log::RELEASE,
        config.path().display()
    );
    n6_log::info!("  index file: {}", aggregator.index_path().display());
    n6_log::info!("  payload storage: {}", aggregator.storage_path().display());
    n6_log::info!("  time tolerance: {}s", aggregator.time_tolerance);
    match aggregator.restart_threshold() {
        Some(threshold) => n6_log::info!("  restart after: {threshold} finished groups"),
        None => n6_log::info!("  restart after: -"),
    };
    n6_log::info!("  log level: {}", config.logging().level);
}

/// Initialize the metric system.
pub fn init_metrics(config: &Config) -> Result<()> {
    let Some(metrics_config) = config.metrics_config() else {
        return Ok(());
    };

    n6_statsd::init(metrics_config)?;
    Ok(())
}

/// Resolves once the process receives `SIGINT` or `SIGTERM`.
pub async fn shutdown_signal() {
    let interrupt = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            n6_log::error!("failed to listen for SIGINT: {}", n6_log::LogError(&error));
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(error) => {
                n6_log::error!("failed to listen for SIGTERM: {}", n6_log::LogError(&error));
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = interrupt => n6_log::info!("received SIGINT"),
        () = terminate => n6_log::info!("received SIGTERM"),
    }
}
