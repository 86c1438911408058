use std::io::IsTerminal;

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

use liquid_lake::{CliArgs, DemoConfig, Pipeline};

fn main() -> Result<()> {
    let ansi = std::io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = CliArgs::parse().into_config()?;
    // Show every row a query returns instead of polars' head/tail elision.
    // Set while the process is still single threaded.
    std::env::set_var("POLARS_FMT_MAX_ROWS", config.display_limit.to_string());

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(config))
}

async fn async_main(config: DemoConfig) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("shutdown requested");
            let _ = shutdown_tx.send(true);
        }
    });

    info!(table = %config.table_name, records = config.record_count, cluster_by = ?config.cluster_columns, "starting liquid clustering demo");
    match Pipeline::new(config, shutdown_rx).run().await {
        Ok(summary) => {
            info!(
                version = summary.table.version,
                updated = summary.metrics.num_target_rows_updated,
                inserted = summary.metrics.num_target_rows_inserted,
                dropped = summary.dropped,
                "demo finished"
            );
            Ok(())
        },
        Err(e) => {
            error!(stage = %e.stage, error = %e.source, "demo aborted");
            Err(e.into())
        },
    }
}
