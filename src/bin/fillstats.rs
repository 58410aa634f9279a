use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use hyperliquid_fillstats::aggregator::{Aggregator, SharedAggregator};
use hyperliquid_fillstats::config::{AppConfig, CONFIG_PATH, Transport};
use hyperliquid_fillstats::pipeline::{self, Pipeline};
use hyperliquid_fillstats::publisher::Publisher;
use hyperliquid_fillstats::types::GroupBy;
use hyperliquid_fillstats::{reporter, server, upstream};

#[derive(Parser)]
#[command(name = "fillstats", about = "Live fill statistics aggregator and dashboard backend")]
struct Args {
    /// Path to the TOML config file
    #[arg(long, default_value = CONFIG_PATH)]
    config: PathBuf,

    /// Override the upstream transport from the config
    #[arg(long, value_enum)]
    transport: Option<Transport>,

    /// Start the first connection at this block height (gRPC only)
    #[arg(long, conflicts_with = "timestamp")]
    block: Option<u64>,

    /// Start the first connection at this Unix timestamp in milliseconds (gRPC only)
    #[arg(long)]
    timestamp: Option<u64>,

    /// Override the grouping dimension from the config
    #[arg(long, value_enum)]
    group_by: Option<GroupBy>,

    /// Also print every published update as a JSON line on stdout
    #[arg(long)]
    stdout: bool,

    /// Write the effective config to --config and exit
    #[arg(long)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    dotenvy::dotenv().ok();

    let mut config = AppConfig::load_or_default(&args.config)?;
    config.apply_env_overrides()?;
    if let Some(transport) = args.transport {
        config.stream.transport = transport;
    }
    if let Some(group_by) = args.group_by {
        config.stream.group_by = group_by;
    }
    if let Some(block) = args.block {
        config.stream.start_block = Some(block);
        config.stream.start_timestamp_ms = None;
    }
    if let Some(ts) = args.timestamp {
        config.stream.start_timestamp_ms = Some(ts);
        config.stream.start_block = None;
    }
    if args.init_config {
        config.save(&args.config)?;
        info!("Wrote config to {}", args.config.display());
        return Ok(());
    }
    config.validate()?;

    info!(
        "Starting fillstats: transport={:?} endpoint={} start={:?} group_by={:?} known_builders={} publish_interval={}ms",
        config.stream.transport,
        config.stream.endpoint,
        config.stream.start_position(),
        config.stream.group_by,
        config.builders.len(),
        config.publish.min_interval_ms,
    );

    let stats = SharedAggregator::new(Aggregator::new(
        &config.aggregator,
        config.builder_directory(),
    ));
    let publisher = Publisher::new(stats.clone(), config.publish.channel_capacity);
    let pipeline = Pipeline::new(
        stats.clone(),
        publisher.clone(),
        Duration::from_millis(config.publish.min_interval_ms),
    );

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                // Dropping the sender would read as a shutdown request.
                warn!("Cannot listen for Ctrl+C: {e}");
                std::future::pending::<()>().await;
            }
        }
    });

    let listener = server::bind(&config.server).await?;
    let server_task = tokio::spawn(server::serve(
        listener,
        publisher.clone(),
        shutdown_rx.clone(),
    ));

    if args.stdout {
        let mut subscription = publisher.subscribe();
        tokio::spawn(async move {
            while let Some(update) = subscription.recv().await {
                reporter::report_update(&update);
            }
        });
    }

    info!("Streaming fills. Press Ctrl+C to stop.");
    let stream_config = &config.stream;
    let configured_start = stream_config.start_position();
    // The start point holds until an event lands; later reconnects stream from latest.
    let connect_stats = stats.clone();
    pipeline::supervise(
        &pipeline,
        move || {
            let start = configured_start.filter(|_| connect_stats.counters().accepted == 0);
            upstream::connect(stream_config, start)
        },
        Duration::from_secs(config.stream.reconnect_delay_secs),
        &mut shutdown_rx,
    )
    .await;

    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Server exited with error: {e:#}"),
        Err(e) => warn!("Server task failed: {e}"),
    }

    // --- Exit summary ---
    let snapshot = stats.snapshot();
    info!(
        "Processed {} events ({} duplicates, {} parse warnings) across {} keys",
        snapshot.counters.accepted,
        snapshot.counters.duplicates,
        snapshot.counters.parse_warnings,
        snapshot.entries.len(),
    );
    reporter::report_exit_summary(&snapshot);

    Ok(())
}
