//! Probe: upstream fill stream
//!
//! Connects to the configured fill stream and:
//! - Prints decoded fills (or only liquidations) as they arrive
//! - Folds them into a local aggregator
//! - Stops after a duration, an event count, or Ctrl+C
//! - Prints a session summary grouped by the configured key

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;

use hyperliquid_fillstats::aggregator::Aggregator;
use hyperliquid_fillstats::config::{AppConfig, CONFIG_PATH, Transport};
use hyperliquid_fillstats::types::{GroupBy, RecentEvent};
use hyperliquid_fillstats::{reporter, upstream};

#[derive(Parser)]
#[command(name = "probe_stream", about = "Print decoded fills from the upstream stream")]
struct Args {
    /// Stream endpoint (overrides config and HYPERLIQUID_ENDPOINT)
    #[arg(long)]
    endpoint: Option<String>,

    /// Upstream transport (overrides config)
    #[arg(long, value_enum)]
    transport: Option<Transport>,

    /// Start from this block height (gRPC only)
    #[arg(long, conflicts_with_all = ["timestamp", "minutes_ago"])]
    block: Option<u64>,

    /// Start from this Unix timestamp in milliseconds (gRPC only)
    #[arg(long, conflicts_with = "minutes_ago")]
    timestamp: Option<u64>,

    /// Start this many minutes in the past (gRPC only)
    #[arg(long)]
    minutes_ago: Option<u64>,

    /// Path to the TOML config file
    #[arg(long, default_value = CONFIG_PATH)]
    config: PathBuf,

    /// Seconds to listen before stopping (0 = until Ctrl+C)
    #[arg(long, default_value_t = 30)]
    duration: u64,

    /// Stop after N printed events (0 = unlimited)
    #[arg(short, long, default_value_t = 0)]
    count: u64,

    /// Grouping dimension for the summary
    #[arg(long, value_enum)]
    group_by: Option<GroupBy>,

    /// Only print liquidation fills
    #[arg(long)]
    liquidations_only: bool,

    /// Print a stats line every N accepted events (0 = never)
    #[arg(long, default_value_t = 100)]
    stats_interval: u64,

    /// Increase detail (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print events as JSON lines instead of text
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    dotenvy::dotenv().ok();

    let mut config = AppConfig::load_or_default(&args.config)?;
    config.apply_env_overrides()?;
    if let Some(endpoint) = args.endpoint {
        config.stream.endpoint = endpoint;
    }
    if let Some(transport) = args.transport {
        config.stream.transport = transport;
    }
    if let Some(group_by) = args.group_by {
        config.stream.group_by = group_by;
    }
    let minutes_ago = args.minutes_ago.map(|minutes| {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        now.saturating_sub(minutes.saturating_mul(60_000))
    });
    if let Some(ts) = args.timestamp.or(minutes_ago) {
        config.stream.start_timestamp_ms = Some(ts);
        config.stream.start_block = None;
    }
    if let Some(block) = args.block {
        config.stream.start_block = Some(block);
        config.stream.start_timestamp_ms = None;
    }
    config.validate()?;

    println!("=== Probe: fill stream ===");
    println!("Endpoint: {} ({:?})", config.stream.endpoint, config.stream.transport);
    match config.stream.start_position() {
        Some(start) => println!("Starting from {start:?}"),
        None => println!("Starting from latest"),
    }
    if config.stream.api_key.is_some() {
        println!("Using API key authentication");
    }
    println!("Grouping by: {:?}", config.stream.group_by);
    if args.liquidations_only {
        println!("Showing liquidations only");
    }
    if args.count > 0 {
        println!("Will stop after {} events", args.count);
    }
    println!();

    println!("--- Connecting ---");
    let mut source = upstream::connect(&config.stream, config.stream.start_position()).await?;
    println!("Connected!");
    println!();

    let mut aggregator = Aggregator::new(&config.aggregator, config.builder_directory());
    let deadline = (args.duration > 0).then(|| Instant::now() + Duration::from_secs(args.duration));
    let start = Instant::now();
    let mut printed = 0u64;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let remaining = match deadline {
            Some(d) => d.saturating_duration_since(Instant::now()),
            None => Duration::from_secs(3600),
        };
        if remaining.is_zero() {
            println!("Duration elapsed, stopping...");
            break;
        }

        let next = tokio::select! {
            _ = &mut ctrl_c => {
                println!("\nStopping stream...");
                break;
            }
            next = tokio::time::timeout(remaining, source.next_event()) => next,
        };

        let event = match next {
            Ok(Ok(Some(event))) => event,
            Ok(Ok(None)) => {
                println!("Stream ended");
                break;
            }
            Ok(Err(e)) => {
                println!("Stream error: {e}");
                break;
            }
            Err(_) => continue, // deadline reached, loop re-checks
        };

        let is_liquidation = event.is_liquidation();
        if !aggregator.ingest(event).is_accepted() {
            if args.verbose >= 2 {
                println!("[{:.1}s] duplicate", start.elapsed().as_secs_f64());
            }
            continue;
        }

        let accepted = aggregator.counters().accepted;
        if args.stats_interval > 0 && accepted % args.stats_interval == 0 {
            let totals = aggregator.global_totals();
            println!(
                "Stats: {} events | {} liquidations | ${} volume | {:.1} events/sec",
                totals.trades,
                totals.liquidations,
                totals.volume.round_dp(2),
                accepted as f64 / start.elapsed().as_secs_f64().max(0.001),
            );
        }

        if args.liquidations_only && !is_liquidation {
            continue;
        }
        printed += 1;
        if let Some(latest) = aggregator.last_accepted() {
            if args.json {
                reporter::report_event(latest);
            } else {
                println!("{}", format_event(latest, printed, args.verbose));
                println!();
            }
        }
        if args.count > 0 && printed >= args.count {
            println!("Reached {} events, stopping...", args.count);
            break;
        }
    }

    let s = source.stats();
    let snapshot = aggregator.snapshot();
    println!();
    println!("--- Session Summary ---");
    println!("Duration: {:.1}s", start.elapsed().as_secs_f64());
    println!("Payloads received: {}", s.payloads);
    println!("Decode errors: {}", s.decode_errors);
    println!("Fills skipped (no key): {}", s.skipped_fills);
    println!("Fills invalid: {}", s.invalid_fills);
    println!(
        "Events accepted: {} ({} duplicates, {} parse warnings)",
        snapshot.counters.accepted, snapshot.counters.duplicates, snapshot.counters.parse_warnings
    );
    println!("Total volume: ${}", snapshot.totals.volume.round_dp(2));
    println!("Total USD fees: ${}", snapshot.totals.fees.round_dp(4));
    println!("Liquidations: {}", snapshot.totals.liquidations);

    if !snapshot.entries.is_empty() {
        println!();
        println!("By {:?}:", config.stream.group_by);
        for entry in snapshot.entries.iter().take(20) {
            println!(
                "  {}: {} trades, ${} volume, ${} fees, {} users, {} liquidations",
                entry.name,
                entry.trade_count,
                entry.total_volume_usd.round_dp(2),
                entry.total_fees_usd.round_dp(4),
                entry.unique_users,
                entry.liquidation_count,
            );
        }
    }
    println!();

    if args.json {
        reporter::report_exit_summary(&snapshot);
    }

    println!("=== Probe Complete ===");
    Ok(())
}

fn format_event(event: &RecentEvent, n: u64, verbosity: u8) -> String {
    let coin = event.coin.as_deref().unwrap_or("?");
    let side = match event.side.as_deref() {
        Some("B") => "LONG",
        Some("A") => "SHORT",
        Some(other) => other,
        None => "?",
    };
    let label = if event.liquidation.is_some() {
        "LIQUIDATION"
    } else {
        "FILL"
    };

    let mut lines = vec![
        format!("{label} #{n}: {coin} {side}"),
        format!("   Size: {} @ ${}", event.size, event.price),
    ];

    if verbosity >= 1 {
        lines.push(format!(
            "   P&L: ${} | Fee: {} {}",
            event.closed_pnl,
            event.fee,
            event.fee_token.as_deref().unwrap_or("?")
        ));
        if let Some(block) = event.block_number {
            lines.push(format!("   Block: #{block}"));
        }
    }

    if verbosity >= 2 {
        lines.push(format!("   Key: {}", event.key));
        if !event.participant.is_empty() {
            lines.push(format!("   User: {}", event.participant));
        }
        if let Some(liq) = &event.liquidation {
            lines.push(format!(
                "   Mark: ${} | Method: {}",
                liq.mark_px.as_deref().unwrap_or("?"),
                liq.method.as_deref().unwrap_or("?")
            ));
        }
    }

    lines.join("\n")
}
