//! dxwatch CLI - Follow live DX spots from a cluster node or WSJT-X.

use anyhow::{Context, Result};
use clap::Parser;
use dxwatch::{
    config::Config,
    ingest::{SpotIngestion, SpotSink},
    metrics::start_metrics_server,
    persist::JsonFileStore,
    session::TransportKind,
    store::StoredSpot,
    watchlist::Disposition,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// dxwatch - Follow live DX spots from a DX cluster or WSJT-X
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (defaults to the platform config directory)
    #[arg(long, env = "DXWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Callsign used for the cluster login
    #[arg(short, long, env = "DXWATCH_CALLSIGN")]
    callsign: Option<String>,

    /// Cluster hostname
    #[arg(long, env = "DXWATCH_HOST")]
    host: Option<String>,

    /// Cluster port
    #[arg(long, env = "DXWATCH_PORT")]
    port: Option<u16>,

    /// Listen for WSJT-X status datagrams instead of a cluster
    #[arg(long)]
    wsjtx: bool,

    /// Print statistics every N seconds (0 = never)
    #[arg(short, long)]
    stats_interval: Option<u64>,

    /// Print each stored spot
    #[arg(short, long)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Disable auto-reconnect
    #[arg(long)]
    no_reconnect: bool,

    /// Serve Prometheus metrics on this port
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Maximum runtime in seconds (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    max_runtime: u64,
}

/// Prints stored spots and connection errors to the terminal.
struct ConsoleSink {
    verbose: bool,
}

impl SpotSink for ConsoleSink {
    fn new_spot(&mut self, stored: &StoredSpot) {
        if stored.disposition == Disposition::Highlight {
            println!("* {}", stored.spot);
        } else if self.verbose {
            println!("  {}", stored.spot);
        }
    }

    fn connection_error(&mut self, message: &str) {
        error!("{}", message);
    }
}

fn apply_args(config: &mut Config, args: &Args) {
    if let Some(callsign) = &args.callsign {
        config.callsign = callsign.to_ascii_uppercase();
    }
    if let Some(host) = &args.host {
        config.cluster.host = host.clone();
    }
    if let Some(port) = args.port {
        config.cluster.port = port;
    }
    if args.wsjtx {
        config.source = TransportKind::UdpWsjtx;
    }
    if let Some(interval) = args.stats_interval {
        config.stats_interval = interval;
    }
    if args.no_reconnect {
        config.auto_reconnect = false;
    }
    if let Some(port) = args.metrics_port {
        config.metrics_enabled = true;
        config.metrics_port = port;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut config = Config::load(args.config.as_deref())?;
    apply_args(&mut config, &args);
    config.validate()?;

    info!("dxwatch starting...");
    info!("Callsign: {}", config.callsign);
    match config.source {
        TransportKind::TcpClusterText => {
            info!("Cluster: {}:{}", config.cluster.host, config.cluster.port)
        }
        TransportKind::UdpWsjtx => {
            info!("WSJT-X: {}:{}", config.wsjtx.address, config.wsjtx.port)
        }
    }

    let state_path = config.state_path();
    let kv = JsonFileStore::open(&state_path)
        .with_context(|| format!("Failed to open state file {}", state_path.display()))?;

    let resolver = config.prefix_table();
    if resolver.is_empty() {
        warn!("No [locations] configured, cluster spots cannot be located");
    }

    let mut ingest = SpotIngestion::new(
        config.session_config(),
        config.ingest_options(),
        Box::new(resolver),
        Box::new(kv),
        Box::new(ConsoleSink {
            verbose: args.verbose,
        }),
    );

    for (id, list) in config.watch_lists()? {
        ingest.set_watch_list(id, list.state(), list.spec())?;
    }

    if config.metrics_enabled {
        let stats = ingest.stats();
        let port = config.metrics_port;
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(port, stats).await {
                error!("Metrics server failed: {}", e);
            }
        });
    }

    let started = ingest.start().await;
    if let Err(e) = started
        && !ingest.reconnect_pending()
    {
        return Err(e.into());
    }

    let mut poll = tokio::time::interval(Duration::from_millis(config.poll_interval_ms.max(10)));
    let stats_period = Duration::from_secs(config.stats_interval.max(1));
    let mut stats_tick = tokio::time::interval_at(
        tokio::time::Instant::now() + stats_period,
        stats_period,
    );
    let deadline = async {
        if args.max_runtime > 0 {
            tokio::time::sleep(Duration::from_secs(args.max_runtime)).await;
            info!("Max runtime reached");
        } else {
            std::future::pending::<()>().await;
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }

            _ = &mut deadline => break,

            _ = poll.tick() => {
                // Failures are already reported through the sink.
                let _ = ingest.poll().await;
                if ingest.is_halted() {
                    warn!("Giving up until restarted");
                    break;
                }
                if !config.auto_reconnect && !ingest.session().state().is_connected() {
                    break;
                }
            }

            _ = stats_tick.tick(), if config.stats_interval > 0 => {
                println!("\n{}", ingest.stats().summary());
            }
        }
    }

    ingest.stop().await;

    println!("\n\nFINAL STATISTICS");
    println!("{}", ingest.stats().summary());

    Ok(())
}
