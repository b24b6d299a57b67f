use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use pfstatsd::agent::Agent;
use pfstatsd::config::Config;
use pfstatsd::graphite::{FlushPolicy, MetricSession, ReliableTransport, TransportConfig};
use pfstatsd::ping::{ExitAfterPolicy, LossSummary, PingEvent, Pinger};

/// Ships pf queue statistics and ICMP probe results to Graphite.
#[derive(Parser)]
#[command(name = "pfstatsd", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Overrides `log_level` from the config file.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,

    /// Send a single metric and exit.
    Post {
        /// Collector as host[:port]; IPv6 as [addr]:port.
        address: String,
        /// Metric name.
        key: String,
        value: f64,
        /// Seconds since the Unix epoch. Default: now.
        timestamp: Option<f64>,
        /// Namespace prefixed to the key.
        #[arg(short, long, default_value = "")]
        namespace: String,
        /// Give up after this many seconds without a connection.
        #[arg(long, default_value_t = 10.0)]
        timeout: f64,
    },

    /// Probe a destination and print each response.
    Ping {
        destination: String,
        /// Stop after this many seconds.
        #[arg(short = 't', long)]
        time_limit: Option<f64>,
        /// Stop after this many responses.
        #[arg(short = 'c', long)]
        count: Option<u64>,
    },
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn init_tracing(level: &str) -> Result<()> {
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    Ok(())
}

fn seconds(value: f64, flag: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("invalid {flag}: {value}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("pfstatsd {}", version::full());
        return Ok(());
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    match cli.command {
        Some(Command::Post {
            address,
            key,
            value,
            timestamp,
            namespace,
            timeout,
        }) => {
            init_tracing(cli.log_level.as_deref().unwrap_or("warn"))?;
            let timeout = seconds(timeout, "--timeout")?;
            rt.block_on(post_once(&address, &namespace, &key, value, timestamp, timeout))
        }
        Some(Command::Ping {
            destination,
            time_limit,
            count,
        }) => {
            init_tracing(cli.log_level.as_deref().unwrap_or("warn"))?;
            let time_limit = time_limit
                .map(|limit| seconds(limit, "--time-limit"))
                .transpose()?;
            rt.block_on(ping(&destination, time_limit, count))
        }
        Some(Command::Version) | None => {
            // Config is required for the main agent run.
            let config_path = cli
                .config
                .context("--config is required (use --help for usage)")?;

            let cfg = Config::load(&config_path)
                .with_context(|| format!("loading config from {}", config_path.display()))?;

            init_tracing(cli.log_level.as_deref().unwrap_or(&cfg.log_level))?;

            tracing::info!(
                version = version::RELEASE,
                commit = version::git_commit(),
                "starting pfstatsd",
            );

            rt.block_on(run(cfg))
        }
    }
}

async fn run(cfg: Config) -> Result<()> {
    // Set up signal handling.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    // Start the agent.
    let mut agent = Agent::new(cfg)?;
    agent.start().await?;

    // Wait for a shutdown signal or the configured time limit.
    tokio::select! {
        _ = shutdown_rx => {}
        _ = agent.finished() => {}
    }

    // Graceful shutdown.
    agent.stop().await?;

    tracing::info!("pfstatsd stopped");

    Ok(())
}

async fn post_once(
    address: &str,
    namespace: &str,
    key: &str,
    value: f64,
    timestamp: Option<f64>,
    timeout: Duration,
) -> Result<()> {
    let config = TransportConfig::from_address(address, Duration::from_secs(1))
        .with_context(|| format!("parsing address {address:?}"))?;
    let session =
        MetricSession::new(namespace, FlushPolicy::manual()).context("creating session")?;
    let transport = ReliableTransport::new(config, session, None);

    transport
        .post(key, value, timestamp, None)
        .await
        .context("buffering metric")?;

    let sent = tokio::time::timeout(timeout, async {
        transport.connect().await?;
        transport.flush(true).await
    })
    .await;
    transport.close().await;

    match sent {
        Ok(result) => {
            let count = result.context("sending metric")?;
            tracing::info!(count, "metric sent");
            Ok(())
        }
        Err(_) => bail!("no connection to {address} within {timeout:?}"),
    }
}

async fn ping(destination: &str, time_limit: Option<Duration>, count: Option<u64>) -> Result<()> {
    let policy = ExitAfterPolicy::from_limits(count, time_limit);
    let mut probe = Pinger::default()
        .probe(destination, policy)
        .with_context(|| format!("starting ping for {destination}"))?;
    let mut summary = LossSummary::default();

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                probe.cancel().await.context("stopping ping")?;
                break;
            }
            event = probe.next() => event,
        };

        match event {
            None => break,
            Some(Ok(PingEvent::Preamble(preamble))) => {
                println!("PING {} ({})", preamble.host, preamble.ip);
            }
            Some(Ok(PingEvent::Response(response))) => {
                summary.record(&response);
                println!("{response}");
            }
            Some(Err(e)) => return Err(e).context("ping failed"),
        }
    }

    println!(
        "{} responses, {} lost, {:.1}% packet loss",
        summary.responses,
        summary.lost,
        summary.loss_percent(),
    );

    Ok(())
}
