//! Meshtenna
//!
//! Field harness for comparing antennas on a mesh node:
//! - `run` probes a fixed destination node and logs every acknowledged probe
//! - `scores` prints the antenna and location tables
//! - `delete` removes stored samples

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::{ArgGroup, Parser, Subcommand};
use tokio::sync::{broadcast, watch};
use tracing_subscriber::EnvFilter;

use meshtenna_agent::config::TestConfig;
use meshtenna_agent::persistence::PersistenceQueue;
use meshtenna_agent::portal::{self, PortalState};
use meshtenna_agent::samples;
use meshtenna_agent::scheduler::{ProbeScheduler, format_elapsed};
use meshtenna_agent::score::{ScoreEngine, SortKey, SortOrder};
use meshtenna_agent::storage::SqliteStorage;
use meshtenna_agent::transport::Transport;
use meshtenna_agent::transport::bridge::BridgeTransport;
use meshtenna_agent::transport::sim::SimTransport;
use meshtenna_common::protocol::{Notice, NoticeLevel};

#[derive(Parser, Debug)]
#[command(name = "meshtenna", about = "Antenna field test harness for mesh nodes")]
struct Cli {
    /// SQLite database holding the test samples.
    #[arg(long, global = true, default_value = "meshtenna.db")]
    database: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Probe the destination node until Ctrl-C or a portal stop request.
    Run {
        /// Test settings (TOML).
        #[arg(long)]
        config: PathBuf,

        /// Use the simulated radio instead of a gateway.
        #[arg(long, default_value_t = false)]
        simulate: bool,

        /// Seconds between probes; values below 30 are raised to 30.
        #[arg(long)]
        interval: Option<String>,

        /// Serve the status portal on this address.
        #[arg(long)]
        portal_addr: Option<SocketAddr>,
    },
    /// Print antenna and location scores.
    Scores {
        /// Only rank antennas tested at this location.
        #[arg(long)]
        location: Option<String>,

        /// Sort column: name, metric or score.
        #[arg(long, default_value = "score")]
        sort: SortKey,

        /// Sort ascending instead of descending.
        #[arg(long, default_value_t = false)]
        asc: bool,
    },
    /// Delete stored samples.
    #[command(group(ArgGroup::new("scope").required(true).args(["antenna", "location", "all"])))]
    Delete {
        /// Every sample of this antenna.
        #[arg(long)]
        antenna: Option<String>,

        /// Every sample taken at this location.
        #[arg(long)]
        location: Option<String>,

        /// Everything.
        #[arg(long, default_value_t = false)]
        all: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let queue = open_store(&cli.database).await?;

    match cli.command {
        Command::Run {
            config,
            simulate,
            interval,
            portal_addr,
        } => {
            let mut config = TestConfig::load(&config)?;
            if let Some(raw) = interval {
                config.set_interval(&raw);
            }

            tracing::info!(
                simulate,
                target = %config.target,
                database = %cli.database.display(),
                "meshtenna starting"
            );

            if simulate {
                run_test(SimTransport::default(), config, queue, portal_addr).await
            } else {
                run_test(BridgeTransport, config, queue, portal_addr).await
            }
        }
        Command::Scores {
            location,
            sort,
            asc,
        } => {
            let order = SortOrder {
                key: sort,
                descending: !asc,
            };
            print_scores(queue, location.as_deref(), order).await;
            Ok(())
        }
        Command::Delete {
            antenna,
            location,
            all,
        } => {
            let deleted = match (antenna, location) {
                (Some(antenna), _) => samples::delete_antenna(&queue, &antenna).await,
                (None, Some(location)) => samples::delete_location(&queue, &location).await,
                (None, None) if all => samples::delete_all(&queue).await,
                (None, None) => 0,
            };
            println!("deleted {deleted} samples");
            Ok(())
        }
    }
}

async fn open_store(path: &Path) -> anyhow::Result<PersistenceQueue<SqliteStorage>> {
    let storage = SqliteStorage::open(path).await?;
    storage.migrate().await?;
    Ok(PersistenceQueue::new(storage))
}

async fn run_test<T: Transport>(
    transport: T,
    config: TestConfig,
    queue: PersistenceQueue<SqliteStorage>,
    portal_addr: Option<SocketAddr>,
) -> anyhow::Result<()> {
    let (stop_tx, stop_rx) = watch::channel(false);
    let mut scheduler = ProbeScheduler::new(config, transport, queue.clone());

    // ── Notices ─────────────────────────────────────────────────
    let notices = scheduler.notices();
    tokio::spawn(log_notices(notices));

    // ── Portal (HTTP) ───────────────────────────────────────────
    if let Some(addr) = portal_addr {
        let state = PortalState::new(scheduler.subscribe(), stop_tx.clone(), queue);
        tokio::spawn(async move {
            if let Err(e) = portal::serve(addr, state).await {
                tracing::error!("portal failed: {e}");
            }
        });
    }

    // ── Shutdown handling ───────────────────────────────────────
    let signal_stop = stop_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received SIGINT, stopping test");
            signal_stop.send_replace(true);
        }
    });

    let summary = scheduler.run(stop_rx).await?;
    tracing::info!(
        sent = summary.sent,
        acked = summary.acked,
        elapsed = %format_elapsed(summary.elapsed),
        "meshtenna stopped"
    );
    Ok(())
}

async fn log_notices(mut notices: broadcast::Receiver<Notice>) {
    loop {
        match notices.recv().await {
            Ok(Notice { level, message }) => match level {
                NoticeLevel::Info => tracing::info!(notice = %message),
                NoticeLevel::Error => tracing::error!(notice = %message),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "notice log lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn print_scores(
    queue: PersistenceQueue<SqliteStorage>,
    location: Option<&str>,
    order: SortOrder,
) {
    let engine = ScoreEngine::new(queue);

    let antennas = engine.antenna_scores(location, order).await;
    println!(
        "{:<28} {:<20} {:>10} {:>6}",
        "ANTENNA", "LOCATION", "AVG RSSI", "SCORE"
    );
    for row in &antennas {
        println!(
            "{:<28} {:<20} {:>10.2} {:>6.1}",
            row.antenna_name, row.location, row.avg_rssi, row.score
        );
    }

    println!();

    let locations = engine.location_scores(order).await;
    println!(
        "{:<28} {:>10} {:>6}  {}",
        "LOCATION", "AVG SNR", "SCORE", "BEST ANTENNA"
    );
    for row in &locations {
        println!(
            "{:<28} {:>10.2} {:>6.1}  {}",
            row.location,
            row.avg_snr,
            row.score,
            row.best_antenna.as_deref().unwrap_or("-")
        );
    }
}
