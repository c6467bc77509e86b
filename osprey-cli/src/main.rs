//! `ospreyd` — the scanner daemon binary.
//!
//! Wires the library together for production use: a redis-backed store, the
//! external engine binary, startup initialisation and the periodic feed
//! check. Scan commands arrive through the protocol front-end, which drives
//! [`osprey::Daemon`] directly.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use osprey::daemon::{Daemon, DaemonConfig};
use osprey::engine::ExternalEngine;
use osprey::kv::RedisStore;

#[derive(Debug, Parser)]
#[command(name = "ospreyd", about = "OSP scanner daemon", version)]
struct Args {
    /// URL of the shared key-value store.
    #[arg(long, default_value = "redis://127.0.0.1:6379", env = "OSPREY_KV_URL")]
    kv_url: String,

    /// Path of the engine executable.
    #[arg(long, default_value = "vscan", env = "OSPREY_ENGINE")]
    engine: PathBuf,

    /// Path of the cross-process feed lock file.
    #[arg(long, default_value = "/var/run/osprey/feed-update.lock")]
    lock_file: PathBuf,

    /// Seconds between feed update checks.
    #[arg(long, default_value_t = 10)]
    feed_check_interval: u64,

    /// Niceness applied to engine processes.
    #[arg(long)]
    niceness: Option<i32>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!(error = %e, "daemon exited with an error");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> osprey::Result<()> {
    let store = Arc::new(RedisStore::open(&args.kv_url)?);
    let engine = Arc::new(ExternalEngine::new(&args.engine));

    let daemon = Daemon::new(
        store,
        engine,
        DaemonConfig {
            lock_path: args.lock_file,
            niceness: args.niceness,
        },
    )
    .await?;

    if !daemon.check().await {
        return Err(osprey::Error::EngineLaunch(format!(
            "engine executable {} not found",
            args.engine.display()
        )));
    }

    daemon.init().await?;
    info!(
        feed_version = ?daemon.feed_version(),
        collection_hash = %daemon.collection_hash(),
        "daemon initialised and ready"
    );

    let tick = Duration::from_secs(args.feed_check_interval.max(1));
    loop {
        tokio::select! {
            _ = tokio::time::sleep(tick) => daemon.scheduler().await,
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                return Ok(());
            }
        }
    }
}
