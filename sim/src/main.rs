//! Replica Sim - scripted multi-device run of the sync core
//!
//! Usage: `replica-sim [config.json] [data-dir]`
//!
//! Log verbosity is controlled through `RUST_LOG`.

mod scenario;

use anyhow::Context;
use replica::SyncConfig;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => SyncConfig::load(&path)
            .await
            .with_context(|| format!("Failed to load sync config from {}", path))?,
        // Short period so the scheduled passes finish quickly
        None => SyncConfig::default().with_periodic_interval(Duration::from_secs(1)),
    };
    let data_dir = args.next().map(PathBuf::from);

    tracing::info!("Starting replica sim");
    scenario::run(config, data_dir).await?;
    tracing::info!("Replica sim finished");
    Ok(())
}
