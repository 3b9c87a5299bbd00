mod cli;
mod decode;
mod metrics;
mod monitor;
mod node;
mod store;
#[cfg(test)]
mod test_utils;

use cli::MonitorConfig;
use decode::EventRegistry;
use eyre::Result;
use monitor::{CacheMonitor, MonitorOptions};
use node::FailoverClient;
use std::sync::Arc;
use std::time::Duration;
use store::pg::PgStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let config = MonitorConfig::from_args();
    init_tracing(config.verbosity);

    info!(
        blockchain_id = %config.blockchain_id,
        endpoints = config.rpc_urls.len(),
        start_block = ?config.start_block,
        end_block = ?config.end_block,
        "starting chain cache monitor"
    );

    let registry = match &config.abi_config {
        Some(path) => {
            let registry = EventRegistry::load(path)?;
            info!(events = registry.len(), path = %path.display(), "loaded ABI event config");
            registry
        }
        None => EventRegistry::empty(),
    };

    let store = PgStore::connect(&config.db_url).await?;
    store.ensure_schema().await?;
    info!("database schema ready");

    let client = FailoverClient::new(
        &config.rpc_urls,
        Duration::from_millis(config.rpc_timeout_ms),
    )?;

    let monitor = CacheMonitor::new(
        Arc::new(store),
        Arc::new(client),
        Arc::new(registry),
        MonitorOptions::from(&config),
    );
    monitor.run().await
}

fn init_tracing(verbosity: u8) {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let (global, local) = match verbosity {
                0 => ("warn", "info"),
                1 => ("warn", "debug"),
                _ => ("warn", "trace"),
            };
            EnvFilter::new(format!("{global},chain_cache_monitor={local}"))
        }
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
