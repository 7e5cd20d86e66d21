use std::sync::Arc;

use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use vctsdb_cq::cluster::{LeaseGate, LocalMetaStore, MetaStore};
use vctsdb_cq::config::Config;
use vctsdb_cq::continuous::ContinuousQueryService;
use vctsdb_cq::metrics;
use vctsdb_cq::query::engine::DryRunEngine;

const CONFIG_ENV: &str = "VCTSDB_CQ_CONFIG";
const CATALOG_ENV: &str = "VCTSDB_CQ_CATALOG";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_ansi(true)
        .pretty()
        .init();

    let config = match std::env::var(CONFIG_ENV) {
        Ok(path) => Config::from_file(&path)?,
        Err(_) => Config::default(),
    };

    if let Some(addr) = config.metrics_addr {
        if let Err(e) = metrics::init_metrics(addr) {
            error!("Failed to initialize metrics: {}", e);
        } else {
            info!("Metrics server listening on {}", addr);
        }
    }

    let meta: Arc<LocalMetaStore> = match std::env::var(CATALOG_ENV) {
        Ok(path) => Arc::new(LocalMetaStore::from_file(&path, config.lease_duration)?),
        Err(_) => {
            info!("{} not set, starting with an empty catalog", CATALOG_ENV);
            Arc::new(LocalMetaStore::new(config.lease_duration))
        }
    };
    let meta: Arc<dyn MetaStore> = meta;
    let gate = Arc::new(LeaseGate::new(meta.clone(), &config.lease_name, config.node_id));

    info!("Starting VCTSDB continuous queries on node {}...", config.node_id);
    let service = ContinuousQueryService::new(config, meta, gate, Arc::new(DryRunEngine));
    service.open()?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    service.close().await?;
    Ok(())
}
