//! Alert consumer
//!
//! Reads a JSON-lines alert file, filters every alert through the configured
//! channels and ingests accepted ones into the SQLite store. Fully rejected
//! alerts go to the binary rejection register.
//!
//! Usage:
//!   ALERTFLOW_ALERTS=alerts.jsonl cargo run --release --bin alert_consumer
//!
//! Environment variables: see `PipelineConfig::from_env`. Set
//! `ALERTFLOW_MATCH_IDS` (comma separated alert ids) to replay a subset.

use alertflow::alert::{AlertSupplier, FilteringAlertSupplier, JsonlAlertSupplier};
use alertflow::config::PipelineConfig;
use alertflow::error::ConfigError;
use alertflow::filter::PredicateRegistry;
use alertflow::AlertConsumer;
use dotenv::dotenv;
use log::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = PipelineConfig::from_env()?;
    let alerts_path = config.require_alerts_path()?.to_string();

    info!("🚀 Alert consumer starting");
    info!("   ├─ Alerts: {}", alerts_path);
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Directives: {}", config.directives_path);
    info!("   ├─ Register: {}/{}.bin ({})", config.register_dir, config.register_prefix, config.register_layout);
    info!("   └─ Buffer: {} alerts, parallel filters: {}", config.updates_buffer_size, config.parallel_filters);

    let registry = PredicateRegistry::with_builtins();
    let mut consumer = AlertConsumer::from_config(&config, &registry)?;

    let stop = consumer.stop_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("⚠️  Received CTRL+C, stopping after the current alert...");
                stop.stop();
            }
            Err(err) => error!("❌ Failed to listen for CTRL+C: {}", err),
        }
    });

    let supplier = JsonlAlertSupplier::open(&alerts_path).map_err(ConfigError::from)?;

    let result = match std::env::var("ALERTFLOW_MATCH_IDS").ok() {
        Some(ids) => {
            let ids: Vec<u64> = ids.split(',').filter_map(|id| id.trim().parse().ok()).collect();
            let supplier = FilteringAlertSupplier::new(supplier, ids);
            info!("📂 Replaying selected alerts through {}", supplier.name());
            consumer.run(supplier).await
        }
        None => consumer.run(supplier).await,
    };

    match result {
        Ok(report) => {
            info!("✅ Run {} complete", report.run_id);
            Ok(())
        }
        Err(e) => {
            error!("❌ Run failed: {}", e);
            Err(e.into())
        }
    }
}
