//! StatMon daemon entry point.

use statmon::alerting::AlertManager;
use statmon::config::MonitorConfig;
use statmon::db::Store;
use statmon::health::HealthEvaluator;
use statmon::monitor::Monitor;
use statmon::scheduler::Scheduler;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("statmon=info".parse()?))
        .init();

    // Load configuration
    let cfg = MonitorConfig::load();
    tracing::info!("Starting StatMon daemon...");
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!(
        "Database initialized successfully ({} station(s))",
        store.get_stations()?.len()
    );

    let monitor = Monitor::new(store.clone(), cfg.ping.clone());
    let evaluator = HealthEvaluator::new(store.clone(), cfg.health.clone());
    let alert_manager = AlertManager::new(store.clone(), cfg.alert_webhook.clone());

    let mut scheduler = Scheduler::new(monitor, evaluator, alert_manager, &cfg);
    scheduler.start();

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down daemon...");
    scheduler.stop().await;

    Ok(())
}
