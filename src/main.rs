use anyhow::{Context as _, Result};
use serde::Serialize;
use tracing::{error, info};

use dbresolver::config::Config;
use dbresolver::pool::PoolStats;
use dbresolver::{Context, DriverRegistry, LogicalDb};

#[derive(Debug, Serialize)]
struct HealthReport {
    status: &'static str,
    driver: String,
    connections: usize,
    pools: Vec<PoolReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct PoolReport {
    role: &'static str,
    #[serde(flatten)]
    stats: PoolStats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(config.log_level.clone())
        .with_writer(std::io::stderr)
        .init();

    info!("dbresolver v{}", env!("CARGO_PKG_VERSION"));

    let registry = DriverRegistry::with_defaults();
    let db = LogicalDb::connect(&registry, &config)
        .await
        .with_context(|| format!("Failed to open {} databases", config.driver))?;
    info!(
        "Opened {} {} connection(s)",
        db.connection_count(),
        db.driver_name()
    );

    let ctx = Context::background().with_timeout(config.ping_timeout_duration());
    let ping = db.ping_context(&ctx).await;

    let report = HealthReport {
        status: if ping.is_ok() { "ok" } else { "unavailable" },
        driver: db.driver_name().to_string(),
        connections: db.connection_count(),
        pools: db
            .stats()
            .into_iter()
            .zip(["primary", "replica"])
            .map(|(stats, role)| PoolReport { role, stats })
            .collect(),
        error: ping.as_ref().err().map(ToString::to_string),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    if let Err(e) = db.close().await {
        error!("Failed to close databases: {}", e);
    }

    if let Err(e) = ping {
        error!("Health check failed: {}", e);
        std::process::exit(1);
    }
    Ok(())
}
