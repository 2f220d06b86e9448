//! Strata Sim binary
//!
//! Runs the eventual-consistency walkthrough and prints its report as JSON.

use strata_sim::SimConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "strata_sim=info,strata_store=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = SimConfig::from_env()?;
    tracing::info!(
        slabs = config.slab_count,
        disconnected = config.mesh.disconnected,
        "Starting simulation"
    );

    let report = strata_sim::run(config).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
