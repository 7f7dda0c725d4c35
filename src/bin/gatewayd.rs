//! Binary composition root: reads a TOML config path from argv, installs
//! the tracing subscriber, builds and spawns the `Gateway`, and waits for
//! Ctrl-C to run the shutdown sequence. Deliberately thin — the core does
//! not mandate a UI, and config-file discovery/reload is out of scope; this
//! is just enough glue to run the crate.

use tracing_subscriber::EnvFilter;
use wirefree_gateway::config::Config;
use wirefree_gateway::gateway::{null_publisher, Gateway};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "gateway.toml".to_string());
    let config_text = std::fs::read_to_string(&config_path)
        .map_err(|e| format!("reading {config_path}: {e}"))?;
    let config = Config::from_toml_str(&config_text)?;

    let gateway = Gateway::build(config, null_publisher()).await?;

    tracing::info!("gateway running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    gateway.shutdown().await;

    Ok(())
}
