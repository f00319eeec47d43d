use anyhow::Context;
use std::env;
use translate_gateway::{config::GatewayConfig, init_gateway, init_tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Get config file path from command line or use default
    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "config/gateway.yaml".to_string());

    let config = GatewayConfig::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;

    init_tracing(config.logging.json);

    init_gateway(config).await.context("Gateway error")?;
    Ok(())
}
