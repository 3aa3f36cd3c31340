//! Gateway-client process entry point: connects to an AgentIM server's
//! `/ws/gateway` endpoint, authenticates, and keeps the connection alive
//! across drops.

use std::env;

use agentim_gateway_client::{GatewayIdentity, run};
use agentim_protocol::WireDeviceInfo;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    agentim_config::load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = agentim_config::GatewayClientConfig::from_env()?;
    let token = env::var("AGENTIM_GATEWAY_TOKEN")
        .map_err(|_| anyhow::anyhow!("AGENTIM_GATEWAY_TOKEN must be set"))?;
    let gateway_id = env::var("AGENTIM_GATEWAY_ID")
        .map_err(|_| anyhow::anyhow!("AGENTIM_GATEWAY_ID must be set"))?;
    let device_info = WireDeviceInfo {
        platform: env::consts::OS.to_string(),
        hostname: hostname(),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let identity = GatewayIdentity { token, gateway_id: gateway_id.clone(), device_info };

    let _handle = run(
        config,
        identity,
        |frame| {
            info!(?frame, "received server frame");
        },
        shutdown_rx,
    )
    .await;

    info!(gateway_id = %gateway_id, "gateway client running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    let _ = shutdown_tx.send(true);
    Ok(())
}

fn hostname() -> String {
    env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}
