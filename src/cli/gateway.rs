//! Gateway tunnel commands

use crate::cli::{connect_cloud, load_cloud_client, persist_refresh_token, print_cloud_events};
use colored::Colorize;
use jcplink_core::error::{ConfigError, JcpError};
use jcplink_core::gateway::{
    CloudAccessInfoSource, GatewayClient, GatewayEvent, TlsPeerOpener,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Connect the cloud session and the tunnel, keep both until Ctrl+C
pub async fn run_connect() -> Result<(), JcpError> {
    let (config, cloud) = load_cloud_client()?;
    let gateway_config = config.gateway.ok_or_else(|| ConfigError::MissingField {
        field: "gateway".to_string(),
    })?;
    print_cloud_events(&cloud);

    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
    let access = Arc::new(CloudAccessInfoSource::new(
        gateway_config.instance_id.clone(),
        gateway_config.access_path.clone(),
    ));
    let gateway = GatewayClient::new(
        gateway_config,
        cloud.clone(),
        access,
        Arc::new(TlsPeerOpener::with_inbound(inbound_tx)),
    )?;

    gateway.add_listener(|event| match event {
        GatewayEvent::Connecting => println!("Gateway {}", "connecting".dimmed()),
        GatewayEvent::Waiting => println!("Gateway {}", "waiting".yellow()),
        GatewayEvent::Connected => println!("Gateway {}", "connected".green()),
        GatewayEvent::Disconnecting => println!("Gateway {}", "disconnecting".yellow()),
        GatewayEvent::Disconnected { reason } => {
            println!("Gateway {} ({})", "disconnected".yellow(), reason)
        }
        GatewayEvent::Failed { message } => println!("Gateway {}: {}", "failed".red(), message),
    });

    connect_cloud(&cloud).await?;

    // A failed first attempt keeps retrying in the background
    if let Err(e) = gateway.connect().await {
        warn!(error = %e, "Gateway connection not established yet");
    }

    println!("{}", "Press Ctrl+C to disconnect".dimmed());
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
            Some(data) = inbound_rx.recv() => {
                info!(bytes = data.len(), "Data received from gateway peer");
            }
        }
    }

    info!("Interrupted, disconnecting");
    gateway.disconnect();
    if let Err(e) = persist_refresh_token(&cloud) {
        warn!(error = %e, "Failed to save the refresh token");
    }
    cloud.disconnect()?;
    println!("Disconnected");
    Ok(())
}
