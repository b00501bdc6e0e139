//! Cloud session commands

use crate::cli::{connect_cloud, load_cloud_client, persist_refresh_token, print_cloud_events};
use colored::Colorize;
use jcplink_core::cloud::ProbeTarget;
use jcplink_core::error::{CloudError, JcpError};
use jcplink_core::types::LoginCode;
use tracing::{info, warn};

/// Connect in the foreground and keep the session until Ctrl+C
pub async fn run_connect(login_code: Option<String>) -> Result<(), JcpError> {
    let (_, client) = load_cloud_client()?;
    print_cloud_events(&client);

    if let Some(code) = login_code {
        client.set_login_code(LoginCode::new(code));
    }

    println!(
        "Connecting to {} ({})...",
        client.api_name(),
        client.apis_url()
    );
    connect_cloud(&client).await?;

    println!("{}", "Press Ctrl+C to disconnect".dimmed());
    tokio::signal::ctrl_c().await?;
    info!("Interrupted, disconnecting");

    // The refresh token may have been renewed while connected
    if let Err(e) = persist_refresh_token(&client) {
        warn!(error = %e, "Failed to save the refresh token");
    }
    client.disconnect()?;
    println!("Disconnected");
    Ok(())
}

/// Probe both remotes once and report each result
pub async fn run_probe() -> Result<(), JcpError> {
    let (_, client) = load_cloud_client()?;

    let mut failures = Vec::new();
    for target in [ProbeTarget::Apis, ProbeTarget::Auth] {
        match client.probe(target).await {
            Ok(report) => println!(
                "{} {} in {} ms (TLS {})",
                "✓".green(),
                target,
                report.duration.as_millis(),
                report.relax_scope
            ),
            Err(e) => {
                println!("{} {}: {}", "✗".red(), target, e);
                failures.push(e.to_string());
            }
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(CloudError::Connection(failures.join("; ")).into())
    }
}
