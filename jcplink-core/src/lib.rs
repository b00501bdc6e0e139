//! Core library for the jcplink cloud agent
//!
//! This crate provides the cloud connectivity core: the authenticating
//! cloud API client (OAuth2 flows, reachability probing, token refresh and
//! reconnection) and the gateway tunnel client that rides on top of it.

pub mod error;
pub mod types;

pub mod auth;
pub mod cloud;
pub mod config;
pub mod gateway;
pub mod scheduler;

/// Initialize logging infrastructure
///
/// Sets up tracing with systemd journal logging for production use.
/// In development, logs to stderr with appropriate formatting. The level
/// comes from `RUST_LOG` and defaults to `info`.
pub fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // Try to use systemd journal logging if available
    #[cfg(target_os = "linux")]
    {
        if std::env::var("JOURNAL_STREAM").is_ok() {
            // We're running under systemd, use journal logging
            let journal_layer = tracing_journald::layer()?;
            tracing_subscriber::registry()
                .with(journal_layer)
                .with(filter)
                .try_init()?;
            return Ok(());
        }
    }

    // Fallback to stderr logging with pretty formatting
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .try_init()?;

    Ok(())
}
