//! jcplink - cloud connectivity agent
//!
//! Keeps an authenticated session with the JCP cloud APIs and opens gateway
//! tunnels on top of it. Secrets are kept in the system keyring.

use clap::{Parser, Subcommand};
use jcplink_core::{error::JcpError, init_logging};

mod cli;

#[derive(Parser)]
#[command(name = "jcplink")]
#[command(about = "Cloud connectivity agent with OAuth2 session keeping and gateway tunnels")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the configuration and store the client secret
    Setup,
    /// Cloud API session commands
    Cloud {
        #[command(subcommand)]
        action: CloudCommands,
    },
    /// Gateway tunnel commands
    Gateway {
        #[command(subcommand)]
        action: GatewayCommands,
    },
}

#[derive(Subcommand)]
enum CloudCommands {
    /// Connect and keep the session alive until Ctrl+C
    Connect {
        /// Authorization code from the user login redirect
        #[arg(long)]
        login_code: Option<String>,
    },
    /// Probe the APIs and the identity provider once
    Probe,
}

#[derive(Subcommand)]
enum GatewayCommands {
    /// Connect the cloud session and the gateway tunnel until Ctrl+C
    Connect,
}

#[tokio::main]
async fn main() {
    if let Err(e) = init_logging() {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(2);
    }

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Setup => cli::setup::run_setup(),
        Commands::Cloud { action } => match action {
            CloudCommands::Connect { login_code } => cli::cloud::run_connect(login_code).await,
            CloudCommands::Probe => cli::cloud::run_probe().await,
        },
        Commands::Gateway { action } => match action {
            GatewayCommands::Connect => cli::gateway::run_connect().await,
        },
    };

    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(exit_code(&e));
        }
    }
}

/// 2 for configuration and keyring problems, 1 for runtime failures
fn exit_code(error: &JcpError) -> i32 {
    match error {
        JcpError::Config(_) | JcpError::Toml(_) | JcpError::TomlSerialize(_) => 2,
        JcpError::Keyring(_) => 2,
        JcpError::Cloud(_) | JcpError::Gateway(_) | JcpError::Io(_) => 1,
    }
}
