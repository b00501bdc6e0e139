//! Setup command implementation
//!
//! Interactive command for first-time configuration with secure storage of
//! the OAuth2 client secret.

use jcplink_core::{
    auth::keyring,
    config::{toml_config, CloudConfig, GatewayConfig},
    error::{ConfigError, JcpError},
    types::ClientSecret,
};
use std::io::{self, Write};

/// Run the setup command
pub fn run_setup() -> Result<(), JcpError> {
    println!("🔐 jcplink Setup");
    println!("================");
    println!();
    println!("This will configure the cloud connection.");
    println!("The client secret will be stored in your system keyring.");
    println!(
        "Configuration will be saved to {}",
        toml_config::get_config_path()?.display()
    );
    println!();

    if let Ok(true) = toml_config::config_exists() {
        println!("⚠️  Existing configuration detected.");
        if !prompt_yes_no("Overwrite existing setup?", false)? {
            println!("Setup cancelled.");
            return Ok(());
        }
        println!();
    }

    let cloud = collect_cloud_config()?;
    let gateway = collect_gateway_config()?;

    let config = toml_config::TomlConfig::new(cloud, gateway);
    config.validate()?;

    let secret = collect_client_secret(&config.cloud.client_id)?;

    println!();
    println!("💾 Saving configuration...");
    toml_config::save_config(&config)?;

    keyring::store_client_secret(&config.cloud.client_id, &secret)?;
    // A new client invalidates any saved user session
    keyring::delete_refresh_token(&config.cloud.client_id)?;

    println!("✅ Setup complete!");
    println!();
    println!("You can now use:");
    println!("  jcplink cloud probe     - Check that the cloud is reachable");
    println!("  jcplink cloud connect   - Keep a cloud session open");
    if config.gateway.is_some() {
        println!("  jcplink gateway connect - Open the gateway tunnel");
    }

    Ok(())
}

fn collect_cloud_config() -> Result<CloudConfig, JcpError> {
    println!("Cloud Configuration:");
    println!("--------------------");

    let client_id = prompt_required("Client id", "")?;
    let apis_url = prompt_required("APIs host[:port]", "api.example.org")?;
    let auth_url = prompt_required("Identity provider host[:port]", "auth.example.org")?;

    let mut config = CloudConfig::new(client_id, apis_url, auth_url);
    config.apis_secured = prompt_yes_no("Use https for the APIs?", true)?;
    config.auth_secured = prompt_yes_no("Use https for the identity provider?", true)?;
    config.auth_realm = prompt_optional("Realm", &config.auth_realm)?;
    config.auth_callback = prompt_optional("Login callback URL (optional)", "")?;
    config.retry_interval_secs = prompt_optional("Retry interval in seconds", "30")?
        .parse()
        .map_err(|_| {
            JcpError::Config(ConfigError::ValidationError {
                message: "Invalid retry interval".to_string(),
            })
        })?;

    config
        .validate()
        .map_err(|message| JcpError::Config(ConfigError::ValidationError { message }))?;
    Ok(config)
}

fn collect_gateway_config() -> Result<Option<GatewayConfig>, JcpError> {
    println!();
    if !prompt_yes_no("Configure a gateway tunnel?", false)? {
        return Ok(None);
    }

    let local_id = prompt_required("Local id", "")?;
    let mut config = GatewayConfig::new(local_id);
    config.instance_id = prompt_optional("Instance id", &config.instance_id)?;
    config.auto_reconnect = prompt_yes_no("Reconnect automatically?", true)?;
    Ok(Some(config))
}

fn collect_client_secret(client_id: &str) -> Result<ClientSecret, JcpError> {
    println!();
    if keyring::has_client_secret(client_id)? {
        println!("A client secret is already stored for '{}'.", client_id);
        if !prompt_yes_no("Replace it?", false)? {
            return keyring::retrieve_client_secret(client_id);
        }
    }

    loop {
        let secret = prompt_input("Client secret: ")?;
        if secret.trim().is_empty() {
            println!("❌ Secret cannot be empty. Please try again.");
            continue;
        }
        return Ok(ClientSecret::new(secret.trim().to_string()));
    }
}

/// Prompt for a required value with default
fn prompt_required(prompt: &str, default: &str) -> Result<String, JcpError> {
    let prompt_text = if default.is_empty() {
        format!("{}: ", prompt)
    } else {
        format!("{} [{}]: ", prompt, default)
    };

    loop {
        let input = prompt_input(&prompt_text)?;

        if input.trim().is_empty() {
            if !default.is_empty() {
                return Ok(default.to_string());
            }
            println!("❌ This field is required. Please enter a value.");
            continue;
        }

        return Ok(input.trim().to_string());
    }
}

fn prompt_optional(prompt: &str, default: &str) -> Result<String, JcpError> {
    let input = prompt_input(&format!("{} [{}]: ", prompt, default))?;

    if input.trim().is_empty() {
        Ok(default.to_string())
    } else {
        Ok(input.trim().to_string())
    }
}

fn prompt_yes_no(prompt: &str, default_yes: bool) -> Result<bool, JcpError> {
    let default_indicator = if default_yes { "[Y/n]" } else { "[y/N]" };
    let prompt_text = format!("{} {}: ", prompt, default_indicator);

    loop {
        let input = prompt_input(&prompt_text)?.to_lowercase();

        match input.as_str() {
            "y" | "yes" => return Ok(true),
            "n" | "no" => return Ok(false),
            "" => return Ok(default_yes),
            _ => println!("Please enter 'y' for yes or 'n' for no."),
        }
    }
}

fn prompt_input(prompt: &str) -> Result<String, JcpError> {
    print!("{}", prompt);
    io::stdout().flush()?;

    let mut input = String::new();
    if io::stdin().read_line(&mut input)? == 0 {
        return Err(JcpError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "input closed",
        )));
    }

    Ok(input.trim_end().to_string())
}
