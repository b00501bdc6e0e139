//! TOML configuration file I/O
//!
//! Handles loading and saving the agent configuration to/from TOML files
//! in the user's configuration directory.

use crate::config::{CloudConfig, GatewayConfig};
use crate::error::{ConfigError, JcpError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Complete TOML configuration structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Cloud API client settings
    pub cloud: CloudConfig,

    /// Gateway tunnel settings (optional)
    #[serde(default)]
    pub gateway: Option<GatewayConfig>,
}

impl TomlConfig {
    pub fn new(cloud: CloudConfig, gateway: Option<GatewayConfig>) -> Self {
        Self { cloud, gateway }
    }

    /// Load and validate configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, JcpError> {
        let contents = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => JcpError::Config(ConfigError::LoadFailed {
                path: path.to_string_lossy().to_string(),
            }),
            _ => JcpError::Config(ConfigError::IoError {
                message: format!("Failed to read config file: {}", e),
            }),
        })?;

        let config: TomlConfig = toml::from_str(&contents).map_err(|e| {
            JcpError::Config(ConfigError::ValidationError {
                message: format!("Failed to parse config file: {}", e),
            })
        })?;

        config.validate()?;

        debug!(
            api = %config.cloud.api_name,
            apis_url = %config.cloud.apis_url,
            auth_url = %config.cloud.auth_url,
            gateway = config.gateway.is_some(),
            "Loaded configuration from {:?}",
            path
        );

        Ok(config)
    }

    /// Save configuration to a TOML file, creating parent directories
    pub fn to_file(&self, path: &Path) -> Result<(), JcpError> {
        self.validate()?;

        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                JcpError::Config(ConfigError::IoError {
                    message: format!("Failed to create config directory: {}", e),
                })
            })?;
        }

        std::fs::write(path, contents).map_err(|_e| {
            JcpError::Config(ConfigError::SaveFailed {
                path: path.to_string_lossy().to_string(),
            })
        })?;

        info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Validate both sections
    pub fn validate(&self) -> Result<(), JcpError> {
        self.cloud
            .validate()
            .map_err(|message| JcpError::Config(ConfigError::ValidationError { message }))?;

        if let Some(gateway) = &self.gateway {
            gateway.validate().map_err(|message| {
                JcpError::Config(ConfigError::ValidationError {
                    message: format!("Invalid gateway section: {}", message),
                })
            })?;
        }

        Ok(())
    }
}

/// Default configuration file name
const CONFIG_FILE_NAME: &str = "config.toml";

/// Get the default configuration directory
///
/// Returns ~/.config/jcplink, or JCPLINK_CONFIG_DIR environment variable if set
pub fn get_config_dir() -> Result<PathBuf, JcpError> {
    // Allow tests to override config directory via environment variable
    if let Ok(config_dir) = std::env::var("JCPLINK_CONFIG_DIR") {
        return Ok(PathBuf::from(config_dir));
    }

    let home = std::env::var("HOME").map_err(|_| {
        JcpError::Config(ConfigError::IoError {
            message: "HOME environment variable not set".to_string(),
        })
    })?;

    Ok(PathBuf::from(home).join(".config").join("jcplink"))
}

/// Get the default configuration file path
pub fn get_config_path() -> Result<PathBuf, JcpError> {
    Ok(get_config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load configuration from the default TOML file
pub fn load_config() -> Result<TomlConfig, JcpError> {
    let config_path = get_config_path()?;
    TomlConfig::from_file(&config_path)
}

/// Save configuration to the default TOML file
pub fn save_config(config: &TomlConfig) -> Result<(), JcpError> {
    let config_path = get_config_path()?;
    config.to_file(&config_path)
}

/// Check if a configuration file exists
pub fn config_exists() -> Result<bool, JcpError> {
    Ok(get_config_path()?.exists())
}
