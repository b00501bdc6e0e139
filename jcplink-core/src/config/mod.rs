//! Configuration module
//!
//! Handles the cloud client and gateway settings loaded from TOML files.

use serde::{Deserialize, Serialize};
use url::Url;

pub mod toml_config;

/// Default Keycloak realm
const DEFAULT_REALM: &str = "jcp";

/// Default path answering the APIs reachability probe
const DEFAULT_ONLINE_PATH: &str = "/apis/JCP/2.0/online/";

/// Default path returning gateway access info
const DEFAULT_ACCESS_PATH: &str = "/apis/core/gateways/2.0/o2s/access";

/// Cloud API client configuration
///
/// Contains all non-sensitive connection parameters. The client secret is
/// stored separately in the keyring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudConfig {
    /// Component name used in logs (e.g. "JCP")
    #[serde(default = "default_api_name")]
    pub api_name: String,

    /// OAuth2 client id registered on the identity provider
    pub client_id: String,

    /// APIs host and optional port, without scheme
    pub apis_url: String,

    /// Identity provider host and optional port, without scheme
    pub auth_url: String,

    /// Use https for API requests
    #[serde(default = "default_true")]
    pub apis_secured: bool,

    /// Use https for the identity provider (token, discovery, logout)
    #[serde(default = "default_true")]
    pub auth_secured: bool,

    /// Keycloak realm name
    #[serde(default = "default_realm")]
    pub auth_realm: String,

    /// Space separated scopes requested during the user login
    #[serde(default = "default_scopes")]
    pub auth_scopes: String,

    /// Redirect URI registered for the auth-code flow
    #[serde(default)]
    pub auth_callback: String,

    /// Delay and period of the reconnection and connection-check timers
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,

    /// Timeout applied to reachability probes and token requests
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// APIs path probed for reachability
    #[serde(default = "default_online_path")]
    pub online_path: String,

    /// Retry TLS handshake failures with relaxed certificate verification
    /// (localhost first, every host on a hostname mismatch)
    #[serde(default = "default_true")]
    pub tls_relaxed_fallback: bool,
}

fn default_api_name() -> String {
    "JCP".to_string()
}
fn default_true() -> bool {
    true
}
fn default_realm() -> String {
    DEFAULT_REALM.to_string()
}
fn default_scopes() -> String {
    "openid".to_string()
}
fn default_retry_interval() -> u64 {
    30
}
fn default_probe_timeout() -> u64 {
    10
}
fn default_online_path() -> String {
    DEFAULT_ONLINE_PATH.to_string()
}

impl CloudConfig {
    /// Create a new cloud configuration with defaults for optional fields
    pub fn new(client_id: String, apis_url: String, auth_url: String) -> Self {
        Self {
            client_id,
            apis_url,
            auth_url,
            ..Self::default()
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.api_name.is_empty() {
            return Err("API name cannot be empty".to_string());
        }

        if self.client_id.is_empty() {
            return Err("Client id cannot be empty".to_string());
        }

        validate_host("apis_url", &self.apis_url)?;
        validate_host("auth_url", &self.auth_url)?;

        if self.auth_realm.is_empty() {
            return Err("Auth realm cannot be empty".to_string());
        }

        if !self.auth_callback.is_empty() && Url::parse(&self.auth_callback).is_err() {
            return Err(format!("Invalid auth callback URL: {}", self.auth_callback));
        }

        if self.retry_interval_secs < 1 || self.retry_interval_secs > 3600 {
            return Err(format!(
                "retry_interval_secs must be between 1 and 3600, got: {}",
                self.retry_interval_secs
            ));
        }

        if self.probe_timeout_secs < 1 || self.probe_timeout_secs > 300 {
            return Err(format!(
                "probe_timeout_secs must be between 1 and 300, got: {}",
                self.probe_timeout_secs
            ));
        }

        if !self.online_path.starts_with('/') {
            return Err("online_path must start with '/'".to_string());
        }

        Ok(())
    }
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            api_name: default_api_name(),
            client_id: String::new(),
            apis_url: String::new(),
            auth_url: String::new(),
            apis_secured: true,
            auth_secured: true,
            auth_realm: default_realm(),
            auth_scopes: default_scopes(),
            auth_callback: String::new(),
            retry_interval_secs: default_retry_interval(),
            probe_timeout_secs: default_probe_timeout(),
            online_path: default_online_path(),
            tls_relaxed_fallback: true,
        }
    }
}

/// Gateway tunnel client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Local identity, used as certificate CN and timer key
    pub local_id: String,

    /// Instance id sent with access info requests
    #[serde(default = "default_instance_id")]
    pub instance_id: String,

    /// APIs path returning the gateway access info
    #[serde(default = "default_access_path")]
    pub access_path: String,

    /// Re-dial automatically after failures and unexpected drops
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
}

fn default_instance_id() -> String {
    "1".to_string()
}
fn default_access_path() -> String {
    DEFAULT_ACCESS_PATH.to_string()
}

impl GatewayConfig {
    pub fn new(local_id: String) -> Self {
        Self {
            local_id,
            instance_id: default_instance_id(),
            access_path: default_access_path(),
            auto_reconnect: true,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.local_id.is_empty() {
            return Err("Local id cannot be empty".to_string());
        }

        if !self
            .local_id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err("Local id contains invalid characters".to_string());
        }

        if !self.access_path.starts_with('/') {
            return Err("access_path must start with '/'".to_string());
        }

        Ok(())
    }
}

/// Check that `value` is a bare `host[:port]` usable after a scheme prefix
fn validate_host(field: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{} cannot be empty", field));
    }

    if value.contains("://") {
        return Err(format!("{} must not contain a scheme, got: {}", field, value));
    }

    let url = Url::parse(&format!("https://{}", value))
        .map_err(|e| format!("Invalid {}: {} ({})", field, value, e))?;

    if url.host_str().is_none() {
        return Err(format!("Invalid {}: missing host", field));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CloudConfig {
        CloudConfig::new(
            "jod-object".to_string(),
            "api.example.org".to_string(),
            "auth.example.org:8998".to_string(),
        )
    }

    #[test]
    fn test_valid_config() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn test_rejects_scheme_in_host() {
        let mut config = sample();
        config.apis_url = "https://api.example.org".to_string();
        assert!(config.validate().unwrap_err().contains("scheme"));
    }

    #[test]
    fn test_rejects_zero_retry_interval() {
        let mut config = sample();
        config.retry_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_gateway_local_id_characters() {
        assert!(GatewayConfig::new("object-01".to_string()).validate().is_ok());
        assert!(GatewayConfig::new("bad id".to_string()).validate().is_err());
        assert!(GatewayConfig::new(String::new()).validate().is_err());
    }
}
