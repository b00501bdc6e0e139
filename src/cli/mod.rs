//! CLI command implementations
//!
//! This module contains the implementation of all CLI subcommands.

pub mod cloud;
pub mod gateway;
pub mod setup;

use colored::Colorize;
use jcplink_core::auth::keyring;
use jcplink_core::cloud::{CloudClient, ConnectionEvent, LoginEvent};
use jcplink_core::config::toml_config::{self, TomlConfig};
use jcplink_core::error::{CloudError, JcpError};
use tracing::warn;

/// Load the configuration file and build a cloud client from it
///
/// The client secret and a previously saved user refresh token come from
/// the keyring.
pub(crate) fn load_cloud_client() -> Result<(TomlConfig, CloudClient), JcpError> {
    let config = toml_config::load_config()?;
    let client_id = config.cloud.client_id.clone();

    let secret = keyring::retrieve_client_secret(&client_id)?;
    let refresh = keyring::retrieve_refresh_token(&client_id)?;
    if refresh.is_some() {
        println!("Restoring saved user session for '{}'", client_id);
    }

    let client = CloudClient::new(config.cloud.clone(), secret, refresh)?;
    Ok((config, client))
}

/// Print connection and login events as they happen
pub(crate) fn print_cloud_events(client: &CloudClient) {
    let api = client.api_name().to_string();
    client.add_connection_listener(move |event| {
        let stamp = chrono::Local::now().format("%H:%M:%S");
        match event {
            ConnectionEvent::Connected => {
                println!("[{}] {} {}", stamp, api, "connected".green())
            }
            ConnectionEvent::ConnectionFailed(reason) => {
                println!("[{}] {} {}: {}", stamp, api, "unreachable".yellow(), reason)
            }
            ConnectionEvent::AuthenticationFailed(reason) => {
                println!("[{}] {} {}: {}", stamp, api, "authentication failed".red(), reason)
            }
            ConnectionEvent::Disconnected => {
                println!("[{}] {} {}", stamp, api, "disconnected".yellow())
            }
        }
    });

    client.add_login_listener(|event| match event {
        LoginEvent::LoggedIn => println!("{}", "User logged in".green()),
        LoginEvent::LoggedOut => println!("{}", "User logged out".yellow()),
    });
}

/// Save the current user refresh token, or forget it when the user flow ended
pub(crate) fn persist_refresh_token(client: &CloudClient) -> Result<(), JcpError> {
    match client.auth_code_refresh_token() {
        Some(token) => keyring::store_refresh_token(client.client_id(), &token),
        None => keyring::delete_refresh_token(client.client_id()),
    }
}

/// Connect and keep the keyring in step with the client's user session
///
/// The refresh token is saved or forgotten whatever the outcome, so a
/// rejected saved session is not restored again on the next run. When the
/// user session was rejected the client has already fallen back to client
/// credentials and one more attempt is made.
pub(crate) async fn connect_cloud(client: &CloudClient) -> Result<(), JcpError> {
    let had_user_session = client.is_auth_code_flow_enabled();
    let result = client.connect().await;
    persist_refresh_token(client)?;

    match result {
        Err(CloudError::Authentication(reason))
            if had_user_session && !client.is_auth_code_flow_enabled() =>
        {
            warn!(reason = %reason, "Saved user session rejected, connecting with client credentials");
            client.connect().await?;
            persist_refresh_token(client)
        }
        other => other.map_err(JcpError::from),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jcplink_core::cloud::ConnectionState;
    use jcplink_core::config::CloudConfig;
    use jcplink_core::types::{ClientSecret, RefreshToken};
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TOKEN_PATH: &str = "/auth/realms/jcp/protocol/openid-connect/token";

    async fn mount_reachable(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/apis/JCP/2.0/online/"))
            .respond_with(ResponseTemplate::new(200))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/auth/realms/jcp/.well-known/openid-configuration"))
            .respond_with(ResponseTemplate::new(200))
            .mount(server)
            .await;
    }

    fn token_response(access: &str, refresh: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": access,
            "refresh_token": refresh,
            "expires_in": 300,
            "token_type": "Bearer"
        }))
    }

    fn client(server: &MockServer, client_id: &str) -> CloudClient {
        let host = server.address().to_string();
        let mut config = CloudConfig::new(client_id.to_string(), host.clone(), host);
        config.apis_secured = false;
        config.auth_secured = false;
        config.retry_interval_secs = 1;
        config.probe_timeout_secs = 2;
        let saved = keyring::retrieve_refresh_token(client_id).unwrap();
        CloudClient::new(config, ClientSecret::new("secret".to_string()), saved).unwrap()
    }

    #[tokio::test]
    async fn test_rejected_saved_session_is_forgotten() {
        let client_id = "cli-stale-session";
        keyring::store_refresh_token(client_id, &RefreshToken::new("dead".to_string())).unwrap();

        let server = MockServer::start().await;
        mount_reachable(&server).await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .and(body_string_contains("grant_type=client_credentials"))
            .respond_with(token_response("t1", "r1"))
            .mount(&server)
            .await;

        let client = client(&server, client_id);
        connect_cloud(&client).await.unwrap();

        assert_eq!(client.state(), ConnectionState::ConnectedAnonymous);
        assert!(keyring::retrieve_refresh_token(client_id).unwrap().is_none());
        client.disconnect().unwrap();
    }

    #[tokio::test]
    async fn test_renewed_user_session_is_saved() {
        let client_id = "cli-live-session";
        keyring::store_refresh_token(client_id, &RefreshToken::new("old".to_string())).unwrap();

        let server = MockServer::start().await;
        mount_reachable(&server).await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(token_response("u1", "new"))
            .mount(&server)
            .await;

        let client = client(&server, client_id);
        connect_cloud(&client).await.unwrap();

        assert_eq!(client.state(), ConnectionState::ConnectedLogged);
        let saved = keyring::retrieve_refresh_token(client_id).unwrap().unwrap();
        assert_eq!(saved.expose(), "new");
        client.disconnect().unwrap();
    }
}
