//! Shared helpers for integration tests
//!
//! A single wiremock server plays both the cloud APIs and the identity
//! provider; the client talks plain http to it with a one second retry
//! interval.

#![allow(dead_code)]

use jcplink_core::cloud::{CloudClient, ConnectionEvent};
use jcplink_core::config::CloudConfig;
use jcplink_core::types::ClientSecret;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const ONLINE_PATH: &str = "/apis/JCP/2.0/online/";
pub const DISCOVERY_PATH: &str = "/auth/realms/jcp/.well-known/openid-configuration";
pub const TOKEN_PATH: &str = "/auth/realms/jcp/protocol/openid-connect/token";
pub const LOGOUT_PATH: &str = "/auth/realms/jcp/protocol/openid-connect/logout";

pub fn cloud_config(server: &MockServer) -> CloudConfig {
    let host = server.address().to_string();
    let mut config = CloudConfig::new("jod-object".to_string(), host.clone(), host);
    config.apis_secured = false;
    config.auth_secured = false;
    config.retry_interval_secs = 1;
    config.probe_timeout_secs = 2;
    config.auth_callback = "https://localhost:8080/login/code".to_string();
    config
}

pub fn cloud_client(server: &MockServer) -> CloudClient {
    CloudClient::new(cloud_config(server), ClientSecret::new("secret".to_string()), None)
        .expect("valid test config")
}

pub async fn mount_online(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path(ONLINE_PATH))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
}

pub async fn mount_discovery(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path(DISCOVERY_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "issuer": "http://localhost/auth/realms/jcp"
        })))
        .mount(server)
        .await;
}

pub fn token_body(access: &str, refresh: &str) -> serde_json::Value {
    serde_json::json!({
        "access_token": access,
        "refresh_token": refresh,
        "expires_in": 300,
        "token_type": "Bearer"
    })
}

/// Token endpoint answering the given grant type
pub fn token_mock(grant_type: &str, access: &str, refresh: &str) -> Mock {
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains(format!("grant_type={}", grant_type)))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body(access, refresh)))
}

/// Reachable APIs and identity provider, client credentials issuing `t1`
pub async fn mount_cloud(server: &MockServer) {
    mount_online(server).await;
    mount_discovery(server).await;
    token_mock("client_credentials", "t1", "r1").mount(server).await;
}

pub fn record_events(client: &CloudClient) -> Arc<Mutex<Vec<ConnectionEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    client.add_connection_listener(move |event| sink.lock().unwrap().push(event.clone()));
    events
}

/// Poll `condition` every 50ms until it holds or `timeout` elapses
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    condition()
}

pub fn count(events: &Mutex<Vec<ConnectionEvent>>, predicate: impl Fn(&ConnectionEvent) -> bool) -> usize {
    events.lock().unwrap().iter().filter(|e| predicate(e)).count()
}
