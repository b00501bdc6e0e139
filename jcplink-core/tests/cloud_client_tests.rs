//! Integration tests for the cloud client connection state machine
//!
//! Covers both authentication flows, waiting states and their retry timer,
//! request execution with token refresh, sessions and logout.

mod common;

use common::*;
use jcplink_core::auth::token::AuthFlow;
use jcplink_core::cloud::{ApiRequest, ConnectionEvent, ConnectionState, LoginEvent};
use jcplink_core::error::{CloudError, ResponseErrorKind};
use jcplink_core::types::LoginCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_connect_with_client_credentials() {
    let server = MockServer::start().await;
    mount_cloud(&server).await;
    let client = cloud_client(&server);
    let events = record_events(&client);

    client.connect().await.unwrap();

    assert_eq!(client.state(), ConnectionState::ConnectedAnonymous);
    assert!(client.is_connected());
    assert!(client.is_user_anonymous());
    assert_eq!(client.active_flow(), Some(AuthFlow::ClientCredentials));
    assert!(client.last_connection().is_some());
    assert_eq!(*events.lock().unwrap(), vec![ConnectionEvent::Connected]);

    client.disconnect().unwrap();
}

#[tokio::test]
async fn test_apis_unreachable_then_healing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(ONLINE_PATH))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(3)
        .mount(&server)
        .await;
    mount_cloud(&server).await;

    let client = cloud_client(&server);
    let events = record_events(&client);

    // Unreachable remotes are not errors
    client.connect().await.unwrap();
    assert_eq!(client.state(), ConnectionState::ConnectingWaitingDependency);
    assert!(client.is_reconnecting());
    assert!(!client.is_connected());

    let connected = wait_until(Duration::from_secs(10), || client.is_connected()).await;
    assert!(connected, "client never connected, state {}", client.state());
    assert_eq!(client.state(), ConnectionState::ConnectedAnonymous);
    assert!(!client.is_reconnecting());

    let events = events.lock().unwrap().clone();
    assert_eq!(events.len(), 4, "events: {:?}", events);
    assert!(events[..3]
        .iter()
        .all(|e| matches!(e, ConnectionEvent::ConnectionFailed(_))));
    assert_eq!(events[3], ConnectionEvent::Connected);

    client.disconnect().unwrap();
}

#[tokio::test]
async fn test_auth_unreachable_waits_for_auth() {
    let server = MockServer::start().await;
    mount_online(&server).await;
    Mock::given(method("GET"))
        .and(path(DISCOVERY_PATH))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let client = cloud_client(&server);
    let events = record_events(&client);

    client.connect().await.unwrap();
    assert_eq!(client.state(), ConnectionState::ConnectingWaitingAuth);
    assert_eq!(count(&events, |e| matches!(e, ConnectionEvent::ConnectionFailed(_))), 1);

    // Disconnect aborts the waiting attempt without a Disconnected event
    client.disconnect().unwrap();
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(!client.is_reconnecting());

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(count(&events, |e| *e == ConnectionEvent::Disconnected), 0);
}

#[tokio::test]
async fn test_concurrent_connect_runs_once() {
    let server = MockServer::start().await;
    mount_online(&server).await;
    mount_discovery(&server).await;
    token_mock("client_credentials", "t1", "r1")
        .expect(1)
        .mount(&server)
        .await;

    let client = cloud_client(&server);
    let events = record_events(&client);

    let (first, second) = tokio::join!(client.connect(), client.connect());
    assert!(first.is_ok());
    assert!(second.is_ok());

    assert!(wait_until(Duration::from_secs(5), || client.is_connected()).await);
    assert_eq!(count(&events, |e| *e == ConnectionEvent::Connected), 1);

    // Already connected: no-op
    client.connect().await.unwrap();
    assert_eq!(count(&events, |e| *e == ConnectionEvent::Connected), 1);
}

#[tokio::test]
async fn test_rejected_credentials() {
    let server = MockServer::start().await;
    mount_online(&server).await;
    mount_discovery(&server).await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
            "error": "unauthorized_client",
            "error_description": "Invalid client secret"
        })))
        .mount(&server)
        .await;

    let client = cloud_client(&server);
    let events = record_events(&client);

    let result = client.connect().await;
    match result {
        Err(CloudError::Authentication(message)) => {
            assert!(message.contains("Invalid client secret"), "message: {}", message)
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(!client.is_reconnecting());
    assert_eq!(
        count(&events, |e| matches!(e, ConnectionEvent::AuthenticationFailed(_))),
        1
    );
}

#[tokio::test]
async fn test_login_code_switches_flow_and_logout_restores_anonymous() {
    let server = MockServer::start().await;
    mount_cloud(&server).await;
    token_mock("authorization_code", "u1", "user-refresh")
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(LOGOUT_PATH))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let client = cloud_client(&server);
    let logins = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&logins);
    client.add_login_listener(move |event| sink.lock().unwrap().push(*event));

    client.connect().await.unwrap();
    assert_eq!(client.state(), ConnectionState::ConnectedAnonymous);
    assert!(client.auth_code_refresh_token().is_none());

    client.set_login_code(LoginCode::from("code-123"));
    assert!(client.is_auth_code_flow_enabled());
    client.disconnect().unwrap();
    client.connect().await.unwrap();

    assert_eq!(client.state(), ConnectionState::ConnectedLogged);
    assert!(client.is_user_authenticated());
    assert!(!client.is_client_credentials_flow_enabled());
    assert_eq!(client.active_flow(), Some(AuthFlow::AuthCode));
    assert_eq!(client.auth_code_refresh_token().unwrap().expose(), "user-refresh");
    assert_eq!(*logins.lock().unwrap(), vec![LoginEvent::LoggedIn]);

    client.logout().await.unwrap();

    assert_eq!(client.state(), ConnectionState::ConnectedAnonymous);
    assert!(client.is_user_anonymous());
    assert!(client.auth_code_refresh_token().is_none());
    assert!(!client.is_session_set());
    assert_eq!(
        *logins.lock().unwrap(),
        vec![LoginEvent::LoggedIn, LoginEvent::LoggedOut]
    );
}

#[tokio::test]
async fn test_rejected_login_code_clears_user_material() {
    let server = MockServer::start().await;
    mount_cloud(&server).await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=authorization_code"))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "error": "invalid_grant",
            "error_description": "Code not valid"
        })))
        .mount(&server)
        .await;

    let client = cloud_client(&server);
    client.set_login_code(LoginCode::from("expired"));

    let result = client.connect().await;
    assert!(matches!(result, Err(CloudError::Authentication(_))));
    assert!(!client.is_auth_code_flow_enabled());

    // Next attempt falls back to client credentials
    client.connect().await.unwrap();
    assert_eq!(client.state(), ConnectionState::ConnectedAnonymous);
}

#[tokio::test]
async fn test_unauthorized_request_refreshes_once() {
    let server = MockServer::start().await;
    mount_cloud(&server).await;
    token_mock("refresh_token", "t2", "r2")
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/apis/objects"))
        .and(header("Authorization", "Bearer t1"))
        .respond_with(ResponseTemplate::new(401).insert_header("WWW-Authenticate", "Bearer error=\"invalid_token\""))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/apis/objects"))
        .and(header("Authorization", "Bearer t2"))
        .respond_with(ResponseTemplate::new(200).set_body_string("\"ok\""))
        .expect(1)
        .mount(&server)
        .await;

    let client = cloud_client(&server);
    client.connect().await.unwrap();

    let response = client.execute(ApiRequest::get("/apis/objects")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text(), "ok");
    assert_eq!(client.state(), ConnectionState::ConnectedAnonymous);
}

#[tokio::test]
async fn test_persistent_unauthorized_surfaces_error() {
    let server = MockServer::start().await;
    mount_cloud(&server).await;
    token_mock("refresh_token", "t1", "r1").mount(&server).await;
    Mock::given(method("GET"))
        .and(path("/apis/secret"))
        .respond_with(ResponseTemplate::new(401).insert_header("WWW-Authenticate", "Bearer realm=\"jcp\""))
        .expect(2)
        .mount(&server)
        .await;

    let client = cloud_client(&server);
    client.connect().await.unwrap();

    match client.execute(ApiRequest::get("/apis/secret")).await {
        Err(CloudError::Response(err)) => {
            assert_eq!(err.kind, ResponseErrorKind::Unauthorized);
            assert_eq!(err.code, Some(401));
            assert_eq!(err.cause.as_deref(), Some("Bearer realm=\"jcp\""));
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn test_concurrent_unauthorized_requests_reconnect_once() {
    let server = MockServer::start().await;
    mount_online(&server).await;
    mount_discovery(&server).await;
    token_mock("client_credentials", "t1", "r1")
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    token_mock("client_credentials", "t2", "r2")
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "error": "invalid_grant",
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/apis/x"))
        .and(header("Authorization", "Bearer t1"))
        .respond_with(ResponseTemplate::new(401).insert_header("WWW-Authenticate", "Bearer error=\"invalid_token\""))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/apis/x"))
        .and(header("Authorization", "Bearer t2"))
        .respond_with(ResponseTemplate::new(200).set_body_string("\"ok\""))
        .mount(&server)
        .await;

    let client = cloud_client(&server);
    client.connect().await.unwrap();

    let results = tokio::join!(
        client.execute(ApiRequest::get("/apis/x")),
        client.execute(ApiRequest::get("/apis/x")),
        client.execute(ApiRequest::get("/apis/x")),
        client.execute(ApiRequest::get("/apis/x")),
    );
    for result in [results.0, results.1, results.2, results.3] {
        let response = result.unwrap();
        assert_eq!(response.status(), 200);
    }
    assert_eq!(client.state(), ConnectionState::ConnectedAnonymous);
}

#[tokio::test]
async fn test_error_status_kinds() {
    let server = MockServer::start().await;
    mount_cloud(&server).await;
    Mock::given(method("DELETE"))
        .and(path("/apis/objects/1"))
        .respond_with(ResponseTemplate::new(409).set_body_string("locked"))
        .mount(&server)
        .await;

    let client = cloud_client(&server);
    client.connect().await.unwrap();

    match client.execute(ApiRequest::get("/apis/missing")).await {
        Err(CloudError::Response(err)) => {
            assert_eq!(err.kind, ResponseErrorKind::NotFound);
            assert!(err.url.ends_with("/apis/missing"));
        }
        other => panic!("unexpected result: {:?}", other),
    }

    match client.execute(ApiRequest::delete("/apis/objects/1")).await {
        Err(CloudError::Response(err)) => {
            assert_eq!(err.kind, ResponseErrorKind::Conflict);
            assert_eq!(err.body, "locked");
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn test_session_cookie_and_default_headers() {
    let server = MockServer::start().await;
    mount_cloud(&server).await;
    Mock::given(method("GET"))
        .and(path("/apis/session"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Set-Cookie", "JSESSIONID=abc123; Path=/; HttpOnly")
                .set_body_string("{}"),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/apis/echo"))
        .and(header("Cookie", "JSESSIONID=abc123"))
        .and(header("X-Object-Id", "object-0001"))
        .and(header("Content-Type", "application/json;charset=UTF-8"))
        .and(body_string_contains("\"name\":\"lamp\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"name": "lamp"})))
        .expect(1)
        .mount(&server)
        .await;

    let client = cloud_client(&server);
    client.connect().await.unwrap();
    assert!(!client.is_session_set());

    client.execute(ApiRequest::get("/apis/session")).await.unwrap();
    assert!(client.is_session_set());

    client.add_default_header("X-Object-Id", "object-0001");
    let request = ApiRequest::post("/apis/echo")
        .json(&serde_json::json!({"name": "lamp"}))
        .unwrap();
    let response = client.execute(request).await.unwrap();
    let body: serde_json::Value = response.json().unwrap();
    assert_eq!(body["name"], "lamp");
}

#[tokio::test]
async fn test_disconnect_clears_connection() {
    let server = MockServer::start().await;
    mount_cloud(&server).await;
    let client = cloud_client(&server);
    let events = record_events(&client);

    client.connect().await.unwrap();
    client.disconnect().unwrap();

    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(client.last_disconnection().is_some());
    assert_eq!(
        *events.lock().unwrap(),
        vec![ConnectionEvent::Connected, ConnectionEvent::Disconnected]
    );
    assert!(matches!(
        client.execute(ApiRequest::get("/apis/objects")).await,
        Err(CloudError::Connection(_))
    ));

    // Second disconnect is a no-op
    client.disconnect().unwrap();
    assert_eq!(events.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_check_timer_reconnects_after_outage() {
    let server = MockServer::start().await;
    mount_cloud(&server).await;
    let client = cloud_client(&server);
    let events = record_events(&client);

    client.connect().await.unwrap();

    // Outage: every endpoint answers 404
    server.reset().await;
    let lost = wait_until(Duration::from_secs(5), || {
        count(&events, |e| *e == ConnectionEvent::Disconnected) == 1
    })
    .await;
    assert!(lost, "outage not detected");
    assert!(wait_until(Duration::from_secs(2), || !client.is_connected()).await);

    mount_cloud(&server).await;
    let healed = wait_until(Duration::from_secs(5), || {
        count(&events, |e| *e == ConnectionEvent::Connected) == 2
    })
    .await;
    assert!(healed, "client did not reconnect, state {}", client.state());
    assert!(client.is_connected());

    client.disconnect().unwrap();
}

#[tokio::test]
async fn test_state_receiver_observes_transitions() {
    let server = MockServer::start().await;
    mount_cloud(&server).await;
    let client = cloud_client(&server);
    let mut states = client.state_receiver();

    client.connect().await.unwrap();
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), ConnectionState::ConnectedAnonymous);

    client.disconnect().unwrap();
    assert_eq!(*states.borrow_and_update(), ConnectionState::Disconnected);
}
