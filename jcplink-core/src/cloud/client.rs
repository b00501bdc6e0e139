//! Authenticating cloud API client
//!
//! [`CloudClient`] keeps a long-lived, self-healing connection to the cloud
//! APIs. A connection attempt probes the APIs and the identity provider,
//! then authenticates with the client-credentials flow or, when a login
//! code or refresh token is staged, with the auth-code (user) flow.
//!
//! Unreachable remotes never surface as errors: the client moves to a
//! waiting state, reports the failure to connection listeners and retries
//! on a timer. While connected, a second timer re-probes both remotes and
//! reconnects from scratch when one of them disappears.
//!
//! All state lives behind one mutex that is never held across network I/O.
//! Each attempt owns a cancellation token so [`CloudClient::disconnect`]
//! aborts it instead of waiting for it to settle.

use crate::auth::oauth::{TokenEndpoint, TokenError};
use crate::auth::token::{AccessToken, AuthFlow, Grant, TokenStore};
use crate::cloud::events::{ConnectionEvent, EventHub, ListenerId, LoginEvent};
use crate::cloud::reachability::{ProbeReport, ProbeTarget, ReachabilityProber, Unreachable};
use crate::cloud::request::{ApiRequest, ApiResponse};
use crate::cloud::state::ConnectionState;
use crate::cloud::transport::{describe_error, HttpTransport};
use crate::config::CloudConfig;
use crate::error::{CloudError, ConfigError, JcpError, ResponseError};
use crate::scheduler::ScheduledTask;
use crate::types::{BearerToken, ClientSecret, LoginCode, RefreshToken};
use chrono::{DateTime, Utc};
use reqwest::header::{CONTENT_TYPE, COOKIE, SET_COOKIE, WWW_AUTHENTICATE};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

const SESSION_KEY: &str = "JSESSIONID";
const DEFAULT_ACCEPT: &str = "application/json";
const JSON_CONTENT_TYPE: &str = "application/json;charset=UTF-8";

/// Fixed URLs derived from the configuration
#[derive(Debug)]
struct Endpoints {
    apis: Url,
    auth: Url,
    apis_online: Url,
    auth_discovery: Url,
    token: Url,
    login: Url,
    logout: Url,
    registration: Url,
}

impl Endpoints {
    fn new(config: &CloudConfig) -> Result<Self, ConfigError> {
        let realm = format!("/auth/realms/{}", config.auth_realm);
        let oidc = format!("{}/protocol/openid-connect", realm);
        let apis_scheme = scheme(config.apis_secured);
        let auth_scheme = scheme(config.auth_secured);

        let mut login = build_url(auth_scheme, &config.auth_url, &format!("{}/auth", oidc))?;
        login
            .query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &config.client_id)
            .append_pair("redirect_uri", &config.auth_callback)
            .append_pair("scope", &config.auth_scopes);

        let mut registration =
            build_url(auth_scheme, &config.auth_url, &format!("{}/registrations", oidc))?;
        registration
            .query_pairs_mut()
            .append_pair("client_id", &config.client_id)
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", &config.auth_callback);

        Ok(Self {
            apis: build_url(apis_scheme, &config.apis_url, "/")?,
            auth: build_url(auth_scheme, &config.auth_url, "/")?,
            apis_online: build_url(apis_scheme, &config.apis_url, &config.online_path)?,
            auth_discovery: build_url(
                auth_scheme,
                &config.auth_url,
                &format!("{}/.well-known/openid-configuration", realm),
            )?,
            token: build_url(auth_scheme, &config.auth_url, &format!("{}/token", oidc))?,
            login,
            logout: build_url(auth_scheme, &config.auth_url, &format!("{}/logout", oidc))?,
            registration,
        })
    }
}

fn scheme(secure: bool) -> &'static str {
    if secure {
        "https"
    } else {
        "http"
    }
}

fn build_url(scheme: &str, host: &str, path: &str) -> Result<Url, ConfigError> {
    let url = format!("{}://{}{}", scheme, host, path);
    Url::parse(&url).map_err(|_| ConfigError::InvalidUrl { url })
}

/// Response as read from the wire, before status mapping
struct RawResponse {
    /// Bearer the request was signed with
    bearer: Option<BearerToken>,
    status: u16,
    session_cookie: Option<String>,
    www_authenticate: Option<String>,
    body: String,
}

/// Mutable state, guarded by a single mutex
#[derive(Debug)]
struct Inner {
    state: ConnectionState,
    tokens: TokenStore,
    connect_timer: Option<ScheduledTask>,
    check_timer: Option<ScheduledTask>,
    attempt: Option<CancellationToken>,
    session_id: Option<String>,
    default_headers: BTreeMap<String, String>,
    last_connection: Option<DateTime<Utc>>,
    last_disconnection: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Shared {
    config: CloudConfig,
    endpoints: Endpoints,
    transport: Arc<HttpTransport>,
    prober: ReachabilityProber,
    token_endpoint: TokenEndpoint,
    inner: Mutex<Inner>,
    /// Serializes token refresh and reconnect after a refused bearer
    recovery: tokio::sync::Mutex<()>,
    state_tx: watch::Sender<ConnectionState>,
    connection_listeners: EventHub<ConnectionEvent>,
    login_listeners: EventHub<LoginEvent>,
}

/// Cheaply cloneable handle to the cloud client
#[derive(Debug, Clone)]
pub struct CloudClient {
    shared: Arc<Shared>,
}

impl CloudClient {
    /// Create a disconnected client
    ///
    /// `auth_code_refresh_token` restores a previous user session; when
    /// present the next connection uses the auth-code flow.
    pub fn new(
        config: CloudConfig,
        client_secret: ClientSecret,
        auth_code_refresh_token: Option<RefreshToken>,
    ) -> Result<Self, JcpError> {
        config
            .validate()
            .map_err(|message| ConfigError::ValidationError { message })?;

        let endpoints = Endpoints::new(&config)?;
        let transport = Arc::new(
            HttpTransport::new(
                Duration::from_secs(config.probe_timeout_secs),
                config.tls_relaxed_fallback,
            )
            .map_err(|e| CloudError::Request(format!("Failed to create HTTP client: {}", e)))?,
        );
        let prober = ReachabilityProber::new(Arc::clone(&transport), config.api_name.clone());
        let token_endpoint = TokenEndpoint::new(
            Arc::clone(&transport),
            endpoints.token.clone(),
            config.client_id.clone(),
            client_secret,
            config.auth_scopes.clone(),
            config.auth_callback.clone(),
        );

        let mut default_headers = BTreeMap::new();
        default_headers.insert("Accept".to_string(), DEFAULT_ACCEPT.to_string());

        let inner = Inner {
            state: ConnectionState::Disconnected,
            tokens: TokenStore::new(auth_code_refresh_token),
            connect_timer: None,
            check_timer: None,
            attempt: None,
            session_id: None,
            default_headers,
            last_connection: None,
            last_disconnection: None,
        };

        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        debug!(api = %config.api_name, apis = %endpoints.apis, auth = %endpoints.auth, "Cloud client created");

        Ok(Self {
            shared: Arc::new(Shared {
                connection_listeners: EventHub::new("connection"),
                login_listeners: EventHub::new("login"),
                config,
                endpoints,
                transport,
                prober,
                token_endpoint,
                inner: Mutex::new(inner),
                recovery: tokio::sync::Mutex::new(()),
                state_tx,
            }),
        })
    }

    // Connection

    /// Open the connection
    ///
    /// No-op when already connected or connecting. Unreachable remotes are
    /// reported to listeners and retried on a timer; only a rejected
    /// authentication is returned as an error.
    #[tracing::instrument(skip(self), fields(api = %self.shared.config.api_name))]
    pub async fn connect(&self) -> Result<(), CloudError> {
        self.shared.connect().await
    }

    /// Close the connection or abort the attempt in progress; idempotent
    pub fn disconnect(&self) -> Result<(), CloudError> {
        self.shared.disconnect()
    }

    /// Execute `request` with the current access token
    ///
    /// A challenged 401 answer triggers one token refresh, or a full reconnection when
    /// the refresh fails, and the request is then sent once more.
    #[tracing::instrument(skip(self, request), fields(api = %self.shared.config.api_name, method = %request.method(), path = %request.path()))]
    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, CloudError> {
        self.shared.execute(&request).await
    }

    /// Stage a login code for the next connection (auth-code flow)
    pub fn set_login_code(&self, code: LoginCode) {
        self.shared.lock().tokens.set_login_code(code);
        debug!(api = %self.shared.config.api_name, "Login code staged");
    }

    /// Log the user out and reconnect with the client-credentials flow
    ///
    /// No-op when the auth-code flow is not in use.
    pub async fn logout(&self) -> Result<(), CloudError> {
        self.shared.logout().await
    }

    /// Probe a single remote once, outside the connection state machine
    pub async fn probe(&self, target: ProbeTarget) -> Result<ProbeReport, Unreachable> {
        let url = match target {
            ProbeTarget::Apis => &self.shared.endpoints.apis_online,
            ProbeTarget::Auth => &self.shared.endpoints.auth_discovery,
        };
        self.shared.prober.probe(target, url).await
    }

    // Listeners

    pub fn add_connection_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.shared.connection_listeners.add(listener)
    }

    pub fn remove_connection_listener(&self, id: ListenerId) -> bool {
        self.shared.connection_listeners.remove(id)
    }

    pub fn connection_listener_count(&self) -> usize {
        self.shared.connection_listeners.len()
    }

    pub fn add_login_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&LoginEvent) + Send + Sync + 'static,
    {
        self.shared.login_listeners.add(listener)
    }

    pub fn remove_login_listener(&self, id: ListenerId) -> bool {
        self.shared.login_listeners.remove(id)
    }

    /// Receiver notified of every state change
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    // Headers and session

    pub fn add_default_header(&self, name: impl Into<String>, value: impl Into<String>) {
        self.shared
            .lock()
            .default_headers
            .insert(name.into(), value.into());
    }

    pub fn remove_default_header(&self, name: &str) {
        self.shared.lock().default_headers.remove(name);
    }

    pub fn is_session_set(&self) -> bool {
        self.shared.lock().session_id.is_some()
    }

    // State getters

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// True while the connection retry timer is scheduled
    pub fn is_reconnecting(&self) -> bool {
        self.shared.lock().connect_timer.is_some()
    }

    pub fn last_connection(&self) -> Option<DateTime<Utc>> {
        self.shared.lock().last_connection
    }

    pub fn last_disconnection(&self) -> Option<DateTime<Utc>> {
        self.shared.lock().last_disconnection
    }

    pub fn is_auth_code_flow_enabled(&self) -> bool {
        self.shared.lock().tokens.is_auth_code_flow_enabled()
    }

    pub fn is_client_credentials_flow_enabled(&self) -> bool {
        self.shared.lock().tokens.is_client_credentials_flow_enabled()
    }

    pub fn is_user_authenticated(&self) -> bool {
        self.is_auth_code_flow_enabled()
    }

    pub fn is_user_anonymous(&self) -> bool {
        !self.is_auth_code_flow_enabled()
    }

    /// Current auth-code refresh token, for persistence across restarts
    pub fn auth_code_refresh_token(&self) -> Option<RefreshToken> {
        self.shared.lock().tokens.auth_code_refresh_token().cloned()
    }

    /// Flow of the current access token
    pub fn active_flow(&self) -> Option<AuthFlow> {
        self.shared.lock().tokens.active_flow()
    }

    // Config getters

    pub fn config(&self) -> &CloudConfig {
        &self.shared.config
    }

    pub fn client_id(&self) -> &str {
        &self.shared.config.client_id
    }

    pub fn api_name(&self) -> &str {
        &self.shared.config.api_name
    }

    pub fn is_https(&self) -> bool {
        self.shared.config.apis_secured
    }

    /// Delay and period of the retry and check timers
    pub fn retry_interval(&self) -> Duration {
        self.shared.retry_interval()
    }

    pub fn apis_url(&self) -> &Url {
        &self.shared.endpoints.apis
    }

    pub fn auth_url(&self) -> &Url {
        &self.shared.endpoints.auth
    }

    /// Identity provider page where the user logs in
    pub fn auth_login_url(&self) -> &Url {
        &self.shared.endpoints.login
    }

    /// Identity provider logout page, optionally redirecting afterwards
    pub fn auth_logout_url(&self, redirect: Option<&str>) -> Url {
        let mut url = self.shared.endpoints.logout.clone();
        if let Some(redirect) = redirect {
            url.query_pairs_mut().append_pair("redirect_uri", redirect);
        }
        url
    }

    pub fn auth_registration_url(&self) -> &Url {
        &self.shared.endpoints.registration
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.config.retry_interval_secs)
    }

    fn set_state(&self, inner: &mut Inner, state: ConnectionState) {
        if inner.state == state {
            return;
        }
        info!(api = %self.config.api_name, from = %inner.state, to = %state, "Cloud client state changed");
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    // Connection state machine

    async fn connect(self: &Arc<Self>) -> Result<(), CloudError> {
        let attempt = {
            let mut inner = self.lock();
            match inner.state {
                state if state.is_connected() || state.is_connecting() => {
                    debug!(api = %self.config.api_name, state = %state, "Connect skipped");
                    return Ok(());
                }
                ConnectionState::Disconnecting => {
                    return Err(CloudError::State(format!(
                        "Can't connect {} client because it is disconnecting, try again later",
                        self.config.api_name
                    )));
                }
                _ => {}
            }
            self.set_state(&mut inner, ConnectionState::Connecting);
            let attempt = CancellationToken::new();
            inner.attempt = Some(attempt.clone());
            attempt
        };

        self.init_connection(&attempt).await
    }

    fn disconnect(&self) -> Result<(), CloudError> {
        let closed = {
            let mut inner = self.lock();
            match inner.state {
                state if state.is_connected() => {
                    self.close_connection(&mut inner);
                    true
                }
                state if state.is_connecting() => {
                    if let Some(attempt) = inner.attempt.take() {
                        attempt.cancel();
                    }
                    if let Some(timer) = inner.connect_timer.take() {
                        timer.stop();
                    }
                    warn!(api = %self.config.api_name, "Connection attempt aborted by disconnect");
                    self.set_state(&mut inner, ConnectionState::Disconnected);
                    false
                }
                _ => false,
            }
        };

        if closed {
            self.connection_listeners.emit(&ConnectionEvent::Disconnected);
        }
        Ok(())
    }

    fn close_connection(&self, inner: &mut Inner) {
        self.set_state(inner, ConnectionState::Disconnecting);
        inner.tokens.clear_access();
        if let Some(timer) = inner.check_timer.take() {
            timer.stop();
        }
        self.set_state(inner, ConnectionState::Disconnected);
        inner.last_disconnection = Some(Utc::now());
    }

    async fn init_connection(self: &Arc<Self>, attempt: &CancellationToken) -> Result<(), CloudError> {
        let probe = tokio::select! {
            _ = attempt.cancelled() => return Ok(()),
            result = self.prober.probe(ProbeTarget::Apis, &self.endpoints.apis_online) => result,
        };
        if let Err(Unreachable(reason)) = probe {
            self.enter_waiting(attempt, ConnectionState::ConnectingWaitingDependency, reason);
            return Ok(());
        }

        let probe = tokio::select! {
            _ = attempt.cancelled() => return Ok(()),
            result = self.prober.probe(ProbeTarget::Auth, &self.endpoints.auth_discovery) => result,
        };
        if let Err(Unreachable(reason)) = probe {
            self.enter_waiting(attempt, ConnectionState::ConnectingWaitingAuth, reason);
            return Ok(());
        }

        let grant = { self.lock().tokens.grant() };
        let flow = grant.flow();
        let result = tokio::select! {
            _ = attempt.cancelled() => return Ok(()),
            result = self.token_endpoint.request(&grant) => result,
        };

        match result {
            Ok(token) => {
                self.complete_connection(attempt, flow, token);
                Ok(())
            }
            Err(TokenError::Transient(reason)) => {
                let reason = format!(
                    "Error connecting to {} because can't get the access token for {} flow ({})",
                    self.config.api_name, flow, reason
                );
                self.enter_waiting(attempt, ConnectionState::ConnectingWaitingAuth, reason);
                Ok(())
            }
            Err(TokenError::Rejected(reason)) => self.fail_authentication(attempt, flow, reason),
        }
    }

    /// Called by the retry timer while waiting for a remote
    async fn retry_connection(self: &Arc<Self>) {
        let attempt = {
            let inner = self.lock();
            if !inner.state.is_waiting() {
                return;
            }
            match &inner.attempt {
                Some(attempt) => attempt.clone(),
                None => return,
            }
        };

        trace!(api = %self.config.api_name, "Retrying connection");
        if let Err(e) = self.init_connection(&attempt).await {
            debug!(api = %self.config.api_name, error = %e, "Timer connection attempt failed");
        }
    }

    fn enter_waiting(self: &Arc<Self>, attempt: &CancellationToken, waiting: ConnectionState, reason: String) {
        {
            let mut inner = self.lock();
            if attempt.is_cancelled() {
                return;
            }
            if inner.state != waiting {
                warn!(api = %self.config.api_name, reason = %reason, "Can't connect, waiting for connection timer");
                self.set_state(&mut inner, waiting);
            }
            if inner.connect_timer.is_none() {
                inner.connect_timer = Some(self.start_connect_timer());
            }
        }

        self.connection_listeners
            .emit(&ConnectionEvent::ConnectionFailed(reason));
    }

    fn complete_connection(self: &Arc<Self>, attempt: &CancellationToken, flow: AuthFlow, token: AccessToken) {
        {
            let mut inner = self.lock();
            if attempt.is_cancelled() {
                debug!(api = %self.config.api_name, "Token obtained for an aborted attempt, discarded");
                return;
            }
            inner.tokens.install(flow, token);
            inner.attempt = None;
            if let Some(timer) = inner.connect_timer.take() {
                timer.stop();
            }
            let state = match flow {
                AuthFlow::ClientCredentials => ConnectionState::ConnectedAnonymous,
                AuthFlow::AuthCode => ConnectionState::ConnectedLogged,
            };
            self.set_state(&mut inner, state);
            if let Some(old) = inner.check_timer.replace(self.start_check_timer()) {
                old.stop();
            }
            inner.last_connection = Some(Utc::now());
        }

        info!(api = %self.config.api_name, flow = %flow, "Cloud client connected");
        if flow == AuthFlow::AuthCode {
            self.login_listeners.emit(&LoginEvent::LoggedIn);
        }
        self.connection_listeners.emit(&ConnectionEvent::Connected);
    }

    fn fail_authentication(&self, attempt: &CancellationToken, flow: AuthFlow, reason: String) -> Result<(), CloudError> {
        let message = format!(
            "Client '{}' can't authenticate to {} via {} flow: {}",
            self.config.client_id, self.config.api_name, flow, reason
        );
        {
            let mut inner = self.lock();
            if attempt.is_cancelled() {
                return Ok(());
            }
            inner.attempt = None;
            if let Some(timer) = inner.connect_timer.take() {
                timer.stop();
            }
            inner.tokens.clear_auth_code();
            inner.tokens.clear_access();
            self.set_state(&mut inner, ConnectionState::Disconnected);
        }

        warn!(api = %self.config.api_name, flow = %flow, "Authentication failed");
        self.connection_listeners
            .emit(&ConnectionEvent::AuthenticationFailed(message.clone()));
        Err(CloudError::Authentication(message))
    }

    // Timers

    fn start_connect_timer(self: &Arc<Self>) -> ScheduledTask {
        let weak = Arc::downgrade(self);
        let interval = self.retry_interval();
        ScheduledTask::start(
            format!("{}-connect", self.config.api_name),
            interval,
            interval,
            move |_| {
                let weak = weak.clone();
                async move {
                    if let Some(shared) = weak.upgrade() {
                        shared.retry_connection().await;
                    }
                }
            },
        )
    }

    fn start_check_timer(self: &Arc<Self>) -> ScheduledTask {
        let weak = Arc::downgrade(self);
        let interval = self.retry_interval();
        ScheduledTask::start(
            format!("{}-check", self.config.api_name),
            interval,
            interval,
            move |own| {
                let weak = weak.clone();
                async move {
                    if let Some(shared) = weak.upgrade() {
                        shared.check_connection(own).await;
                    }
                }
            },
        )
    }

    /// Re-probe both remotes; reconnect from scratch when one is gone
    async fn check_connection(self: &Arc<Self>, own: CancellationToken) {
        let probes = async {
            self.prober
                .probe(ProbeTarget::Apis, &self.endpoints.apis_online)
                .await?;
            self.prober
                .probe(ProbeTarget::Auth, &self.endpoints.auth_discovery)
                .await
        };
        let result = tokio::select! {
            _ = own.cancelled() => return,
            result = probes => result,
        };
        let reason = match result {
            Ok(_) => {
                trace!(api = %self.config.api_name, "Connection check passed");
                return;
            }
            Err(Unreachable(reason)) => reason,
        };

        {
            let mut inner = self.lock();
            if own.is_cancelled() || !inner.state.is_connected() {
                return;
            }
            // This check timer ends here; a successful reconnection starts a new one
            own.cancel();
            warn!(api = %self.config.api_name, reason = %reason, "Connection check failed, reconnecting");
            self.close_connection(&mut inner);
        }
        self.connection_listeners.emit(&ConnectionEvent::Disconnected);

        if let Err(e) = self.connect().await {
            warn!(api = %self.config.api_name, error = %e, "Can't reconnect after failed connection check");
        }
    }

    // Requests

    fn request_url(&self, request: &ApiRequest) -> Result<Url, CloudError> {
        let scheme = if request.to_auth {
            scheme(self.config.auth_secured)
        } else {
            scheme(request.secure.unwrap_or(self.config.apis_secured))
        };
        let host = if request.to_auth {
            &self.config.auth_url
        } else {
            &self.config.apis_url
        };
        let mut url = build_url(scheme, host, &request.path).map_err(|e| {
            CloudError::Request(format!(
                "Error on prepare request '[{}] {}' because {}",
                request.method, request.path, e
            ))
        })?;
        if !request.params.is_empty() {
            url.query_pairs_mut().extend_pairs(request.params.iter());
        }
        Ok(url)
    }

    async fn execute(self: &Arc<Self>, request: &ApiRequest) -> Result<ApiResponse, CloudError> {
        let url = self.request_url(request)?;
        if !self.lock().state.is_connected() {
            return Err(self.not_connected(request, &url));
        }
        request.validate()?;

        let mut response = self.send(request, &url).await?;
        // Only a 401 carrying a challenge means the bearer was refused
        if response.status == 401 && response.www_authenticate.is_some() {
            self.recover_session(response.bearer.take(), response.www_authenticate.as_deref())
                .await?;
            if !self.wait_settled().await.is_connected() {
                return Err(self.not_connected(request, &url));
            }
            response = self.send(request, &url).await?;
        }

        if let Some(cookie) = response.session_cookie.take() {
            self.lock().session_id = Some(cookie);
        }

        if !(200..300).contains(&response.status) {
            let mut error = ResponseError::from_status(url.as_str(), response.status, response.body);
            if response.status == 401 {
                error.cause = response.www_authenticate;
            }
            return Err(error.into());
        }

        Ok(ApiResponse::new(url.to_string(), response.status, response.body))
    }

    /// Renew the session after `refused` was rejected
    ///
    /// Concurrent callers queue on the recovery lock; whoever finds the
    /// stored bearer already replaced skips straight to the replay.
    async fn recover_session(
        self: &Arc<Self>,
        refused: Option<BearerToken>,
        challenge: Option<&str>,
    ) -> Result<(), CloudError> {
        let _recovery = self.recovery.lock().await;

        let current = { self.lock().tokens.bearer() };
        let renewed = match (&refused, &current) {
            (Some(refused), Some(current)) => refused.expose() != current.expose(),
            (None, Some(_)) => true,
            (_, None) => false,
        };
        if renewed {
            debug!(api = %self.config.api_name, "Access token already renewed");
            return Ok(());
        }

        warn!(api = %self.config.api_name, www_authenticate = ?challenge, "Unauthorized, refreshing access token");
        if !self.refresh_connection().await {
            warn!(api = %self.config.api_name, "Token refresh failed, reconnecting");
            self.reconnect().await?;
        }
        Ok(())
    }

    /// Wait, bounded by the probe timeout, for the state to leave the
    /// transient connecting and disconnecting states
    async fn wait_settled(&self) -> ConnectionState {
        let mut rx = self.state_tx.subscribe();
        let bound = Duration::from_secs(self.config.probe_timeout_secs);
        let settled = tokio::time::timeout(
            bound,
            rx.wait_for(|state| {
                !matches!(state, ConnectionState::Connecting | ConnectionState::Disconnecting)
            }),
        )
        .await;
        match settled {
            Ok(Ok(state)) => *state,
            _ => self.lock().state,
        }
    }

    fn not_connected(&self, request: &ApiRequest, url: &Url) -> CloudError {
        CloudError::Connection(format!(
            "Error on exec request '[{}] {}' because not connected to {}",
            request.method, url, self.config.api_name
        ))
    }

    /// Sign and send; the bearer is read at send time so a replay uses the newest token
    async fn send(&self, request: &ApiRequest, url: &Url) -> Result<RawResponse, CloudError> {
        let (bearer, headers, session) = {
            let inner = self.lock();
            (
                inner.tokens.bearer(),
                inner.default_headers.clone(),
                inner.session_id.clone(),
            )
        };

        let mut builder = self
            .transport
            .client_for(url)
            .request(request.method.as_reqwest(), url.clone());
        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(session) = session {
            builder = builder.header(COOKIE, session);
        }
        if let Some(bearer) = &bearer {
            builder = builder.bearer_auth(bearer.expose());
        }
        if let Some(body) = &request.body {
            builder = builder
                .header(CONTENT_TYPE, JSON_CONTENT_TYPE)
                .body(body.clone());
        }

        let request_error = |e: reqwest::Error| {
            CloudError::Request(format!(
                "Error on exec [{}] request @ '{}' because {}",
                request.method,
                url,
                describe_error(&e)
            ))
        };

        let response = builder.send().await.map_err(request_error)?;
        let status = response.status().as_u16();
        let session_cookie = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find(|v| v.contains(SESSION_KEY))
            .and_then(|v| v.split(';').next())
            .map(|v| v.trim().to_string());
        let www_authenticate = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.map_err(request_error)?;

        Ok(RawResponse {
            bearer,
            status,
            session_cookie,
            www_authenticate,
            body,
        })
    }

    /// Refresh the access token of the active flow; no retry on failure
    async fn refresh_connection(&self) -> bool {
        let refresh = { self.lock().tokens.refresh_token() };
        let Some(refresh) = refresh else {
            debug!(api = %self.config.api_name, "No refresh token available");
            return false;
        };

        match self.token_endpoint.request(&Grant::RefreshToken(refresh)).await {
            Ok(token) => {
                let replaced = self.lock().tokens.replace(token);
                if replaced {
                    debug!(api = %self.config.api_name, "Access token refreshed");
                }
                replaced
            }
            Err(e) => {
                debug!(api = %self.config.api_name, error = %e, "Access token refresh failed");
                false
            }
        }
    }

    /// Full disconnect and reconnect, re-running flow selection
    ///
    /// A rejected user flow drops its material and falls back to the
    /// client-credentials flow.
    async fn reconnect(self: &Arc<Self>) -> Result<(), CloudError> {
        let flow = { self.lock().tokens.flow() };
        self.disconnect()?;

        match self.connect().await {
            Err(CloudError::Authentication(reason)) if flow == AuthFlow::AuthCode => {
                info!(api = %self.config.api_name, reason = %reason, "User session expired, falling back to client credentials");
                self.login_listeners.emit(&LoginEvent::LoggedOut);
                self.connect().await
            }
            other => other,
        }
    }

    async fn logout(self: &Arc<Self>) -> Result<(), CloudError> {
        let user = { self.lock().tokens.is_auth_code_flow_enabled() };
        if !user {
            return Ok(());
        }

        let logout_path = self.endpoints.logout.path().to_string();
        if let Err(e) = self.execute(&ApiRequest::get(logout_path).to_auth()).await {
            warn!(api = %self.config.api_name, error = %e, "Logout request failed");
        }

        self.lock().session_id = None;
        self.disconnect()?;
        self.lock().tokens.clear_auth_code();
        info!(api = %self.config.api_name, "User logged out");
        self.login_listeners.emit(&LoginEvent::LoggedOut);

        self.connect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> CloudClient {
        let mut config = CloudConfig::new(
            "jod-object".to_string(),
            "api.example.org:9001".to_string(),
            "auth.example.org:8998".to_string(),
        );
        config.auth_callback = "https://localhost:8080/login/code".to_string();
        CloudClient::new(config, ClientSecret::new("secret".to_string()), None).unwrap()
    }

    #[test]
    fn test_endpoint_urls() {
        let client = client();
        assert_eq!(client.apis_url().as_str(), "https://api.example.org:9001/");
        assert_eq!(client.auth_url().as_str(), "https://auth.example.org:8998/");
        assert_eq!(
            client.shared.endpoints.token.as_str(),
            "https://auth.example.org:8998/auth/realms/jcp/protocol/openid-connect/token"
        );
        assert_eq!(
            client.shared.endpoints.auth_discovery.as_str(),
            "https://auth.example.org:8998/auth/realms/jcp/.well-known/openid-configuration"
        );
        assert_eq!(
            client.shared.endpoints.apis_online.as_str(),
            "https://api.example.org:9001/apis/JCP/2.0/online/"
        );
    }

    #[test]
    fn test_login_and_logout_urls() {
        let client = client();
        let login = client.auth_login_url();
        assert_eq!(login.path(), "/auth/realms/jcp/protocol/openid-connect/auth");
        let pairs: Vec<(String, String)> = login.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("client_id".to_string(), "jod-object".to_string())));
        assert!(pairs.contains(&("response_type".to_string(), "code".to_string())));

        let logout = client.auth_logout_url(Some("https://localhost/bye"));
        assert_eq!(
            logout.as_str(),
            "https://auth.example.org:8998/auth/realms/jcp/protocol/openid-connect/logout?redirect_uri=https%3A%2F%2Flocalhost%2Fbye"
        );
        assert!(client
            .auth_registration_url()
            .path()
            .ends_with("/openid-connect/registrations"));
    }

    #[test]
    fn test_request_url_scheme_rule() {
        let client = client();
        let shared = &client.shared;

        let plain = shared
            .request_url(&ApiRequest::get("/apis/x").secure(false).param("a", "1 2"))
            .unwrap();
        assert_eq!(plain.as_str(), "http://api.example.org:9001/apis/x?a=1+2");

        let auth = shared
            .request_url(&ApiRequest::get("/auth/x").to_auth().secure(false))
            .unwrap();
        assert_eq!(auth.scheme(), "https");

        let default = shared.request_url(&ApiRequest::post("/apis/y")).unwrap();
        assert_eq!(default.scheme(), "https");
    }

    #[test]
    fn test_auth_request_scheme_follows_auth_secured() {
        let mut config = CloudConfig::new(
            "jod-object".to_string(),
            "api.example.org:9001".to_string(),
            "auth.example.org:8998".to_string(),
        );
        config.auth_secured = false;
        let client = CloudClient::new(config, ClientSecret::new("secret".to_string()), None).unwrap();

        let auth = client
            .shared
            .request_url(&ApiRequest::get("/auth/x").to_auth())
            .unwrap();
        assert_eq!(auth.as_str(), "http://auth.example.org:8998/auth/x");

        let apis = client.shared.request_url(&ApiRequest::get("/apis/x")).unwrap();
        assert_eq!(apis.scheme(), "https");
    }

    #[test]
    fn test_initial_state_and_defaults() {
        let client = client();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(!client.is_connected());
        assert!(!client.is_reconnecting());
        assert!(client.is_user_anonymous());
        assert!(client.last_connection().is_none());
        assert_eq!(
            client.shared.lock().default_headers.get("Accept").map(String::as_str),
            Some(DEFAULT_ACCEPT)
        );
    }

    #[test]
    fn test_disconnect_when_disconnected_is_noop() {
        let client = client();
        assert!(client.disconnect().is_ok());
        assert!(client.disconnect().is_ok());
        assert!(client.last_disconnection().is_none());
    }

    #[tokio::test]
    async fn test_execute_requires_connection() {
        let client = client();
        let result = client.execute(ApiRequest::get("/apis/x")).await;
        assert!(matches!(result, Err(CloudError::Connection(_))));
    }

    #[test]
    fn test_initial_refresh_token_enables_user_flow() {
        let config = CloudConfig::new(
            "svc".to_string(),
            "localhost:9001".to_string(),
            "localhost:8998".to_string(),
        );
        let client = CloudClient::new(
            config,
            ClientSecret::new("s".to_string()),
            Some(RefreshToken::new("rt".to_string())),
        )
        .unwrap();
        assert!(client.is_user_authenticated());
        assert_eq!(client.auth_code_refresh_token().unwrap().expose(), "rt");
    }
}
