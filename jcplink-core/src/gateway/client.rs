//! Gateway tunnel client
//!
//! [`GatewayClient`] wraps a secure peer opened through a cloud gateway.
//! Every `connect()` generates a fresh local identity and trust store, asks
//! the cloud client for access info, trusts the returned gateway
//! certificate and opens a peer, which never reconnects on its own.
//!
//! The wrapper owns the retry policy:
//! - while the cloud client is offline it waits on a one-shot listener and
//!   retries as soon as the cloud client reports `Connected`;
//! - any other failure schedules a single reconnect timer, keyed by the
//!   local id and paced by the cloud client's retry interval;
//! - an unexpected drop of an established peer triggers one new `connect()`,
//!   local disconnects and never-established attempts do not.

use crate::cloud::{CloudClient, ConnectionEvent, EventHub, ListenerId};
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::gateway::access::AccessInfoSource;
use crate::gateway::identity::LocalIdentity;
use crate::gateway::peer::{PeerOpener, PeerSettings, SecurePeer};
use crate::gateway::state::{DisconnectReason, GatewayEvent, GatewayState};
use crate::gateway::trust::{build_client_config, parse_certificate, DynTrustStore, GATEWAY_CERT_ALIAS};
use crate::scheduler::ScheduledTask;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
struct Inner {
    state: GatewayState,
    identity: Option<Arc<LocalIdentity>>,
    trust: DynTrustStore,
    peer: Option<Arc<dyn SecurePeer>>,
    /// Bumped for every opened peer, to ignore drops of replaced peers
    generation: u64,
    attempt: Option<CancellationToken>,
    dependency_listener: Option<ListenerId>,
    reconnect_timer: Option<ScheduledTask>,
}

struct Shared {
    config: GatewayConfig,
    cloud: CloudClient,
    access: Arc<dyn AccessInfoSource>,
    opener: Arc<dyn PeerOpener>,
    peer_settings: PeerSettings,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<GatewayState>,
    listeners: EventHub<GatewayEvent>,
}

/// Cheaply cloneable handle to a gateway tunnel client
#[derive(Clone)]
pub struct GatewayClient {
    shared: Arc<Shared>,
}

impl GatewayClient {
    pub fn new(
        config: GatewayConfig,
        cloud: CloudClient,
        access: Arc<dyn AccessInfoSource>,
        opener: Arc<dyn PeerOpener>,
    ) -> Result<Self, GatewayError> {
        config.validate().map_err(GatewayError::State)?;

        let (state_tx, _) = watch::channel(GatewayState::Disconnected);
        let shared = Arc::new(Shared {
            config,
            cloud,
            access,
            opener,
            peer_settings: PeerSettings::default(),
            inner: Mutex::new(Inner {
                state: GatewayState::Disconnected,
                identity: None,
                trust: DynTrustStore::new(),
                peer: None,
                generation: 0,
                attempt: None,
                dependency_listener: None,
                reconnect_timer: None,
            }),
            state_tx,
            listeners: EventHub::new("gateway"),
        });

        // Self healing: only drops of an established peer reconnect
        let weak = Arc::downgrade(&shared);
        shared.listeners.add(move |event| {
            let GatewayEvent::Disconnected { reason } = event else {
                return;
            };
            match reason {
                DisconnectReason::LocalRequest | DisconnectReason::NeverConnected => {}
                DisconnectReason::RemoteDrop => {
                    let Some(shared) = weak.upgrade() else {
                        return;
                    };
                    if !shared.config.auto_reconnect {
                        return;
                    }
                    info!(local_id = %shared.config.local_id, "Gateway peer dropped, reconnecting");
                    spawn_detached(async move {
                        if let Err(e) = shared.connect().await {
                            warn!(local_id = %shared.config.local_id, error = %e, "Gateway reconnection failed");
                        }
                    });
                }
            }
        });

        debug!(local_id = %shared.config.local_id, "Gateway client created");
        Ok(Self { shared })
    }

    /// Open the tunnel; no-op when connected or connecting
    ///
    /// Returns the error of the first attempt. Unless auto-reconnect is
    /// disabled, a failed attempt keeps being retried in the background.
    #[tracing::instrument(skip(self), fields(local_id = %self.shared.config.local_id))]
    pub async fn connect(&self) -> Result<(), GatewayError> {
        self.shared.connect().await
    }

    /// Close the tunnel or stop waiting for it; idempotent
    pub fn disconnect(&self) {
        self.shared.disconnect()
    }

    /// Send raw bytes through the open peer
    pub fn send(&self, data: &[u8]) -> Result<(), GatewayError> {
        let peer = self.shared.lock().peer.clone();
        match peer {
            Some(peer) => peer.send(data),
            None => Err(GatewayError::State(format!(
                "gateway client '{}' is not connected",
                self.shared.config.local_id
            ))),
        }
    }

    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&GatewayEvent) + Send + Sync + 'static,
    {
        self.shared.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared.listeners.remove(id)
    }

    pub fn state_receiver(&self) -> watch::Receiver<GatewayState> {
        self.shared.state_tx.subscribe()
    }

    pub fn state(&self) -> GatewayState {
        self.shared.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// True while the reconnect timer is scheduled
    pub fn is_reconnecting(&self) -> bool {
        self.shared.lock().reconnect_timer.is_some()
    }

    pub fn is_waiting_dependency(&self) -> bool {
        self.shared.lock().dependency_listener.is_some()
    }

    pub fn local_id(&self) -> &str {
        &self.shared.config.local_id
    }

    /// Identity of the current connection cycle
    pub fn identity(&self) -> Option<Arc<LocalIdentity>> {
        self.shared.lock().identity.clone()
    }

    /// Trust store of the current connection cycle
    pub fn trust_store(&self) -> DynTrustStore {
        self.shared.lock().trust.clone()
    }

    pub fn cloud(&self) -> &CloudClient {
        &self.shared.cloud
    }
}

impl std::fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClient")
            .field("local_id", &self.shared.config.local_id)
            .field("state", &self.state())
            .finish()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, inner: &mut Inner, state: GatewayState) {
        if inner.state == state {
            return;
        }
        info!(local_id = %self.config.local_id, from = %inner.state, to = %state, "Gateway client state changed");
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    async fn connect(self: &Arc<Self>) -> Result<(), GatewayError> {
        let attempt = {
            let mut inner = self.lock();
            match inner.state {
                state if state.is_connected() || state.is_connecting() => {
                    debug!(local_id = %self.config.local_id, state = %state, "Connect skipped");
                    return Ok(());
                }
                GatewayState::Disconnecting => {
                    return Err(GatewayError::State(format!(
                        "gateway client '{}' is disconnecting",
                        self.config.local_id
                    )));
                }
                _ => {}
            }
            self.set_state(&mut inner, GatewayState::Connecting);
            let attempt = CancellationToken::new();
            inner.attempt = Some(attempt.clone());
            attempt
        };
        self.listeners.emit(&GatewayEvent::Connecting);

        let identity = match LocalIdentity::generate(&self.config.local_id) {
            Ok(identity) => Arc::new(identity),
            Err(e) => {
                error!(local_id = %self.config.local_id, error = %e, "Can't generate local identity");
                let current = {
                    let mut inner = self.lock();
                    let current = !attempt.is_cancelled();
                    if current {
                        inner.attempt = None;
                        self.set_state(&mut inner, GatewayState::Disconnected);
                    }
                    current
                };
                if current {
                    self.listeners.emit(&GatewayEvent::Failed {
                        message: e.to_string(),
                    });
                }
                return Err(e);
            }
        };

        {
            let mut inner = self.lock();
            if attempt.is_cancelled() {
                return Ok(());
            }
            inner.identity = Some(identity);
            inner.trust = DynTrustStore::new();
        }

        self.do_connect(&attempt, false).await
    }

    /// One connection attempt with the identity of the current cycle
    ///
    /// With `prevent_retry` set, failures neither schedule the reconnect
    /// timer nor emit a terminal disconnection.
    async fn do_connect(self: &Arc<Self>, attempt: &CancellationToken, mut prevent_retry: bool) -> Result<(), GatewayError> {
        if !self.cloud.is_connected() {
            if !prevent_retry {
                if self.config.auto_reconnect {
                    self.wait_on_dependency(attempt);
                } else {
                    self.give_up(attempt, GatewayError::DependencyNotConnected.to_string());
                }
            }
            return Err(GatewayError::DependencyNotConnected);
        }

        let (identity, trust, listener) = {
            let mut inner = self.lock();
            if attempt.is_cancelled() {
                return Err(aborted());
            }
            let identity = inner
                .identity
                .clone()
                .ok_or_else(|| GatewayError::Identity("no local identity generated".to_string()))?;
            (identity, inner.trust.clone(), inner.dependency_listener.take())
        };
        if let Some(id) = listener {
            self.cloud.remove_connection_listener(id);
            prevent_retry = false;
        }

        let result = tokio::select! {
            _ = attempt.cancelled() => return Err(aborted()),
            result = self.open(&identity, &trust) => result,
        };

        match result {
            Ok(peer) => self.complete_connection(attempt, peer),
            Err(e) => {
                if !prevent_retry {
                    self.handle_failure(attempt, &e);
                }
                Err(e)
            }
        }
    }

    async fn open(&self, identity: &LocalIdentity, trust: &DynTrustStore) -> Result<Arc<dyn SecurePeer>, GatewayError> {
        let access = self
            .access
            .fetch_access_info(&self.cloud, identity.certificate())
            .await?;

        let server_cert = parse_certificate(&access.gw_certificate)?;
        trust.add_certificate(GATEWAY_CERT_ALIAS, server_cert);

        let tls = build_client_config(identity, trust)?;
        self.opener.open_peer(&access, tls, self.peer_settings).await
    }

    fn complete_connection(self: &Arc<Self>, attempt: &CancellationToken, peer: Arc<dyn SecurePeer>) -> Result<(), GatewayError> {
        let generation = {
            let mut inner = self.lock();
            if attempt.is_cancelled() {
                peer.close();
                return Err(aborted());
            }
            if let Some(timer) = inner.reconnect_timer.take() {
                timer.stop();
            }
            inner.generation += 1;
            inner.peer = Some(Arc::clone(&peer));
            self.set_state(&mut inner, GatewayState::Connected);
            inner.generation
        };

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            peer.closed().await;
            if let Some(shared) = weak.upgrade() {
                shared.peer_closed(generation);
            }
        });

        info!(local_id = %self.config.local_id, "Gateway client connected");
        self.listeners.emit(&GatewayEvent::Connected);
        Ok(())
    }

    fn peer_closed(&self, generation: u64) {
        {
            let mut inner = self.lock();
            if inner.generation != generation || !inner.state.is_connected() {
                return;
            }
            inner.peer = None;
            inner.attempt = None;
            self.set_state(&mut inner, GatewayState::Disconnected);
        }
        warn!(local_id = %self.config.local_id, "Gateway peer closed unexpectedly");
        self.listeners.emit(&GatewayEvent::Disconnected {
            reason: DisconnectReason::RemoteDrop,
        });
    }

    /// Register the one-shot listener on the cloud client
    fn wait_on_dependency(self: &Arc<Self>, attempt: &CancellationToken) {
        {
            let mut inner = self.lock();
            if attempt.is_cancelled() {
                return;
            }
            if inner.dependency_listener.is_none() {
                let weak = Arc::downgrade(self);
                let token = attempt.clone();
                let id = self.cloud.add_connection_listener(move |event| {
                    if *event == ConnectionEvent::Connected {
                        dependency_ready(&weak, &token);
                    }
                });
                inner.dependency_listener = Some(id);
            }
            info!(local_id = %self.config.local_id, "Cloud client not connected, waiting for it");
            self.set_state(&mut inner, GatewayState::WaitingOnDependency);
        }
        self.listeners.emit(&GatewayEvent::Waiting);

        // The cloud client may have connected before the listener was in place
        if self.cloud.is_connected() {
            dependency_ready(&Arc::downgrade(self), attempt);
        }
    }

    fn handle_failure(self: &Arc<Self>, attempt: &CancellationToken, e: &GatewayError) {
        if !self.config.auto_reconnect {
            self.give_up(attempt, e.to_string());
            return;
        }

        {
            let mut inner = self.lock();
            if attempt.is_cancelled() {
                return;
            }
            warn!(local_id = %self.config.local_id, error = %e, "Gateway connection failed, waiting for reconnect timer");
            if inner.reconnect_timer.is_none() {
                inner.reconnect_timer = Some(self.start_reconnect_timer());
            }
            self.set_state(&mut inner, GatewayState::WaitingToRetry);
        }
        self.listeners.emit(&GatewayEvent::Failed {
            message: e.to_string(),
        });
        self.listeners.emit(&GatewayEvent::Waiting);
    }

    /// Terminal failure without retry
    fn give_up(&self, attempt: &CancellationToken, message: String) {
        {
            let mut inner = self.lock();
            if attempt.is_cancelled() {
                return;
            }
            inner.attempt = None;
            self.set_state(&mut inner, GatewayState::Disconnected);
        }
        warn!(local_id = %self.config.local_id, reason = %message, "Gateway connection failed");
        self.listeners.emit(&GatewayEvent::Failed { message });
        self.listeners.emit(&GatewayEvent::Disconnected {
            reason: DisconnectReason::NeverConnected,
        });
    }

    fn start_reconnect_timer(self: &Arc<Self>) -> ScheduledTask {
        let weak = Arc::downgrade(self);
        let interval = self.cloud.retry_interval();
        ScheduledTask::start(
            format!("{}-gw-reconnect", self.config.local_id),
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

        if let Err(e) = self.do_connect(&attempt, true).await {
            if !attempt.is_cancelled() {
                debug!(local_id = %self.config.local_id, error = %e, "Timer connection attempt failed");
                self.listeners.emit(&GatewayEvent::Failed {
                    message: e.to_string(),
                });
            }
        }
    }

    fn disconnect(&self) {
        let (listener, peer) = {
            let mut inner = self.lock();
            let state = inner.state;
            if !state.is_connected() && !state.is_connecting() {
                debug!(local_id = %self.config.local_id, state = %state, "Disconnect skipped");
                return;
            }
            if let Some(attempt) = inner.attempt.take() {
                attempt.cancel();
            }
            if let Some(timer) = inner.reconnect_timer.take() {
                timer.stop();
            }
            if state.is_connected() {
                self.set_state(&mut inner, GatewayState::Disconnecting);
            }
            (inner.dependency_listener.take(), inner.peer.take())
        };

        if let Some(id) = listener {
            self.cloud.remove_connection_listener(id);
        }
        if let Some(peer) = peer {
            self.listeners.emit(&GatewayEvent::Disconnecting);
            peer.close();
        }

        self.set_state(&mut self.lock(), GatewayState::Disconnected);
        info!(local_id = %self.config.local_id, "Gateway client disconnected");
        self.listeners.emit(&GatewayEvent::Disconnected {
            reason: DisconnectReason::LocalRequest,
        });
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(attempt) = inner.attempt.take() {
            attempt.cancel();
        }
        if let Some(timer) = inner.reconnect_timer.take() {
            timer.stop();
        }
        let listener = inner.dependency_listener.take();
        let peer = inner.peer.take();

        if let Some(id) = listener {
            self.cloud.remove_connection_listener(id);
        }
        // The watcher task keeps its own handle, dropping ours is not enough
        if let Some(peer) = peer {
            peer.close();
        }
        debug!(local_id = %self.config.local_id, "Gateway client dropped");
    }
}

/// Cloud client connected: drop the one-shot listener and retry
fn dependency_ready(weak: &Weak<Shared>, attempt: &CancellationToken) {
    let Some(shared) = weak.upgrade() else {
        return;
    };
    let listener = {
        let mut inner = shared.lock();
        if attempt.is_cancelled() {
            return;
        }
        inner.dependency_listener.take()
    };
    let Some(id) = listener else {
        return;
    };
    shared.cloud.remove_connection_listener(id);

    debug!(local_id = %shared.config.local_id, "Cloud client connected, resuming gateway connection");
    let attempt = attempt.clone();
    spawn_detached(async move {
        if let Err(e) = shared.do_connect(&attempt, false).await {
            debug!(local_id = %shared.config.local_id, error = %e, "Gateway connection after dependency failed");
        }
    });
}

fn aborted() -> GatewayError {
    GatewayError::State("connection attempt aborted".to_string())
}

/// Spawn from synchronous listener code, when a runtime is available
fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
        }
        Err(_) => warn!("No tokio runtime available, gateway task not started"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CloudConfig;
    use crate::gateway::access::TunnelAccessInfo;
    use crate::types::ClientSecret;
    use async_trait::async_trait;
    use rustls::pki_types::CertificateDer;
    use rustls::ClientConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoAccess;

    #[async_trait]
    impl AccessInfoSource for NoAccess {
        async fn fetch_access_info(
            &self,
            _cloud: &CloudClient,
            _certificate: &CertificateDer<'static>,
        ) -> Result<TunnelAccessInfo, GatewayError> {
            Err(GatewayError::AccessInfo("unavailable".to_string()))
        }
    }

    struct NoPeer;

    #[async_trait]
    impl PeerOpener for NoPeer {
        async fn open_peer(
            &self,
            _access: &TunnelAccessInfo,
            _tls: Arc<ClientConfig>,
            _settings: PeerSettings,
        ) -> Result<Arc<dyn SecurePeer>, GatewayError> {
            Err(GatewayError::PeerOpen("unavailable".to_string()))
        }
    }

    fn offline_cloud() -> CloudClient {
        let config = CloudConfig::new(
            "jod-object".to_string(),
            "127.0.0.1:9".to_string(),
            "127.0.0.1:9".to_string(),
        );
        CloudClient::new(config, ClientSecret::new("secret".to_string()), None).unwrap()
    }

    fn gateway(auto_reconnect: bool) -> GatewayClient {
        let mut config = GatewayConfig::new("object-0001".to_string());
        config.auto_reconnect = auto_reconnect;
        GatewayClient::new(config, offline_cloud(), Arc::new(NoAccess), Arc::new(NoPeer)).unwrap()
    }

    fn record(client: &GatewayClient) -> Arc<Mutex<Vec<GatewayEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        client.add_listener(move |event| sink.lock().unwrap().push(event.clone()));
        events
    }

    #[tokio::test]
    async fn test_waits_on_offline_dependency() {
        let client = gateway(true);
        let events = record(&client);
        let listeners_before = client.cloud().connection_listener_count();

        let result = client.connect().await;
        assert_eq!(result, Err(GatewayError::DependencyNotConnected));
        assert_eq!(client.state(), GatewayState::WaitingOnDependency);
        assert!(client.is_waiting_dependency());
        assert!(client.identity().is_some());
        assert_eq!(client.cloud().connection_listener_count(), listeners_before + 1);
        assert_eq!(
            *events.lock().unwrap(),
            vec![GatewayEvent::Connecting, GatewayEvent::Waiting]
        );

        // Second connect while waiting is a no-op
        assert!(client.connect().await.is_ok());
        assert_eq!(client.cloud().connection_listener_count(), listeners_before + 1);
    }

    #[tokio::test]
    async fn test_drop_while_waiting_removes_dependency_listener() {
        let client = gateway(true);
        let cloud = client.cloud().clone();
        let listeners_before = cloud.connection_listener_count();

        let _ = client.connect().await;
        assert_eq!(cloud.connection_listener_count(), listeners_before + 1);

        drop(client);
        assert_eq!(cloud.connection_listener_count(), listeners_before);
    }

    #[tokio::test]
    async fn test_disconnect_while_waiting() {
        let client = gateway(true);
        let listeners_before = client.cloud().connection_listener_count();
        let _ = client.connect().await;
        let events = record(&client);

        client.disconnect();
        assert_eq!(client.state(), GatewayState::Disconnected);
        assert!(!client.is_waiting_dependency());
        assert_eq!(client.cloud().connection_listener_count(), listeners_before);
        assert_eq!(
            *events.lock().unwrap(),
            vec![GatewayEvent::Disconnected {
                reason: DisconnectReason::LocalRequest
            }]
        );

        // Idempotent
        client.disconnect();
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_offline_dependency_without_auto_reconnect() {
        let client = gateway(false);
        let events = record(&client);

        let result = client.connect().await;
        assert_eq!(result, Err(GatewayError::DependencyNotConnected));
        assert_eq!(client.state(), GatewayState::Disconnected);
        assert!(!client.is_waiting_dependency());
        assert!(events.lock().unwrap().contains(&GatewayEvent::Disconnected {
            reason: DisconnectReason::NeverConnected
        }));
    }

    fn count_connecting(client: &GatewayClient) -> Arc<AtomicUsize> {
        let connecting = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&connecting);
        client.add_listener(move |event| {
            if *event == GatewayEvent::Connecting {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        connecting
    }

    #[tokio::test]
    async fn test_self_heal_only_on_remote_drop() {
        let client = gateway(true);
        let connecting = count_connecting(&client);

        for reason in [DisconnectReason::LocalRequest, DisconnectReason::NeverConnected] {
            client.shared.listeners.emit(&GatewayEvent::Disconnected { reason });
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(connecting.load(Ordering::SeqCst), 0);

        client.shared.listeners.emit(&GatewayEvent::Disconnected {
            reason: DisconnectReason::RemoteDrop,
        });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(connecting.load(Ordering::SeqCst), 1);
        assert_eq!(client.state(), GatewayState::WaitingOnDependency);
        client.disconnect();
    }

    #[tokio::test]
    async fn test_no_self_heal_without_auto_reconnect() {
        let client = gateway(false);
        let connecting = count_connecting(&client);

        client.shared.listeners.emit(&GatewayEvent::Disconnected {
            reason: DisconnectReason::RemoteDrop,
        });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(connecting.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_send_requires_connection() {
        let client = gateway(true);
        assert!(matches!(client.send(b"x"), Err(GatewayError::State(_))));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = GatewayConfig::new("bad id".to_string());
        let result = GatewayClient::new(config, offline_cloud(), Arc::new(NoAccess), Arc::new(NoPeer));
        assert!(result.is_err());
    }
}
