//! Secure peer behind a gateway tunnel
//!
//! [`PeerOpener`] is the seam where the relay protocol plugs in. The
//! default [`TlsPeerOpener`] dials the gateway over TCP, runs the TLS
//! handshake with the tunnel's client configuration and moves raw bytes
//! between the stream and channels. Peers never reconnect on their own:
//! the gateway client owns the retry policy.

use crate::error::GatewayError;
use crate::gateway::access::TunnelAccessInfo;
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Options passed to the opener for each peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerSettings {
    /// Bound on both the TCP connect and the TLS handshake
    pub connect_timeout: Duration,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// An open connection to the remote end of a tunnel
#[async_trait]
pub trait SecurePeer: Send + Sync + fmt::Debug {
    /// Resolves once the peer is closed, by either side
    async fn closed(&self);

    /// Close the peer; idempotent
    fn close(&self);

    fn is_open(&self) -> bool;

    fn send(&self, data: &[u8]) -> Result<(), GatewayError>;
}

/// Opens the secure peer of a tunnel
///
/// Opened peers must not reconnect by themselves: once closed they stay
/// closed and the gateway client opens a new one.
#[async_trait]
pub trait PeerOpener: Send + Sync {
    async fn open_peer(
        &self,
        access: &TunnelAccessInfo,
        tls: Arc<ClientConfig>,
        settings: PeerSettings,
    ) -> Result<Arc<dyn SecurePeer>, GatewayError>;
}

/// Opens TLS-over-TCP peers
#[derive(Debug, Clone, Default)]
pub struct TlsPeerOpener {
    inbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl TlsPeerOpener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward data received by every opened peer to `inbound`
    pub fn with_inbound(inbound: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self {
            inbound: Some(inbound),
        }
    }
}

#[async_trait]
impl PeerOpener for TlsPeerOpener {
    #[tracing::instrument(skip(self, tls), fields(gw = %access.gw_address, port = access.gw_port))]
    async fn open_peer(
        &self,
        access: &TunnelAccessInfo,
        tls: Arc<ClientConfig>,
        settings: PeerSettings,
    ) -> Result<Arc<dyn SecurePeer>, GatewayError> {
        let remote = format!("{}:{}", access.gw_address, access.gw_port);
        let open_error = |message: String| GatewayError::PeerOpen(format!("{} ({})", remote, message));

        let server_name = ServerName::try_from(access.gw_address.clone())
            .map_err(|e| open_error(e.to_string()))?;

        let tcp = tokio::time::timeout(settings.connect_timeout, TcpStream::connect(&remote))
            .await
            .map_err(|_| open_error("connect timed out".to_string()))?
            .map_err(|e| open_error(e.to_string()))?;

        let connector = TlsConnector::from(tls);
        let stream = tokio::time::timeout(settings.connect_timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| open_error("TLS handshake timed out".to_string()))?
            .map_err(|e| open_error(e.to_string()))?;

        debug!(remote = %remote, "Gateway peer opened");
        Ok(Arc::new(TlsPeer::spawn(remote, stream, self.inbound.clone())))
    }
}

type TlsStream = tokio_rustls::client::TlsStream<TcpStream>;

/// Peer whose stream is owned by a single I/O task
pub struct TlsPeer {
    remote: String,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    close: CancellationToken,
    done: CancellationToken,
}

impl TlsPeer {
    fn spawn(remote: String, stream: TlsStream, inbound: Option<mpsc::UnboundedSender<Vec<u8>>>) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let close = CancellationToken::new();
        let done = CancellationToken::new();

        tokio::spawn(run_io(
            remote.clone(),
            stream,
            outbound_rx,
            inbound,
            close.clone(),
            done.clone(),
        ));

        Self {
            remote,
            outbound,
            close,
            done,
        }
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }
}

impl fmt::Debug for TlsPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsPeer")
            .field("remote", &self.remote)
            .field("open", &self.is_open())
            .finish()
    }
}

#[async_trait]
impl SecurePeer for TlsPeer {
    async fn closed(&self) {
        self.done.cancelled().await;
    }

    fn close(&self) {
        self.close.cancel();
    }

    fn is_open(&self) -> bool {
        !self.done.is_cancelled()
    }

    fn send(&self, data: &[u8]) -> Result<(), GatewayError> {
        if !self.is_open() {
            return Err(GatewayError::State(format!("peer {} is closed", self.remote)));
        }
        self.outbound
            .send(data.to_vec())
            .map_err(|_| GatewayError::State(format!("peer {} is closed", self.remote)))
    }
}

impl Drop for TlsPeer {
    fn drop(&mut self) {
        self.close.cancel();
    }
}

async fn run_io(
    remote: String,
    mut stream: TlsStream,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    inbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
    close: CancellationToken,
    done: CancellationToken,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        tokio::select! {
            _ = close.cancelled() => {
                if let Err(e) = stream.shutdown().await {
                    trace!(remote = %remote, error = %e, "Shutdown of closed peer failed");
                }
                info!(remote = %remote, "Gateway peer closed locally");
                break;
            }
            read = stream.read(&mut buf) => match read {
                Ok(0) => {
                    info!(remote = %remote, "Gateway peer closed by remote");
                    break;
                }
                Ok(n) => {
                    trace!(remote = %remote, bytes = n, "Data received");
                    if let Some(inbound) = &inbound {
                        if inbound.send(buf[..n].to_vec()).is_err() {
                            trace!(remote = %remote, "Inbound receiver dropped, discarding data");
                        }
                    }
                }
                Err(e) => {
                    warn!(remote = %remote, error = %e, "Gateway peer read failed");
                    break;
                }
            },
            Some(data) = outbound.recv() => {
                if let Err(e) = stream.write_all(&data).await {
                    warn!(remote = %remote, error = %e, "Gateway peer write failed");
                    break;
                }
                if let Err(e) = stream.flush().await {
                    warn!(remote = %remote, error = %e, "Gateway peer flush failed");
                    break;
                }
            }
        }
    }
    done.cancel();
}
