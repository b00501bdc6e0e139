//! HTTP transport shared by the prober, the token endpoint and API requests
//!
//! Holds a strictly verifying client and a relaxed one. Which client a
//! request uses depends on the instance's relax scope, which only ever
//! widens: first to localhost after a TLS handshake failure, then to every
//! host when the retry still fails on a hostname mismatch or on a
//! non-localhost certificate.

use reqwest::Client;
use std::error::Error as StdError;
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::time::Duration;
use tracing::warn;
use url::{Host, Url};

/// Hosts for which certificate verification is relaxed
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RelaxScope {
    Strict,
    Localhost,
    AllHosts,
}

impl std::fmt::Display for RelaxScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelaxScope::Strict => write!(f, "strict"),
            RelaxScope::Localhost => write!(f, "localhost"),
            RelaxScope::AllHosts => write!(f, "all hosts"),
        }
    }
}

#[derive(Debug)]
pub struct HttpTransport {
    strict: Client,
    relaxed: Client,
    scope: Mutex<RelaxScope>,
    fallback_enabled: bool,
}

impl HttpTransport {
    /// Build both clients with the given request timeout
    ///
    /// With `fallback_enabled` false the scope never leaves
    /// [`RelaxScope::Strict`].
    pub fn new(timeout: Duration, fallback_enabled: bool) -> Result<Self, reqwest::Error> {
        Self::with_pinned_hosts(timeout, fallback_enabled, &[])
    }

    /// Like [`HttpTransport::new`], resolving each `(host, address)` pair
    /// to the given address instead of asking DNS
    pub fn with_pinned_hosts(
        timeout: Duration,
        fallback_enabled: bool,
        pinned: &[(String, SocketAddr)],
    ) -> Result<Self, reqwest::Error> {
        let mut strict = Client::builder().timeout(timeout).use_rustls_tls();
        let mut relaxed = Client::builder()
            .timeout(timeout)
            .use_rustls_tls()
            .danger_accept_invalid_certs(true);
        for (host, addr) in pinned {
            strict = strict.resolve(host, *addr);
            relaxed = relaxed.resolve(host, *addr);
        }
        let strict = strict.build()?;
        let relaxed = relaxed.build()?;

        Ok(Self {
            strict,
            relaxed,
            scope: Mutex::new(RelaxScope::Strict),
            fallback_enabled,
        })
    }

    pub fn fallback_enabled(&self) -> bool {
        self.fallback_enabled
    }

    pub fn scope(&self) -> RelaxScope {
        *self.scope.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Widen the relax scope; returns true if it changed
    pub fn relax(&self, scope: RelaxScope) -> bool {
        if !self.fallback_enabled {
            return false;
        }
        let mut current = self.scope.lock().unwrap_or_else(|e| e.into_inner());
        if scope <= *current {
            return false;
        }
        warn!(from = %*current, to = %scope, "Relaxing TLS certificate verification");
        *current = scope;
        true
    }

    /// Client to use for `url` under the current scope
    pub fn client_for(&self, url: &Url) -> &Client {
        let relaxed = match self.scope() {
            RelaxScope::Strict => false,
            RelaxScope::Localhost => is_localhost(url),
            RelaxScope::AllHosts => true,
        };
        if relaxed {
            &self.relaxed
        } else {
            &self.strict
        }
    }
}

/// True for `localhost` and loopback addresses
pub fn is_localhost(url: &Url) -> bool {
    match url.host() {
        Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(ip)) => IpAddr::V4(ip).is_loopback(),
        Some(Host::Ipv6(ip)) => IpAddr::V6(ip).is_loopback(),
        None => false,
    }
}

fn find_rustls_error<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a rustls::Error> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(tls) = e.downcast_ref::<rustls::Error>() {
            return Some(tls);
        }
        if let Some(inner) = e.downcast_ref::<std::io::Error>().and_then(|io| io.get_ref()) {
            if let Some(tls) = inner.downcast_ref::<rustls::Error>() {
                return Some(tls);
            }
        }
        current = e.source();
    }
    None
}

fn chain_message(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut current = err.source();
    while let Some(e) = current {
        message.push_str(": ");
        message.push_str(&e.to_string());
        current = e.source();
    }
    message
}

/// Whether the error was caused by a failed TLS handshake
pub fn is_tls_failure(err: &(dyn StdError + 'static)) -> bool {
    if find_rustls_error(err).is_some() {
        return true;
    }
    let message = chain_message(err).to_lowercase();
    message.contains("certificate") || message.contains("handshake")
}

/// Whether the TLS failure is a certificate not matching the requested host
pub fn is_hostname_mismatch(err: &(dyn StdError + 'static)) -> bool {
    if let Some(rustls::Error::InvalidCertificate(cert_err)) = find_rustls_error(err) {
        // Covers both NotValidForName and NotValidForNameContext
        return format!("{:?}", cert_err).starts_with("NotValidForName");
    }
    chain_message(err)
        .to_lowercase()
        .contains("not valid for name")
}

/// Full error chain as a single line, for logs and listener messages
pub fn describe_error(err: &(dyn StdError + 'static)) -> String {
    chain_message(err)
}
