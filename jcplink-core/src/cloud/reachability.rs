//! Reachability probing of the cloud APIs and the identity provider
//!
//! A probe is a bounded GET expecting HTTP 200. TLS handshake failures are
//! retried once with relaxed verification for localhost, and once more for
//! every host when the certificate does not match the requested name or the
//! host is not local.

use crate::cloud::transport::{
    describe_error, is_hostname_mismatch, is_localhost, is_tls_failure, HttpTransport, RelaxScope,
};
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use url::Url;

/// Probe failure; never surfaced past the cloud client
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct Unreachable(pub String);

/// Which remote a probe targets, for messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeTarget {
    Apis,
    Auth,
}

impl std::fmt::Display for ProbeTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeTarget::Apis => write!(f, "APIs' url"),
            ProbeTarget::Auth => write!(f, "Auth's url"),
        }
    }
}

/// Outcome of a successful probe
#[derive(Debug, Clone, Copy)]
pub struct ProbeReport {
    pub duration: Duration,
    pub relax_scope: RelaxScope,
}

#[derive(Debug)]
pub struct ReachabilityProber {
    transport: Arc<HttpTransport>,
    api_name: String,
}

impl ReachabilityProber {
    pub fn new(transport: Arc<HttpTransport>, api_name: impl Into<String>) -> Self {
        Self {
            transport,
            api_name: api_name.into(),
        }
    }

    /// Probe `url`, classifying every failure as [`Unreachable`]
    #[tracing::instrument(skip(self), fields(api = %self.api_name, url = %url))]
    pub async fn probe(&self, target: ProbeTarget, url: &Url) -> Result<ProbeReport, Unreachable> {
        let start = Instant::now();

        let status = match self.get(url).await {
            Ok(status) => status,
            Err(err) if self.transport.fallback_enabled() && is_tls_failure(&err) => {
                debug!(error = %describe_error(&err), "TLS handshake failed, retrying relaxed on localhost");
                self.transport.relax(RelaxScope::Localhost);

                match self.get(url).await {
                    Ok(status) => status,
                    // Localhost relaxation does not cover other hosts, so a
                    // remote certificate failure counts as a hostname mismatch
                    Err(retry_err)
                        if is_hostname_mismatch(&retry_err)
                            || (!is_localhost(url) && is_tls_failure(&retry_err)) =>
                    {
                        warn!(
                            api = %self.api_name,
                            error = %describe_error(&retry_err),
                            "Certificate hostname mismatch, relaxing verification on all hosts"
                        );
                        self.transport.relax(RelaxScope::AllHosts);
                        self.get(url)
                            .await
                            .map_err(|e| self.not_reachable(target, url, &e))?
                    }
                    Err(retry_err) if is_tls_failure(&retry_err) => {
                        return Err(Unreachable(format!(
                            "Error connecting to {} because SSL handshaking failed ({})",
                            self.api_name,
                            describe_error(&retry_err)
                        )));
                    }
                    Err(retry_err) => return Err(self.not_reachable(target, url, &retry_err)),
                }
            }
            Err(err) => return Err(self.not_reachable(target, url, &err)),
        };

        if status != StatusCode::OK {
            return Err(Unreachable(format!(
                "Error connecting to {} because '{}' ({}) returned '{}' code",
                self.api_name,
                url,
                target,
                status.as_u16()
            )));
        }

        let report = ProbeReport {
            duration: start.elapsed(),
            relax_scope: self.transport.scope(),
        };
        debug!(
            duration_ms = report.duration.as_millis(),
            relax_scope = %report.relax_scope,
            "Probe succeeded"
        );
        Ok(report)
    }

    async fn get(&self, url: &Url) -> Result<StatusCode, reqwest::Error> {
        let response = self
            .transport
            .client_for(url)
            .get(url.clone())
            .send()
            .await?;
        Ok(response.status())
    }

    fn not_reachable(&self, target: ProbeTarget, url: &Url, err: &reqwest::Error) -> Unreachable {
        let reason = if err.is_timeout() {
            "request timeout".to_string()
        } else if err.is_connect() {
            format!("connection refused or unreachable ({})", describe_error(err))
        } else {
            describe_error(err)
        };
        Unreachable(format!(
            "Error connecting to {} because '{}' ({}) not reachable [{}]",
            self.api_name, url, target, reason
        ))
    }
}
