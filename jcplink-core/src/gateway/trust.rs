//! Dynamic trust store and TLS context for gateway tunnels
//!
//! [`DynTrustStore`] accepts server certificates at runtime, after the TLS
//! context using it has been built. It is copy-on-write: the verifier reads
//! an immutable snapshot per handshake, so adding a certificate never races
//! with a handshake in progress. [`CertKeystore`] is the standard keystore
//! format on the other side of the bridge, persisted as an annotated PEM
//! bundle.

use crate::error::GatewayError;
use crate::gateway::identity::LocalIdentity;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, SignatureScheme};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};
use x509_parser::prelude::{FromDer, X509Certificate};

/// Alias of the gateway server certificate in the trust store
pub const GATEWAY_CERT_ALIAS: &str = "JCPGWsCert";

const PEM_TAG: &str = "CERTIFICATE";
const ALIAS_MARKER: &str = "# alias:";

type CertMap = BTreeMap<String, CertificateDer<'static>>;

/// Trust store that can grow after the TLS context was built
///
/// Clones share the same certificates. Adding under an existing alias
/// replaces that certificate; aliases are never removed.
#[derive(Debug, Clone, Default)]
pub struct DynTrustStore {
    certs: Arc<RwLock<Arc<CertMap>>>,
}

impl DynTrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the certificate stored under `alias`
    pub fn add_certificate(&self, alias: &str, cert: CertificateDer<'static>) {
        let mut guard = self.certs.write().unwrap_or_else(|e| e.into_inner());
        let mut next = CertMap::clone(&guard);
        if next.insert(alias.to_string(), cert).is_some() {
            debug!(alias = %alias, "Trusted certificate replaced");
        } else {
            debug!(alias = %alias, "Trusted certificate added");
        }
        *guard = Arc::new(next);
    }

    pub fn certificate(&self, alias: &str) -> Option<CertificateDer<'static>> {
        self.snapshot().get(alias).cloned()
    }

    pub fn aliases(&self) -> Vec<String> {
        self.snapshot().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when exactly this certificate is trusted
    pub fn contains(&self, cert: &CertificateDer<'_>) -> bool {
        self.snapshot().values().any(|c| c.as_ref() == cert.as_ref())
    }

    fn snapshot(&self) -> Arc<CertMap> {
        self.certs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Copy every trusted certificate into `keystore`, replacing same aliases
    pub fn copy_to_keystore(&self, keystore: &mut CertKeystore) {
        for (alias, cert) in self.snapshot().iter() {
            keystore.insert(alias, cert.clone());
        }
    }

    /// Trust every certificate of `keystore`, replacing same aliases
    pub fn copy_from_keystore(&self, keystore: &CertKeystore) {
        let mut guard = self.certs.write().unwrap_or_else(|e| e.into_inner());
        let mut next = CertMap::clone(&guard);
        for (alias, cert) in &keystore.entries {
            next.insert(alias.clone(), cert.clone());
        }
        *guard = Arc::new(next);
    }
}

/// Alias to certificate keystore, persisted as an annotated PEM bundle
///
/// Each certificate block is preceded by a `# alias: <name>` line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertKeystore {
    entries: CertMap,
}

impl CertKeystore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, alias: &str, cert: CertificateDer<'static>) {
        self.entries.insert(alias.to_string(), cert);
    }

    pub fn get(&self, alias: &str) -> Option<&CertificateDer<'static>> {
        self.entries.get(alias)
    }

    pub fn aliases(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_pem(&self) -> String {
        let mut out = String::new();
        for (alias, cert) in &self.entries {
            out.push_str(&format!("{} {}\n", ALIAS_MARKER, alias));
            out.push_str(&pem::encode(&pem::Pem::new(PEM_TAG, cert.to_vec())));
        }
        out
    }

    pub fn from_pem(text: &str) -> Result<Self, GatewayError> {
        let mut keystore = Self::new();
        let mut alias: Option<String> = None;
        let mut block: Option<String> = None;

        for line in text.lines() {
            let line = line.trim();
            if let Some(name) = line.strip_prefix(ALIAS_MARKER) {
                alias = Some(name.trim().to_string());
                continue;
            }
            if line.starts_with("-----BEGIN") {
                block = Some(String::new());
            }
            let Some(current) = block.as_mut() else {
                continue;
            };
            current.push_str(line);
            current.push('\n');

            if line.starts_with("-----END") {
                let parsed = pem::parse(current.as_bytes()).map_err(|e| {
                    GatewayError::InvalidCertificate(format!("malformed keystore entry ({})", e))
                })?;
                let name = alias.take().ok_or_else(|| {
                    GatewayError::InvalidCertificate("keystore entry without alias".to_string())
                })?;
                if parsed.tag() == PEM_TAG {
                    keystore.insert(&name, CertificateDer::from(parsed.into_contents()));
                } else {
                    warn!(alias = %name, tag = %parsed.tag(), "Skipping non certificate keystore entry");
                }
                block = None;
            }
        }

        Ok(keystore)
    }

    pub fn save(&self, path: &Path) -> Result<(), GatewayError> {
        std::fs::write(path, self.to_pem()).map_err(|e| {
            GatewayError::Tls(format!("can't write keystore '{}' ({})", path.display(), e))
        })
    }

    pub fn load(path: &Path) -> Result<Self, GatewayError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Tls(format!("can't read keystore '{}' ({})", path.display(), e))
        })?;
        Self::from_pem(&text)
    }
}

/// Parse a server certificate given as PEM text or raw DER
///
/// The certificate must be well formed X.509 and currently valid.
pub fn parse_certificate(bytes: &[u8]) -> Result<CertificateDer<'static>, GatewayError> {
    if bytes.is_empty() {
        return Err(GatewayError::InvalidCertificate("empty certificate".to_string()));
    }

    let cert = if bytes.starts_with(b"-----BEGIN") {
        rustls_pemfile::certs(&mut &bytes[..])
            .next()
            .ok_or_else(|| GatewayError::InvalidCertificate("no certificate in PEM data".to_string()))?
            .map_err(|e| GatewayError::InvalidCertificate(e.to_string()))?
    } else {
        CertificateDer::from(bytes.to_vec())
    };

    let (_, parsed) = X509Certificate::from_der(cert.as_ref())
        .map_err(|e| GatewayError::InvalidCertificate(e.to_string()))?;
    if !parsed.validity().is_valid() {
        return Err(GatewayError::InvalidCertificate(format!(
            "certificate '{}' is expired or not yet valid",
            parsed.subject()
        )));
    }
    debug!(subject = %parsed.subject(), "Server certificate parsed");

    Ok(cert)
}

/// Build the TLS client context for a tunnel
///
/// The local identity is presented as client certificate. The server is
/// accepted only when its end-entity certificate is in `trust` at
/// handshake time.
pub fn build_client_config(
    identity: &LocalIdentity,
    trust: &DynTrustStore,
) -> Result<Arc<ClientConfig>, GatewayError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = Arc::new(TrustStoreVerifier {
        trust: trust.clone(),
        provider: Arc::clone(&provider),
    });

    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| GatewayError::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(vec![identity.certificate().clone()], identity.private_key())
        .map_err(|e| GatewayError::Tls(e.to_string()))?;

    Ok(Arc::new(config))
}

/// Pins server certificates to the content of a [`DynTrustStore`]
#[derive(Debug)]
struct TrustStoreVerifier {
    trust: DynTrustStore,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for TrustStoreVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if self.trust.contains(end_entity) {
            return Ok(ServerCertVerified::assertion());
        }
        warn!(server = ?server_name, trusted = self.trust.len(), "Gateway certificate not in trust store");
        Err(rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer))
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}
