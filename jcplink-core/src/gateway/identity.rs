//! Ephemeral local identity for gateway tunnels
//!
//! A fresh ECDSA P-256 key pair and self-signed certificate are generated
//! for every new tunnel connection. The certificate is sent to the cloud
//! as proof of identity and presented to the gateway as TLS client
//! certificate; the private key never leaves the process.

use crate::error::GatewayError;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use secrecy::{ExposeSecret, SecretVec};
use std::fmt;
use tracing::debug;

/// Validity of generated identity certificates
pub const CERT_VALIDITY_DAYS: i64 = 3650;

const ALIAS_SUFFIX: &str = "-CloudCert";

pub struct LocalIdentity {
    alias: String,
    certificate: CertificateDer<'static>,
    certificate_pem: String,
    private_key: SecretVec<u8>,
}

impl LocalIdentity {
    /// Generate a new key pair and self-signed certificate for `local_id`
    ///
    /// Failures mean a broken local crypto environment and are not retried.
    pub fn generate(local_id: &str) -> Result<Self, GatewayError> {
        let identity_error = |e: rcgen::Error| {
            GatewayError::Identity(format!("can't generate certificate for '{}' ({})", local_id, e))
        };

        let mut params = CertificateParams::new(vec![local_id.to_string()]).map_err(identity_error)?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, local_id);
        params.distinguished_name = dn;

        let now = time::OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + time::Duration::days(CERT_VALIDITY_DAYS);

        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).map_err(identity_error)?;
        let cert = params.self_signed(&key_pair).map_err(identity_error)?;

        let alias = alias_for(local_id);
        debug!(alias = %alias, "Local identity generated");

        Ok(Self {
            alias,
            certificate: cert.der().clone(),
            certificate_pem: cert.pem(),
            private_key: SecretVec::new(key_pair.serialize_der()),
        })
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.certificate
    }

    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    /// PKCS#8 private key, for building a TLS client configuration
    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            self.private_key.expose_secret().clone(),
        ))
    }
}

impl fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("alias", &self.alias)
            .field("certificate_len", &self.certificate.len())
            .finish_non_exhaustive()
    }
}

/// Keystore alias of the identity generated for `local_id`
pub fn alias_for(local_id: &str) -> String {
    format!("{}{}", local_id, ALIAS_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use x509_parser::prelude::*;

    #[test]
    fn test_generate_identity() {
        let identity = LocalIdentity::generate("object-0001").unwrap();
        assert_eq!(identity.alias(), "object-0001-CloudCert");
        assert!(identity.certificate_pem().contains("BEGIN CERTIFICATE"));

        let (_, cert) = X509Certificate::from_der(identity.certificate().as_ref()).unwrap();
        let cn = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap();
        assert_eq!(cn, "object-0001");

        let days = cert.validity().time_to_expiration().unwrap().whole_days();
        assert!(days >= CERT_VALIDITY_DAYS - 1, "validity was {} days", days);
    }

    #[test]
    fn test_every_generation_is_fresh() {
        let first = LocalIdentity::generate("object-0001").unwrap();
        let second = LocalIdentity::generate("object-0001").unwrap();
        assert_ne!(first.certificate(), second.certificate());
        assert_eq!(first.alias(), second.alias());
    }

    #[test]
    fn test_debug_hides_key() {
        let identity = LocalIdentity::generate("object-0001").unwrap();
        let debug = format!("{:?}", identity);
        assert!(debug.contains("object-0001-CloudCert"));
        assert!(!debug.contains("private_key"));
    }
}
