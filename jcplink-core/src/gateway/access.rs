//! Gateway access info
//!
//! Before opening a tunnel the client asks the cloud APIs which gateway to
//! use, sending its freshly generated certificate. The answer names the
//! gateway endpoint and carries the gateway's certificate to trust.

use crate::cloud::{ApiRequest, CloudClient};
use crate::error::{CloudError, GatewayError};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rustls::pki_types::CertificateDer;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Everything needed to open one tunnel; used for a single attempt
#[derive(Clone, PartialEq, Eq)]
pub struct TunnelAccessInfo {
    pub gw_address: String,
    pub gw_port: u16,
    /// Gateway server certificate, PEM or DER
    pub gw_certificate: Vec<u8>,
}

impl std::fmt::Debug for TunnelAccessInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelAccessInfo")
            .field("gw_address", &self.gw_address)
            .field("gw_port", &self.gw_port)
            .field("gw_certificate_len", &self.gw_certificate.len())
            .finish()
    }
}

impl TunnelAccessInfo {
    fn validate(self) -> Result<Self, GatewayError> {
        if self.gw_address.is_empty() {
            return Err(GatewayError::AccessInfo("missing gateway address".to_string()));
        }
        if self.gw_port == 0 {
            return Err(GatewayError::AccessInfo("missing gateway port".to_string()));
        }
        if self.gw_certificate.is_empty() {
            return Err(GatewayError::AccessInfo("missing gateway certificate".to_string()));
        }
        Ok(self)
    }
}

/// Supplies tunnel access info for a local certificate
#[async_trait]
pub trait AccessInfoSource: Send + Sync {
    async fn fetch_access_info(
        &self,
        cloud: &CloudClient,
        certificate: &CertificateDer<'static>,
    ) -> Result<TunnelAccessInfo, GatewayError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AccessRequest<'a> {
    instance_id: &'a str,
    client_certificate: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccessResponse {
    gw_address: String,
    gw_port: u16,
    gw_certificate: String,
}

/// Asks the cloud gateways API for access info
#[derive(Debug, Clone)]
pub struct CloudAccessInfoSource {
    instance_id: String,
    access_path: String,
}

impl CloudAccessInfoSource {
    pub fn new(instance_id: impl Into<String>, access_path: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            access_path: access_path.into(),
        }
    }
}

#[async_trait]
impl AccessInfoSource for CloudAccessInfoSource {
    async fn fetch_access_info(
        &self,
        cloud: &CloudClient,
        certificate: &CertificateDer<'static>,
    ) -> Result<TunnelAccessInfo, GatewayError> {
        let cloud_error = |e: CloudError| GatewayError::AccessInfo(e.to_string());

        let request = ApiRequest::post(self.access_path.as_str())
            .json(&AccessRequest {
                instance_id: &self.instance_id,
                client_certificate: STANDARD.encode(certificate.as_ref()),
            })
            .map_err(cloud_error)?;
        let response: AccessResponse = cloud
            .execute(request)
            .await
            .map_err(cloud_error)?
            .json()
            .map_err(cloud_error)?;

        let gw_certificate = STANDARD.decode(response.gw_certificate.trim()).map_err(|e| {
            GatewayError::AccessInfo(format!("gateway certificate is not base64 ({})", e))
        })?;

        debug!(gw_address = %response.gw_address, gw_port = response.gw_port, "Gateway access info received");

        TunnelAccessInfo {
            gw_address: response.gw_address,
            gw_port: response.gw_port,
            gw_certificate,
        }
        .validate()
    }
}
