//! Keycloak token endpoint client
//!
//! Implements the client-credentials, authorization-code and refresh-token
//! grants as plain form posts. Rejections by the identity provider are
//! told apart from transient transport failures so the cloud client can
//! decide between failing the connection and retrying later.

use crate::auth::token::{AccessToken, Grant};
use crate::cloud::transport::{describe_error, is_tls_failure, HttpTransport, RelaxScope};
use crate::types::{BearerToken, ClientSecret, RefreshToken};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

/// Token endpoint failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    /// Credentials, code or refresh token rejected
    #[error("{0}")]
    Rejected(String),

    /// Network, TLS or server-side failure; worth retrying later
    #[error("{0}")]
    Transient(String),
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug)]
pub struct TokenEndpoint {
    transport: Arc<HttpTransport>,
    token_url: Url,
    client_id: String,
    client_secret: ClientSecret,
    scopes: String,
    callback: String,
}

impl TokenEndpoint {
    pub fn new(
        transport: Arc<HttpTransport>,
        token_url: Url,
        client_id: String,
        client_secret: ClientSecret,
        scopes: String,
        callback: String,
    ) -> Self {
        Self {
            transport,
            token_url,
            client_id,
            client_secret,
            scopes,
            callback,
        }
    }

    pub fn token_url(&self) -> &Url {
        &self.token_url
    }

    /// Obtain a token for the given grant
    #[tracing::instrument(skip(self, grant), fields(client_id = %self.client_id, grant = grant_name(grant)))]
    pub async fn request(&self, grant: &Grant) -> Result<AccessToken, TokenError> {
        let mut form: Vec<(&str, &str)> = vec![
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.expose()),
        ];
        match grant {
            Grant::ClientCredentials => {
                form.push(("grant_type", "client_credentials"));
            }
            Grant::AuthorizationCode(code) => {
                form.push(("grant_type", "authorization_code"));
                form.push(("code", code.expose()));
                form.push(("redirect_uri", self.callback.as_str()));
                if !self.scopes.is_empty() {
                    form.push(("scope", self.scopes.as_str()));
                }
            }
            Grant::RefreshToken(refresh) => {
                form.push(("grant_type", "refresh_token"));
                form.push(("refresh_token", refresh.expose()));
            }
        }

        let result = self.post(&form).await;
        let response = match result {
            Err(err) if is_tls_failure(&err) && self.transport.relax(RelaxScope::Localhost) => {
                debug!("TLS handshake failed on token endpoint, retrying relaxed on localhost");
                self.post(&form).await
            }
            other => other,
        }
        .map_err(|e| {
            TokenError::Transient(format!(
                "can't reach token endpoint '{}' ({})",
                self.token_url,
                describe_error(&e)
            ))
        })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            TokenError::Transient(format!("can't read token response ({})", describe_error(&e)))
        })?;

        if status.is_success() {
            let parsed: TokenResponse = serde_json::from_str(&body).map_err(|e| {
                TokenError::Transient(format!("invalid token response ({})", e))
            })?;
            debug!(expires_in = ?parsed.expires_in, "Token obtained");
            return Ok(AccessToken::new(
                BearerToken::new(parsed.access_token),
                parsed.refresh_token.map(RefreshToken::new),
                parsed.expires_in,
            ));
        }

        match serde_json::from_str::<TokenErrorResponse>(&body) {
            Ok(err) if status.is_client_error() => {
                let mut message = match err.error_description {
                    Some(description) => format!("{} ({})", err.error, description),
                    None => err.error,
                };
                if message.contains("Incorrect redirect_uri") {
                    message = format!("Incorrect redirect_uri ({})", self.callback);
                }
                warn!(status = status.as_u16(), grant = grant_name(grant), "Token request rejected");
                Err(TokenError::Rejected(message))
            }
            _ if status == reqwest::StatusCode::UNAUTHORIZED => {
                Err(TokenError::Rejected("client unauthorized".to_string()))
            }
            _ => Err(TokenError::Transient(format!(
                "token endpoint returned '{}' code",
                status.as_u16()
            ))),
        }
    }

    async fn post(&self, form: &[(&str, &str)]) -> Result<reqwest::Response, reqwest::Error> {
        self.transport
            .client_for(&self.token_url)
            .post(self.token_url.clone())
            .form(form)
            .send()
            .await
    }
}

fn grant_name(grant: &Grant) -> &'static str {
    match grant {
        Grant::ClientCredentials => "client_credentials",
        Grant::AuthorizationCode(_) => "authorization_code",
        Grant::RefreshToken(_) => "refresh_token",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LoginCode;
    use std::time::Duration;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TOKEN_PATH: &str = "/auth/realms/jcp/protocol/openid-connect/token";

    fn endpoint(server: &MockServer) -> TokenEndpoint {
        let transport = Arc::new(HttpTransport::new(Duration::from_secs(2), true).unwrap());
        let url = Url::parse(&format!("{}{}", server.uri(), TOKEN_PATH)).unwrap();
        TokenEndpoint::new(
            transport,
            url,
            "svc".to_string(),
            ClientSecret::new("secret".to_string()),
            "openid".to_string(),
            "https://localhost/cb".to_string(),
        )
    }

    #[tokio::test]
    async fn test_client_credentials_grant() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .and(body_string_contains("grant_type=client_credentials"))
            .and(body_string_contains("client_secret=secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at-1",
                "refresh_token": "rt-1",
                "expires_in": 300,
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let token = endpoint(&server).request(&Grant::ClientCredentials).await.unwrap();
        assert_eq!(token.bearer().expose(), "at-1");
        assert_eq!(token.refresh_token().unwrap().expose(), "rt-1");
        assert_eq!(token.expires_in(), Some(300));
    }

    #[tokio::test]
    async fn test_invalid_grant_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "Code not valid"
            })))
            .mount(&server)
            .await;

        let result = endpoint(&server)
            .request(&Grant::AuthorizationCode(LoginCode::from("bad")))
            .await;
        assert_eq!(
            result.unwrap_err(),
            TokenError::Rejected("invalid_grant (Code not valid)".to_string())
        );
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let result = endpoint(&server).request(&Grant::ClientCredentials).await;
        assert!(matches!(result, Err(TokenError::Transient(_))));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transient() {
        let server = MockServer::start().await;
        let endpoint = endpoint(&server);
        drop(server);

        let result = endpoint.request(&Grant::ClientCredentials).await;
        assert!(matches!(result, Err(TokenError::Transient(_))));
    }
}
