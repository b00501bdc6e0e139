//! OAuth2 token material owned by the cloud client
//!
//! The store keeps at most one access token, tagged with the flow that
//! issued it, plus the staged material of the user (auth-code) flow. The
//! active flow is derived from that staged material, never stored.

use crate::types::{BearerToken, LoginCode, RefreshToken};
use chrono::{DateTime, Utc};

/// OAuth2 flow used to obtain the access token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFlow {
    /// Software client authenticated by its own id and secret
    ClientCredentials,
    /// End user authenticated through a login code or refresh token
    AuthCode,
}

impl std::fmt::Display for AuthFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthFlow::ClientCredentials => write!(f, "client-credentials"),
            AuthFlow::AuthCode => write!(f, "auth-code"),
        }
    }
}

/// Bearer token plus the refresh token issued with it
///
/// Replaced wholesale on refresh or re-authentication.
#[derive(Debug, Clone)]
pub struct AccessToken {
    bearer: BearerToken,
    refresh: Option<RefreshToken>,
    expires_in: Option<u64>,
    issued_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn new(bearer: BearerToken, refresh: Option<RefreshToken>, expires_in: Option<u64>) -> Self {
        Self {
            bearer,
            refresh,
            expires_in,
            issued_at: Utc::now(),
        }
    }

    pub fn bearer(&self) -> &BearerToken {
        &self.bearer
    }

    pub fn refresh_token(&self) -> Option<&RefreshToken> {
        self.refresh.as_ref()
    }

    /// Lifetime in seconds as announced by the identity provider
    pub fn expires_in(&self) -> Option<u64> {
        self.expires_in
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }
}

/// Grant to present to the token endpoint for the next authentication
#[derive(Debug, Clone)]
pub enum Grant {
    ClientCredentials,
    AuthorizationCode(LoginCode),
    RefreshToken(RefreshToken),
}

impl Grant {
    /// Flow the grant belongs to when used to open a connection
    pub fn flow(&self) -> AuthFlow {
        match self {
            Grant::ClientCredentials => AuthFlow::ClientCredentials,
            Grant::AuthorizationCode(_) | Grant::RefreshToken(_) => AuthFlow::AuthCode,
        }
    }
}

#[derive(Debug, Clone)]
struct ActiveToken {
    flow: AuthFlow,
    token: AccessToken,
}

/// Token material of the cloud client
#[derive(Debug, Default)]
pub struct TokenStore {
    active: Option<ActiveToken>,
    auth_code_refresh: Option<RefreshToken>,
    login_code: Option<LoginCode>,
}

impl TokenStore {
    pub fn new(auth_code_refresh: Option<RefreshToken>) -> Self {
        Self {
            active: None,
            auth_code_refresh: auth_code_refresh.filter(|t| !t.expose().is_empty()),
            login_code: None,
        }
    }

    /// Flow selected for the next authentication
    pub fn flow(&self) -> AuthFlow {
        if self.auth_code_refresh.is_some() || self.login_code.is_some() {
            AuthFlow::AuthCode
        } else {
            AuthFlow::ClientCredentials
        }
    }

    pub fn is_auth_code_flow_enabled(&self) -> bool {
        self.flow() == AuthFlow::AuthCode
    }

    pub fn is_client_credentials_flow_enabled(&self) -> bool {
        self.flow() == AuthFlow::ClientCredentials
    }

    /// Grant for a full authentication; the login code wins over the refresh token
    pub fn grant(&self) -> Grant {
        if let Some(code) = &self.login_code {
            Grant::AuthorizationCode(code.clone())
        } else if let Some(refresh) = &self.auth_code_refresh {
            Grant::RefreshToken(refresh.clone())
        } else {
            Grant::ClientCredentials
        }
    }

    /// Flow that issued the current access token
    pub fn active_flow(&self) -> Option<AuthFlow> {
        self.active.as_ref().map(|a| a.flow)
    }

    /// Access token issued by `flow`, if that flow is the active one
    pub fn token_for(&self, flow: AuthFlow) -> Option<&AccessToken> {
        self.active
            .as_ref()
            .filter(|a| a.flow == flow)
            .map(|a| &a.token)
    }

    pub fn bearer(&self) -> Option<BearerToken> {
        self.active.as_ref().map(|a| a.token.bearer().clone())
    }

    /// Refresh token of the active flow
    pub fn refresh_token(&self) -> Option<RefreshToken> {
        match self.active.as_ref()? {
            ActiveToken {
                flow: AuthFlow::ClientCredentials,
                token,
            } => token.refresh_token().cloned(),
            ActiveToken {
                flow: AuthFlow::AuthCode,
                ..
            } => self.auth_code_refresh.clone(),
        }
    }

    pub fn auth_code_refresh_token(&self) -> Option<&RefreshToken> {
        self.auth_code_refresh.as_ref()
    }

    pub fn has_login_code(&self) -> bool {
        self.login_code.is_some()
    }

    /// Install the token obtained by a full authentication
    ///
    /// Installing one flow clears the other flow's material.
    pub fn install(&mut self, flow: AuthFlow, token: AccessToken) {
        match flow {
            AuthFlow::ClientCredentials => {
                self.auth_code_refresh = None;
                self.login_code = None;
            }
            AuthFlow::AuthCode => {
                self.auth_code_refresh = token.refresh_token().cloned();
                self.login_code = None;
            }
        }
        self.active = Some(ActiveToken { flow, token });
    }

    /// Replace the access token after a successful refresh
    ///
    /// Returns false when no flow is active anymore.
    pub fn replace(&mut self, token: AccessToken) -> bool {
        let Some(active) = self.active.as_mut() else {
            return false;
        };
        if active.flow == AuthFlow::AuthCode {
            self.auth_code_refresh = token.refresh_token().cloned();
        }
        active.token = token;
        true
    }

    pub fn set_login_code(&mut self, code: LoginCode) {
        self.login_code = Some(code);
    }

    /// Drop the access token, keeping the staged user material
    pub fn clear_access(&mut self) {
        self.active = None;
    }

    /// Drop the staged user material (login code and refresh token)
    pub fn clear_auth_code(&mut self) {
        self.auth_code_refresh = None;
        self.login_code = None;
        if self.active_flow() == Some(AuthFlow::AuthCode) {
            self.active = None;
        }
    }
}
