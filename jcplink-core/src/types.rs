//! Type definitions and wrappers for secure data handling
//!
//! This module provides type-safe wrappers for sensitive data using the
//! secrecy crate to prevent accidental exposure in logs or debug output.

use secrecy::{ExposeSecret, Secret};

/// Keyring service used to store the OAuth2 client secret
pub const KEYRING_SERVICE_CLIENT_SECRET: &str = "jcplink-client-secret";

/// Keyring service used to persist the auth-code flow refresh token
pub const KEYRING_SERVICE_REFRESH_TOKEN: &str = "jcplink-refresh-token";

/// OAuth2 client secret shared with the identity provider
#[derive(Clone, Debug)]
pub struct ClientSecret(Secret<String>);

impl ClientSecret {
    pub fn new(secret: String) -> Self {
        Self(Secret::new(secret))
    }

    /// Expose the secret value (use with caution!)
    ///
    /// Only the token endpoint form body should ever see this value.
    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl From<String> for ClientSecret {
    fn from(secret: String) -> Self {
        Self::new(secret)
    }
}

/// Bearer access token attached to API requests
#[derive(Clone, Debug)]
pub struct BearerToken(Secret<String>);

impl BearerToken {
    pub fn new(token: String) -> Self {
        Self(Secret::new(token))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

/// Refresh token issued together with an access token
#[derive(Clone, Debug)]
pub struct RefreshToken(Secret<String>);

impl RefreshToken {
    pub fn new(token: String) -> Self {
        Self(Secret::new(token))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl From<String> for RefreshToken {
    fn from(token: String) -> Self {
        Self::new(token)
    }
}

/// One-time authorization code obtained from the user login redirect
#[derive(Clone, Debug)]
pub struct LoginCode(Secret<String>);

impl LoginCode {
    pub fn new(code: String) -> Self {
        Self(Secret::new(code))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl From<String> for LoginCode {
    fn from(code: String) -> Self {
        Self::new(code)
    }
}

impl From<&str> for LoginCode {
    fn from(code: &str) -> Self {
        Self::new(code.to_string())
    }
}
