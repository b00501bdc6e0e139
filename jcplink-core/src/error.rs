//! Error types for the jcplink cloud agent
//!
//! This module defines all error types used throughout the crate. The cloud
//! client and the gateway wrapper each have their own closed error enum;
//! [`JcpError`] aggregates them for the command-line front end.

use thiserror::Error;

/// Main error type for the jcplink application
#[derive(Error, Debug)]
pub enum JcpError {
    /// Errors related to configuration loading/parsing
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Errors related to keyring operations
    #[error("Keyring error: {0}")]
    Keyring(#[from] KeyringError),

    /// Errors raised by the cloud API client
    #[error("Cloud error: {0}")]
    Cloud(#[from] CloudError),

    /// Errors raised by the gateway tunnel client
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing errors
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization errors
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration file: {path}")]
    LoadFailed { path: String },

    #[error("Failed to save configuration file: {path}")]
    SaveFailed { path: String },

    #[error("Invalid URL: {url}")]
    InvalidUrl { url: String },

    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },

    #[error("Configuration validation error: {message}")]
    ValidationError { message: String },

    #[error("I/O error: {message}")]
    IoError { message: String },
}

/// System keyring operation errors
#[derive(Error, Debug)]
pub enum KeyringError {
    #[error("Keyring service unavailable")]
    ServiceUnavailable,

    #[error("Failed to store credential in keyring")]
    StoreFailed,

    #[error("Failed to retrieve credential from keyring")]
    RetrieveFailed,

    #[error("Credential not found in keyring")]
    NotFound,
}

/// Errors surfaced by the cloud API client
///
/// Unreachability is deliberately absent: it never escapes the client and is
/// only reported to connection listeners.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CloudError {
    /// Credentials, login code or refresh token rejected by the identity provider
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Operation not allowed in the current connection state
    #[error("Invalid state: {0}")]
    State(String),

    /// Request attempted while not connected
    #[error("Not connected: {0}")]
    Connection(String),

    /// Malformed request or transport failure while executing it
    #[error("Request error: {0}")]
    Request(String),

    /// The server answered with an error status or an unparsable body
    #[error("{0}")]
    Response(ResponseError),
}

impl From<ResponseError> for CloudError {
    fn from(e: ResponseError) -> Self {
        CloudError::Response(e)
    }
}

/// Kind of a [`ResponseError`], one per handled HTTP status family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseErrorKind {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    /// Any other non-2xx code
    Code,
    /// The body could not be decoded into the requested type
    Parsing,
}

impl std::fmt::Display for ResponseErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ResponseErrorKind::BadRequest => "bad request",
            ResponseErrorKind::Unauthorized => "unauthorized",
            ResponseErrorKind::Forbidden => "forbidden",
            ResponseErrorKind::NotFound => "not found",
            ResponseErrorKind::Conflict => "conflict",
            ResponseErrorKind::Code => "error code",
            ResponseErrorKind::Parsing => "parsing error",
        };
        f.write_str(name)
    }
}

/// Error returned for a completed request that did not succeed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseError {
    pub kind: ResponseErrorKind,
    pub url: String,
    pub code: Option<u16>,
    pub body: String,
    pub cause: Option<String>,
}

impl std::fmt::Display for ResponseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Response error ({}) from '{}'", self.kind, self.url)?;
        if let Some(code) = self.code {
            write!(f, " with code {}", code)?;
        }
        if let Some(cause) = &self.cause {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for ResponseError {}

impl ResponseError {
    /// Map a non-2xx status code to its error kind
    pub fn from_status(url: impl Into<String>, code: u16, body: impl Into<String>) -> Self {
        let kind = match code {
            400 => ResponseErrorKind::BadRequest,
            401 => ResponseErrorKind::Unauthorized,
            403 => ResponseErrorKind::Forbidden,
            404 => ResponseErrorKind::NotFound,
            409 => ResponseErrorKind::Conflict,
            _ => ResponseErrorKind::Code,
        };
        Self {
            kind,
            url: url.into(),
            code: Some(code),
            body: body.into(),
            cause: None,
        }
    }

    /// Build a parsing error for a body that could not be decoded
    pub fn parsing(url: impl Into<String>, body: impl Into<String>, cause: impl ToString) -> Self {
        Self {
            kind: ResponseErrorKind::Parsing,
            url: url.into(),
            code: None,
            body: body.into(),
            cause: Some(cause.to_string()),
        }
    }
}

/// Errors surfaced by the gateway tunnel client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Cloud client not connected")]
    DependencyNotConnected,

    #[error("Invalid gateway access info: {0}")]
    AccessInfo(String),

    #[error("Invalid gateway certificate: {0}")]
    InvalidCertificate(String),

    #[error("Failed to open gateway peer: {0}")]
    PeerOpen(String),

    /// Local identity or keystore could not be generated; not retried
    #[error("Failed to generate local identity: {0}")]
    Identity(String),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("Invalid state: {0}")]
    State(String),
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, JcpError>;
