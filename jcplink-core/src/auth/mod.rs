//! Authentication module
//!
//! Handles OAuth2 token material, the identity provider token endpoint and
//! keyring storage of the client secret and the user refresh token.

// Use mock keyring in test mode or CI environment
#[cfg(any(test, feature = "mock-keyring"))]
#[path = "keyring_mock.rs"]
pub mod keyring;

// Use real keyring in production
#[cfg(not(any(test, feature = "mock-keyring")))]
pub mod keyring;

pub mod oauth;
pub mod token;
