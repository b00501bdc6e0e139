//! Keyring operations for secure credential storage
//!
//! Uses the system keyring (GNOME Keyring on Linux) to store the OAuth2
//! client secret and the refresh token of the user login flow. Entries are
//! keyed by client id.

use crate::error::{JcpError, KeyringError};
use crate::types::{
    ClientSecret, RefreshToken, KEYRING_SERVICE_CLIENT_SECRET, KEYRING_SERVICE_REFRESH_TOKEN,
};
use keyring::Entry;

fn entry(service: &str, client_id: &str) -> Result<Entry, JcpError> {
    Entry::new(service, client_id).map_err(|_| JcpError::Keyring(KeyringError::ServiceUnavailable))
}

fn has_entry(service: &str, client_id: &str) -> Result<bool, JcpError> {
    match entry(service, client_id)?.get_password() {
        Ok(_) => Ok(true),
        Err(_) => Ok(false),
    }
}

fn delete_entry(service: &str, client_id: &str) -> Result<(), JcpError> {
    match entry(service, client_id)?.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(_) => Err(JcpError::Keyring(KeyringError::StoreFailed)),
    }
}

/// Store the client secret in the system keyring
pub fn store_client_secret(client_id: &str, secret: &ClientSecret) -> Result<(), JcpError> {
    entry(KEYRING_SERVICE_CLIENT_SECRET, client_id)?
        .set_password(secret.expose())
        .map_err(|_| JcpError::Keyring(KeyringError::StoreFailed))
}

/// Retrieve the client secret from the system keyring
pub fn retrieve_client_secret(client_id: &str) -> Result<ClientSecret, JcpError> {
    entry(KEYRING_SERVICE_CLIENT_SECRET, client_id)?
        .get_password()
        .map(ClientSecret::new)
        .map_err(|e| match e {
            keyring::Error::NoEntry => JcpError::Keyring(KeyringError::NotFound),
            _ => JcpError::Keyring(KeyringError::RetrieveFailed),
        })
}

/// Check if a client secret exists for the given client id
pub fn has_client_secret(client_id: &str) -> Result<bool, JcpError> {
    has_entry(KEYRING_SERVICE_CLIENT_SECRET, client_id)
}

/// Store the user flow refresh token in the system keyring
pub fn store_refresh_token(client_id: &str, token: &RefreshToken) -> Result<(), JcpError> {
    entry(KEYRING_SERVICE_REFRESH_TOKEN, client_id)?
        .set_password(token.expose())
        .map_err(|_| JcpError::Keyring(KeyringError::StoreFailed))
}

/// Retrieve the user flow refresh token, `None` when nothing is stored
pub fn retrieve_refresh_token(client_id: &str) -> Result<Option<RefreshToken>, JcpError> {
    match entry(KEYRING_SERVICE_REFRESH_TOKEN, client_id)?.get_password() {
        Ok(token) => Ok(Some(RefreshToken::new(token))),
        Err(keyring::Error::NoEntry) => Ok(None),
        Err(_) => Err(JcpError::Keyring(KeyringError::RetrieveFailed)),
    }
}

/// Delete the stored refresh token (user logged out)
pub fn delete_refresh_token(client_id: &str) -> Result<(), JcpError> {
    delete_entry(KEYRING_SERVICE_REFRESH_TOKEN, client_id)
}
