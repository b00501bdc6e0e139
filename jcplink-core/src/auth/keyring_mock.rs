//! Mock keyring implementation for testing
//!
//! Provides an in-memory keyring implementation that doesn't require
//! system keyring access. Used in CI environments and for testing.

use crate::error::{JcpError, KeyringError};
use crate::types::{
    ClientSecret, RefreshToken, KEYRING_SERVICE_CLIENT_SECRET, KEYRING_SERVICE_REFRESH_TOKEN,
};
use std::collections::HashMap;
use std::sync::Mutex;

lazy_static::lazy_static! {
    static ref MOCK_KEYRING: Mutex<HashMap<String, String>> = Mutex::new(HashMap::new());
}

/// Generate a key for the mock keyring
fn make_key(service: &str, client_id: &str) -> String {
    format!("{}:{}", service, client_id)
}

fn store(service: &str, client_id: &str, value: &str) -> Result<(), JcpError> {
    let mut keyring = MOCK_KEYRING
        .lock()
        .map_err(|_| JcpError::Keyring(KeyringError::StoreFailed))?;
    keyring.insert(make_key(service, client_id), value.to_string());
    Ok(())
}

fn retrieve(service: &str, client_id: &str) -> Result<Option<String>, JcpError> {
    let keyring = MOCK_KEYRING
        .lock()
        .map_err(|_| JcpError::Keyring(KeyringError::RetrieveFailed))?;
    Ok(keyring.get(&make_key(service, client_id)).cloned())
}

fn delete(service: &str, client_id: &str) -> Result<(), JcpError> {
    let mut keyring = MOCK_KEYRING
        .lock()
        .map_err(|_| JcpError::Keyring(KeyringError::StoreFailed))?;
    keyring.remove(&make_key(service, client_id));
    Ok(())
}

/// Store the client secret in the mock keyring
pub fn store_client_secret(client_id: &str, secret: &ClientSecret) -> Result<(), JcpError> {
    store(KEYRING_SERVICE_CLIENT_SECRET, client_id, secret.expose())
}

/// Retrieve the client secret from the mock keyring
pub fn retrieve_client_secret(client_id: &str) -> Result<ClientSecret, JcpError> {
    retrieve(KEYRING_SERVICE_CLIENT_SECRET, client_id)?
        .map(ClientSecret::new)
        .ok_or(JcpError::Keyring(KeyringError::NotFound))
}

/// Check if a client secret exists in the mock keyring
pub fn has_client_secret(client_id: &str) -> Result<bool, JcpError> {
    Ok(retrieve(KEYRING_SERVICE_CLIENT_SECRET, client_id)?.is_some())
}

/// Store the refresh token in the mock keyring
pub fn store_refresh_token(client_id: &str, token: &RefreshToken) -> Result<(), JcpError> {
    store(KEYRING_SERVICE_REFRESH_TOKEN, client_id, token.expose())
}

/// Retrieve the refresh token from the mock keyring
pub fn retrieve_refresh_token(client_id: &str) -> Result<Option<RefreshToken>, JcpError> {
    Ok(retrieve(KEYRING_SERVICE_REFRESH_TOKEN, client_id)?.map(RefreshToken::new))
}

/// Delete the refresh token from the mock keyring
pub fn delete_refresh_token(client_id: &str) -> Result<(), JcpError> {
    delete(KEYRING_SERVICE_REFRESH_TOKEN, client_id)
}
