//! Courier API credentials in the OS credential store.
//!
//! Uses the `keyring` crate (Keychain on macOS, Credential Manager on
//! Windows, Secret Service on Linux). Configuration falls back to this store
//! when `NCM_API_KEY` is not set in the environment.

use keyring::Entry;
use tracing::{info, warn};

use crate::error::{LogisticsError, Result};

const SERVICE_NAME: &str = "merchant-logistics";

pub const KEY_COURIER_API_KEY: &str = "ncm_api_key";
pub const KEY_COURIER_BASE_URL: &str = "ncm_api_base_url";

const ALL_KEYS: &[&str] = &[KEY_COURIER_API_KEY, KEY_COURIER_BASE_URL];

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Retrieve a single credential. Returns `None` when the entry does not exist
/// or the platform store is unavailable.
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

pub fn set_credential(key: &str, value: &str) -> Result<()> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| LogisticsError::Config(e.to_string()))?;
    entry
        .set_password(value)
        .map_err(|e| LogisticsError::Config(e.to_string()))
}

/// Delete a credential. Succeeds if the entry does not exist.
pub fn delete_credential(key: &str) -> Result<()> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| LogisticsError::Config(e.to_string()))?;
    match entry.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(LogisticsError::Config(e.to_string())),
    }
}

// ---------------------------------------------------------------------------
// High-level API
// ---------------------------------------------------------------------------

/// Stored courier token, if any (trimmed, never empty).
pub fn courier_api_key() -> Option<String> {
    get_credential(KEY_COURIER_API_KEY)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Store the courier token (and optionally the base URL) issued by NCM.
pub fn store_courier_credentials(api_key: &str, base_url: Option<&str>) -> Result<()> {
    let api_key = api_key.trim();
    if api_key.is_empty() {
        return Err(LogisticsError::validation("Missing required field: api_key"));
    }
    set_credential(KEY_COURIER_API_KEY, api_key)?;

    if let Some(url) = base_url.map(str::trim).filter(|u| !u.is_empty()) {
        set_credential(KEY_COURIER_BASE_URL, &crate::config::normalize_base_url(url))?;
    }

    info!("courier credentials updated");
    Ok(())
}

/// Remove every stored courier credential.
pub fn clear_courier_credentials() -> Result<()> {
    info!("clearing stored courier credentials");
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_api_key_is_rejected_before_touching_the_store() {
        let err = store_courier_credentials("   ", Some("demo.nepalcanmove.com")).unwrap_err();
        assert!(matches!(err, LogisticsError::Validation(_)));
    }
}
