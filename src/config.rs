//! Runtime configuration from the environment (`.env` supported).

use std::path::PathBuf;
use std::time::Duration;

use rusqlite::Connection;
use tracing::{debug, info};

use crate::db;
use crate::error::{LogisticsError, Result};
use crate::storage;

pub const MAX_COURIER_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_FROM_BRANCH: &str = "TINKUNE";
pub const DEFAULT_DELIVERY_TYPE: &str = "Door2Door";

/// Everything the courier client needs.
#[derive(Debug, Clone)]
pub struct CourierConfig {
    pub base_url: String,
    pub base_url_v2: String,
    pub api_key: String,
    pub timeout: Duration,
}

impl CourierConfig {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        let base_url = normalize_base_url(base_url);
        Self {
            base_url_v2: derive_v2_url(&base_url),
            base_url,
            api_key: api_key.trim().to_string(),
            timeout: Duration::from_secs(MAX_COURIER_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub courier_base_url: String,
    pub courier_base_url_v2: String,
    /// Token from `NCM_API_KEY`; see [`resolve_courier_api_key`] for fallbacks.
    pub courier_api_key: Option<String>,
    pub courier_timeout: Duration,
    pub default_from_branch: String,
    pub default_delivery_type: String,
    pub database_path: PathBuf,
    pub http_host: String,
    pub http_port: u16,
    pub log_dir: PathBuf,
}

impl AppConfig {
    /// Load from process environment after reading `.env` if present.
    pub fn from_env() -> Result<Self> {
        if let Ok(path) = dotenv::dotenv() {
            debug!("Loaded environment from {}", path.display());
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let courier_base_url = get("NCM_API_BASE_URL")
            .or_else(|| storage::get_credential(storage::KEY_COURIER_BASE_URL))
            .map(|u| normalize_base_url(&u))
            .ok_or_else(|| LogisticsError::Config("NCM_API_BASE_URL is not set".into()))?;
        let courier_base_url_v2 = get("NCM_API_BASE_URL_V2")
            .map(|u| normalize_base_url(&u))
            .unwrap_or_else(|| derive_v2_url(&courier_base_url));

        let timeout_secs = match get("NCM_TIMEOUT_SECS") {
            Some(raw) => raw.parse::<u64>().map_err(|_| {
                LogisticsError::Config(format!("NCM_TIMEOUT_SECS is not a number: {raw:?}"))
            })?,
            None => MAX_COURIER_TIMEOUT_SECS,
        };

        let http_port = match get("HTTP_PORT") {
            Some(raw) => raw.parse::<u16>().map_err(|_| {
                LogisticsError::Config(format!("HTTP_PORT is not a valid port: {raw:?}"))
            })?,
            None => 8080,
        };

        Ok(Self {
            courier_base_url,
            courier_base_url_v2,
            courier_api_key: get("NCM_API_KEY"),
            courier_timeout: Duration::from_secs(timeout_secs.clamp(1, MAX_COURIER_TIMEOUT_SECS)),
            default_from_branch: get("NCM_DEFAULT_FROM_BRANCH")
                .map(|b| b.to_uppercase())
                .unwrap_or_else(|| DEFAULT_FROM_BRANCH.to_string()),
            default_delivery_type: get("NCM_DEFAULT_DELIVERY_TYPE")
                .unwrap_or_else(|| DEFAULT_DELIVERY_TYPE.to_string()),
            database_path: get("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data/logistics.db")),
            http_host: get("HTTP_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            http_port,
            log_dir: get("LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("logs")),
        })
    }

    /// Build the courier client configuration once the token is known.
    /// Branch and delivery-type defaults go to the sync engine instead.
    pub fn courier_config(&self, api_key: String) -> CourierConfig {
        CourierConfig {
            base_url: self.courier_base_url.clone(),
            base_url_v2: self.courier_base_url_v2.clone(),
            api_key,
            timeout: self.courier_timeout,
        }
    }
}

/// Courier token lookup order: environment, OS credential store,
/// `local_settings` (`courier/api_key`).
pub fn resolve_courier_api_key(from_env: Option<&str>, conn: &Connection) -> Result<String> {
    if let Some(key) = from_env.map(str::trim).filter(|k| !k.is_empty()) {
        return Ok(key.to_string());
    }
    if let Some(key) = storage::courier_api_key() {
        info!("Using courier token from OS credential store");
        return Ok(key);
    }
    if let Some(key) = db::get_setting(conn, "courier", "api_key")
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
    {
        info!("Using courier token from local settings");
        return Ok(key);
    }
    Err(LogisticsError::Config(
        "courier API token not found (NCM_API_KEY, credential store, local settings)".into(),
    ))
}

/// Add a scheme when missing and strip trailing slashes.
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

/// `…/api/v1` → `…/api/v2`; anything else gets `/v2` appended.
fn derive_v2_url(base_url: &str) -> String {
    match base_url.strip_suffix("/v1") {
        Some(prefix) => format!("{prefix}/v2"),
        None => format!("{base_url}/v2"),
    }
}
