//! Error taxonomy for the reconciliation core.
//!
//! Expected runtime failures (bad operator input, courier rejections, unknown
//! shipment ids in a webhook) are values of [`LogisticsError`] and travel back
//! to the caller as `Err`. Bulk operations collect them per item instead of
//! propagating.

use serde::Serialize;

pub type Result<T> = std::result::Result<T, LogisticsError>;

#[derive(Debug, thiserror::Error)]
pub enum LogisticsError {
    /// Missing or invalid input, rejected before any I/O or mutation.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Phone number had no digits left after normalization.
    #[error("Invalid phone number format: {0:?}")]
    InvalidPhone(String),

    /// The order has no courier shipment yet.
    #[error("Order {0} is not linked to a courier shipment")]
    NotLinked(String),

    /// Non-2xx, timed out, or malformed courier response.
    #[error("Courier API error: {message}")]
    CourierApi {
        message: String,
        body: Option<String>,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    /// Lost a race on the order↔shipment linkage.
    #[error("Concurrent update conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl LogisticsError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn courier(message: impl Into<String>, body: Option<String>) -> Self {
        Self::CourierApi {
            message: message.into(),
            body,
        }
    }

    /// Stable machine-readable kind, used in reports and webhook responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::InvalidPhone(_) => "invalid_phone",
            Self::NotLinked(_) => "not_linked",
            Self::CourierApi { .. } => "courier_api_error",
            Self::NotFound(_) => "not_found",
            Self::ConcurrencyConflict(_) => "concurrency_conflict",
            Self::Database(_) => "database_error",
            Self::Config(_) => "config_error",
        }
    }

    /// Message suitable for an operator-facing summary. Courier errors carry
    /// the raw body when the courier sent one.
    pub fn display_message(&self) -> String {
        match self {
            Self::CourierApi {
                message,
                body: Some(body),
            } if !body.trim().is_empty() && body.trim() != message => {
                format!("{message}: {}", body.trim())
            }
            other => other.to_string(),
        }
    }
}

impl From<rusqlite::Error> for LogisticsError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(ref code, ref detail) = err {
            let is_unique = code.code == rusqlite::ErrorCode::ConstraintViolation
                && detail
                    .as_deref()
                    .map(|d| d.contains("courier_order_id"))
                    .unwrap_or(false);
            if is_unique {
                return Self::ConcurrencyConflict(
                    "courier shipment id is already linked to another order".into(),
                );
            }
        }
        Self::Database(err.to_string())
    }
}

/// Serializable error sample for bulk reports.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ErrorSample {
    pub reference: String,
    pub kind: &'static str,
    pub message: String,
}

impl ErrorSample {
    pub fn new(reference: impl Into<String>, err: &LogisticsError) -> Self {
        Self {
            reference: reference.into(),
            kind: err.kind(),
            message: err.display_message(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn courier_display_includes_raw_body() {
        let err = LogisticsError::courier("HTTP 400", Some("{\"Error\":\"bad branch\"}".into()));
        assert_eq!(
            err.display_message(),
            "HTTP 400: {\"Error\":\"bad branch\"}"
        );
        assert_eq!(err.kind(), "courier_api_error");
    }

    #[test]
    fn courier_display_without_body() {
        let err = LogisticsError::courier("Request timeout", None);
        assert_eq!(err.display_message(), "Courier API error: Request timeout");
    }

    #[test]
    fn unique_violation_on_courier_id_maps_to_conflict() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE t (courier_order_id TEXT);
             CREATE UNIQUE INDEX idx_t_courier ON t(courier_order_id);
             INSERT INTO t VALUES ('99');",
        )
        .unwrap();
        let err: LogisticsError = conn
            .execute("INSERT INTO t VALUES ('99')", [])
            .unwrap_err()
            .into();
        assert!(matches!(err, LogisticsError::ConcurrencyConflict(_)));
    }

    #[test]
    fn other_sqlite_errors_map_to_database() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let err: LogisticsError = conn.execute("SELECT * FROM missing", []).unwrap_err().into();
        assert_eq!(err.kind(), "database_error");
    }
}
