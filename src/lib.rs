//! Merchant logistics core
//!
//! Reconciles merchant orders with the NCM courier: status mapping, the
//! order state machine with its stock effects, shipment creation and status
//! sync, dispatch batches, and the inbound webhook.

pub mod config;
pub mod courier;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod logistics;
pub mod models;
pub mod orders;
pub mod report;
pub mod state_machine;
pub mod status_map;
pub mod storage;
pub mod webhook;

pub use courier::{CourierApi, CourierClient};
pub use db::DbState;
pub use dispatch::BatchOutcome;
pub use error::{LogisticsError, Result};
pub use logistics::LogisticsSyncEngine;
pub use models::{InOut, LogisticsProvider, OrderStatus, PaymentStatus};
pub use report::BulkReport;
