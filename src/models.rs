//! Domain types: closed status enums and the persisted row shapes.
//!
//! Status values are stored as lowercase snake_case strings. Parsing goes
//! through `FromStr`, which rejects anything outside the enum with
//! [`LogisticsError::Validation`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::LogisticsError;

// ---------------------------------------------------------------------------
// Order status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Processing,
    Confirmed,
    Packed,
    Shipped,
    Dispatched,
    Delivered,
    Cancelled,
    Returned,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 9] = [
        OrderStatus::Pending,
        OrderStatus::Processing,
        OrderStatus::Confirmed,
        OrderStatus::Packed,
        OrderStatus::Shipped,
        OrderStatus::Dispatched,
        OrderStatus::Delivered,
        OrderStatus::Cancelled,
        OrderStatus::Returned,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Processing => "processing",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Packed => "packed",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Dispatched => "dispatched",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Returned => "returned",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            OrderStatus::Pending => "Pending payment",
            OrderStatus::Processing => "Processing",
            OrderStatus::Confirmed => "Confirmed",
            OrderStatus::Packed => "Packed",
            OrderStatus::Shipped => "Shipped",
            OrderStatus::Dispatched => "Dispatched",
            OrderStatus::Delivered => "Delivered",
            OrderStatus::Cancelled => "Cancelled",
            OrderStatus::Returned => "Returned",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Delivered | OrderStatus::Cancelled | OrderStatus::Returned
        )
    }

    /// Position along the forward fulfillment path. `None` for the
    /// off-path outcomes (cancelled, returned).
    pub fn rank(self) -> Option<u8> {
        match self {
            OrderStatus::Pending => Some(0),
            OrderStatus::Processing => Some(1),
            OrderStatus::Confirmed => Some(2),
            OrderStatus::Packed => Some(3),
            OrderStatus::Shipped => Some(4),
            OrderStatus::Dispatched => Some(5),
            OrderStatus::Delivered => Some(6),
            OrderStatus::Cancelled | OrderStatus::Returned => None,
        }
    }

    /// States in which goods are out of the warehouse, so a dispatch stock
    /// deduction stays in place.
    pub fn keeps_stock_deducted(self) -> bool {
        matches!(self, OrderStatus::Dispatched | OrderStatus::Delivered)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = LogisticsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(OrderStatus::Pending),
            "processing" => Ok(OrderStatus::Processing),
            "confirmed" => Ok(OrderStatus::Confirmed),
            "packed" => Ok(OrderStatus::Packed),
            "shipped" => Ok(OrderStatus::Shipped),
            "dispatched" => Ok(OrderStatus::Dispatched),
            "delivered" => Ok(OrderStatus::Delivered),
            "cancelled" | "canceled" => Ok(OrderStatus::Cancelled),
            "returned" => Ok(OrderStatus::Returned),
            other => Err(LogisticsError::validation(format!(
                "unknown order status: {other:?}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Payment status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Partial,
    Paid,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Partial => "partial",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = LogisticsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(PaymentStatus::Pending),
            "partial" => Ok(PaymentStatus::Partial),
            "paid" => Ok(PaymentStatus::Paid),
            "failed" => Ok(PaymentStatus::Failed),
            "refunded" => Ok(PaymentStatus::Refunded),
            other => Err(LogisticsError::validation(format!(
                "unknown payment status: {other:?}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Logistics provider tag
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogisticsProvider {
    Ncm,
    Sundarijal,
    Express,
    Local,
    Other,
}

impl LogisticsProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            LogisticsProvider::Ncm => "ncm",
            LogisticsProvider::Sundarijal => "sundarijal",
            LogisticsProvider::Express => "express",
            LogisticsProvider::Local => "local",
            LogisticsProvider::Other => "other",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            LogisticsProvider::Ncm => "NCM",
            LogisticsProvider::Sundarijal => "Sundarijal",
            LogisticsProvider::Express => "Express",
            LogisticsProvider::Local => "Local Delivery",
            LogisticsProvider::Other => "Other",
        }
    }
}

impl fmt::Display for LogisticsProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogisticsProvider {
    type Err = LogisticsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ncm" => Ok(LogisticsProvider::Ncm),
            "sundarijal" => Ok(LogisticsProvider::Sundarijal),
            "express" => Ok(LogisticsProvider::Express),
            "local" => Ok(LogisticsProvider::Local),
            "other" => Ok(LogisticsProvider::Other),
            other => Err(LogisticsError::validation(format!(
                "unknown logistics provider: {other:?}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// In/out locale flag
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InOut {
    In,
    Out,
}

impl InOut {
    pub fn as_str(self) -> &'static str {
        match self {
            InOut::In => "in",
            InOut::Out => "out",
        }
    }
}

impl FromStr for InOut {
    type Err = LogisticsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "in" => Ok(InOut::In),
            "out" => Ok(InOut::Out),
            other => Err(LogisticsError::validation(format!(
                "unknown in/out value: {other:?}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Activity log action kinds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityAction {
    Created,
    StatusChanged,
    PaymentChanged,
    TrackingAdded,
    TrackingUpdated,
    NotesAdded,
    NotesUpdated,
    Updated,
    CityDetected,
    Deleted,
    Restored,
}

impl ActivityAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ActivityAction::Created => "created",
            ActivityAction::StatusChanged => "status_changed",
            ActivityAction::PaymentChanged => "payment_changed",
            ActivityAction::TrackingAdded => "tracking_added",
            ActivityAction::TrackingUpdated => "tracking_updated",
            ActivityAction::NotesAdded => "notes_added",
            ActivityAction::NotesUpdated => "notes_updated",
            ActivityAction::Updated => "updated",
            ActivityAction::CityDetected => "city_detected",
            ActivityAction::Deleted => "deleted",
            ActivityAction::Restored => "restored",
        }
    }
}

impl FromStr for ActivityAction {
    type Err = LogisticsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(ActivityAction::Created),
            "status_changed" => Ok(ActivityAction::StatusChanged),
            "payment_changed" => Ok(ActivityAction::PaymentChanged),
            "tracking_added" => Ok(ActivityAction::TrackingAdded),
            "tracking_updated" => Ok(ActivityAction::TrackingUpdated),
            "notes_added" => Ok(ActivityAction::NotesAdded),
            "notes_updated" => Ok(ActivityAction::NotesUpdated),
            "updated" => Ok(ActivityAction::Updated),
            "city_detected" => Ok(ActivityAction::CityDetected),
            "deleted" => Ok(ActivityAction::Deleted),
            "restored" => Ok(ActivityAction::Restored),
            other => Err(LogisticsError::validation(format!(
                "unknown activity action: {other:?}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Order {
    pub id: i64,
    pub order_number: String,
    pub barcode: Option<String>,
    pub customer_name: String,
    pub customer_phone: String,
    pub alternate_phone: Option<String>,
    pub shipping_address: String,
    pub branch_city: Option<String>,
    pub notes: String,
    pub order_status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub courier_status: Option<String>,
    pub courier_order_id: Option<String>,
    pub courier_from_branch: Option<String>,
    pub courier_destination_branch: Option<String>,
    pub courier_created_at: Option<String>,
    pub courier_last_synced_at: Option<String>,
    pub tracking_number: Option<String>,
    pub admin_notes: Option<String>,
    pub logistics: Option<LogisticsProvider>,
    pub in_out: InOut,
    pub is_partial_payment: bool,
    pub partial_amount_paid: Option<f64>,
    pub remaining_amount: Option<f64>,
    pub subtotal: f64,
    pub discount_amount: f64,
    pub shipping_charge: f64,
    pub tax_percent: f64,
    pub total_amount: f64,
    pub package_weight: Option<f64>,
    pub stock_deducted: bool,
    pub delivered_at: Option<String>,
    pub dispatch_date: Option<String>,
    pub is_deleted: bool,
    pub deleted_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Order {
    /// Courier-side mirror, present once the order is linked.
    pub fn shipment(&self) -> Option<CourierShipment> {
        let courier_order_id = self.courier_order_id.clone()?;
        Some(CourierShipment {
            courier_order_id,
            mapped_status: self.order_status,
            raw_status: self.courier_status.clone().unwrap_or_default(),
            cod_amount: self.total_amount,
            last_synced_at: self.courier_last_synced_at.clone(),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderItem {
    pub id: i64,
    pub order_id: i64,
    pub product_id: Option<i64>,
    pub variation_id: Option<i64>,
    pub product_name: String,
    pub product_sku: Option<String>,
    pub quantity: i64,
    pub price: f64,
    pub total: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivityLogEntry {
    pub id: i64,
    pub order_id: i64,
    pub action: ActivityAction,
    pub field_name: String,
    pub old_value: String,
    pub new_value: String,
    pub description: String,
    pub actor: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CourierShipment {
    pub courier_order_id: String,
    pub mapped_status: OrderStatus,
    pub raw_status: String,
    pub cod_amount: f64,
    pub last_synced_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchBatch {
    pub id: i64,
    pub batch_number: String,
    pub logistics: LogisticsProvider,
    pub status: OrderStatus,
    pub total_orders: i64,
    pub notes: Option<String>,
    pub created_by: Option<String>,
    pub is_deleted: bool,
    pub deleted_by: Option<String>,
    pub deleted_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchItem {
    pub id: i64,
    pub dispatch_id: i64,
    pub scanned_order_id: String,
    pub order_id: Option<i64>,
    pub order_number: Option<String>,
    pub scanned_at: String,
}

impl DispatchItem {
    pub fn is_linked(&self) -> bool {
        self.order_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_status_round_trips_through_str() {
        for status in OrderStatus::ALL {
            assert_eq!(status.as_str().parse::<OrderStatus>().unwrap(), status);
        }
    }

    #[test]
    fn unknown_order_status_is_rejected() {
        let err = "teleported".parse::<OrderStatus>().unwrap_err();
        assert!(matches!(err, LogisticsError::Validation(_)));
    }

    #[test]
    fn american_spelling_of_cancelled_is_accepted() {
        assert_eq!(
            "Canceled".parse::<OrderStatus>().unwrap(),
            OrderStatus::Cancelled
        );
    }

    #[test]
    fn terminal_states() {
        let terminal: Vec<_> = OrderStatus::ALL
            .into_iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(
            terminal,
            vec![
                OrderStatus::Delivered,
                OrderStatus::Cancelled,
                OrderStatus::Returned
            ]
        );
    }

    #[test]
    fn rank_follows_fulfillment_path() {
        assert!(OrderStatus::Pending.rank() < OrderStatus::Processing.rank());
        assert!(OrderStatus::Shipped.rank() < OrderStatus::Dispatched.rank());
        assert!(OrderStatus::Dispatched.rank() < OrderStatus::Delivered.rank());
        assert_eq!(OrderStatus::Cancelled.rank(), None);
    }

    #[test]
    fn payment_status_rejects_free_text() {
        assert!("partially".parse::<PaymentStatus>().is_err());
        assert_eq!(
            " PAID ".parse::<PaymentStatus>().unwrap(),
            PaymentStatus::Paid
        );
    }
}
