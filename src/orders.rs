//! Order persistence: row mapping, lookups, the activity log, order creation
//! and trash/restore.
//!
//! Connection-level helpers (`load_order`, `insert_activity`, …) expect the
//! caller to hold the database lock and, for writes, an open transaction.
//! The `&DbState` entry points take the lock and open the transaction
//! themselves.

use std::str::FromStr;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Deserialize;
use tracing::info;

use crate::db::{self, DbState};
use crate::error::{LogisticsError, Result};
use crate::models::{
    ActivityAction, ActivityLogEntry, InOut, LogisticsProvider, Order, OrderItem, OrderStatus,
    PaymentStatus,
};
use crate::state_machine;

pub(crate) const ORDER_COLUMNS: &str = "
    id, order_number, barcode, customer_name, customer_phone, alternate_phone,
    shipping_address, branch_city, notes, order_status, payment_status,
    courier_status, courier_order_id, courier_from_branch, courier_destination_branch,
    courier_created_at, courier_last_synced_at, tracking_number, admin_notes,
    logistics, in_out, is_partial_payment, partial_amount_paid, remaining_amount,
    subtotal, discount_amount, shipping_charge, tax_percent, total_amount,
    package_weight, stock_deducted, delivered_at, dispatch_date, is_deleted,
    deleted_at, created_at, updated_at";

/// Parse a closed-enum text column, surfacing bad values as a conversion error.
fn enum_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = LogisticsError>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: LogisticsError| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn order_from_row(row: &Row<'_>) -> rusqlite::Result<Order> {
    let logistics = match row
        .get::<_, Option<String>>(19)?
        .filter(|s| !s.trim().is_empty())
    {
        Some(raw) => Some(raw.parse::<LogisticsProvider>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(19, rusqlite::types::Type::Text, Box::new(e))
        })?),
        None => None,
    };

    Ok(Order {
        id: row.get(0)?,
        order_number: row.get(1)?,
        barcode: row.get(2)?,
        customer_name: row.get(3)?,
        customer_phone: row.get(4)?,
        alternate_phone: row.get(5)?,
        shipping_address: row.get(6)?,
        branch_city: row.get(7)?,
        notes: row.get(8)?,
        order_status: enum_column(row, 9)?,
        payment_status: enum_column(row, 10)?,
        courier_status: row.get(11)?,
        courier_order_id: row.get(12)?,
        courier_from_branch: row.get(13)?,
        courier_destination_branch: row.get(14)?,
        courier_created_at: row.get(15)?,
        courier_last_synced_at: row.get(16)?,
        tracking_number: row.get(17)?,
        admin_notes: row.get(18)?,
        logistics,
        in_out: enum_column(row, 20)?,
        is_partial_payment: row.get(21)?,
        partial_amount_paid: row.get(22)?,
        remaining_amount: row.get(23)?,
        subtotal: row.get(24)?,
        discount_amount: row.get(25)?,
        shipping_charge: row.get(26)?,
        tax_percent: row.get(27)?,
        total_amount: row.get(28)?,
        package_weight: row.get(29)?,
        stock_deducted: row.get(30)?,
        delivered_at: row.get(31)?,
        dispatch_date: row.get(32)?,
        is_deleted: row.get(33)?,
        deleted_at: row.get(34)?,
        created_at: row.get(35)?,
        updated_at: row.get(36)?,
    })
}

// ---------------------------------------------------------------------------
// Lookups
// ---------------------------------------------------------------------------

/// Load an order by id, including trashed ones.
pub fn load_order(conn: &Connection, order_id: i64) -> Result<Order> {
    conn.query_row(
        &format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?1"),
        params![order_id],
        order_from_row,
    )
    .optional()?
    .ok_or_else(|| LogisticsError::not_found(format!("order {order_id}")))
}

/// Load an order that is not in the trash.
pub fn load_active_order(conn: &Connection, order_id: i64) -> Result<Order> {
    let order = load_order(conn, order_id)?;
    if order.is_deleted {
        return Err(LogisticsError::not_found(format!(
            "order {} is in the trash",
            order.order_number
        )));
    }
    Ok(order)
}

pub fn get_order(db: &DbState, order_id: i64) -> Result<Order> {
    let conn = db.lock()?;
    load_order(&conn, order_id)
}

/// Lookup by courier shipment id. Trashed orders are invisible.
pub fn find_by_courier_id(conn: &Connection, courier_order_id: &str) -> Result<Option<Order>> {
    let order = conn
        .query_row(
            &format!(
                "SELECT {ORDER_COLUMNS} FROM orders
                 WHERE courier_order_id = ?1 AND is_deleted = 0"
            ),
            params![courier_order_id.trim()],
            order_from_row,
        )
        .optional()?;
    Ok(order)
}

/// Exact match on order number first, then on the order barcode.
pub fn find_by_number_or_barcode(conn: &Connection, scanned: &str) -> Result<Option<Order>> {
    let scanned = scanned.trim();
    if scanned.is_empty() {
        return Ok(None);
    }
    let by_number = conn
        .query_row(
            &format!(
                "SELECT {ORDER_COLUMNS} FROM orders
                 WHERE order_number = ?1 AND is_deleted = 0"
            ),
            params![scanned],
            order_from_row,
        )
        .optional()?;
    if by_number.is_some() {
        return Ok(by_number);
    }
    let by_barcode = conn
        .query_row(
            &format!(
                "SELECT {ORDER_COLUMNS} FROM orders
                 WHERE barcode = ?1 AND is_deleted = 0
                 ORDER BY id LIMIT 1"
            ),
            params![scanned],
            order_from_row,
        )
        .optional()?;
    Ok(by_barcode)
}

/// Ids of linked, active, non-terminal orders (the bulk sync working set).
pub fn list_syncable_order_ids(conn: &Connection) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM orders
         WHERE courier_order_id IS NOT NULL
           AND is_deleted = 0
           AND order_status NOT IN ('delivered', 'cancelled', 'returned')
         ORDER BY id",
    )?;
    let ids = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(ids)
}

pub fn load_items(conn: &Connection, order_id: i64) -> Result<Vec<OrderItem>> {
    let mut stmt = conn.prepare(
        "SELECT id, order_id, product_id, variation_id, product_name, product_sku,
                quantity, price, total
         FROM order_items WHERE order_id = ?1 ORDER BY id",
    )?;
    let items = stmt
        .query_map(params![order_id], |row| {
            Ok(OrderItem {
                id: row.get(0)?,
                order_id: row.get(1)?,
                product_id: row.get(2)?,
                variation_id: row.get(3)?,
                product_name: row.get(4)?,
                product_sku: row.get(5)?,
                quantity: row.get(6)?,
                price: row.get(7)?,
                total: row.get(8)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(items)
}

pub fn get_order_items(db: &DbState, order_id: i64) -> Result<Vec<OrderItem>> {
    let conn = db.lock()?;
    load_items(&conn, order_id)
}

// ---------------------------------------------------------------------------
// Activity log
// ---------------------------------------------------------------------------

/// One append-only activity log row.
#[derive(Debug, Clone)]
pub struct NewActivity<'a> {
    pub order_id: i64,
    pub action: ActivityAction,
    pub field_name: &'a str,
    pub old_value: &'a str,
    pub new_value: &'a str,
    pub description: String,
    pub actor: Option<&'a str>,
}

impl<'a> NewActivity<'a> {
    pub fn new(order_id: i64, action: ActivityAction, description: impl Into<String>) -> Self {
        Self {
            order_id,
            action,
            field_name: "",
            old_value: "",
            new_value: "",
            description: description.into(),
            actor: None,
        }
    }

    pub fn field(mut self, name: &'a str, old_value: &'a str, new_value: &'a str) -> Self {
        self.field_name = name;
        self.old_value = old_value;
        self.new_value = new_value;
        self
    }

    pub fn by(mut self, actor: Option<&'a str>) -> Self {
        self.actor = actor;
        self
    }
}

pub fn insert_activity(conn: &Connection, entry: &NewActivity<'_>) -> Result<i64> {
    conn.execute(
        "INSERT INTO order_activity_logs (
            order_id, action_type, field_name, old_value, new_value,
            description, actor, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            entry.order_id,
            entry.action.as_str(),
            entry.field_name,
            entry.old_value,
            entry.new_value,
            entry.description,
            entry.actor,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn load_activity(conn: &Connection, order_id: i64) -> Result<Vec<ActivityLogEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, order_id, action_type, field_name, old_value, new_value,
                description, actor, created_at
         FROM order_activity_logs WHERE order_id = ?1 ORDER BY id",
    )?;
    let entries = stmt
        .query_map(params![order_id], |row| {
            Ok(ActivityLogEntry {
                id: row.get(0)?,
                order_id: row.get(1)?,
                action: enum_column(row, 2)?,
                field_name: row.get(3)?,
                old_value: row.get(4)?,
                new_value: row.get(5)?,
                description: row.get(6)?,
                actor: row.get(7)?,
                created_at: row.get(8)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entries)
}

pub fn list_activity(db: &DbState, order_id: i64) -> Result<Vec<ActivityLogEntry>> {
    let conn = db.lock()?;
    load_activity(&conn, order_id)
}

// ---------------------------------------------------------------------------
// Order creation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NewOrderItem {
    pub product_id: Option<i64>,
    pub variation_id: Option<i64>,
    /// Used only for items not linked to the catalogue.
    pub product_name: String,
    pub product_sku: Option<String>,
    pub quantity: i64,
    pub price: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NewOrder {
    /// Assigned as `ORD######` when absent.
    pub order_number: Option<String>,
    pub barcode: Option<String>,
    pub customer_name: String,
    pub customer_phone: String,
    pub alternate_phone: Option<String>,
    pub shipping_address: String,
    pub branch_city: Option<String>,
    pub notes: String,
    pub order_status: Option<OrderStatus>,
    pub logistics: Option<LogisticsProvider>,
    pub in_out: Option<InOut>,
    pub discount_amount: f64,
    pub shipping_charge: f64,
    /// Defaults to 13 (VAT).
    pub tax_percent: Option<f64>,
    pub package_weight: Option<f64>,
    /// Present when the customer paid part of the total up front.
    pub partial_amount_paid: Option<f64>,
    pub items: Vec<NewOrderItem>,
}

const DEFAULT_TAX_PERCENT: f64 = 13.0;

pub(crate) fn round_money(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// `(subtotal − discount) × (1 + tax%) + shipping`
pub fn compute_total(subtotal: f64, discount: f64, tax_percent: f64, shipping: f64) -> f64 {
    let after_discount = subtotal - discount;
    let tax_amount = after_discount * tax_percent / 100.0;
    round_money(after_discount + tax_amount + shipping)
}

struct ItemSnapshot {
    product_id: Option<i64>,
    variation_id: Option<i64>,
    name: String,
    sku: Option<String>,
}

/// Resolve the name/sku snapshot for a line item from the catalogue.
fn snapshot_item(conn: &Connection, item: &NewOrderItem) -> Result<ItemSnapshot> {
    if let Some(variation_id) = item.variation_id {
        let (product_id, name, sku): (i64, String, String) = conn
            .query_row(
                "SELECT v.product_id, p.name, v.sku
                 FROM product_variations v JOIN products p ON p.id = v.product_id
                 WHERE v.id = ?1",
                params![variation_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?
            .ok_or_else(|| LogisticsError::not_found(format!("variation {variation_id}")))?;
        if item.product_id.is_some_and(|p| p != product_id) {
            return Err(LogisticsError::validation(format!(
                "variation {variation_id} does not belong to product {}",
                item.product_id.unwrap_or_default()
            )));
        }
        return Ok(ItemSnapshot {
            product_id: Some(product_id),
            variation_id: Some(variation_id),
            name,
            sku: Some(sku),
        });
    }

    if let Some(product_id) = item.product_id {
        let (name, sku): (String, Option<String>) = conn
            .query_row(
                "SELECT name, sku FROM products WHERE id = ?1",
                params![product_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| LogisticsError::not_found(format!("product {product_id}")))?;
        return Ok(ItemSnapshot {
            product_id: Some(product_id),
            variation_id: None,
            name,
            sku: item.product_sku.clone().or(sku),
        });
    }

    let name = item.product_name.trim();
    if name.is_empty() {
        return Err(LogisticsError::validation(
            "custom items need a product name",
        ));
    }
    Ok(ItemSnapshot {
        product_id: None,
        variation_id: None,
        name: name.to_string(),
        sku: item.product_sku.clone(),
    })
}

/// Next `ORD######` number after the most recent order.
fn next_order_number(conn: &Connection) -> Result<String> {
    let last: Option<(i64, String)> = conn
        .query_row(
            "SELECT id, order_number FROM orders ORDER BY id DESC LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let mut n = match last {
        Some((id, number)) => number
            .strip_prefix("ORD")
            .and_then(|digits| digits.parse::<i64>().ok())
            .unwrap_or(id),
        None => 0,
    };

    loop {
        n += 1;
        let candidate = format!("ORD{n:06}");
        let taken: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM orders WHERE order_number = ?1)",
            params![candidate],
            |row| row.get(0),
        )?;
        if !taken {
            return Ok(candidate);
        }
    }
}

fn validate_new_order(new: &NewOrder) -> Result<()> {
    if new.customer_name.trim().is_empty() {
        return Err(LogisticsError::validation("customer name is required"));
    }
    if new.items.is_empty() {
        return Err(LogisticsError::validation("an order needs at least one item"));
    }
    for item in &new.items {
        if item.quantity < 1 {
            return Err(LogisticsError::validation(format!(
                "quantity must be at least 1 (got {})",
                item.quantity
            )));
        }
        if !item.price.is_finite() || item.price < 0.0 {
            return Err(LogisticsError::validation(format!(
                "price must be non-negative (got {})",
                item.price
            )));
        }
    }
    if new.discount_amount < 0.0 || new.shipping_charge < 0.0 {
        return Err(LogisticsError::validation(
            "discount and shipping charge must be non-negative",
        ));
    }
    if let Some(tax) = new.tax_percent {
        if !(0.0..=100.0).contains(&tax) {
            return Err(LogisticsError::validation(format!(
                "tax percent must be between 0 and 100 (got {tax})"
            )));
        }
    }
    if let Some(status) = new.order_status {
        if status == OrderStatus::Dispatched || status.is_terminal() {
            return Err(LogisticsError::validation(format!(
                "new orders cannot start as {status}"
            )));
        }
    }
    Ok(())
}

/// Insert an order with its item snapshots and a `created` log entry.
pub fn create_order(db: &DbState, new: &NewOrder, actor: Option<&str>) -> Result<Order> {
    validate_new_order(new)?;

    let conn = db.lock()?;
    let order = db::in_transaction(&conn, |conn| {
        let mut snapshots = Vec::with_capacity(new.items.len());
        for item in &new.items {
            snapshots.push(snapshot_item(conn, item)?);
        }

        let subtotal = round_money(
            new.items
                .iter()
                .map(|i| i.price * i.quantity as f64)
                .sum::<f64>(),
        );
        if new.discount_amount > subtotal {
            return Err(LogisticsError::validation(format!(
                "discount {:.2} exceeds subtotal {subtotal:.2}",
                new.discount_amount
            )));
        }
        let tax_percent = new.tax_percent.unwrap_or(DEFAULT_TAX_PERCENT);
        let total = compute_total(
            subtotal,
            new.discount_amount,
            tax_percent,
            new.shipping_charge,
        );

        let (payment_status, partial_paid, remaining) = match new.partial_amount_paid {
            Some(paid) => {
                if !(0.0..=total).contains(&paid) {
                    return Err(LogisticsError::validation(format!(
                        "partial amount {paid:.2} must be between 0 and the total {total:.2}"
                    )));
                }
                (PaymentStatus::Partial, Some(paid), Some(round_money(total - paid)))
            }
            None => (PaymentStatus::Pending, None, None),
        };

        let order_number = match new.order_number.as_deref().map(str::trim) {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => next_order_number(conn)?,
        };
        let now = Utc::now().to_rfc3339();
        let status = new.order_status.unwrap_or(OrderStatus::Processing);

        conn.execute(
            "INSERT INTO orders (
                order_number, barcode, customer_name, customer_phone, alternate_phone,
                shipping_address, branch_city, notes, order_status, payment_status,
                logistics, in_out, is_partial_payment, partial_amount_paid, remaining_amount,
                subtotal, discount_amount, shipping_charge, tax_percent, total_amount,
                package_weight, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                      ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?22)",
            params![
                order_number,
                new.barcode.as_deref().map(str::trim).filter(|b| !b.is_empty()),
                new.customer_name.trim(),
                new.customer_phone.trim(),
                new.alternate_phone.as_deref().map(str::trim).filter(|p| !p.is_empty()),
                new.shipping_address.trim(),
                new.branch_city.as_deref().map(str::trim).filter(|c| !c.is_empty()),
                new.notes.trim(),
                status.as_str(),
                payment_status.as_str(),
                new.logistics.map(|l| l.as_str()),
                new.in_out.unwrap_or(InOut::In).as_str(),
                partial_paid.is_some(),
                partial_paid,
                remaining,
                subtotal,
                new.discount_amount,
                new.shipping_charge,
                tax_percent,
                total,
                new.package_weight,
                now,
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(ref code, _)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                LogisticsError::validation(format!("order number {order_number} already exists"))
            }
            other => other.into(),
        })?;
        let order_id = conn.last_insert_rowid();

        for (item, snap) in new.items.iter().zip(&snapshots) {
            conn.execute(
                "INSERT INTO order_items (
                    order_id, product_id, variation_id, product_name, product_sku,
                    quantity, price, total
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    order_id,
                    snap.product_id,
                    snap.variation_id,
                    snap.name,
                    snap.sku,
                    item.quantity,
                    item.price,
                    round_money(item.price * item.quantity as f64),
                ],
            )?;
        }

        let mut description =
            format!("Order #{order_number} was created with total amount Rs. {total:.2}");
        if let (Some(paid), Some(left)) = (partial_paid, remaining) {
            description.push_str(&format!(
                " | Partial Payment: Rs. {paid:.2} paid, Rs. {left:.2} remaining"
            ));
        }
        insert_activity(
            conn,
            &NewActivity::new(order_id, ActivityAction::Created, description).by(actor),
        )?;

        load_order(conn, order_id)
    })?;

    info!(
        order_id = order.id,
        order_number = %order.order_number,
        total = order.total_amount,
        "Order created"
    );
    Ok(order)
}

// ---------------------------------------------------------------------------
// Trash / restore
// ---------------------------------------------------------------------------

/// Soft-delete an order. Stock held by a dispatch is returned to inventory.
pub fn move_to_trash(db: &DbState, order_id: i64, actor: Option<&str>) -> Result<Order> {
    let conn = db.lock()?;
    let order = db::in_transaction(&conn, |conn| {
        let order = load_order(conn, order_id)?;
        if order.is_deleted {
            return Err(LogisticsError::validation(format!(
                "order {} is already in the trash",
                order.order_number
            )));
        }

        let restored = if order.stock_deducted {
            state_machine::restore_stock(conn, &order)?;
            true
        } else {
            false
        };

        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE orders SET is_deleted = 1, deleted_at = ?1, updated_at = ?1
             WHERE id = ?2",
            params![now, order_id],
        )?;

        let mut description = format!("Order #{} moved to trash", order.order_number);
        if restored {
            description.push_str(" (stock restored)");
        }
        insert_activity(
            conn,
            &NewActivity::new(order_id, ActivityAction::Deleted, description)
                .field("is_deleted", "false", "true")
                .by(actor),
        )?;

        load_order(conn, order_id)
    })?;

    info!(order_id, order_number = %order.order_number, "Order moved to trash");
    Ok(order)
}

/// Bring an order back from the trash. Stock is not touched: trashing
/// already returned any dispatch deduction and cleared the marker.
pub fn restore_from_trash(db: &DbState, order_id: i64, actor: Option<&str>) -> Result<Order> {
    let conn = db.lock()?;
    let order = db::in_transaction(&conn, |conn| {
        let order = load_order(conn, order_id)?;
        if !order.is_deleted {
            return Err(LogisticsError::validation(format!(
                "order {} is not in the trash",
                order.order_number
            )));
        }

        conn.execute(
            "UPDATE orders SET is_deleted = 0, deleted_at = NULL, updated_at = ?1
             WHERE id = ?2",
            params![Utc::now().to_rfc3339(), order_id],
        )?;

        let who = actor.unwrap_or("system");
        insert_activity(
            conn,
            &NewActivity::new(
                order_id,
                ActivityAction::Restored,
                format!("Order restored from trash by {who}"),
            )
            .field("is_deleted", "true", "false")
            .by(actor),
        )?;

        load_order(conn, order_id)
    })?;

    info!(order_id, order_number = %order.order_number, "Order restored from trash");
    Ok(order)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::open_in_memory;

    pub(crate) fn seed_product(conn: &Connection, name: &str, stock: i64) -> i64 {
        conn.execute(
            "INSERT INTO products (name, sku, price, stock) VALUES (?1, ?2, 100, ?3)",
            params![name, format!("SKU-{name}"), stock],
        )
        .expect("insert product");
        conn.last_insert_rowid()
    }

    pub(crate) fn seed_variation(conn: &Connection, product_id: i64, sku: &str, stock: i64) -> i64 {
        conn.execute(
            "INSERT INTO product_variations (product_id, sku, variation_name, stock)
             VALUES (?1, ?2, ?2, ?3)",
            params![product_id, sku, stock],
        )
        .expect("insert variation");
        conn.last_insert_rowid()
    }

    pub(crate) fn order_with_items(items: Vec<NewOrderItem>) -> NewOrder {
        NewOrder {
            customer_name: "Sita Sharma".into(),
            customer_phone: "+977 980-1234567".into(),
            shipping_address: "Baneshwor, Kathmandu".into(),
            branch_city: Some("Pokhara".into()),
            tax_percent: Some(0.0),
            items,
            ..Default::default()
        }
    }

    pub(crate) fn item(product_id: i64, variation_id: Option<i64>, qty: i64, price: f64) -> NewOrderItem {
        NewOrderItem {
            product_id: Some(product_id),
            variation_id,
            quantity: qty,
            price,
            ..Default::default()
        }
    }

    #[test]
    fn test_create_order_numbers_and_totals() {
        let db = open_in_memory().unwrap();
        let pid = {
            let conn = db.lock().unwrap();
            seed_product(&conn, "Kurta", 20)
        };

        let mut new = order_with_items(vec![item(pid, None, 2, 500.0)]);
        new.discount_amount = 100.0;
        new.tax_percent = Some(13.0);
        new.shipping_charge = 150.0;

        let first = create_order(&db, &new, Some("admin")).unwrap();
        assert_eq!(first.order_number, "ORD000001");
        assert_eq!(first.subtotal, 1000.0);
        // (1000 - 100) * 1.13 + 150
        assert!((first.total_amount - 1167.0).abs() < 1e-9);
        assert_eq!(first.order_status, OrderStatus::Processing);
        assert_eq!(first.payment_status, PaymentStatus::Pending);

        let second = create_order(&db, &new, None).unwrap();
        assert_eq!(second.order_number, "ORD000002");

        let items = get_order_items(&db, first.id).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].product_name, "Kurta");
        assert_eq!(items[0].total, 1000.0);

        let log = list_activity(&db, first.id).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].action, ActivityAction::Created);
        assert_eq!(log[0].actor.as_deref(), Some("admin"));
    }

    #[test]
    fn test_create_order_with_partial_payment() {
        let db = open_in_memory().unwrap();
        let pid = {
            let conn = db.lock().unwrap();
            seed_product(&conn, "Shawl", 5)
        };
        let mut new = order_with_items(vec![item(pid, None, 1, 1500.0)]);
        new.partial_amount_paid = Some(500.0);

        let order = create_order(&db, &new, None).unwrap();
        assert_eq!(order.payment_status, PaymentStatus::Partial);
        assert!(order.is_partial_payment);
        assert_eq!(order.partial_amount_paid, Some(500.0));
        assert_eq!(order.remaining_amount, Some(1000.0));
    }

    #[test]
    fn test_create_order_rejects_bad_lines_without_writing() {
        let db = open_in_memory().unwrap();
        let pid = {
            let conn = db.lock().unwrap();
            seed_product(&conn, "Cap", 5)
        };

        let zero_qty = order_with_items(vec![item(pid, None, 0, 10.0)]);
        assert!(matches!(
            create_order(&db, &zero_qty, None),
            Err(LogisticsError::Validation(_))
        ));

        let negative_price = order_with_items(vec![item(pid, None, 1, -1.0)]);
        assert!(matches!(
            create_order(&db, &negative_price, None),
            Err(LogisticsError::Validation(_))
        ));

        let missing_product = order_with_items(vec![item(9999, None, 1, 1.0)]);
        assert!(matches!(
            create_order(&db, &missing_product, None),
            Err(LogisticsError::NotFound(_))
        ));

        let conn = db.lock().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM orders", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_variation_snapshot_uses_variation_sku() {
        let db = open_in_memory().unwrap();
        let (pid, vid) = {
            let conn = db.lock().unwrap();
            let pid = seed_product(&conn, "Tshirt", 0);
            let vid = seed_variation(&conn, pid, "TSHIRT-RED-M", 3);
            (pid, vid)
        };
        let order = create_order(&db, &order_with_items(vec![item(pid, Some(vid), 1, 800.0)]), None)
            .unwrap();
        let items = get_order_items(&db, order.id).unwrap();
        assert_eq!(items[0].variation_id, Some(vid));
        assert_eq!(items[0].product_sku.as_deref(), Some("TSHIRT-RED-M"));
    }

    #[test]
    fn test_lookup_by_number_or_barcode_skips_trashed() {
        let db = open_in_memory().unwrap();
        let pid = {
            let conn = db.lock().unwrap();
            seed_product(&conn, "Mug", 5)
        };
        let mut new = order_with_items(vec![item(pid, None, 1, 250.0)]);
        new.barcode = Some("8801234".into());
        let order = create_order(&db, &new, None).unwrap();

        {
            let conn = db.lock().unwrap();
            let hit = find_by_number_or_barcode(&conn, " ORD000001 ").unwrap();
            assert_eq!(hit.map(|o| o.id), Some(order.id));
            let hit = find_by_number_or_barcode(&conn, "8801234").unwrap();
            assert_eq!(hit.map(|o| o.id), Some(order.id));
            assert!(find_by_number_or_barcode(&conn, "ORD999999").unwrap().is_none());
        }

        move_to_trash(&db, order.id, None).unwrap();
        let conn = db.lock().unwrap();
        assert!(find_by_number_or_barcode(&conn, "ORD000001").unwrap().is_none());
    }

    #[test]
    fn test_trash_returns_dispatch_stock_and_restore_keeps_it() {
        let db = open_in_memory().unwrap();
        let pid = {
            let conn = db.lock().unwrap();
            seed_product(&conn, "Bag", 10)
        };
        let order = create_order(&db, &order_with_items(vec![item(pid, None, 4, 900.0)]), None)
            .unwrap();
        state_machine::transition_order_status(&db, order.id, "dispatched", None).unwrap();

        let stock = |db: &DbState| -> i64 {
            let conn = db.lock().unwrap();
            conn.query_row("SELECT stock FROM products WHERE id = ?1", params![pid], |r| r.get(0))
                .unwrap()
        };
        assert_eq!(stock(&db), 6);

        let trashed = move_to_trash(&db, order.id, Some("admin")).unwrap();
        assert!(trashed.is_deleted);
        assert!(!trashed.stock_deducted);
        assert_eq!(stock(&db), 10);
        assert!(move_to_trash(&db, order.id, None).is_err());

        let restored = restore_from_trash(&db, order.id, Some("admin")).unwrap();
        assert!(!restored.is_deleted);
        assert!(!restored.stock_deducted);
        assert_eq!(stock(&db), 10);

        // leaving dispatched later must not hand the stock back a second time
        state_machine::transition_order_status(&db, order.id, "cancelled", None).unwrap();
        assert_eq!(stock(&db), 10);

        let actions: Vec<ActivityAction> = list_activity(&db, order.id)
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(
            actions,
            vec![
                ActivityAction::Created,
                ActivityAction::StatusChanged,
                ActivityAction::Deleted,
                ActivityAction::Restored,
            ]
        );
    }

    #[test]
    fn test_trash_round_trip_of_undeducted_order_keeps_stock() {
        let db = open_in_memory().unwrap();
        let pid = {
            let conn = db.lock().unwrap();
            seed_product(&conn, "Bag", 10)
        };
        let order = create_order(&db, &order_with_items(vec![item(pid, None, 4, 900.0)]), None)
            .unwrap();
        state_machine::transition_order_status(&db, order.id, "delivered", None).unwrap();

        let stock = || -> i64 {
            let conn = db.lock().unwrap();
            conn.query_row("SELECT stock FROM products WHERE id = ?1", params![pid], |r| r.get(0))
                .unwrap()
        };
        assert_eq!(stock(), 10);

        move_to_trash(&db, order.id, None).unwrap();
        assert_eq!(stock(), 10);
        let restored = restore_from_trash(&db, order.id, None).unwrap();
        assert_eq!(restored.order_status, OrderStatus::Delivered);
        assert!(!restored.stock_deducted);
        assert_eq!(stock(), 10);
    }
}
