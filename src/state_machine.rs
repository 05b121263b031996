//! Order status / payment status transitions and their side effects.
//!
//! The machine permits every transition between known statuses (operators
//! correct mistakes by moving backwards) and records each one in the activity
//! log. Side effects hang off specific edges:
//!
//! - entering `dispatched` deducts item stock once per dispatch, flooring at
//!   zero and reporting shortages instead of failing;
//! - leaving the warehouse-out states (`dispatched`/`delivered`) for anything
//!   else gives the same quantities back;
//! - the first entry into `delivered` stamps `delivered_at`.
//!
//! Every public entry point runs inside one transaction: stock, order row and
//! log entries commit together or not at all.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::db::{self, DbState};
use crate::error::{LogisticsError, Result};
use crate::models::{ActivityAction, InOut, LogisticsProvider, Order, OrderItem, OrderStatus, PaymentStatus};
use crate::orders::{self, NewActivity};

/// Products decremented to at or below this count are flagged `low_stock`.
/// Any restoration that leaves stock above zero flags `in_stock`.
pub const LOW_STOCK_THRESHOLD: i64 = 10;

const NOTES_LOG_LIMIT: usize = 100;

// ---------------------------------------------------------------------------
// Stock primitive
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum StockTarget {
    Product(i64),
    Variation(i64),
}

impl StockTarget {
    /// Variation stock when the line has one, else product stock.
    pub fn for_item(item: &OrderItem) -> Option<Self> {
        item.variation_id
            .map(StockTarget::Variation)
            .or(item.product_id.map(StockTarget::Product))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StockChange {
    pub target: StockTarget,
    pub before: i64,
    pub after: i64,
}

/// A line whose requested quantity exceeded available stock at dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StockShortage {
    pub order_number: String,
    pub item_name: String,
    pub requested: i64,
    pub available: i64,
}

impl StockShortage {
    pub fn message(&self) -> String {
        format!(
            "{}: {} (requested {}, only {} in stock)",
            self.order_number, self.item_name, self.requested, self.available
        )
    }
}

/// The one way stock counters change: `stock = MAX(0, stock + delta)` plus the
/// matching status flag, in a single statement. Returns `None` when the target
/// row no longer exists. Callers hold the surrounding transaction.
pub fn adjust_stock(conn: &Connection, target: StockTarget, delta: i64) -> Result<Option<StockChange>> {
    let before: Option<i64> = match target {
        StockTarget::Product(id) => conn
            .query_row("SELECT stock FROM products WHERE id = ?1", params![id], |row| row.get(0))
            .optional()?,
        StockTarget::Variation(id) => conn
            .query_row(
                "SELECT stock FROM product_variations WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?,
    };
    let Some(before) = before else {
        return Ok(None);
    };

    let after: i64 = match target {
        StockTarget::Product(id) => conn.query_row(
            "UPDATE products SET
                stock = MAX(0, stock + ?1),
                stock_status = CASE
                    WHEN stock + ?1 <= 0 THEN 'out_of_stock'
                    WHEN ?1 > 0 THEN 'in_stock'
                    WHEN stock + ?1 <= ?3 THEN 'low_stock'
                    ELSE 'in_stock'
                END,
                updated_at = datetime('now')
             WHERE id = ?2
             RETURNING stock",
            params![delta, id, LOW_STOCK_THRESHOLD],
            |row| row.get(0),
        )?,
        StockTarget::Variation(id) => conn.query_row(
            "UPDATE product_variations SET
                stock = MAX(0, stock + ?1),
                status = CASE
                    WHEN stock + ?1 <= 0 THEN 'out_of_stock'
                    WHEN status = 'out_of_stock' THEN 'active'
                    ELSE status
                END,
                updated_at = datetime('now')
             WHERE id = ?2
             RETURNING stock",
            params![delta, id],
            |row| row.get(0),
        )?,
    };

    debug!(?target, before, after, delta, "Stock adjusted");
    Ok(Some(StockChange { target, before, after }))
}

/// Take every line's quantity out of stock. No-op when the order already holds
/// a deduction.
pub fn deduct_stock(conn: &Connection, order: &Order) -> Result<Vec<StockShortage>> {
    if order.stock_deducted {
        return Ok(Vec::new());
    }

    let mut shortages = Vec::new();
    for item in orders::load_items(conn, order.id)? {
        let Some(target) = StockTarget::for_item(&item) else {
            continue;
        };
        match adjust_stock(conn, target, -item.quantity)? {
            Some(change) if change.before < item.quantity => {
                warn!(
                    order_id = order.id,
                    ?target,
                    requested = item.quantity,
                    available = change.before,
                    "Stock shortage on dispatch"
                );
                shortages.push(StockShortage {
                    order_number: order.order_number.clone(),
                    item_name: item.product_name.clone(),
                    requested: item.quantity,
                    available: change.before,
                });
            }
            Some(_) => {}
            None => warn!(
                order_id = order.id,
                ?target,
                "Stock target no longer exists; line skipped"
            ),
        }
    }

    conn.execute(
        "UPDATE orders SET stock_deducted = 1 WHERE id = ?1",
        params![order.id],
    )?;
    Ok(shortages)
}

/// Give a dispatch deduction back. No-op when the order holds none.
pub fn restore_stock(conn: &Connection, order: &Order) -> Result<()> {
    if !order.stock_deducted {
        return Ok(());
    }

    for item in orders::load_items(conn, order.id)? {
        if let Some(target) = StockTarget::for_item(&item) {
            if adjust_stock(conn, target, item.quantity)?.is_none() {
                warn!(order_id = order.id, ?target, "Stock target no longer exists; restore skipped");
            }
        }
    }

    conn.execute(
        "UPDATE orders SET stock_deducted = 0 WHERE id = ?1",
        params![order.id],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Order status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct TransitionContext<'a> {
    pub actor: Option<&'a str>,
    /// Replaces the default log description.
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransitionOutcome {
    pub order_id: i64,
    pub from: OrderStatus,
    pub to: OrderStatus,
    pub changed: bool,
    pub stock_deducted: bool,
    pub stock_restored: bool,
    pub delivered_stamped: bool,
    pub shortages: Vec<StockShortage>,
}

/// Apply `target` to `order` inside the caller's transaction. Same-status
/// calls change nothing and write no log entry.
pub fn apply_order_status(
    conn: &Connection,
    order: &Order,
    target: OrderStatus,
    ctx: &TransitionContext<'_>,
) -> Result<TransitionOutcome> {
    let mut outcome = TransitionOutcome {
        order_id: order.id,
        from: order.order_status,
        to: target,
        changed: false,
        stock_deducted: false,
        stock_restored: false,
        delivered_stamped: false,
        shortages: Vec::new(),
    };
    if order.order_status == target {
        return Ok(outcome);
    }

    if target == OrderStatus::Dispatched && !order.stock_deducted {
        outcome.shortages = deduct_stock(conn, order)?;
        outcome.stock_deducted = true;
    } else if !target.keeps_stock_deducted() && order.stock_deducted {
        restore_stock(conn, order)?;
        outcome.stock_restored = true;
    }

    let now = Utc::now().to_rfc3339();
    outcome.delivered_stamped = target == OrderStatus::Delivered && order.delivered_at.is_none();
    conn.execute(
        "UPDATE orders SET
            order_status = ?1,
            delivered_at = CASE WHEN ?1 = 'delivered' THEN COALESCE(delivered_at, ?2) ELSE delivered_at END,
            dispatch_date = CASE WHEN ?1 = 'dispatched' THEN COALESCE(dispatch_date, ?2) ELSE dispatch_date END,
            updated_at = ?2
         WHERE id = ?3",
        params![target.as_str(), now, order.id],
    )?;

    let description = ctx.description.clone().unwrap_or_else(|| {
        format!(
            "Order status changed from \"{}\" to \"{}\"",
            order.order_status, target
        )
    });
    orders::insert_activity(
        conn,
        &NewActivity::new(order.id, ActivityAction::StatusChanged, description)
            .field("order_status", order.order_status.as_str(), target.as_str())
            .by(ctx.actor),
    )?;

    outcome.changed = true;
    info!(
        order_id = order.id,
        from = %order.order_status,
        to = %target,
        shortages = outcome.shortages.len(),
        "Order status changed"
    );
    Ok(outcome)
}

/// Operator transition by status name. Unknown names are rejected before the
/// database is touched.
pub fn transition_order_status(
    db: &DbState,
    order_id: i64,
    target: &str,
    actor: Option<&str>,
) -> Result<TransitionOutcome> {
    let target: OrderStatus = target.parse()?;
    let conn = db.lock()?;
    db::in_transaction(&conn, |conn| {
        let order = orders::load_active_order(conn, order_id)?;
        apply_order_status(
            conn,
            &order,
            target,
            &TransitionContext {
                actor,
                description: None,
            },
        )
    })
}

// ---------------------------------------------------------------------------
// Payment status
// ---------------------------------------------------------------------------

/// Apply a payment status inside the caller's transaction, keeping the
/// partial-payment fields consistent. Returns the number of log entries
/// written.
pub fn apply_payment_status(
    conn: &Connection,
    order: &Order,
    target: PaymentStatus,
    actor: Option<&str>,
) -> Result<usize> {
    let old = order.payment_status;
    if old == target {
        return Ok(0);
    }
    let mut entries = 0;

    if target == PaymentStatus::Partial {
        let paid = order.partial_amount_paid.unwrap_or(0.0);
        let remaining = orders::round_money(order.total_amount - paid);
        conn.execute(
            "UPDATE orders SET is_partial_payment = 1, partial_amount_paid = ?1,
                remaining_amount = ?2
             WHERE id = ?3",
            params![paid, remaining, order.id],
        )?;
        orders::insert_activity(
            conn,
            &NewActivity::new(
                order.id,
                ActivityAction::PaymentChanged,
                format!("Partial payment enabled. Payment status changed from \"{old}\" to \"partial\""),
            )
            .field("partial_payment_enabled", old.as_str(), "partial")
            .by(actor),
        )?;
        entries += 1;
    } else if old == PaymentStatus::Partial {
        // amounts stay as a historical record
        conn.execute(
            "UPDATE orders SET is_partial_payment = 0 WHERE id = ?1",
            params![order.id],
        )?;
        orders::insert_activity(
            conn,
            &NewActivity::new(
                order.id,
                ActivityAction::PaymentChanged,
                format!("Partial payment cleared. Payment status changed from \"partial\" to \"{target}\""),
            )
            .field("partial_payment_cleared", "partial", target.as_str())
            .by(actor),
        )?;
        entries += 1;
    }

    conn.execute(
        "UPDATE orders SET payment_status = ?1, updated_at = ?2 WHERE id = ?3",
        params![target.as_str(), Utc::now().to_rfc3339(), order.id],
    )?;
    orders::insert_activity(
        conn,
        &NewActivity::new(
            order.id,
            ActivityAction::PaymentChanged,
            format!("Payment status changed from \"{old}\" to \"{target}\""),
        )
        .field("payment_status", old.as_str(), target.as_str())
        .by(actor),
    )?;
    entries += 1;

    info!(order_id = order.id, from = %old, to = %target, "Payment status changed");
    Ok(entries)
}

/// Set the amount received on an order in `partial` and recompute the
/// remaining balance.
pub fn record_partial_payment(
    db: &DbState,
    order_id: i64,
    amount: f64,
    actor: Option<&str>,
) -> Result<Order> {
    let conn = db.lock()?;
    db::in_transaction(&conn, |conn| {
        let order = orders::load_active_order(conn, order_id)?;
        if order.payment_status != PaymentStatus::Partial {
            return Err(LogisticsError::validation(format!(
                "order {} is not in partial payment (payment status is {})",
                order.order_number, order.payment_status
            )));
        }
        if !amount.is_finite() || amount < 0.0 || amount > order.total_amount {
            return Err(LogisticsError::validation(format!(
                "partial amount must be between 0 and {:.2} (got {amount})",
                order.total_amount
            )));
        }

        let amount = orders::round_money(amount);
        let remaining = orders::round_money(order.total_amount - amount);
        conn.execute(
            "UPDATE orders SET partial_amount_paid = ?1, remaining_amount = ?2,
                is_partial_payment = 1, updated_at = ?3
             WHERE id = ?4",
            params![amount, remaining, Utc::now().to_rfc3339(), order_id],
        )?;

        let old = format!("{:.2}", order.partial_amount_paid.unwrap_or(0.0));
        let new = format!("{amount:.2}");
        if old != new {
            orders::insert_activity(
                conn,
                &NewActivity::new(
                    order_id,
                    ActivityAction::PaymentChanged,
                    format!("Partial payment recorded: Rs. {new} paid, Rs. {remaining:.2} remaining"),
                )
                .field("partial_amount_paid", &old, &new)
                .by(actor),
            )?;
        }

        orders::load_order(conn, order_id)
    })
}

// ---------------------------------------------------------------------------
// Operator update
// ---------------------------------------------------------------------------

/// Fields an operator may change in one save. `None` leaves a field alone;
/// an empty string clears tracking number, admin notes and logistics.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OrderUpdate {
    pub order_status: Option<String>,
    pub payment_status: Option<String>,
    pub tracking_number: Option<String>,
    pub admin_notes: Option<String>,
    pub logistics: Option<String>,
    pub in_out: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateOutcome {
    pub order: Order,
    pub changed_fields: Vec<&'static str>,
    pub log_entries: usize,
    pub shortages: Vec<StockShortage>,
}

impl UpdateOutcome {
    pub fn summary(&self) -> String {
        if self.changed_fields.is_empty() {
            "No changes were made to the order.".to_string()
        } else {
            format!(
                "Order updated successfully! Changed: {}",
                self.changed_fields.join(", ")
            )
        }
    }
}

struct ParsedUpdate {
    order_status: Option<OrderStatus>,
    payment_status: Option<PaymentStatus>,
    tracking_number: Option<String>,
    admin_notes: Option<String>,
    logistics: Option<Option<LogisticsProvider>>,
    in_out: Option<InOut>,
}

impl ParsedUpdate {
    fn parse(update: &OrderUpdate) -> Result<Self> {
        Ok(Self {
            order_status: update.order_status.as_deref().map(str::parse::<OrderStatus>).transpose()?,
            payment_status: update
                .payment_status
                .as_deref()
                .map(str::parse::<PaymentStatus>)
                .transpose()?,
            tracking_number: update.tracking_number.as_deref().map(|s| s.trim().to_string()),
            admin_notes: update.admin_notes.as_deref().map(|s| s.trim().to_string()),
            logistics: update
                .logistics
                .as_deref()
                .map(str::trim)
                .map(|s| if s.is_empty() { Ok(None) } else { s.parse::<LogisticsProvider>().map(Some) })
                .transpose()?,
            in_out: update.in_out.as_deref().map(str::parse::<InOut>).transpose()?,
        })
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn logistics_label(l: Option<LogisticsProvider>) -> &'static str {
    l.map(LogisticsProvider::label).unwrap_or("None")
}

/// Set the logistics provider tag inside the caller's transaction. Returns
/// `false` (and writes nothing) when it already has that value.
pub fn apply_logistics(
    conn: &Connection,
    order: &Order,
    logistics: Option<LogisticsProvider>,
    actor: Option<&str>,
) -> Result<bool> {
    if logistics == order.logistics {
        return Ok(false);
    }
    conn.execute(
        "UPDATE orders SET logistics = ?1, updated_at = ?2 WHERE id = ?3",
        params![logistics.map(|l| l.as_str()), Utc::now().to_rfc3339(), order.id],
    )?;
    orders::insert_activity(
        conn,
        &NewActivity::new(
            order.id,
            ActivityAction::Updated,
            format!(
                "Logistics provider changed from \"{}\" to \"{}\"",
                logistics_label(order.logistics),
                logistics_label(logistics)
            ),
        )
        .field(
            "logistics",
            order.logistics.map(|l| l.as_str()).unwrap_or(""),
            logistics.map(|l| l.as_str()).unwrap_or(""),
        )
        .by(actor),
    )?;
    Ok(true)
}

/// Set the in/out flag inside the caller's transaction.
pub fn apply_in_out(conn: &Connection, order: &Order, in_out: InOut, actor: Option<&str>) -> Result<bool> {
    if in_out == order.in_out {
        return Ok(false);
    }
    conn.execute(
        "UPDATE orders SET in_out = ?1, updated_at = ?2 WHERE id = ?3",
        params![in_out.as_str(), Utc::now().to_rfc3339(), order.id],
    )?;
    orders::insert_activity(
        conn,
        &NewActivity::new(
            order.id,
            ActivityAction::Updated,
            format!(
                "IN/OUT status changed from \"{}\" to \"{}\"",
                order.in_out.as_str(),
                in_out.as_str()
            ),
        )
        .field("in_out", order.in_out.as_str(), in_out.as_str())
        .by(actor),
    )?;
    Ok(true)
}

/// Apply an operator save: one activity log entry per changed field, all in
/// one transaction. Every value is validated before anything is written.
pub fn update_order(
    db: &DbState,
    order_id: i64,
    update: &OrderUpdate,
    actor: Option<&str>,
) -> Result<UpdateOutcome> {
    let parsed = ParsedUpdate::parse(update)?;

    let conn = db.lock()?;
    db::in_transaction(&conn, |conn| {
        let order = orders::load_active_order(conn, order_id)?;
        let mut changed_fields = Vec::new();
        let mut log_entries = 0;
        let mut shortages = Vec::new();
        let now = Utc::now().to_rfc3339();

        if let Some(target) = parsed.order_status {
            let outcome = apply_order_status(
                conn,
                &order,
                target,
                &TransitionContext {
                    actor,
                    description: None,
                },
            )?;
            if outcome.changed {
                changed_fields.push("Order Status");
                log_entries += 1;
                shortages = outcome.shortages;
            }
        }

        if let Some(target) = parsed.payment_status {
            let order = orders::load_order(conn, order_id)?;
            let written = apply_payment_status(conn, &order, target, actor)?;
            if written > 0 {
                changed_fields.push("Payment Status");
                log_entries += written;
            }
        }

        if let Some(new_logistics) = parsed.logistics {
            if apply_logistics(conn, &order, new_logistics, actor)? {
                changed_fields.push("Logistics Provider");
                log_entries += 1;
            }
        }

        if let Some(new_tracking) = parsed.tracking_number.as_deref() {
            let old_tracking = order.tracking_number.as_deref().unwrap_or("");
            if new_tracking != old_tracking {
                conn.execute(
                    "UPDATE orders SET tracking_number = ?1, updated_at = ?2 WHERE id = ?3",
                    params![(!new_tracking.is_empty()).then_some(new_tracking), now, order_id],
                )?;
                let (action, description, label) = if old_tracking.is_empty() {
                    (
                        ActivityAction::TrackingAdded,
                        format!("Tracking number added: {new_tracking}"),
                        "Tracking Number Added",
                    )
                } else {
                    (
                        ActivityAction::TrackingUpdated,
                        format!("Tracking number updated from \"{old_tracking}\" to \"{new_tracking}\""),
                        "Tracking Number Updated",
                    )
                };
                orders::insert_activity(
                    conn,
                    &NewActivity::new(order_id, action, description)
                        .field("tracking_number", old_tracking, new_tracking)
                        .by(actor),
                )?;
                changed_fields.push(label);
                log_entries += 1;
            }
        }

        if let Some(new_notes) = parsed.admin_notes.as_deref() {
            let old_notes = order.admin_notes.as_deref().unwrap_or("");
            if new_notes != old_notes {
                conn.execute(
                    "UPDATE orders SET admin_notes = ?1, updated_at = ?2 WHERE id = ?3",
                    params![(!new_notes.is_empty()).then_some(new_notes), now, order_id],
                )?;
                let old_short = truncate_chars(old_notes, NOTES_LOG_LIMIT);
                let new_short = truncate_chars(new_notes, NOTES_LOG_LIMIT);
                let (action, description, label) = if old_notes.is_empty() {
                    (ActivityAction::NotesAdded, "Admin notes added", "Admin Notes Added")
                } else {
                    (ActivityAction::NotesUpdated, "Admin notes updated", "Admin Notes Updated")
                };
                orders::insert_activity(
                    conn,
                    &NewActivity::new(order_id, action, description)
                        .field("admin_notes", &old_short, &new_short)
                        .by(actor),
                )?;
                changed_fields.push(label);
                log_entries += 1;
            }
        }

        if let Some(new_in_out) = parsed.in_out {
            if apply_in_out(conn, &order, new_in_out, actor)? {
                changed_fields.push("IN/OUT");
                log_entries += 1;
            }
        }

        Ok(UpdateOutcome {
            order: orders::load_order(conn, order_id)?,
            changed_fields,
            log_entries,
            shortages,
        })
    })
}
