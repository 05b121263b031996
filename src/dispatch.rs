//! Dispatch batches: a scanned list of order numbers / barcodes processed in
//! one go.
//!
//! A batch and all its items are written in a single transaction together
//! with every order transition the scan triggers. Items are immutable after
//! creation; housekeeping only trashes, restores or purges whole batches.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::{info, warn};

use crate::db::{self, DbState};
use crate::error::{LogisticsError, Result};
use crate::models::{DispatchBatch, DispatchItem, LogisticsProvider, OrderStatus};
use crate::orders;
use crate::report::{join_samples, plural, SAMPLE_LIMIT};
use crate::state_machine::{self, StockShortage, TransitionContext};

const BATCH_COLUMNS: &str = "id, batch_number, logistics, status, total_orders, notes, created_by,
     is_deleted, deleted_by, deleted_at, created_at";

/// Split operator input on commas and newlines, trim, drop blanks.
pub fn parse_scanned_ids(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c == '\n')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Result of one batch scan.
#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub batch: DispatchBatch,
    /// Orders moved to the batch status.
    pub updated: Vec<String>,
    /// Resolved orders that were already in the batch status.
    pub already_in_status: Vec<String>,
    /// Scanned ids that matched no order.
    pub unlinked: Vec<String>,
    pub shortages: Vec<StockShortage>,
}

impl BatchOutcome {
    pub fn linked_count(&self) -> usize {
        self.updated.len() + self.already_in_status.len()
    }

    pub fn summary(&self) -> String {
        let total = self.batch.total_orders as usize;
        let verb = if self.batch.status == OrderStatus::Dispatched {
            "dispatched".to_string()
        } else {
            format!("set to {}", self.batch.status.label())
        };
        let mut out = if self.updated.len() == total {
            format!(
                "Successfully {verb} {} {}! Batch: {}",
                total,
                plural(total, "order"),
                self.batch.batch_number
            )
        } else {
            format!(
                "{}{} {}/{} orders. Batch: {}",
                verb[..1].to_uppercase(),
                &verb[1..],
                self.updated.len(),
                total,
                self.batch.batch_number
            )
        };
        if !self.unlinked.is_empty() {
            out.push_str(&format!(
                " {} order(s) not found: {}",
                self.unlinked.len(),
                join_samples(&self.unlinked, self.unlinked.len())
            ));
        }
        if !self.already_in_status.is_empty() {
            out.push_str(&format!(
                " {} already {}: {}",
                self.already_in_status.len(),
                self.batch.status,
                join_samples(&self.already_in_status, self.already_in_status.len())
            ));
        }
        out
    }

    /// Up to three shortage messages, then a count of the rest.
    pub fn stock_warnings(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .shortages
            .iter()
            .take(SAMPLE_LIMIT)
            .map(StockShortage::message)
            .collect();
        if self.shortages.len() > SAMPLE_LIMIT {
            out.push(format!(
                "...and {} more stock warnings",
                self.shortages.len() - SAMPLE_LIMIT
            ));
        }
        out
    }
}

fn batch_from_row(row: &Row<'_>) -> rusqlite::Result<DispatchBatch> {
    let parse_err = |idx: usize, e: LogisticsError| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    };
    let logistics: String = row.get(2)?;
    let status: String = row.get(3)?;
    Ok(DispatchBatch {
        id: row.get(0)?,
        batch_number: row.get(1)?,
        logistics: logistics.parse().map_err(|e| parse_err(2, e))?,
        status: status.parse().map_err(|e| parse_err(3, e))?,
        total_orders: row.get(4)?,
        notes: row.get(5)?,
        created_by: row.get(6)?,
        is_deleted: row.get(7)?,
        deleted_by: row.get(8)?,
        deleted_at: row.get(9)?,
        created_at: row.get(10)?,
    })
}

/// `DISPATCH-YYYYMMDD-HHMMSS`, suffixed `-2`, `-3`, … when taken.
pub fn next_batch_number(conn: &Connection, at: DateTime<Utc>) -> Result<String> {
    let base = format!("DISPATCH-{}", at.format("%Y%m%d-%H%M%S"));
    let mut candidate = base.clone();
    let mut suffix = 1;
    loop {
        let taken: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM dispatches WHERE batch_number = ?1)",
            params![candidate],
            |row| row.get(0),
        )?;
        if !taken {
            return Ok(candidate);
        }
        suffix += 1;
        candidate = format!("{base}-{suffix}");
    }
}

fn validate_scan(scanned_ids: &[String]) -> Result<Vec<String>> {
    let ids: Vec<String> = scanned_ids
        .iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if ids.is_empty() {
        return Err(LogisticsError::validation("Please scan at least one order ID"));
    }

    let mut seen = HashSet::new();
    let mut dupes: Vec<String> = Vec::new();
    for id in &ids {
        if !seen.insert(id.as_str()) && !dupes.contains(id) {
            dupes.push(id.clone());
        }
    }
    if !dupes.is_empty() {
        return Err(LogisticsError::validation(format!(
            "Duplicate order IDs detected: {}",
            join_samples(&dupes, dupes.len())
        )));
    }
    Ok(ids)
}

/// Create a batch from scanned ids and move every resolved order to
/// `target_status`. Empty or duplicate scans are rejected before anything is
/// written.
pub fn create_batch(
    db: &DbState,
    scanned_ids: &[String],
    target_status: &str,
    logistics: &str,
    actor: Option<&str>,
    notes: Option<&str>,
) -> Result<BatchOutcome> {
    let ids = validate_scan(scanned_ids)?;
    let target: OrderStatus = target_status.parse()?;
    let logistics: LogisticsProvider = logistics.parse()?;
    let notes = notes.map(str::trim).filter(|n| !n.is_empty());

    let conn = db.lock()?;
    let outcome = db::in_transaction(&conn, |conn| {
        let now = Utc::now();
        let stamp = now.to_rfc3339();
        let batch_number = next_batch_number(conn, now)?;

        let batch_id: i64 = conn.query_row(
            "INSERT INTO dispatches
                (batch_number, logistics, status, total_orders, notes, created_by, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
             RETURNING id",
            params![
                batch_number,
                logistics.as_str(),
                target.as_str(),
                ids.len() as i64,
                notes,
                actor,
                stamp
            ],
            |row| row.get(0),
        )?;

        let mut updated = Vec::new();
        let mut already_in_status = Vec::new();
        let mut unlinked = Vec::new();
        let mut shortages = Vec::new();

        for scanned in &ids {
            let order = orders::find_by_number_or_barcode(conn, scanned)?;
            conn.execute(
                "INSERT INTO dispatch_items (dispatch_id, scanned_order_id, order_id, scanned_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![batch_id, scanned, order.as_ref().map(|o| o.id), stamp],
            )?;

            let Some(order) = order else {
                unlinked.push(scanned.clone());
                continue;
            };
            if order.order_status == target {
                warn!(
                    batch_number = %batch_number,
                    order_number = %order.order_number,
                    "Order already {target}; skipped"
                );
                already_in_status.push(order.order_number.clone());
                continue;
            }

            let description = if target == OrderStatus::Dispatched {
                format!("Order dispatched via batch {batch_number} with {}", logistics.label())
            } else {
                format!(
                    "Order status set to \"{target}\" via batch {batch_number} with {}",
                    logistics.label()
                )
            };
            let transition = state_machine::apply_order_status(
                conn,
                &order,
                target,
                &TransitionContext {
                    actor,
                    description: Some(description),
                },
            )?;
            shortages.extend(transition.shortages);

            let order = orders::load_order(conn, order.id)?;
            state_machine::apply_logistics(conn, &order, Some(logistics), actor)?;
            conn.execute(
                "UPDATE orders SET dispatch_date = COALESCE(dispatch_date, ?1) WHERE id = ?2",
                params![stamp, order.id],
            )?;
            updated.push(order.order_number);
        }

        let batch = conn.query_row(
            &format!("SELECT {BATCH_COLUMNS} FROM dispatches WHERE id = ?1"),
            params![batch_id],
            batch_from_row,
        )?;
        Ok(BatchOutcome {
            batch,
            updated,
            already_in_status,
            unlinked,
            shortages,
        })
    })?;

    info!(
        batch_number = %outcome.batch.batch_number,
        total = outcome.batch.total_orders,
        updated = outcome.updated.len(),
        unlinked = outcome.unlinked.len(),
        shortages = outcome.shortages.len(),
        "Dispatch batch created"
    );
    Ok(outcome)
}

// ---------------------------------------------------------------------------
// Housekeeping
// ---------------------------------------------------------------------------

/// Active batches, newest first, optionally filtered by provider.
pub fn list_batches(db: &DbState, logistics: Option<&str>) -> Result<Vec<DispatchBatch>> {
    query_batches(db, false, logistics)
}

pub fn list_trashed_batches(db: &DbState, logistics: Option<&str>) -> Result<Vec<DispatchBatch>> {
    query_batches(db, true, logistics)
}

fn query_batches(db: &DbState, trashed: bool, logistics: Option<&str>) -> Result<Vec<DispatchBatch>> {
    let filter = logistics
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::parse::<LogisticsProvider>)
        .transpose()?;

    let conn = db.lock()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {BATCH_COLUMNS} FROM dispatches
         WHERE is_deleted = ?1 AND (?2 IS NULL OR logistics = ?2)
         ORDER BY created_at DESC, id DESC"
    ))?;
    let batches = stmt
        .query_map(params![trashed, filter.map(|l| l.as_str())], batch_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(batches)
}

/// A batch with its items; linked items carry the current order number.
pub fn get_batch(db: &DbState, batch_id: i64) -> Result<(DispatchBatch, Vec<DispatchItem>)> {
    let conn = db.lock()?;
    let batch = load_batch(&conn, batch_id)?;
    let mut stmt = conn.prepare(
        "SELECT di.id, di.dispatch_id, di.scanned_order_id, di.order_id, o.order_number, di.scanned_at
         FROM dispatch_items di
         LEFT JOIN orders o ON o.id = di.order_id
         WHERE di.dispatch_id = ?1
         ORDER BY di.id",
    )?;
    let items = stmt
        .query_map(params![batch_id], |row| {
            Ok(DispatchItem {
                id: row.get(0)?,
                dispatch_id: row.get(1)?,
                scanned_order_id: row.get(2)?,
                order_id: row.get(3)?,
                order_number: row.get(4)?,
                scanned_at: row.get(5)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok((batch, items))
}

fn load_batch(conn: &Connection, batch_id: i64) -> Result<DispatchBatch> {
    conn.query_row(
        &format!("SELECT {BATCH_COLUMNS} FROM dispatches WHERE id = ?1"),
        params![batch_id],
        batch_from_row,
    )
    .optional()?
    .ok_or_else(|| LogisticsError::not_found(format!("dispatch batch {batch_id}")))
}

pub fn move_batch_to_trash(db: &DbState, batch_id: i64, actor: Option<&str>) -> Result<DispatchBatch> {
    let conn = db.lock()?;
    db::in_transaction(&conn, |conn| {
        let batch = load_batch(conn, batch_id)?;
        if batch.is_deleted {
            return Err(LogisticsError::validation(format!(
                "batch {} is already in the trash",
                batch.batch_number
            )));
        }
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE dispatches SET is_deleted = 1, deleted_by = ?1, deleted_at = ?2, updated_at = ?2
             WHERE id = ?3",
            params![actor, now, batch_id],
        )?;
        info!(batch_number = %batch.batch_number, "Dispatch batch moved to trash");
        load_batch(conn, batch_id)
    })
}

pub fn restore_batch(db: &DbState, batch_id: i64) -> Result<DispatchBatch> {
    let conn = db.lock()?;
    db::in_transaction(&conn, |conn| {
        let batch = load_batch(conn, batch_id)?;
        if !batch.is_deleted {
            return Err(LogisticsError::validation(format!(
                "batch {} is not in the trash",
                batch.batch_number
            )));
        }
        conn.execute(
            "UPDATE dispatches SET is_deleted = 0, deleted_by = NULL, deleted_at = NULL, updated_at = ?1
             WHERE id = ?2",
            params![Utc::now().to_rfc3339(), batch_id],
        )?;
        info!(batch_number = %batch.batch_number, "Dispatch batch restored");
        load_batch(conn, batch_id)
    })
}

/// Permanently delete a trashed batch and its items. Orders are untouched.
pub fn purge_batch(db: &DbState, batch_id: i64) -> Result<String> {
    let conn = db.lock()?;
    db::in_transaction(&conn, |conn| {
        let batch = load_batch(conn, batch_id)?;
        if !batch.is_deleted {
            return Err(LogisticsError::validation(format!(
                "batch {} must be moved to the trash before it can be deleted",
                batch.batch_number
            )));
        }
        conn.execute("DELETE FROM dispatch_items WHERE dispatch_id = ?1", params![batch_id])?;
        conn.execute("DELETE FROM dispatches WHERE id = ?1", params![batch_id])?;
        warn!(batch_number = %batch.batch_number, "Dispatch batch permanently deleted");
        Ok(batch.batch_number)
    })
}
