//! Order ↔ courier reconciliation.
//!
//! [`LogisticsSyncEngine`] owns the outbound flows (send one, send many,
//! manual sync, bulk sync, comments) and webhook ingestion. Every channel
//! that learns a courier status funnels through [`apply_courier_status`]:
//!
//! - the raw `courier_status` mirror is last-write-wins on arrival;
//! - the derived `order_status` only moves forward along the fulfillment
//!   rank, except that `cancelled`/`returned` are accepted from any
//!   non-terminal status; terminal orders are never moved by the courier;
//! - manual syncs always write one `courier_status` log entry, bulk sync and
//!   webhooks only when the raw string changed, so redelivery is a no-op.
//!
//! Courier calls never run with the database lock held: each flow reads what
//! it needs, releases the lock, calls the courier, then reopens a short
//! transaction and reloads the order before writing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{DEFAULT_DELIVERY_TYPE, DEFAULT_FROM_BRANCH};
use crate::courier::{self, Branch, CourierApi, ShipmentRequest};
use crate::db::{self, DbState};
use crate::error::{LogisticsError, Result};
use crate::models::{ActivityAction, LogisticsProvider, Order, OrderItem, OrderStatus, PaymentStatus};
use crate::orders::{self, NewActivity};
use crate::report::BulkReport;
use crate::state_machine::{self, StockShortage, TransitionContext};
use crate::status_map::{is_known_courier_status, map_courier_status};

/// `courier_status` written right after a shipment is created.
pub const CREATED_COURIER_STATUS: &str = "Order Created";

/// A send claim older than this is considered abandoned.
const SEND_CLAIM_TTL_SECS: i64 = 300;

const BULK_STATUS_CHUNK: usize = 100;

const PACKAGE_ITEM_LIMIT: usize = 3;

const COMMENT_LOG_LIMIT: usize = 100;

// ---------------------------------------------------------------------------
// Courier status application
// ---------------------------------------------------------------------------

/// Which channel reported a courier status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSource<'a> {
    Manual,
    Bulk,
    /// Carries the webhook `event` name.
    Webhook(&'a str),
}

impl SyncSource<'_> {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncSource::Manual => "manual",
            SyncSource::Bulk => "bulk",
            SyncSource::Webhook(_) => "webhook",
        }
    }

    fn always_logs(&self) -> bool {
        matches!(self, SyncSource::Manual)
    }

    fn describe(&self, old: &str, new: &str) -> String {
        match self {
            SyncSource::Manual => format!(
                "Manual sync: {} → {new}",
                if old.is_empty() { "None" } else { old }
            ),
            SyncSource::Bulk => format!("Bulk sync: {new}"),
            SyncSource::Webhook(event) => format!("Webhook: {event} - {new}"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CourierStatusOutcome {
    pub order_id: i64,
    pub order_number: String,
    pub old_courier_status: Option<String>,
    pub courier_status: String,
    pub mapped_status: OrderStatus,
    pub order_status: OrderStatus,
    pub status_changed: bool,
    pub logged: bool,
    pub shortages: Vec<StockShortage>,
}

/// Order status a courier-derived status moves `current` to, if any.
pub fn courier_target(current: OrderStatus, mapped: OrderStatus) -> Option<OrderStatus> {
    if current.is_terminal() || current == mapped {
        return None;
    }
    match (mapped.rank(), current.rank()) {
        (None, _) => Some(mapped),
        (Some(to), Some(from)) if to > from => Some(mapped),
        _ => None,
    }
}

/// Record a raw courier status on `order` inside the caller's transaction.
/// `order` must have been loaded in that same transaction.
pub fn apply_courier_status(
    conn: &Connection,
    order: &Order,
    raw_status: &str,
    source: SyncSource<'_>,
    actor: Option<&str>,
) -> Result<CourierStatusOutcome> {
    let raw = raw_status.trim();
    if raw.is_empty() {
        return Err(LogisticsError::validation("courier status is empty"));
    }
    if !is_known_courier_status(raw) {
        warn!(order_id = order.id, courier_status = raw, "Unrecognized courier status");
    }

    let old_raw = order.courier_status.clone().unwrap_or_default();
    let raw_changed = old_raw != raw;
    let mapped = map_courier_status(raw);
    let now = Utc::now().to_rfc3339();

    conn.execute(
        "UPDATE orders SET
            courier_status = ?1,
            courier_last_synced_at = ?2,
            updated_at = CASE WHEN ?3 THEN ?2 ELSE updated_at END
         WHERE id = ?4",
        params![raw, now, raw_changed, order.id],
    )?;

    let logged = raw_changed || source.always_logs();
    if logged {
        orders::insert_activity(
            conn,
            &NewActivity::new(
                order.id,
                ActivityAction::StatusChanged,
                source.describe(&old_raw, raw),
            )
            .field("courier_status", &old_raw, raw)
            .by(actor),
        )?;
    }

    let mut outcome = CourierStatusOutcome {
        order_id: order.id,
        order_number: order.order_number.clone(),
        old_courier_status: order.courier_status.clone(),
        courier_status: raw.to_string(),
        mapped_status: mapped,
        order_status: order.order_status,
        status_changed: false,
        logged,
        shortages: Vec::new(),
    };

    match courier_target(order.order_status, mapped) {
        Some(target) => {
            let transition = state_machine::apply_order_status(
                conn,
                order,
                target,
                &TransitionContext {
                    actor,
                    description: Some(format!(
                        "Order status changed from \"{}\" to \"{}\" (NCM: {raw})",
                        order.order_status, target
                    )),
                },
            )?;
            outcome.order_status = target;
            outcome.status_changed = transition.changed;
            outcome.shortages = transition.shortages;
        }
        None if mapped != order.order_status => debug!(
            order_id = order.id,
            current = %order.order_status,
            mapped = %mapped,
            "Courier status does not advance the order; order status kept"
        ),
        None => {}
    }

    info!(
        order_id = order.id,
        source = source.as_str(),
        courier_status = raw,
        order_status = %outcome.order_status,
        changed = outcome.status_changed,
        "Courier status applied"
    );
    Ok(outcome)
}

// ---------------------------------------------------------------------------
// Options and outcomes
// ---------------------------------------------------------------------------

/// Per-send overrides. Unset fields fall back to the order and engine defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SendOptions {
    pub actor: Option<String>,
    pub destination_branch: Option<String>,
    pub from_branch: Option<String>,
    pub delivery_type: Option<String>,
    pub instruction: Option<String>,
    pub weight: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SendManyOptions {
    #[serde(flatten)]
    pub send: SendOptions,
    /// Tag every selected order with the NCM provider before sending.
    pub auto_set_logistics: bool,
    #[serde(skip)]
    pub deadline: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SendOutcome {
    Sent {
        order_number: String,
        shipment_id: String,
    },
    /// The order already had a shipment.
    Skipped {
        order_number: String,
        shipment_id: String,
    },
}

/// Inbound courier push. Field types are loose because the courier sends
/// ids as numbers or strings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookEvent {
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub order_id: Option<Value>,
    #[serde(default)]
    pub order_ids: Option<Vec<Value>>,
    #[serde(default)]
    pub test: Option<Value>,
}

impl WebhookEvent {
    pub fn is_test(&self) -> bool {
        match &self.test {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
            _ => false,
        }
    }

    /// `order_id` wins over `order_ids`.
    pub fn shipment_ids(&self) -> Vec<String> {
        match (&self.order_id, &self.order_ids) {
            (Some(id), _) if !id.is_null() => courier::id_to_string(id).into_iter().collect(),
            (_, Some(ids)) => ids.iter().filter_map(courier::id_to_string).collect(),
            _ => Vec::new(),
        }
    }

    pub fn is_single(&self) -> bool {
        self.order_id.as_ref().is_some_and(|v| !v.is_null())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct WebhookUpdate {
    pub order_number: String,
    pub ncm_order_id: String,
    pub new_status: String,
    pub changed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookReport {
    pub event: String,
    pub status: String,
    pub single: bool,
    pub updated_orders: Vec<WebhookUpdate>,
    pub not_found_orders: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Test,
    Processed(WebhookReport),
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct LogisticsSyncEngine {
    db: Arc<DbState>,
    courier: Arc<dyn CourierApi>,
    default_from_branch: String,
    default_delivery_type: String,
}

impl LogisticsSyncEngine {
    pub fn new(db: Arc<DbState>, courier: Arc<dyn CourierApi>) -> Self {
        Self {
            db,
            courier,
            default_from_branch: DEFAULT_FROM_BRANCH.to_string(),
            default_delivery_type: DEFAULT_DELIVERY_TYPE.to_string(),
        }
    }

    pub fn with_defaults(mut self, from_branch: &str, delivery_type: &str) -> Self {
        self.default_from_branch = from_branch.trim().to_uppercase();
        self.default_delivery_type = delivery_type.trim().to_string();
        self
    }

    pub fn db(&self) -> &Arc<DbState> {
        &self.db
    }

    pub fn courier(&self) -> &Arc<dyn CourierApi> {
        &self.courier
    }

    // -- send -------------------------------------------------------------

    /// Create the courier shipment for one order. Already-linked orders are
    /// reported as skipped without calling the courier.
    pub async fn send_order(&self, order_id: i64, opts: &SendOptions) -> Result<SendOutcome> {
        let branches = self.fetch_branches_for_validation().await;
        self.send_with_branches(order_id, opts, branches.as_deref())
            .await
    }

    /// Send each order independently; one failure never stops the rest.
    pub async fn send_many(&self, order_ids: &[i64], opts: &SendManyOptions) -> Result<BulkReport> {
        let started = Instant::now();
        let actor = opts.send.actor.as_deref();
        let mut report = BulkReport::default();

        if opts.auto_set_logistics {
            self.tag_ncm_logistics(order_ids, actor)?;
        }

        let branches = self.fetch_branches_for_validation().await;
        for &order_id in order_ids {
            let reference = self.order_reference(order_id);
            if opts.deadline.is_some_and(|d| started.elapsed() >= d) {
                report.record_skip(&reference, "deadline exceeded");
                continue;
            }
            match self
                .send_with_branches(order_id, &opts.send, branches.as_deref())
                .await
            {
                Ok(SendOutcome::Sent { .. }) => report.record_success(),
                Ok(SendOutcome::Skipped { shipment_id, .. }) => {
                    report.record_skip(&reference, &format!("already sent (NCM ID {shipment_id})"))
                }
                Err(e) => {
                    warn!(order_id, error = %e, "Bulk send item failed");
                    report.record_error(&reference, &e);
                }
            }
        }

        info!(
            success = report.success,
            skipped = report.skipped,
            errors = report.errors,
            "Bulk send finished"
        );
        Ok(report)
    }

    async fn fetch_branches_for_validation(&self) -> Option<Vec<Branch>> {
        match self.courier.list_branches().await {
            Ok(branches) if !branches.is_empty() => Some(branches),
            Ok(_) => {
                warn!("Courier returned no branches; destination branch not validated");
                None
            }
            Err(e) => {
                warn!(error = %e, "Could not fetch courier branches; destination branch not validated");
                None
            }
        }
    }

    async fn send_with_branches(
        &self,
        order_id: i64,
        opts: &SendOptions,
        branches: Option<&[Branch]>,
    ) -> Result<SendOutcome> {
        let claim = Uuid::new_v4().to_string();
        let request = {
            let conn = self.db.lock()?;
            let order = orders::load_active_order(&conn, order_id)?;
            if let Some(shipment_id) = order.courier_order_id.clone() {
                debug!(order_id, %shipment_id, "Order already linked; send skipped");
                return Ok(SendOutcome::Skipped {
                    order_number: order.order_number,
                    shipment_id,
                });
            }
            let items = orders::load_items(&conn, order_id)?;
            let request = self.build_request(&order, &items, opts)?;
            if let Some(branches) = branches {
                if !branches.iter().any(|b| b.matches(&request.to_branch)) {
                    return Err(LogisticsError::validation(format!(
                        "Invalid destination branch: {}",
                        request.to_branch
                    )));
                }
            }
            if !claim_send(&conn, order_id, &claim)? {
                let current = orders::load_order(&conn, order_id)?;
                return match current.courier_order_id {
                    Some(shipment_id) => Ok(SendOutcome::Skipped {
                        order_number: current.order_number,
                        shipment_id,
                    }),
                    None => Err(LogisticsError::ConcurrencyConflict(format!(
                        "order {} is already being sent to the courier",
                        current.order_number
                    ))),
                };
            }
            request
        };

        let shipment_id = match self.courier.create_shipment(&request).await {
            Ok(id) => id,
            Err(e) => {
                warn!(order_id, error = %e, "Courier rejected shipment");
                self.release_claim(order_id, &claim);
                return Err(e);
            }
        };

        let actor = opts.actor.as_deref();
        let linked = {
            let conn = self.db.lock()?;
            db::in_transaction(&conn, |conn| {
                link_shipment(conn, order_id, &claim, &shipment_id, &request, actor)
            })
        };
        match linked {
            Ok(order_number) => {
                info!(order_id, %shipment_id, "Order linked to courier shipment");
                Ok(SendOutcome::Sent {
                    order_number,
                    shipment_id,
                })
            }
            Err(e) => {
                error!(
                    order_id,
                    %shipment_id,
                    error = %e,
                    "Courier shipment created but could not be linked; reconcile manually"
                );
                self.release_claim(order_id, &claim);
                Err(e)
            }
        }
    }

    fn build_request(
        &self,
        order: &Order,
        items: &[OrderItem],
        opts: &SendOptions,
    ) -> Result<ShipmentRequest> {
        if order.customer_name.trim().chars().count() < 2 {
            return Err(LogisticsError::validation(
                "Customer name must be at least 2 characters",
            ));
        }
        let to_branch = non_empty(opts.destination_branch.as_deref())
            .or_else(|| non_empty(order.branch_city.as_deref()))
            .ok_or_else(|| LogisticsError::validation("Missing required field: branch"))?;
        let from_branch = non_empty(opts.from_branch.as_deref())
            .unwrap_or(&self.default_from_branch);
        let delivery_type = non_empty(opts.delivery_type.as_deref())
            .unwrap_or(&self.default_delivery_type);
        let instruction = non_empty(opts.instruction.as_deref())
            .or_else(|| non_empty(Some(order.notes.as_str())))
            .map(str::to_string);

        ShipmentRequest {
            order_ref: order.order_number.clone(),
            customer_name: order.customer_name.clone(),
            phone: order.customer_phone.clone(),
            phone2: order.alternate_phone.clone(),
            address: order.shipping_address.clone(),
            from_branch: from_branch.to_string(),
            to_branch: to_branch.to_string(),
            cod_amount: cod_amount(order),
            package_description: package_description(items),
            instruction,
            delivery_type: delivery_type.to_string(),
            weight: opts.weight.or(order.package_weight).unwrap_or(1.0),
        }
        .validated()
    }

    fn release_claim(&self, order_id: i64, claim: &str) {
        let released = self.db.lock().and_then(|conn| {
            conn.execute(
                "UPDATE orders SET courier_send_claim = NULL, courier_send_claimed_at = NULL
                 WHERE id = ?1 AND courier_send_claim = ?2",
                params![order_id, claim],
            )
            .map_err(LogisticsError::from)
        });
        if let Err(e) = released {
            warn!(order_id, error = %e, "Failed to release courier send claim");
        }
    }

    fn tag_ncm_logistics(&self, order_ids: &[i64], actor: Option<&str>) -> Result<()> {
        let conn = self.db.lock()?;
        db::in_transaction(&conn, |conn| {
            for &order_id in order_ids {
                let Ok(order) = orders::load_active_order(conn, order_id) else {
                    continue;
                };
                state_machine::apply_logistics(conn, &order, Some(LogisticsProvider::Ncm), actor)?;
            }
            Ok(())
        })
    }

    fn order_reference(&self, order_id: i64) -> String {
        self.db
            .lock()
            .and_then(|conn| orders::load_order(&conn, order_id))
            .map(|o| o.order_number)
            .unwrap_or_else(|_| format!("#{order_id}"))
    }

    // -- sync -------------------------------------------------------------

    /// Pull the latest status for one linked order. Always writes one
    /// `courier_status` log entry.
    pub async fn sync_one(&self, order_id: i64, actor: Option<&str>) -> Result<CourierStatusOutcome> {
        let shipment_id = {
            let conn = self.db.lock()?;
            let order = orders::load_active_order(&conn, order_id)?;
            order
                .courier_order_id
                .ok_or(LogisticsError::NotLinked(order.order_number))?
        };

        let history = self.courier.get_status_history(&shipment_id).await?;
        let latest = history.first().ok_or_else(|| {
            LogisticsError::courier(
                format!("No status history returned for shipment {shipment_id}"),
                None,
            )
        })?;

        let conn = self.db.lock()?;
        db::in_transaction(&conn, |conn| {
            let order = orders::load_active_order(conn, order_id)?;
            apply_courier_status(conn, &order, &latest.status, SyncSource::Manual, actor)
        })
    }

    /// Pull statuses for many orders with one courier request per chunk.
    /// `None` syncs every linked, active, non-terminal order. Orders the
    /// courier does not report are left unchanged.
    pub async fn sync_bulk(
        &self,
        order_ids: Option<&[i64]>,
        deadline: Option<Duration>,
        actor: Option<&str>,
    ) -> Result<BulkReport> {
        let started = Instant::now();
        let mut report = BulkReport::default();

        let candidates: Vec<(i64, String, String)> = {
            let conn = self.db.lock()?;
            let ids = match order_ids {
                Some(ids) => ids.to_vec(),
                None => orders::list_syncable_order_ids(&conn)?,
            };
            let mut out = Vec::with_capacity(ids.len());
            for id in ids {
                match orders::load_active_order(&conn, id) {
                    Ok(order) if order.order_status.is_terminal() => {
                        report.record_skip(&order.order_number, "already in a final status")
                    }
                    Ok(order) => match order.courier_order_id {
                        Some(shipment_id) => out.push((id, order.order_number, shipment_id)),
                        None => report.record_skip(&order.order_number, "not linked to NCM"),
                    },
                    Err(e) => report.record_error(&format!("#{id}"), &e),
                }
            }
            out
        };

        for chunk in candidates.chunks(BULK_STATUS_CHUNK) {
            if deadline.is_some_and(|d| started.elapsed() >= d) {
                for (_, number, _) in chunk {
                    report.record_skip(number, "deadline exceeded");
                }
                continue;
            }

            let shipment_ids: Vec<String> = chunk.iter().map(|(_, _, s)| s.clone()).collect();
            let statuses: HashMap<String, String> =
                match self.courier.get_bulk_statuses(&shipment_ids).await {
                    Ok(map) => map,
                    Err(e) => {
                        warn!(orders = chunk.len(), error = %e, "Bulk status request failed");
                        for (_, number, _) in chunk {
                            report.record_error(number, &e);
                        }
                        continue;
                    }
                };

            let conn = self.db.lock()?;
            for (order_id, number, shipment_id) in chunk {
                let Some(raw) = statuses.get(shipment_id) else {
                    debug!(order_id, %shipment_id, "No status returned for shipment");
                    report.record_skip(number, "no status returned by NCM");
                    continue;
                };
                let applied = db::in_transaction(&conn, |conn| {
                    let order = orders::load_active_order(conn, *order_id)?;
                    if order.order_status.is_terminal() {
                        return Ok(None);
                    }
                    apply_courier_status(conn, &order, raw, SyncSource::Bulk, actor).map(Some)
                });
                match applied {
                    Ok(Some(_)) => report.record_success(),
                    Ok(None) => report.record_skip(number, "already in a final status"),
                    Err(e) => report.record_error(number, &e),
                }
            }
        }

        info!(
            synced = report.success,
            skipped = report.skipped,
            errors = report.errors,
            "Bulk sync finished"
        );
        Ok(report)
    }

    // -- webhook ----------------------------------------------------------

    /// Apply a courier push. Orders are looked up by shipment id only;
    /// unknown ids are reported, not raised.
    pub fn ingest_webhook(&self, event: &WebhookEvent) -> Result<WebhookOutcome> {
        if event.is_test() {
            info!("Test webhook received");
            return Ok(WebhookOutcome::Test);
        }

        let shipment_ids = event.shipment_ids();
        if shipment_ids.is_empty() {
            return Err(LogisticsError::validation("No order IDs"));
        }
        let status = event
            .status
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| LogisticsError::validation("No status"))?;
        let event_name = event.event.as_deref().unwrap_or("status_update");

        let mut report = WebhookReport {
            event: event_name.to_string(),
            status: status.to_string(),
            single: event.is_single(),
            updated_orders: Vec::new(),
            not_found_orders: Vec::new(),
        };

        let conn = self.db.lock()?;
        for shipment_id in shipment_ids {
            let applied = db::in_transaction(&conn, |conn| {
                match orders::find_by_courier_id(conn, &shipment_id)? {
                    Some(order) => apply_courier_status(
                        conn,
                        &order,
                        status,
                        SyncSource::Webhook(event_name),
                        None,
                    )
                    .map(Some),
                    None => Ok(None),
                }
            })?;
            match applied {
                Some(outcome) => report.updated_orders.push(WebhookUpdate {
                    order_number: outcome.order_number,
                    ncm_order_id: shipment_id,
                    new_status: outcome.order_status.as_str().to_string(),
                    changed: outcome.logged || outcome.status_changed,
                }),
                None => {
                    warn!(%shipment_id, "Webhook references unknown shipment");
                    report.not_found_orders.push(shipment_id);
                }
            }
        }

        info!(
            event = event_name,
            status,
            updated = report.updated_orders.len(),
            not_found = report.not_found_orders.len(),
            "Webhook processed"
        );
        Ok(WebhookOutcome::Processed(report))
    }

    // -- extras -----------------------------------------------------------

    /// Forward an operator comment to the courier and log it.
    pub async fn add_comment(&self, order_id: i64, text: &str, actor: Option<&str>) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Err(LogisticsError::validation("comment text is empty"));
        }
        let shipment_id = self.linked_shipment(order_id)?;
        self.courier.add_comment(&shipment_id, text).await?;

        let logged: String = text.chars().take(COMMENT_LOG_LIMIT).collect();
        let conn = self.db.lock()?;
        db::in_transaction(&conn, |conn| {
            orders::insert_activity(
                conn,
                &NewActivity::new(
                    order_id,
                    ActivityAction::Updated,
                    format!("Comment sent to NCM: {logged}"),
                )
                .field("courier_comment", "", &logged)
                .by(actor),
            )
            .map(|_| ())
        })
    }

    /// Ask the courier to return a shipment to the vendor.
    pub async fn request_return(
        &self,
        order_id: i64,
        comment: Option<&str>,
        actor: Option<&str>,
    ) -> Result<()> {
        let shipment_id = self.linked_shipment(order_id)?;
        self.courier.return_order(&shipment_id, comment).await?;

        let conn = self.db.lock()?;
        db::in_transaction(&conn, |conn| {
            orders::insert_activity(
                conn,
                &NewActivity::new(
                    order_id,
                    ActivityAction::Updated,
                    format!("Return requested in NCM for ID: {shipment_id}"),
                )
                .field("ncm_return", "", comment.unwrap_or(""))
                .by(actor),
            )
            .map(|_| ())
        })
    }

    pub async fn list_branches(&self) -> Result<Vec<Branch>> {
        self.courier.list_branches().await
    }

    fn linked_shipment(&self, order_id: i64) -> Result<String> {
        let conn = self.db.lock()?;
        let order = orders::load_active_order(&conn, order_id)?;
        order
            .courier_order_id
            .ok_or(LogisticsError::NotLinked(order.order_number))
    }
}

// ---------------------------------------------------------------------------
// Storage steps
// ---------------------------------------------------------------------------

/// Compare-and-set on the send claim. `false` when the order is linked,
/// trashed, or claimed by a send that is still fresh.
fn claim_send(conn: &Connection, order_id: i64, claim: &str) -> Result<bool> {
    let now = Utc::now();
    let stale_before = (now - chrono::Duration::seconds(SEND_CLAIM_TTL_SECS)).to_rfc3339();
    let rows = conn.execute(
        "UPDATE orders SET courier_send_claim = ?1, courier_send_claimed_at = ?2
         WHERE id = ?3
           AND courier_order_id IS NULL
           AND is_deleted = 0
           AND (courier_send_claim IS NULL OR courier_send_claimed_at < ?4)",
        params![claim, now.to_rfc3339(), order_id, stale_before],
    )?;
    Ok(rows == 1)
}

/// Persist a new shipment id. Conditional on the claim still being ours and
/// the order still unlinked. Returns the order number.
fn link_shipment(
    conn: &Connection,
    order_id: i64,
    claim: &str,
    shipment_id: &str,
    request: &ShipmentRequest,
    actor: Option<&str>,
) -> Result<String> {
    let order = orders::load_order(conn, order_id)?;
    let now = Utc::now().to_rfc3339();
    let rows = conn.execute(
        "UPDATE orders SET
            courier_order_id = ?1,
            courier_status = ?2,
            courier_created_at = ?3,
            courier_last_synced_at = ?3,
            courier_from_branch = ?4,
            courier_destination_branch = ?5,
            courier_send_claim = NULL,
            courier_send_claimed_at = NULL,
            updated_at = ?3
         WHERE id = ?6 AND courier_order_id IS NULL AND courier_send_claim = ?7",
        params![
            shipment_id,
            CREATED_COURIER_STATUS,
            now,
            request.from_branch,
            request.to_branch,
            order_id,
            claim
        ],
    )?;
    if rows == 0 {
        return Err(LogisticsError::ConcurrencyConflict(format!(
            "order {} was linked or lost its send claim while shipment {shipment_id} was being created",
            order.order_number
        )));
    }

    orders::insert_activity(
        conn,
        &NewActivity::new(
            order_id,
            ActivityAction::Updated,
            format!("Order created in NCM with ID: {shipment_id}"),
        )
        .field("ncm_integration", "", shipment_id)
        .by(actor),
    )?;
    state_machine::apply_logistics(conn, &order, Some(LogisticsProvider::Ncm), actor)?;
    Ok(order.order_number)
}

// ---------------------------------------------------------------------------
// Request helpers
// ---------------------------------------------------------------------------

/// First three item names, then `and N more`; `Products` for an empty order.
pub fn package_description(items: &[OrderItem]) -> String {
    let names: Vec<&str> = items
        .iter()
        .map(|i| i.product_name.trim())
        .filter(|n| !n.is_empty())
        .collect();
    if names.is_empty() {
        return "Products".to_string();
    }
    let mut out = names[..names.len().min(PACKAGE_ITEM_LIMIT)].join(", ");
    if names.len() > PACKAGE_ITEM_LIMIT {
        out.push_str(&format!(" and {} more", names.len() - PACKAGE_ITEM_LIMIT));
    }
    out
}

/// Amount the courier collects: nothing once paid, the balance on a partial
/// payment, otherwise the order total.
pub fn cod_amount(order: &Order) -> f64 {
    match order.payment_status {
        PaymentStatus::Paid | PaymentStatus::Refunded => 0.0,
        PaymentStatus::Partial => order
            .remaining_amount
            .unwrap_or(order.total_amount)
            .max(0.0),
        PaymentStatus::Pending | PaymentStatus::Failed => order.total_amount,
    }
}

fn non_empty(v: Option<&str>) -> Option<&str> {
    v.map(str::trim).filter(|s| !s.is_empty())
}
