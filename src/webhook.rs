//! HTTP surface: `POST /webhook/ncm` for courier pushes, `GET /health`.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::error::LogisticsError;
use crate::logistics::{LogisticsSyncEngine, WebhookEvent, WebhookOutcome};

pub const WEBHOOK_PATH: &str = "/webhook/ncm";

pub fn router(engine: Arc<LogisticsSyncEngine>) -> Router {
    Router::new()
        .route(WEBHOOK_PATH, post(ncm_webhook))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

fn error_response(status: StatusCode, msg: &str) -> (StatusCode, Json<Value>) {
    (status, Json(json!({ "success": false, "message": msg })))
}

fn status_for(err: &LogisticsError) -> StatusCode {
    match err {
        LogisticsError::Validation(_) | LogisticsError::InvalidPhone(_) => StatusCode::BAD_REQUEST,
        LogisticsError::NotFound(_) => StatusCode::NOT_FOUND,
        LogisticsError::ConcurrencyConflict(_) | LogisticsError::NotLinked(_) => StatusCode::CONFLICT,
        LogisticsError::CourierApi { .. }
        | LogisticsError::Database(_)
        | LogisticsError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn ncm_webhook(
    State(engine): State<Arc<LogisticsSyncEngine>>,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let event: WebhookEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "Webhook body is not valid JSON");
            return error_response(StatusCode::BAD_REQUEST, "Invalid JSON");
        }
    };

    // ingestion is synchronous SQLite work
    let result = tokio::task::spawn_blocking(move || engine.ingest_webhook(&event)).await;

    match result {
        Ok(Ok(WebhookOutcome::Test)) => (
            StatusCode::OK,
            Json(json!({ "status": "success", "message": "Test webhook received" })),
        ),
        Ok(Ok(WebhookOutcome::Processed(report))) => {
            if report.single && report.updated_orders.is_empty() {
                return (
                    StatusCode::NOT_FOUND,
                    Json(json!({
                        "success": false,
                        "message": "Order not found",
                        "not_found_orders": report.not_found_orders,
                    })),
                );
            }
            (
                StatusCode::OK,
                Json(json!({
                    "success": true,
                    "message": "Webhook processed",
                    "event": report.event,
                    "status": report.status,
                    "updated_count": report.updated_orders.len(),
                    "updated_orders": report.updated_orders,
                    "not_found_count": report.not_found_orders.len(),
                    "not_found_orders": report.not_found_orders,
                })),
            )
        }
        Ok(Err(e)) => {
            let status = status_for(&e);
            if status.is_server_error() {
                error!(error = %e, "Webhook processing failed");
            } else {
                warn!(error = %e, "Webhook rejected");
            }
            let message = match &e {
                LogisticsError::Validation(msg) => msg.clone(),
                other => other.display_message(),
            };
            error_response(status, &message)
        }
        Err(e) => {
            error!(error = %e, "Webhook task panicked");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
        }
    }
}
