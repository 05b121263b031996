//! NCM courier REST client.
//!
//! Every call returns `Result<_, LogisticsError>`: courier rejections,
//! non-2xx responses, timeouts and unparseable bodies all come back as
//! [`LogisticsError::CourierApi`] carrying the raw body when there was one.
//! Nothing here retries; a retried create could ship the same order twice,
//! so retry policy belongs to the caller.
//!
//! Courier payloads are normalized into the fixed structs below right after
//! deserialization (`code`/`Code` casing, numeric or string order ids).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{CourierConfig, MAX_COURIER_TIMEOUT_SECS};
use crate::error::{LogisticsError, Result};

/// `Message` value NCM returns when a shipment was created.
pub const CREATE_SUCCESS_MESSAGE: &str = "Order Successfully Created";

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// Everything needed to book one shipment.
#[derive(Debug, Clone, Serialize)]
pub struct ShipmentRequest {
    /// Our order number, sent as `vref_id`.
    pub order_ref: String,
    pub customer_name: String,
    pub phone: String,
    pub phone2: Option<String>,
    pub address: String,
    pub from_branch: String,
    pub to_branch: String,
    pub cod_amount: f64,
    pub package_description: String,
    pub instruction: Option<String>,
    pub delivery_type: String,
    pub weight: f64,
}

impl ShipmentRequest {
    /// Check required fields and normalize phone numbers to digits. Fails
    /// without any network I/O.
    pub fn validated(mut self) -> Result<Self> {
        let required = [
            ("name", &self.customer_name),
            ("phone", &self.phone),
            ("address", &self.address),
            ("fbranch", &self.from_branch),
            ("branch", &self.to_branch),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(LogisticsError::validation(format!(
                    "Missing required field: {field}"
                )));
            }
        }
        if !self.cod_amount.is_finite() || self.cod_amount < 0.0 {
            return Err(LogisticsError::validation(format!(
                "Missing required field: cod_charge (got {})",
                self.cod_amount
            )));
        }

        let phone = normalize_phone(&self.phone);
        if phone.is_empty() {
            return Err(LogisticsError::InvalidPhone(self.phone));
        }
        self.phone = phone;
        self.phone2 = self
            .phone2
            .as_deref()
            .map(normalize_phone)
            .filter(|p| !p.is_empty());
        self.customer_name = self.customer_name.trim().to_string();
        self.address = self.address.trim().to_string();
        self.from_branch = self.from_branch.trim().to_uppercase();
        self.to_branch = self.to_branch.trim().to_uppercase();
        if self.weight <= 0.0 || !self.weight.is_finite() {
            self.weight = 1.0;
        }
        Ok(self)
    }
}

/// Digits only.
pub fn normalize_phone(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_digit).collect()
}

#[derive(Debug, Serialize)]
struct CreateOrderPayload<'a> {
    name: &'a str,
    phone: &'a str,
    phone2: &'a str,
    cod_charge: String,
    address: &'a str,
    fbranch: &'a str,
    branch: &'a str,
    package: &'a str,
    vref_id: &'a str,
    instruction: &'a str,
    delivery_type: &'a str,
    weight: String,
}

impl<'a> From<&'a ShipmentRequest> for CreateOrderPayload<'a> {
    fn from(req: &'a ShipmentRequest) -> Self {
        Self {
            name: &req.customer_name,
            phone: &req.phone,
            phone2: req.phone2.as_deref().unwrap_or(""),
            cod_charge: format!("{:.2}", req.cod_amount),
            address: &req.address,
            fbranch: &req.from_branch,
            branch: &req.to_branch,
            package: &req.package_description,
            vref_id: &req.order_ref,
            instruction: req.instruction.as_deref().unwrap_or(""),
            delivery_type: &req.delivery_type,
            weight: format!("{}", req.weight),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreateOrderResponse {
    #[serde(rename = "Message", alias = "message")]
    message: Option<String>,
    orderid: Option<Value>,
}

/// One entry of a shipment's status history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub status: String,
    #[serde(default, alias = "added_time", alias = "timestamp")]
    pub added_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Branch {
    pub code: String,
    pub name: String,
}

impl Branch {
    /// Accepts `code`/`Code` and `name`/`Name`; codes are uppercased and a
    /// missing name falls back to the code.
    fn from_value(v: &Value) -> Option<Self> {
        let field = |keys: &[&str]| {
            keys.iter()
                .find_map(|k| v.get(*k).and_then(Value::as_str))
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };
        let code = field(&["code", "Code"])?.to_uppercase();
        let name = field(&["name", "Name"]).unwrap_or_else(|| code.clone());
        Some(Self { code, name })
    }

    /// Case-insensitive match on code or name.
    pub fn matches(&self, candidate: &str) -> bool {
        let candidate = candidate.trim();
        self.code.eq_ignore_ascii_case(candidate) || self.name.eq_ignore_ascii_case(candidate)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShippingRate {
    pub from_branch: String,
    pub to_branch: String,
    pub delivery_type: String,
    pub charge: f64,
}

/// Order ids and numbers come back as either JSON numbers or strings.
pub(crate) fn id_to_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Numeric ids go out as numbers, anything else as strings.
fn id_to_value(id: &str) -> Value {
    id.parse::<i64>()
        .map(Value::from)
        .unwrap_or_else(|_| Value::String(id.to_string()))
}

// ---------------------------------------------------------------------------
// Courier seam
// ---------------------------------------------------------------------------

/// The courier operations the sync engine depends on. Implemented by
/// [`CourierClient`] and by in-process fakes in tests.
#[async_trait]
pub trait CourierApi: Send + Sync {
    /// Book a shipment; returns the courier's order id.
    async fn create_shipment(&self, request: &ShipmentRequest) -> Result<String>;

    /// Status history, newest first.
    async fn get_status_history(&self, shipment_id: &str) -> Result<Vec<StatusEntry>>;

    /// Latest raw status per shipment id. Ids the courier does not report are
    /// absent from the map.
    async fn get_bulk_statuses(&self, shipment_ids: &[String]) -> Result<HashMap<String, String>>;

    async fn list_branches(&self) -> Result<Vec<Branch>>;

    async fn add_comment(&self, shipment_id: &str, text: &str) -> Result<()>;

    async fn get_order_details(&self, _shipment_id: &str) -> Result<Value> {
        Err(LogisticsError::courier("order details are not supported", None))
    }

    async fn get_shipping_rate(
        &self,
        _from_branch: &str,
        _to_branch: &str,
        _delivery_type: &str,
    ) -> Result<ShippingRate> {
        Err(LogisticsError::courier("shipping rates are not supported", None))
    }

    async fn return_order(&self, _shipment_id: &str, _comment: Option<&str>) -> Result<()> {
        Err(LogisticsError::courier("returns are not supported", None))
    }

    async fn register_webhook(&self, _url: &str) -> Result<String> {
        Err(LogisticsError::courier("webhook registration is not supported", None))
    }

    async fn test_webhook(&self, _url: &str) -> Result<String> {
        Err(LogisticsError::courier("webhook testing is not supported", None))
    }
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

pub struct CourierClient {
    http: Client,
    base_url: String,
    base_url_v2: String,
    api_key: String,
}

impl CourierClient {
    pub fn new(config: &CourierConfig) -> Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(LogisticsError::Config("courier API key is empty".into()));
        }
        let timeout = config
            .timeout
            .min(Duration::from_secs(MAX_COURIER_TIMEOUT_SECS));
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LogisticsError::Config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            base_url_v2: config.base_url_v2.trim_end_matches('/').to_string(),
            api_key: config.api_key.trim().to_string(),
        })
    }

    fn v1(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn v2(&self, path: &str) -> String {
        format!("{}{path}", self.base_url_v2)
    }

    /// Send with auth, map transport and HTTP failures, parse JSON.
    async fn send_json<T: DeserializeOwned>(&self, req: RequestBuilder, url: &str) -> Result<T> {
        let resp = req
            .header("Authorization", format!("Token {}", self.api_key))
            .send()
            .await
            .map_err(|e| transport_error(url, &e))?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            warn!(url, status = status.as_u16(), "Courier API returned an error");
            return Err(LogisticsError::courier(
                error_message(status, &body),
                (!body.trim().is_empty()).then(|| body.trim().to_string()),
            ));
        }

        serde_json::from_str(&body).map_err(|e| {
            LogisticsError::courier(
                format!("Malformed courier response: {e}"),
                (!body.trim().is_empty()).then(|| body.trim().to_string()),
            )
        })
    }
}

fn transport_error(url: &str, err: &reqwest::Error) -> LogisticsError {
    let message = if err.is_timeout() {
        "Request timeout".to_string()
    } else if err.is_connect() {
        format!("Cannot reach courier API at {url}")
    } else if err.is_builder() {
        format!("Invalid courier API URL: {url}")
    } else {
        format!("Network error communicating with courier: {err}")
    };
    LogisticsError::courier(message, None)
}

/// Best-effort human message from an error body (`Error`, `error`,
/// `message`, `detail`), else a status description.
fn error_message(status: StatusCode, body: &str) -> String {
    let from_body = serde_json::from_str::<Value>(body).ok().and_then(|json| {
        ["Error", "error", "message", "Message", "detail"]
            .iter()
            .find_map(|k| json.get(*k))
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
    });
    match (from_body, status.as_u16()) {
        (Some(msg), code) => format!("{msg} (HTTP {code})"),
        (None, 401) => "Courier API token is invalid (HTTP 401)".to_string(),
        (None, 404) => "Courier API endpoint not found (HTTP 404)".to_string(),
        (None, code) if code >= 500 => format!("Courier server error (HTTP {code})"),
        (None, code) => format!("Unexpected courier response (HTTP {code})"),
    }
}

#[async_trait]
impl CourierApi for CourierClient {
    async fn create_shipment(&self, request: &ShipmentRequest) -> Result<String> {
        let request = request.clone().validated()?;
        let url = self.v1("/order/create");
        let payload = CreateOrderPayload::from(&request);

        info!(
            order_ref = %request.order_ref,
            fbranch = %request.from_branch,
            branch = %request.to_branch,
            "Creating courier shipment"
        );
        let resp: CreateOrderResponse = self
            .send_json(self.http.post(&url).json(&payload), &url)
            .await?;

        let message = resp.message.unwrap_or_default();
        if message != CREATE_SUCCESS_MESSAGE {
            return Err(LogisticsError::courier(
                if message.is_empty() {
                    "Courier did not confirm the shipment".to_string()
                } else {
                    message.clone()
                },
                Some(message),
            ));
        }
        let id = resp
            .orderid
            .as_ref()
            .and_then(id_to_string)
            .ok_or_else(|| LogisticsError::courier("Courier response is missing orderid", None))?;
        info!(order_ref = %request.order_ref, shipment_id = %id, "Courier shipment created");
        Ok(id)
    }

    async fn get_status_history(&self, shipment_id: &str) -> Result<Vec<StatusEntry>> {
        let url = self.v1("/order/status");
        let entries: Vec<StatusEntry> = self
            .send_json(self.http.get(&url).query(&[("id", shipment_id)]), &url)
            .await?;
        debug!(shipment_id, entries = entries.len(), "Fetched status history");
        Ok(entries)
    }

    async fn get_bulk_statuses(&self, shipment_ids: &[String]) -> Result<HashMap<String, String>> {
        #[derive(Deserialize)]
        struct BulkResponse {
            #[serde(default)]
            result: HashMap<String, Value>,
        }

        if shipment_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let url = self.v1("/orders/statuses");
        let body = serde_json::json!({
            "orders": shipment_ids.iter().map(|id| id_to_value(id)).collect::<Vec<_>>(),
        });
        let resp: BulkResponse = self.send_json(self.http.post(&url).json(&body), &url).await?;

        Ok(resp
            .result
            .into_iter()
            .filter_map(|(id, status)| match status {
                Value::String(s) => Some((id, s)),
                _ => None,
            })
            .collect())
    }

    async fn list_branches(&self) -> Result<Vec<Branch>> {
        let url = self.v2("/branches");
        let raw: Value = self.send_json(self.http.get(&url), &url).await?;
        let list = match &raw {
            Value::Array(items) => items.as_slice(),
            Value::Object(map) => map
                .get("data")
                .or_else(|| map.get("branches"))
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default(),
            _ => &[],
        };
        Ok(list.iter().filter_map(Branch::from_value).collect())
    }

    async fn add_comment(&self, shipment_id: &str, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Err(LogisticsError::validation("comment text is empty"));
        }
        let url = self.v1("/comment");
        let body = serde_json::json!({ "orderid": id_to_value(shipment_id), "comments": text });
        let _: Value = self.send_json(self.http.post(&url).json(&body), &url).await?;
        Ok(())
    }

    async fn get_order_details(&self, shipment_id: &str) -> Result<Value> {
        let url = self.v1("/order");
        self.send_json(self.http.get(&url).query(&[("id", shipment_id)]), &url)
            .await
    }

    async fn get_shipping_rate(
        &self,
        from_branch: &str,
        to_branch: &str,
        delivery_type: &str,
    ) -> Result<ShippingRate> {
        let url = self.v1("/shipping-rate");
        let raw: Value = self
            .send_json(
                self.http.get(&url).query(&[
                    ("creation", from_branch),
                    ("destination", to_branch),
                    ("type", delivery_type),
                ]),
                &url,
            )
            .await?;
        let charge = match raw.get("charge") {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        }
        .ok_or_else(|| {
            LogisticsError::courier("Shipping rate response is missing charge", Some(raw.to_string()))
        })?;
        Ok(ShippingRate {
            from_branch: from_branch.to_uppercase(),
            to_branch: to_branch.to_uppercase(),
            delivery_type: delivery_type.to_string(),
            charge,
        })
    }

    async fn return_order(&self, shipment_id: &str, comment: Option<&str>) -> Result<()> {
        let url = self.v2("/vendor/order/return");
        let mut body = serde_json::json!({ "pk": id_to_value(shipment_id) });
        if let Some(comment) = comment.map(str::trim).filter(|c| !c.is_empty()) {
            body["comment"] = Value::String(comment.to_string());
        }
        let _: Value = self.send_json(self.http.post(&url).json(&body), &url).await?;
        info!(shipment_id, "Courier return requested");
        Ok(())
    }

    async fn register_webhook(&self, url: &str) -> Result<String> {
        let endpoint = self.v2("/vendor/webhook");
        let resp: Value = self
            .send_json(
                self.http
                    .post(&endpoint)
                    .json(&serde_json::json!({ "webhook_url": url })),
                &endpoint,
            )
            .await?;
        Ok(response_message(&resp, "Webhook registered"))
    }

    async fn test_webhook(&self, url: &str) -> Result<String> {
        let endpoint = self.v2("/vendor/webhook/test");
        let resp: Value = self
            .send_json(
                self.http
                    .post(&endpoint)
                    .json(&serde_json::json!({ "webhook_url": url })),
                &endpoint,
            )
            .await?;
        Ok(response_message(&resp, "Webhook test sent"))
    }
}

fn response_message(resp: &Value, fallback: &str) -> String {
    ["message", "Message", "detail"]
        .iter()
        .find_map(|k| resp.get(*k).and_then(Value::as_str))
        .unwrap_or(fallback)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Query, State};
    use axum::http::HeaderMap;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeCourier {
        calls: AtomicUsize,
        last_create: Mutex<Option<Value>>,
    }

    fn authorized(headers: &HeaderMap) -> bool {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(|v| v == "Token test-key")
            .unwrap_or(false)
    }

    async fn create(
        State(fake): State<Arc<FakeCourier>>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        fake.calls.fetch_add(1, Ordering::SeqCst);
        if !authorized(&headers) {
            return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({"detail": "Invalid token."})));
        }
        let reply = match body["vref_id"].as_str() {
            Some("ORD-REJECT") => serde_json::json!({"Message": "Branch not serviceable"}),
            Some("ORD-BOOM") => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({"Error": {"branch": ["Invalid branch"]}})),
                )
            }
            _ => serde_json::json!({"Message": CREATE_SUCCESS_MESSAGE, "orderid": 99}),
        };
        *fake.last_create.lock().unwrap() = Some(body);
        (StatusCode::OK, Json(reply))
    }

    async fn status(
        State(fake): State<Arc<FakeCourier>>,
        Query(q): Query<HashMap<String, String>>,
    ) -> Json<Value> {
        fake.calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(q.get("id").map(String::as_str), Some("99"));
        Json(serde_json::json!([
            {"orderid": 99, "status": "Pickup Complete", "added_time": "2026-10-02T10:00:00"},
            {"orderid": 99, "status": "Pickup Order Created", "added_time": "2026-10-01T09:00:00"},
        ]))
    }

    async fn bulk(Json(body): Json<Value>) -> Json<Value> {
        assert_eq!(body["orders"], serde_json::json!([99, 100]));
        Json(serde_json::json!({"result": {"99": "Delivered", "100": "In Transit"}, "errors": [101]}))
    }

    async fn branches() -> Json<Value> {
        Json(serde_json::json!([
            {"code": "tinkune", "name": "TINKUNE"},
            {"Code": "POK", "Name": "POKHARA"},
            {"Code": "BRT"},
            {"district": "no code"},
        ]))
    }

    async fn comment(Json(body): Json<Value>) -> Json<Value> {
        assert_eq!(body["orderid"], serde_json::json!(99));
        Json(serde_json::json!({"message": "Comment added"}))
    }

    async fn shipping_rate(Query(q): Query<HashMap<String, String>>) -> Json<Value> {
        assert_eq!(q.get("creation").map(String::as_str), Some("TINKUNE"));
        assert_eq!(q.get("type").map(String::as_str), Some("Pickup"));
        Json(serde_json::json!({"charge": "150.00"}))
    }

    async fn return_order(Json(body): Json<Value>) -> Json<Value> {
        assert_eq!(body["pk"], serde_json::json!(99));
        assert_eq!(body["comment"], "Damaged in transit");
        Json(serde_json::json!({"message": "Return initiated"}))
    }

    async fn webhook(Json(body): Json<Value>) -> Json<Value> {
        assert_eq!(body["webhook_url"], "https://shop.example/webhook/ncm");
        Json(serde_json::json!({"message": "Webhook URL updated"}))
    }

    async fn slow() -> Json<Value> {
        tokio::time::sleep(Duration::from_secs(3)).await;
        Json(serde_json::json!([]))
    }

    async fn spawn_fake() -> (String, Arc<FakeCourier>) {
        let fake = Arc::new(FakeCourier::default());
        let app = Router::new()
            .route("/api/v1/order/create", post(create))
            .route("/api/v1/order/status", get(status))
            .route("/api/v1/orders/statuses", post(bulk))
            .route("/api/v1/comment", post(comment))
            .route("/api/v2/branches", get(branches))
            .route("/api/v1/shipping-rate", get(shipping_rate))
            .route("/api/v2/vendor/order/return", post(return_order))
            .route("/api/v2/vendor/webhook", post(webhook))
            .route("/api/v2/vendor/webhook/test", post(|| async { Json(serde_json::json!({})) }))
            .route("/slow/v1/order/status", get(slow))
            .with_state(fake.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), fake)
    }

    fn client(base: &str) -> CourierClient {
        CourierClient::new(&CourierConfig::new(&format!("{base}/api/v1"), "test-key")).unwrap()
    }

    fn request(order_ref: &str) -> ShipmentRequest {
        ShipmentRequest {
            order_ref: order_ref.into(),
            customer_name: "Sita Sharma".into(),
            phone: "+977 (980) 123-4567".into(),
            phone2: Some("n/a".into()),
            address: "Lakeside, Pokhara".into(),
            from_branch: "tinkune".into(),
            to_branch: "pokhara".into(),
            cod_amount: 1500.0,
            package_description: "Kurta, Shawl".into(),
            instruction: None,
            delivery_type: "Door2Door".into(),
            weight: 1.0,
        }
    }

    #[test]
    fn phone_normalization_keeps_digits_only() {
        assert_eq!(normalize_phone("+977-980 123 4567"), "9779801234567");
        assert_eq!(normalize_phone("call me"), "");
    }

    #[test]
    fn branch_casing_is_normalized() {
        let b = Branch::from_value(&serde_json::json!({"Code": "pok", "Name": "Pokhara"})).unwrap();
        assert_eq!(b, Branch { code: "POK".into(), name: "Pokhara".into() });
        assert!(b.matches("pokhara"));
        assert!(b.matches(" POK "));
        assert!(Branch::from_value(&serde_json::json!({"name": "nameless"})).is_none());
    }

    #[tokio::test]
    async fn create_sends_normalized_payload_and_returns_id() {
        let (base, fake) = spawn_fake().await;
        let id = client(&base).create_shipment(&request("ORD000001")).await.unwrap();
        assert_eq!(id, "99");

        let sent = fake.last_create.lock().unwrap().clone().unwrap();
        assert_eq!(sent["phone"], "9779801234567");
        assert_eq!(sent["phone2"], "");
        assert_eq!(sent["fbranch"], "TINKUNE");
        assert_eq!(sent["branch"], "POKHARA");
        assert_eq!(sent["cod_charge"], "1500.00");
        assert_eq!(sent["vref_id"], "ORD000001");
    }

    #[tokio::test]
    async fn validation_failures_make_no_network_call() {
        let (base, fake) = spawn_fake().await;
        let client = client(&base);

        let mut no_name = request("ORD000001");
        no_name.customer_name = "  ".into();
        assert!(matches!(
            client.create_shipment(&no_name).await,
            Err(LogisticsError::Validation(_))
        ));

        let mut bad_phone = request("ORD000001");
        bad_phone.phone = "no phone".into();
        assert!(matches!(
            client.create_shipment(&bad_phone).await,
            Err(LogisticsError::InvalidPhone(_))
        ));

        assert_eq!(fake.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn non_sentinel_message_is_a_failure() {
        let (base, _fake) = spawn_fake().await;
        let err = client(&base).create_shipment(&request("ORD-REJECT")).await.unwrap_err();
        match err {
            LogisticsError::CourierApi { message, .. } => {
                assert_eq!(message, "Branch not serviceable")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn http_error_carries_raw_body() {
        let (base, _fake) = spawn_fake().await;
        let err = client(&base).create_shipment(&request("ORD-BOOM")).await.unwrap_err();
        match err {
            LogisticsError::CourierApi { message, body } => {
                assert!(message.contains("HTTP 400"));
                assert!(body.unwrap().contains("Invalid branch"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn wrong_token_is_reported() {
        let (base, _fake) = spawn_fake().await;
        let client =
            CourierClient::new(&CourierConfig::new(&format!("{base}/api/v1"), "other")).unwrap();
        let err = client.create_shipment(&request("ORD000001")).await.unwrap_err();
        assert!(err.display_message().contains("Invalid token"));
    }

    #[tokio::test]
    async fn status_history_is_newest_first() {
        let (base, _fake) = spawn_fake().await;
        let history = client(&base).get_status_history("99").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, "Pickup Complete");
        assert_eq!(history[0].added_time.as_deref(), Some("2026-10-02T10:00:00"));
    }

    #[tokio::test]
    async fn bulk_statuses_skip_unreported_ids() {
        let (base, _fake) = spawn_fake().await;
        let statuses = client(&base)
            .get_bulk_statuses(&["99".to_string(), "100".to_string()])
            .await
            .unwrap();
        assert_eq!(statuses.get("99").map(String::as_str), Some("Delivered"));
        assert_eq!(statuses.get("100").map(String::as_str), Some("In Transit"));
        assert!(!statuses.contains_key("101"));
    }

    #[tokio::test]
    async fn branches_accept_either_casing() {
        let (base, _fake) = spawn_fake().await;
        let branches = client(&base).list_branches().await.unwrap();
        assert_eq!(
            branches,
            vec![
                Branch { code: "TINKUNE".into(), name: "TINKUNE".into() },
                Branch { code: "POK".into(), name: "POKHARA".into() },
                Branch { code: "BRT".into(), name: "BRT".into() },
            ]
        );
    }

    #[tokio::test]
    async fn comment_is_acknowledged() {
        let (base, _fake) = spawn_fake().await;
        client(&base).add_comment("99", "Customer asked for evening delivery").await.unwrap();
    }

    #[tokio::test]
    async fn timeout_surfaces_as_courier_error() {
        let (base, _fake) = spawn_fake().await;
        let mut config = CourierConfig::new(&format!("{base}/slow/v1"), "test-key");
        config.timeout = Duration::from_millis(200);
        let err = CourierClient::new(&config)
            .unwrap()
            .get_status_history("99")
            .await
            .unwrap_err();
        assert_eq!(err.display_message(), "Courier API error: Request timeout");
    }

    #[tokio::test]
    async fn shipping_rate_parses_string_charge() {
        let (base, _fake) = spawn_fake().await;
        let rate = client(&base)
            .get_shipping_rate("TINKUNE", "pokhara", "Pickup")
            .await
            .unwrap();
        assert_eq!(rate.to_branch, "POKHARA");
        assert_eq!(rate.charge, 150.0);
    }

    #[tokio::test]
    async fn return_and_webhook_registration_use_v2() {
        let (base, _fake) = spawn_fake().await;
        let client = client(&base);
        client.return_order("99", Some(" Damaged in transit ")).await.unwrap();

        let url = "https://shop.example/webhook/ncm";
        assert_eq!(client.register_webhook(url).await.unwrap(), "Webhook URL updated");
        assert_eq!(client.test_webhook(url).await.unwrap(), "Webhook test sent");
    }

    #[tokio::test]
    async fn unknown_endpoint_is_a_courier_error() {
        let (base, _fake) = spawn_fake().await;
        let err = client(&base).get_order_details("99").await.unwrap_err();
        assert_eq!(err.kind(), "courier_api_error");
        assert!(err.to_string().contains("HTTP 404"));
    }
}
