//! Broker postback receiver
//!
//! Dhan POSTs a JSON payload whenever an order's status changes. The payload
//! is mapped to a broker-agnostic `OrderUpdate` and handed to every registered
//! handler before the broker gets its 200, so an update is never acknowledged
//! before it was processed. A failing handler turns the reply into a 500 and
//! the broker redelivers; handlers must therefore be idempotent.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::domain::entities::order_update::OrderUpdate;
use crate::domain::entities::trade::OrderStatus;

pub const DEFAULT_POSTBACK_PATH: &str = "/webhook/dhan/order";

const RECENT_UPDATES_CAPACITY: usize = 100;

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Receives every validated postback
///
/// `Err` means the update was not applied and must be redelivered.
#[async_trait]
pub trait OrderUpdateHandler: Send + Sync {
    async fn on_order_update(&self, update: &OrderUpdate) -> Result<(), HandlerError>;
}

/// Dhan v2 order postback body
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DhanPostback {
    pub dhan_client_id: String,
    pub order_id: String,
    pub correlation_id: String,
    /// TRANSIT, PENDING, REJECTED, CANCELLED, TRADED, EXPIRED, PART_TRADED, TRIGGERED
    pub order_status: String,
    pub transaction_type: String,
    pub exchange_segment: String,
    pub product_type: String,
    pub order_type: String,
    pub validity: String,
    pub trading_symbol: String,
    pub security_id: String,
    pub quantity: u32,
    pub disclosed_quantity: u32,
    pub price: f64,
    pub trigger_price: f64,
    #[serde(rename = "filled_qty")]
    pub filled_qty: u32,
    pub average_traded_price: f64,
    pub remaining_quantity: u32,
    pub create_time: String,
    pub update_time: String,
    pub exchange_time: String,
    pub drv_expiry_date: String,
    pub drv_option_type: String,
    pub drv_strike_price: f64,
    pub oms_error_code: String,
    pub oms_error_description: String,
}

/// Dhan order status to broker-agnostic status. Unknown strings stay pending.
pub fn map_postback_status(status: &str) -> OrderStatus {
    match status {
        "TRADED" => OrderStatus::Completed,
        "CANCELLED" | "EXPIRED" => OrderStatus::Cancelled,
        "REJECTED" => OrderStatus::Rejected,
        "PENDING" | "TRANSIT" => OrderStatus::Pending,
        "PART_TRADED" | "TRIGGERED" => OrderStatus::Open,
        _ => OrderStatus::Pending,
    }
}

/// Dhan timestamps are exchange-local (IST) without an offset.
fn parse_exchange_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    let ist = FixedOffset::east_opt(5 * 3600 + 30 * 60)?;
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").ok()?;
    naive
        .and_local_timezone(ist)
        .single()
        .map(|ts| ts.with_timezone(&Utc))
}

impl DhanPostback {
    pub fn into_order_update(self, received_at: DateTime<Utc>) -> OrderUpdate {
        OrderUpdate {
            status: map_postback_status(&self.order_status),
            exchange_time: parse_exchange_time(&self.exchange_time),
            order_id: self.order_id,
            correlation_id: self.correlation_id,
            symbol: self.trading_symbol,
            side: self.transaction_type,
            quantity: self.quantity,
            filled_qty: self.filled_qty,
            pending_qty: self.remaining_quantity,
            average_price: self.average_traded_price,
            error_code: self.oms_error_code,
            error_message: self.oms_error_description,
            received_at,
        }
    }
}

#[derive(Default)]
struct PostbackInner {
    handlers: RwLock<Vec<Arc<dyn OrderUpdateHandler>>>,
    recent: Mutex<VecDeque<OrderUpdate>>,
}

/// Shared state of the postback routes
#[derive(Clone, Default)]
pub struct PostbackState {
    inner: Arc<PostbackInner>,
}

impl PostbackState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Handlers run in registration order.
    pub fn on_order_update(&self, handler: Arc<dyn OrderUpdateHandler>) {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// Up to `n` most recent updates, oldest first
    pub fn recent_updates(&self, n: usize) -> Vec<OrderUpdate> {
        let recent = self
            .inner
            .recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let skip = recent.len().saturating_sub(n);
        recent.iter().skip(skip).cloned().collect()
    }

    fn remember(&self, update: &OrderUpdate) {
        let mut recent = self
            .inner
            .recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        recent.push_back(update.clone());
        while recent.len() > RECENT_UPDATES_CAPACITY {
            recent.pop_front();
        }
    }

    fn handlers(&self) -> Vec<Arc<dyn OrderUpdateHandler>> {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
}

fn bad_request(message: &str) -> ApiError {
    api_error(StatusCode::BAD_REQUEST, message)
}

/// Postback, health and recent-update routes
///
/// Non-POST requests on `path` get 405 from the method router.
pub fn router(path: &str, state: PostbackState) -> Router {
    Router::new()
        .route(path, post(handle_postback))
        .route("/postbacks/recent", get(recent_postbacks))
        .route("/health", get(health_check))
        .with_state(state)
}

async fn handle_postback(
    State(state): State<PostbackState>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let postback: DhanPostback = serde_json::from_slice(&body).map_err(|e| {
        warn!("invalid postback payload: {}", e);
        bad_request("bad request")
    })?;

    if postback.order_id.is_empty() {
        warn!("postback missing orderId");
        return Err(bad_request("missing orderId"));
    }

    let update = postback.into_order_update(Utc::now());
    info!(
        order_id = %update.order_id,
        symbol = %update.symbol,
        status = %update.status,
        "postback: filled {}/{} @ {:.2}",
        update.filled_qty,
        update.quantity,
        update.average_price
    );

    state.remember(&update);
    let mut failed = false;
    for handler in state.handlers() {
        if let Err(e) = handler.on_order_update(&update).await {
            error!(order_id = %update.order_id, "postback not applied, asking for redelivery: {}", e);
            failed = true;
        }
    }
    if failed {
        return Err(api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "postback not applied",
        ));
    }

    Ok(Json(serde_json::json!({ "received": true })))
}

#[derive(Debug, Deserialize)]
struct RecentQuery {
    limit: Option<usize>,
}

async fn recent_postbacks(
    State(state): State<PostbackState>,
    Query(params): Query<RecentQuery>,
) -> Json<Vec<OrderUpdate>> {
    let limit = params
        .limit
        .unwrap_or(RECENT_UPDATES_CAPACITY)
        .min(RECENT_UPDATES_CAPACITY);
    Json(state.recent_updates(limit))
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use tower::ServiceExt;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<OrderUpdate>>,
    }

    #[async_trait]
    impl OrderUpdateHandler for Recorder {
        async fn on_order_update(&self, update: &OrderUpdate) -> Result<(), HandlerError> {
            self.seen.lock().unwrap().push(update.clone());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl OrderUpdateHandler for Failing {
        async fn on_order_update(&self, _update: &OrderUpdate) -> Result<(), HandlerError> {
            Err("database is locked".into())
        }
    }

    fn post_json(body: &str) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(DEFAULT_POSTBACK_PATH)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(map_postback_status("TRADED"), OrderStatus::Completed);
        assert_eq!(map_postback_status("CANCELLED"), OrderStatus::Cancelled);
        assert_eq!(map_postback_status("EXPIRED"), OrderStatus::Cancelled);
        assert_eq!(map_postback_status("REJECTED"), OrderStatus::Rejected);
        assert_eq!(map_postback_status("PENDING"), OrderStatus::Pending);
        assert_eq!(map_postback_status("TRANSIT"), OrderStatus::Pending);
        assert_eq!(map_postback_status("PART_TRADED"), OrderStatus::Open);
        assert_eq!(map_postback_status("TRIGGERED"), OrderStatus::Open);
        assert_eq!(map_postback_status("SOMETHING_NEW"), OrderStatus::Pending);
    }

    #[test]
    fn test_exchange_time_is_ist() {
        let ts = parse_exchange_time("2024-09-11 10:15:30").unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-09-11T04:45:30+00:00");
        assert!(parse_exchange_time("").is_none());
        assert!(parse_exchange_time("yesterday").is_none());
    }

    #[test]
    fn test_payload_maps_to_update() {
        let json = r#"{
            "dhanClientId": "1000000132",
            "orderId": "1124091136546",
            "correlationId": "sig-42",
            "orderStatus": "TRADED",
            "transactionType": "BUY",
            "tradingSymbol": "INFY",
            "quantity": 10,
            "filled_qty": 10,
            "averageTradedPrice": 101.5,
            "remainingQuantity": 0,
            "exchangeTime": "2024-09-11 10:15:30"
        }"#;
        let postback: DhanPostback = serde_json::from_str(json).unwrap();
        let update = postback.into_order_update(Utc::now());
        assert_eq!(update.order_id, "1124091136546");
        assert_eq!(update.correlation_id, "sig-42");
        assert_eq!(update.status, OrderStatus::Completed);
        assert_eq!(update.symbol, "INFY");
        assert_eq!(update.filled_qty, 10);
        assert_eq!(update.fill_price(), Some(101.5));
        assert!(update.exchange_time.is_some());
    }

    #[tokio::test]
    async fn test_postback_dispatches_to_handlers() {
        let state = PostbackState::new();
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        state.on_order_update(first.clone());
        state.on_order_update(second.clone());

        let app = router(DEFAULT_POSTBACK_PATH, state.clone());
        let response = app
            .oneshot(post_json(
                r#"{"orderId":"A1","orderStatus":"REJECTED","omsErrorDescription":"RMS limit"}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, serde_json::json!({"received": true}));
        assert_eq!(first.seen.lock().unwrap().len(), 1);
        assert_eq!(second.seen.lock().unwrap()[0].error_message, "RMS limit");
        assert_eq!(state.recent_updates(10)[0].status, OrderStatus::Rejected);
    }

    #[tokio::test]
    async fn test_handler_failure_asks_for_redelivery() {
        let state = PostbackState::new();
        let recorder = Arc::new(Recorder::default());
        state.on_order_update(Arc::new(Failing));
        state.on_order_update(recorder.clone());

        let response = router(DEFAULT_POSTBACK_PATH, state.clone())
            .oneshot(post_json(r#"{"orderId":"A2","orderStatus":"TRADED"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_json(response).await,
            serde_json::json!({"error": "postback not applied"})
        );
        // later handlers still see the update
        assert_eq!(recorder.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_bad_payloads() {
        let state = PostbackState::new();
        let recorder = Arc::new(Recorder::default());
        state.on_order_update(recorder.clone());

        let response = router(DEFAULT_POSTBACK_PATH, state.clone())
            .oneshot(post_json("{not json"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = router(DEFAULT_POSTBACK_PATH, state.clone())
            .oneshot(post_json(r#"{"orderStatus":"TRADED"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let get = Request::builder()
            .method(Method::GET)
            .uri(DEFAULT_POSTBACK_PATH)
            .body(Body::empty())
            .unwrap();
        let response = router(DEFAULT_POSTBACK_PATH, state.clone())
            .oneshot(get)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        assert!(recorder.seen.lock().unwrap().is_empty());
        assert!(state.recent_updates(10).is_empty());
    }

    #[tokio::test]
    async fn test_recent_buffer_is_bounded() {
        let state = PostbackState::new();
        for i in 0..120 {
            let update = OrderUpdate::new(format!("O{}", i), OrderStatus::Pending, Utc::now());
            state.remember(&update);
        }
        let recent = state.recent_updates(usize::MAX);
        assert_eq!(recent.len(), RECENT_UPDATES_CAPACITY);
        assert_eq!(recent[0].order_id, "O20");
        assert_eq!(state.recent_updates(2)[1].order_id, "O119");

        let request = Request::builder()
            .uri("/postbacks/recent?limit=3")
            .body(Body::empty())
            .unwrap();
        let response = router(DEFAULT_POSTBACK_PATH, state).oneshot(request).await.unwrap();
        let body = body_json(response).await;
        assert_eq!(body.as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_health() {
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = router(DEFAULT_POSTBACK_PATH, PostbackState::new())
            .oneshot(request)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, serde_json::json!({"status": "ok"}));
    }
}
