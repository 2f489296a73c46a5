//! HTTP command surface: subscribe, unsubscribe and list, plus the
//! operational endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use tracing::error;
use watch_core::{format_units, SubscriptionRecord, NATIVE_DECIMALS, NATIVE_SYMBOL};
use watch_engine::{
    CycleReport, LoopState, SubscribeOutcome, UnsubscribeOutcome, WatchError,
};

use crate::app::Components;

pub fn router(components: Components) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/readyz", get(ready))
        .route("/status", get(status))
        .route("/metrics", get(metrics_handler))
        .route("/v1/subscriptions", post(subscribe))
        .route(
            "/v1/subscriptions/:subscriber/:address",
            delete(unsubscribe),
        )
        .route(
            "/v1/subscribers/:subscriber/subscriptions",
            get(list_subscriptions),
        )
        .with_state(components)
}

#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    pub subscriber_id: String,
    pub address: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscriptionView {
    pub subscriber_id: String,
    pub address: String,
    /// Smallest units, as a decimal string so JSON clients keep precision.
    pub balance_wei: String,
    pub balance_display: String,
    pub created_at_ms: u64,
}

impl From<&SubscriptionRecord> for SubscriptionView {
    fn from(record: &SubscriptionRecord) -> Self {
        Self {
            subscriber_id: record.subscriber_id.to_string(),
            address: record.address.to_string(),
            balance_wei: record.last_known_balance.to_string(),
            balance_display: format!(
                "{} {NATIVE_SYMBOL}",
                format_units(record.last_known_balance, NATIVE_DECIMALS, 4)
            ),
            created_at_ms: record.created_at_ms,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubscribeResponse {
    pub status: String,
    pub subscription: SubscriptionView,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListResponse {
    pub subscriptions: Vec<SubscriptionView>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusBody {
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

/// Wraps [`WatchError`] for HTTP mapping.
pub struct ApiError(WatchError);

impl From<WatchError> for ApiError {
    fn from(err: WatchError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            WatchError::InvalidAddress(_) => (StatusCode::BAD_REQUEST, "invalid_address"),
            WatchError::InvalidSubscriber(_) => (StatusCode::BAD_REQUEST, "invalid_subscriber"),
            WatchError::LimitReached { .. } => (StatusCode::CONFLICT, "limit_reached"),
            WatchError::UpstreamUnavailable(_) => (StatusCode::BAD_GATEWAY, "upstream_unavailable"),
            WatchError::StorageFailure(_) => {
                error!(error = %self.0, "storage failure while serving request");
                (StatusCode::SERVICE_UNAVAILABLE, "storage_failure")
            }
            WatchError::StorageDegraded => (StatusCode::SERVICE_UNAVAILABLE, "storage_degraded"),
        };
        let body = ErrorBody {
            error: code.to_string(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

async fn subscribe(
    State(c): State<Components>,
    Json(req): Json<SubscribeRequest>,
) -> Result<Response, ApiError> {
    let outcome = c.registry.subscribe(&req.subscriber_id, &req.address).await?;
    let (status, label) = match &outcome {
        SubscribeOutcome::Created(_) => (StatusCode::CREATED, "created"),
        SubscribeOutcome::AlreadyWatching(_) => (StatusCode::OK, "already_watching"),
    };
    let body = SubscribeResponse {
        status: label.to_string(),
        subscription: SubscriptionView::from(outcome.record()),
    };
    Ok((status, Json(body)).into_response())
}

async fn unsubscribe(
    State(c): State<Components>,
    Path((subscriber, address)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let response = match c.registry.unsubscribe(&subscriber, &address).await? {
        UnsubscribeOutcome::Removed => (
            StatusCode::OK,
            Json(StatusBody {
                status: "removed".to_string(),
            }),
        )
            .into_response(),
        UnsubscribeOutcome::NotWatching => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: "not_watching".to_string(),
                message: "You are not watching this address.".to_string(),
            }),
        )
            .into_response(),
    };
    Ok(response)
}

async fn list_subscriptions(
    State(c): State<Components>,
    Path(subscriber): Path<String>,
) -> Result<Json<ListResponse>, ApiError> {
    let records = c.registry.list_for(&subscriber)?;
    Ok(Json(ListResponse {
        subscriptions: records.iter().map(SubscriptionView::from).collect(),
    }))
}

#[derive(Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ReportView {
    pub total: u64,
    pub checked: u64,
    pub changed: u64,
    pub unchanged: u64,
    pub fetch_failed: u64,
    pub vanished: u64,
    pub superseded: u64,
    pub expired: u64,
    pub notify_failed: u64,
    pub storage_failed: u64,
    pub started_at_ms: u64,
    pub duration_ms: u64,
}

impl From<&CycleReport> for ReportView {
    fn from(r: &CycleReport) -> Self {
        Self {
            total: r.total,
            checked: r.checked,
            changed: r.changed,
            unchanged: r.unchanged,
            fetch_failed: r.fetch_failed,
            vanished: r.vanished,
            superseded: r.superseded,
            expired: r.expired,
            notify_failed: r.notify_failed,
            storage_failed: r.storage_failed,
            started_at_ms: r.started_at_ms,
            duration_ms: r.duration_ms,
        }
    }
}

async fn health() -> impl IntoResponse {
    "ok"
}

async fn ready(State(c): State<Components>) -> impl IntoResponse {
    if c.health.is_degraded() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    match c.store.schema_version() {
        Ok(Some(_)) => StatusCode::OK,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    }
}

#[derive(Serialize)]
struct StatusResponse {
    service: ServiceInfo,
    uptime_ms: u64,
    subscriptions: usize,
    accepting_subscriptions: bool,
    loop_state: &'static str,
    last_cycle: Option<ReportView>,
}

#[derive(Serialize)]
struct ServiceInfo {
    name: &'static str,
    version: &'static str,
}

async fn status(State(c): State<Components>) -> impl IntoResponse {
    let uptime_ms = u64::try_from(c.started.elapsed().as_millis()).unwrap_or(u64::MAX);
    let loop_state = match c.reconciler.state() {
        LoopState::Idle => "idle",
        LoopState::Polling => "polling",
    };
    Json(StatusResponse {
        service: ServiceInfo {
            name: "watch-node",
            version: env!("CARGO_PKG_VERSION"),
        },
        uptime_ms,
        subscriptions: c.store.len(),
        accepting_subscriptions: c.registry.is_accepting(),
        loop_state,
        last_cycle: c.reconciler.last_report().as_ref().map(ReportView::from),
    })
}

async fn metrics_handler(State(c): State<Components>) -> Response {
    let encoder = TextEncoder::new();
    let metric_families = c.metrics.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "failed encoding metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}
