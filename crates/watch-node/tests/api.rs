use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use tower::ServiceExt;
use watch_core::Address;
use watch_engine::mock::{RecordingSink, StaticBalanceSource};
use watch_engine::TickOutcome;
use watch_node::api::{self, ListResponse, ReportView, SubscribeResponse};
use watch_node::app::Components;
use watch_node::config::AppConfig;
use watch_storage::SubscriptionStore;

const ADDR: &str = "0xB91986a9854be250aC681f6737836945D7afF6Fa";
const ADDR_LOWER: &str = "0xb91986a9854be250ac681f6737836945d7aff6fa";

struct TestNode {
    app: Router,
    source: Arc<StaticBalanceSource>,
    sink: Arc<RecordingSink>,
    components: Components,
}

fn node() -> TestNode {
    let cfg = AppConfig::from_toml_str("").expect("default config");
    let source = Arc::new(StaticBalanceSource::new());
    let sink = Arc::new(RecordingSink::new());
    let components = Components::assemble(
        &cfg,
        SubscriptionStore::open_temporary().expect("store"),
        source.clone(),
        sink.clone(),
    )
    .expect("assemble");
    TestNode {
        app: api::router(components.clone()),
        source,
        sink,
        components,
    }
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<&str>) -> (StatusCode, Vec<u8>) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, bytes.to_vec())
}

fn subscribe_body(subscriber: &str, address: &str) -> String {
    format!(r#"{{"subscriber_id":"{subscriber}","address":"{address}"}}"#)
}

#[tokio::test]
async fn subscribe_list_unsubscribe_flow() {
    let n = node();
    n.source
        .set(&Address::parse(ADDR).unwrap(), 5_000_000_000_000_000_000);

    let (status, body) = send(
        &n.app,
        Method::POST,
        "/v1/subscriptions",
        Some(&subscribe_body("42", ADDR)),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let created: SubscribeResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(created.status, "created");
    assert_eq!(created.subscription.address, ADDR_LOWER);
    assert_eq!(created.subscription.balance_wei, "5000000000000000000");
    assert_eq!(created.subscription.balance_display, "5.0000 BNB");

    let (status, body) = send(
        &n.app,
        Method::POST,
        "/v1/subscriptions",
        Some(&subscribe_body("42", ADDR_LOWER)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let again: SubscribeResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(again.status, "already_watching");

    let (status, body) = send(&n.app, Method::GET, "/v1/subscribers/42/subscriptions", None).await;
    assert_eq!(status, StatusCode::OK);
    let listed: ListResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(listed.subscriptions.len(), 1);

    let uri = format!("/v1/subscriptions/42/{ADDR}");
    let (status, _) = send(&n.app, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&n.app, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, body) = send(&n.app, Method::GET, "/v1/subscribers/42/subscriptions", None).await;
    let listed: ListResponse = serde_json::from_slice(&body).unwrap();
    assert!(listed.subscriptions.is_empty());
}

#[tokio::test]
async fn error_mapping() {
    let n = node();

    let (status, body) = send(
        &n.app,
        Method::POST,
        "/v1/subscriptions",
        Some(&subscribe_body("42", "not-an-address")),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(String::from_utf8_lossy(&body).contains("invalid_address"));

    // No balance configured for this address: the source fails.
    let (status, body) = send(
        &n.app,
        Method::POST,
        "/v1/subscriptions",
        Some(&subscribe_body("42", ADDR)),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(String::from_utf8_lossy(&body).contains("upstream_unavailable"));
    assert!(n.components.store.is_empty());
}

#[tokio::test]
async fn cycle_results_show_in_metrics_and_status() {
    let n = node();
    let addr = Address::parse(ADDR).unwrap();
    n.source.set(&addr, 1);
    send(
        &n.app,
        Method::POST,
        "/v1/subscriptions",
        Some(&subscribe_body("42", ADDR)),
    )
    .await;

    n.source.set(&addr, 2);
    assert!(matches!(
        n.components.reconciler.tick().await,
        TickOutcome::Completed(_)
    ));
    assert_eq!(n.sink.events().len(), 1);

    let (status, body) = send(&n.app, Method::GET, "/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8_lossy(&body);
    assert!(text.contains("watch_notifications_total 1"));

    let (_, body) = send(&n.app, Method::GET, "/status", None).await;
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let last: ReportView = serde_json::from_value(json["last_cycle"].clone()).unwrap();
    assert_eq!(last.total, 1);
    assert_eq!(last.changed, 1);
}

#[tokio::test]
async fn cycles_cannot_be_triggered_over_http() {
    let n = node();
    let (status, _) = send(&n.app, Method::POST, "/v1/reconcile", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(n.components.reconciler.last_report().is_none());
}

#[tokio::test]
async fn health_and_status() {
    let n = node();
    let (status, _) = send(&n.app, Method::GET, "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&n.app, Method::GET, "/readyz", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&n.app, Method::GET, "/status", None).await;
    assert_eq!(status, StatusCode::OK);
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["loop_state"], "idle");
    assert_eq!(json["accepting_subscriptions"], true);

    n.components.health.mark_degraded("test");
    let (status, _) = send(&n.app, Method::GET, "/readyz", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}
