use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use shopper_dispatch::api::rest::router;
use shopper_dispatch::config::Config;
use shopper_dispatch::engine::dispatch::run_dispatch_workers;
use shopper_dispatch::engine::queue::WorkItem;
use shopper_dispatch::gateway::protocol::OutboundEvent;
use shopper_dispatch::ledger::store::{InMemoryStore, LedgerStore, StoreError};
use shopper_dispatch::models::courier::{CourierId, GeoPoint};
use shopper_dispatch::models::order::Order;
use shopper_dispatch::registry::ConnectionHandle;
use shopper_dispatch::state::AppState;
use tokio::sync::mpsc;
use tower::ServiceExt;

fn shared_state() -> (Arc<AppState>, mpsc::Receiver<WorkItem>) {
    let (state, rx) = AppState::new(Config::default(), Arc::new(InMemoryStore::default()));
    (Arc::new(state), rx)
}

fn setup() -> (axum::Router, mpsc::Receiver<WorkItem>) {
    let (state, rx) = shared_state();
    (router(state), rx)
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn connect(state: &AppState, id: &str, lat: f64, lng: f64) -> mpsc::Receiver<OutboundEvent> {
    let (handle, rx) = ConnectionHandle::channel(16);
    state
        .engine
        .register(&CourierId::from(id), GeoPoint::new(lat, lng), handle)
        .await
        .unwrap();
    rx
}

struct BrokenStore;

#[async_trait]
impl LedgerStore for BrokenStore {
    async fn save(&self, _order: &Order) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("disk full".to_string()))
    }

    async fn load(&self) -> Result<Vec<Order>, StoreError> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn health_returns_ok() {
    let (app, _rx) = setup();
    let response = app.oneshot(get_request("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["couriers"], 0);
    assert_eq!(body["orders"], 0);
    assert_eq!(body["open_offers"], 0);
}

#[tokio::test]
async fn metrics_returns_prometheus_format() {
    let (app, _rx) = setup();
    let response = app.oneshot(get_request("/metrics")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.contains("text/plain"));

    let body = body_string(response).await;
    assert!(body.contains("orders_in_queue"));
    assert!(body.contains("connected_couriers"));
}

#[tokio::test]
async fn create_order_returns_pending() {
    let (app, _rx) = setup();
    let response = app
        .oneshot(json_request(
            "POST",
            "/orders",
            json!({
                "pickup": { "lat": 52.51, "lng": 13.39 },
                "dropoff": { "lat": 52.54, "lng": 13.42 }
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["state"]["state"], "pending");
    assert_eq!(body["offer_attempts"], 0);
    assert!(body["last_offer_outcome"].is_null());
}

#[tokio::test]
async fn create_order_without_dropoff_is_accepted() {
    let (app, _rx) = setup();
    let response = app
        .oneshot(json_request(
            "POST",
            "/orders",
            json!({ "pickup": { "lat": 52.51, "lng": 13.39 } }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_json(response).await["dropoff"].is_null());
}

#[tokio::test]
async fn create_order_invalid_pickup_returns_400() {
    let (app, _rx) = setup();
    let response = app
        .oneshot(json_request(
            "POST",
            "/orders",
            json!({ "pickup": { "lat": 95.0, "lng": 13.39 } }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn get_nonexistent_order_returns_404() {
    let (app, _rx) = setup();
    let fake_id = "00000000-0000-0000-0000-000000000000";
    let response = app
        .oneshot(get_request(&format!("/orders/{fake_id}")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn list_orders_filters_by_state() {
    let (state, _rx) = shared_state();
    let app = router(state.clone());

    let order = state
        .engine
        .create_order(GeoPoint::new(0.0, 0.0), None)
        .await
        .unwrap();

    let res = app
        .clone()
        .oneshot(get_request("/orders?state=pending"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let pending = body_json(res).await;
    assert_eq!(pending.as_array().unwrap().len(), 1);
    assert_eq!(pending[0]["id"], order.id.to_string());

    let res = app
        .clone()
        .oneshot(get_request("/orders?state=accepted"))
        .await
        .unwrap();
    assert_eq!(body_json(res).await.as_array().unwrap().len(), 0);

    let res = app.oneshot(get_request("/orders?state=lost")).await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn list_couriers_initially_empty() {
    let (app, _rx) = setup();
    let response = app.oneshot(get_request("/couriers")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn update_courier_status() {
    let (state, _rx) = shared_state();
    let app = router(state.clone());
    let _socket = connect(&state, "eve", 52.0, 13.0).await;

    let res = app
        .clone()
        .oneshot(get_request("/couriers/eve"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(body_json(res).await["status"], "Available");

    let res = app
        .clone()
        .oneshot(json_request(
            "PATCH",
            "/couriers/eve/status",
            json!({ "status": "Offline" }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(body_json(res).await["status"], "Offline");

    let res = app
        .clone()
        .oneshot(json_request(
            "PATCH",
            "/couriers/eve/status",
            json!({ "status": "Busy" }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = app
        .oneshot(json_request(
            "PATCH",
            "/couriers/nobody/status",
            json!({ "status": "Available" }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn status_override_conflicts_with_outstanding_offer() {
    let (state, _rx) = shared_state();
    let app = router(state.clone());
    let _socket = connect(&state, "frank", 52.0, 13.0).await;
    assert!(state.index.try_reserve(&CourierId::from("frank")));

    let res = app
        .oneshot(json_request(
            "PATCH",
            "/couriers/frank/status",
            json!({ "status": "Offline" }),
        ))
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn ledger_failure_degrades_health() {
    let (state, _rx) = AppState::new(Config::default(), Arc::new(BrokenStore));
    let app = router(Arc::new(state));

    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/orders",
            json!({ "pickup": { "lat": 0.0, "lng": 0.0 } }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);

    let res = app.oneshot(get_request("/health")).await.unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(res).await["status"], "degraded");
}

#[tokio::test]
async fn full_dispatch_flow() {
    let (state, rx) = shared_state();
    tokio::spawn(run_dispatch_workers(state.engine.clone(), rx, 2));
    let app = router(state.clone());
    let mut socket = connect(&state, "dan", 52.52, 13.405).await;
    assert!(matches!(
        socket.recv().await,
        Some(OutboundEvent::Registered { .. })
    ));

    let res = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/orders",
            json!({
                "pickup": { "lat": 52.521, "lng": 13.405 },
                "dropoff": { "lat": 52.54, "lng": 13.42 }
            }),
        ))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let order_id = body_json(res).await["id"].as_str().unwrap().to_string();

    let offer = tokio::time::timeout(Duration::from_secs(2), socket.recv())
        .await
        .unwrap()
        .unwrap();
    let OutboundEvent::NewOrder { order, .. } = offer else {
        panic!("expected new-order, got {offer:?}");
    };
    assert_eq!(order.id.to_string(), order_id);

    state
        .engine
        .accept(&CourierId::from("dan"), order.id)
        .await
        .unwrap();

    let res = app
        .clone()
        .oneshot(get_request(&format!("/orders/{order_id}")))
        .await
        .unwrap();
    let updated_order = body_json(res).await;
    assert_eq!(updated_order["state"]["state"], "accepted");
    assert_eq!(updated_order["state"]["courier_id"], "dan");

    let res = app.oneshot(get_request("/couriers")).await.unwrap();
    let couriers = body_json(res).await;
    assert_eq!(couriers[0]["status"], "Busy");
}
