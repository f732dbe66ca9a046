use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::courier::GeoPoint;
use crate::models::order::Order;
use crate::state::AppState;

const STATES: [&str; 5] = ["pending", "offered", "accepted", "delivered", "unassignable"];

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/orders", post(create_order).get(list_orders))
        .route("/orders/:id", get(get_order))
}

#[derive(Deserialize)]
pub struct CreateOrderRequest {
    pub pickup: GeoPoint,
    pub dropoff: Option<GeoPoint>,
}

#[derive(Deserialize)]
pub struct ListOrdersQuery {
    pub state: Option<String>,
}

async fn create_order(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateOrderRequest>,
) -> Result<Json<Order>, AppError> {
    if !payload.pickup.is_valid() {
        return Err(AppError::BadRequest("pickup is not a valid coordinate".to_string()));
    }
    if payload.dropoff.is_some_and(|dropoff| !dropoff.is_valid()) {
        return Err(AppError::BadRequest("dropoff is not a valid coordinate".to_string()));
    }

    let order = state
        .engine
        .create_order(payload.pickup, payload.dropoff)
        .await?;
    Ok(Json(order))
}

async fn list_orders(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListOrdersQuery>,
) -> Result<Json<Vec<Order>>, AppError> {
    if let Some(name) = &query.state
        && !STATES.contains(&name.as_str())
    {
        return Err(AppError::BadRequest(format!("unknown order state {name}")));
    }

    Ok(Json(state.ledger.list(query.state.as_deref()).await))
}

async fn get_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    let order = state
        .ledger
        .get(id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("order {} not found", id)))?;

    Ok(Json(order))
}
