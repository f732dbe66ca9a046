use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::routing::{get, patch};
use serde::Deserialize;

use crate::error::AppError;
use crate::models::courier::{Courier, CourierId, CourierStatus};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/couriers", get(list_couriers))
        .route("/couriers/:id", get(get_courier))
        .route("/couriers/:id/status", patch(update_courier_status))
}

#[derive(Deserialize)]
pub struct UpdateStatusRequest {
    pub status: CourierStatus,
}

async fn list_couriers(State(state): State<Arc<AppState>>) -> Json<Vec<Courier>> {
    Json(state.index.snapshot())
}

async fn get_courier(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Courier>, AppError> {
    let courier = state
        .index
        .get(&CourierId::new(id.clone()))
        .ok_or_else(|| AppError::NotFound(format!("courier {} not found", id)))?;

    Ok(Json(courier))
}

async fn update_courier_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(payload): Json<UpdateStatusRequest>,
) -> Result<Json<Courier>, AppError> {
    if !matches!(payload.status, CourierStatus::Available | CourierStatus::Offline) {
        return Err(AppError::BadRequest(
            "status can only be set to Available or Offline".to_string(),
        ));
    }

    let courier_id = CourierId::new(id);
    state
        .index
        .override_status(&courier_id, payload.status)?
        .map(Json)
        .ok_or_else(|| AppError::Conflict(format!("courier {} holds an outstanding offer", courier_id)))
}
