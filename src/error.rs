use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::models::courier::CourierId;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

/// Outcomes of registry, ledger and engine operations that are not a plain success.
///
/// Everything except `LedgerUnavailable` is recoverable by the caller;
/// `Unassignable` must additionally be escalated rather than dropped.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DispatchError {
    #[error("courier {0} is not registered")]
    NotRegistered(CourierId),

    #[error("courier {0} is not connected")]
    NotConnected(CourierId),

    #[error("order {0} is already offered or assigned")]
    AlreadyAssigned(Uuid),

    #[error("order {0} is not pending")]
    NotPending(Uuid),

    #[error("offer for order {0} is no longer valid")]
    OfferExpired(Uuid),

    #[error("order {order_id} is not offered to courier {courier_id}")]
    WrongCourier { order_id: Uuid, courier_id: CourierId },

    #[error("order {0} exhausted its offer attempts")]
    Unassignable(Uuid),

    #[error("order {0} not found")]
    UnknownOrder(Uuid),

    #[error("order {0} already exists")]
    DuplicateOrder(Uuid),

    #[error("ledger store unavailable: {0}")]
    LedgerUnavailable(String),

    #[error("dispatch queue closed")]
    QueueClosed,
}

impl From<DispatchError> for AppError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::NotRegistered(_) | DispatchError::UnknownOrder(_) => {
                AppError::NotFound(err.to_string())
            }
            DispatchError::NotConnected(_)
            | DispatchError::LedgerUnavailable(_)
            | DispatchError::QueueClosed => AppError::Unavailable(err.to_string()),
            DispatchError::AlreadyAssigned(_)
            | DispatchError::NotPending(_)
            | DispatchError::OfferExpired(_)
            | DispatchError::WrongCourier { .. }
            | DispatchError::Unassignable(_)
            | DispatchError::DuplicateOrder(_) => AppError::Conflict(err.to_string()),
        }
    }
}
