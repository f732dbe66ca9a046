//! JSON frames exchanged with courier apps: `{"event": "<name>", "data": {...}}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DispatchError;
use crate::models::courier::{CourierId, GeoPoint};
use crate::models::order::Order;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum InboundEvent {
    ShopperRegister(LocationReport),
    LocationUpdate(LocationReport),
    Accept(OrderResponse),
    Reject(OrderResponse),
    OrderDelivered(OrderResponse),
}

impl InboundEvent {
    pub fn user_id(&self) -> &CourierId {
        match self {
            InboundEvent::ShopperRegister(report) | InboundEvent::LocationUpdate(report) => {
                &report.user_id
            }
            InboundEvent::Accept(response)
            | InboundEvent::Reject(response)
            | InboundEvent::OrderDelivered(response) => &response.user_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocationReport {
    pub user_id: CourierId,
    pub location: GeoPoint,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub user_id: CourierId,
    pub order_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderView {
    pub id: Uuid,
    pub pickup: GeoPoint,
    pub dropoff: Option<GeoPoint>,
    pub created_at: DateTime<Utc>,
}

impl From<&Order> for OrderView {
    fn from(order: &Order) -> Self {
        Self {
            id: order.id,
            pickup: order.pickup,
            dropoff: order.dropoff,
            created_at: order.created_at,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UnavailableReason {
    Expired,
    OfferedElsewhere,
    NoLongerPending,
}

impl UnavailableReason {
    pub fn from_error(err: &DispatchError) -> Self {
        match err {
            DispatchError::WrongCourier { .. } | DispatchError::AlreadyAssigned(_) => {
                UnavailableReason::OfferedElsewhere
            }
            DispatchError::OfferExpired(_) => UnavailableReason::Expired,
            _ => UnavailableReason::NoLongerPending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum OutboundEvent {
    #[serde(rename_all = "camelCase")]
    Registered { user_id: CourierId },

    #[serde(rename_all = "camelCase")]
    NewOrder {
        order: OrderView,
        offer_id: Uuid,
        expires_at: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    BatchOrders {
        orders: Vec<OrderView>,
        offer_id: Uuid,
        expires_at: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    OfferAccepted { offer_id: Uuid, order_ids: Vec<Uuid> },

    #[serde(rename_all = "camelCase")]
    OfferUnavailable {
        order_id: Uuid,
        reason: UnavailableReason,
    },

    Error { message: String },
}
