use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::courier::{CourierId, GeoPoint};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum OrderState {
    Pending,
    Offered {
        courier_id: CourierId,
        offer_id: Uuid,
        expires_at: DateTime<Utc>,
    },
    Accepted {
        courier_id: CourierId,
    },
    Delivered {
        courier_id: CourierId,
    },
    Unassignable,
}

impl OrderState {
    pub fn is_pending(&self) -> bool {
        matches!(self, OrderState::Pending)
    }

    pub fn name(&self) -> &'static str {
        match self {
            OrderState::Pending => "pending",
            OrderState::Offered { .. } => "offered",
            OrderState::Accepted { .. } => "accepted",
            OrderState::Delivered { .. } => "delivered",
            OrderState::Unassignable => "unassignable",
        }
    }
}

/// How the most recent offer for an order ended without an acceptance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OfferOutcome {
    Rejected,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub pickup: GeoPoint,
    pub dropoff: Option<GeoPoint>,
    pub state: OrderState,
    pub offer_attempts: u32,
    pub last_offer_outcome: Option<OfferOutcome>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn new(pickup: GeoPoint, dropoff: Option<GeoPoint>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            pickup,
            dropoff,
            state: OrderState::Pending,
            offer_attempts: 0,
            last_offer_outcome: None,
            created_at: now,
            updated_at: now,
        }
    }
}
