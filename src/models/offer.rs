use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::courier::CourierId;

/// A time-bounded proposal of one or more orders to a single courier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: Uuid,
    pub courier_id: CourierId,
    pub order_ids: Vec<Uuid>,
    pub expires_at: DateTime<Utc>,
}

impl Offer {
    pub fn is_batch(&self) -> bool {
        self.order_ids.len() > 1
    }
}
