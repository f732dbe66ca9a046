use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::models::courier::CourierId;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryCause {
    Timeout,
    Disconnected,
    SendFailed,
}

/// Structured record of every decision the dispatch core makes.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchEvent {
    CourierRegistered {
        courier_id: CourierId,
        reconnect: bool,
    },
    CourierDisconnected {
        courier_id: CourierId,
    },
    OrderCreated {
        order_id: Uuid,
    },
    NoCandidates {
        order_id: Uuid,
        radius_km: f64,
        next_radius_km: f64,
    },
    OfferIssued {
        offer_id: Uuid,
        courier_id: CourierId,
        order_ids: Vec<Uuid>,
        expires_at: DateTime<Utc>,
    },
    OfferAccepted {
        offer_id: Uuid,
        courier_id: CourierId,
        order_ids: Vec<Uuid>,
    },
    OfferRejected {
        offer_id: Uuid,
        courier_id: CourierId,
        order_ids: Vec<Uuid>,
    },
    OfferExpired {
        offer_id: Uuid,
        courier_id: CourierId,
        order_ids: Vec<Uuid>,
        cause: ExpiryCause,
    },
    LateResponse {
        order_id: Uuid,
        courier_id: CourierId,
        reason: String,
    },
    OrderDelivered {
        order_id: Uuid,
        courier_id: CourierId,
    },
    OrderUnassignable {
        order_id: Uuid,
        attempts: u32,
    },
    LedgerUnavailable {
        reason: String,
    },
}

impl DispatchEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchEvent::CourierRegistered { .. } => "courier_registered",
            DispatchEvent::CourierDisconnected { .. } => "courier_disconnected",
            DispatchEvent::OrderCreated { .. } => "order_created",
            DispatchEvent::NoCandidates { .. } => "no_candidates",
            DispatchEvent::OfferIssued { .. } => "offer_issued",
            DispatchEvent::OfferAccepted { .. } => "offer_accepted",
            DispatchEvent::OfferRejected { .. } => "offer_rejected",
            DispatchEvent::OfferExpired { .. } => "offer_expired",
            DispatchEvent::LateResponse { .. } => "late_response",
            DispatchEvent::OrderDelivered { .. } => "order_delivered",
            DispatchEvent::OrderUnassignable { .. } => "order_unassignable",
            DispatchEvent::LedgerUnavailable { .. } => "ledger_unavailable",
        }
    }
}

pub trait EventSink: Send + Sync {
    fn record(&self, event: &DispatchEvent);
}

/// Writes events as log lines.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: &DispatchEvent) {
        match event {
            DispatchEvent::CourierRegistered {
                courier_id,
                reconnect,
            } => info!(courier_id = %courier_id, reconnect, "courier registered"),
            DispatchEvent::CourierDisconnected { courier_id } => {
                info!(courier_id = %courier_id, "courier disconnected")
            }
            DispatchEvent::OrderCreated { order_id } => info!(order_id = %order_id, "order created"),
            DispatchEvent::NoCandidates {
                order_id,
                radius_km,
                next_radius_km,
            } => debug!(
                order_id = %order_id,
                radius_km,
                next_radius_km,
                "no available couriers in range; backing off"
            ),
            DispatchEvent::OfferIssued {
                offer_id,
                courier_id,
                order_ids,
                ..
            } => info!(
                offer_id = %offer_id,
                courier_id = %courier_id,
                orders = order_ids.len(),
                "offer issued"
            ),
            DispatchEvent::OfferAccepted {
                offer_id,
                courier_id,
                order_ids,
            } => info!(
                offer_id = %offer_id,
                courier_id = %courier_id,
                orders = order_ids.len(),
                "offer accepted"
            ),
            DispatchEvent::OfferRejected {
                offer_id,
                courier_id,
                ..
            } => info!(offer_id = %offer_id, courier_id = %courier_id, "offer rejected"),
            DispatchEvent::OfferExpired {
                offer_id,
                courier_id,
                cause,
                ..
            } => info!(
                offer_id = %offer_id,
                courier_id = %courier_id,
                cause = ?cause,
                "offer expired"
            ),
            DispatchEvent::LateResponse {
                order_id,
                courier_id,
                reason,
            } => warn!(
                order_id = %order_id,
                courier_id = %courier_id,
                reason = %reason,
                "offer response arrived for an offer that is no longer valid"
            ),
            DispatchEvent::OrderDelivered {
                order_id,
                courier_id,
            } => info!(order_id = %order_id, courier_id = %courier_id, "order delivered"),
            DispatchEvent::OrderUnassignable { order_id, attempts } => error!(
                order_id = %order_id,
                attempts,
                "order exhausted offer attempts; escalating"
            ),
            DispatchEvent::LedgerUnavailable { reason } => {
                error!(reason = %reason, "ledger store unavailable; dispatch halted")
            }
        }
    }
}

/// Republishes events to live subscribers such as the `/events` stream.
pub struct BroadcastSink {
    tx: broadcast::Sender<DispatchEvent>,
}

impl BroadcastSink {
    pub fn new(tx: broadcast::Sender<DispatchEvent>) -> Self {
        Self { tx }
    }
}

impl EventSink for BroadcastSink {
    fn record(&self, event: &DispatchEvent) {
        let _ = self.tx.send(event.clone());
    }
}

pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutSink {
    fn record(&self, event: &DispatchEvent) {
        for sink in &self.sinks {
            sink.record(event);
        }
    }
}

/// Keeps every event in memory. Meant for tests and debugging.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<DispatchEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<DispatchEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl EventSink for RecordingSink {
    fn record(&self, event: &DispatchEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
