use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use dashmap::{DashMap, DashSet};
use tokio::sync::{Mutex, mpsc};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{Config, DispatchPolicy};
use crate::engine::batching::BatchingCoordinator;
use crate::engine::queue::{WorkItem, WorkQueue};
use crate::error::DispatchError;
use crate::gateway::protocol::{OrderView, OutboundEvent, UnavailableReason};
use crate::geo::index::{Candidate, GeoIndex};
use crate::ledger::{Acceptance, Ledger, Release};
use crate::models::courier::{CourierId, CourierStatus, GeoPoint};
use crate::models::offer::Offer;
use crate::models::order::Order;
use crate::observability::events::{DispatchEvent, EventSink, ExpiryCause};
use crate::observability::metrics::Metrics;
use crate::registry::{ConnectionHandle, ConnectionRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    Offered,
    BackedOff,
    Skipped,
}

impl MatchOutcome {
    fn label(&self) -> &'static str {
        match self {
            MatchOutcome::Offered => "offered",
            MatchOutcome::BackedOff => "backed_off",
            MatchOutcome::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum OfferEnd {
    Rejected,
    Expired(ExpiryCause),
}

/// Matches pending orders to couriers and drives every offer to its end.
///
/// The engine is the only writer of courier availability in the index; order
/// state changes go exclusively through the ledger.
///
/// `claims` holds every courier with an offer in flight or outstanding. It is
/// the gate for "one offer per courier" and outlives the courier's index entry,
/// which a disconnect removes.
pub struct DispatchEngine {
    me: Weak<DispatchEngine>,
    registry: Arc<ConnectionRegistry>,
    index: Arc<GeoIndex>,
    ledger: Arc<Ledger>,
    queue: WorkQueue,
    batching: BatchingCoordinator,
    policy: DispatchPolicy,
    sink: Arc<dyn EventSink>,
    metrics: Metrics,
    active_offers: DashMap<CourierId, Offer>,
    claims: DashSet<CourierId>,
    declined: DashMap<Uuid, BTreeSet<CourierId>>,
    halted: AtomicBool,
}

impl DispatchEngine {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        index: Arc<GeoIndex>,
        ledger: Arc<Ledger>,
        queue: WorkQueue,
        config: &Config,
        sink: Arc<dyn EventSink>,
        metrics: Metrics,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            registry,
            index,
            ledger,
            queue,
            batching: BatchingCoordinator::new(config.batching.clone()),
            policy: config.dispatch.clone(),
            sink,
            metrics,
            active_offers: DashMap::new(),
            claims: DashSet::new(),
            declined: DashMap::new(),
            halted: AtomicBool::new(false),
        })
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn active_offer(&self, courier_id: &CourierId) -> Option<Offer> {
        self.active_offers.get(courier_id).map(|entry| entry.value().clone())
    }

    fn initial_item(&self, order_id: Uuid) -> WorkItem {
        WorkItem {
            order_id,
            radius_km: self.policy.initial_radius_km,
            pass: 0,
        }
    }

    /// Reloads the ledger and queues every pending order for matching.
    pub async fn recover(&self) -> Result<usize, DispatchError> {
        let pending = self.ledger.recover().await.inspect_err(|err| self.on_ledger_error(err))?;
        for order_id in &pending {
            self.queue.schedule(self.initial_item(*order_id), Duration::ZERO);
        }
        Ok(pending.len())
    }

    pub async fn create_order(&self, pickup: GeoPoint, dropoff: Option<GeoPoint>) -> Result<Order, DispatchError> {
        if self.is_halted() {
            return Err(DispatchError::LedgerUnavailable("dispatch halted".to_string()));
        }

        let order = self
            .ledger
            .create_order(Order::new(pickup, dropoff))
            .await
            .inspect_err(|err| self.on_ledger_error(err))?;
        self.sink.record(&DispatchEvent::OrderCreated { order_id: order.id });

        self.queue.enqueue(self.initial_item(order.id)).await?;
        Ok(order)
    }

    /// One matching pass for one order.
    pub async fn process(self: &Arc<Self>, item: WorkItem) -> Result<MatchOutcome, DispatchError> {
        self.queue.mark_taken(item.order_id);
        if self.is_halted() {
            return Err(DispatchError::LedgerUnavailable("dispatch halted".to_string()));
        }

        let Some(order) = self.ledger.get(item.order_id).await else {
            return Ok(MatchOutcome::Skipped);
        };
        if !order.state.is_pending() {
            return Ok(MatchOutcome::Skipped);
        }

        let declined = self
            .declined
            .get(&order.id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        let candidates: Vec<Candidate> = self
            .index
            .nearest(
                &order.pickup,
                self.policy.candidate_limit + declined.len(),
                item.radius_km,
            )
            .into_iter()
            .filter(|candidate| !declined.contains(&candidate.courier_id))
            .take(self.policy.candidate_limit)
            .collect();

        for candidate in &candidates {
            if !self.claims.insert(candidate.courier_id.clone()) {
                continue;
            }
            if !self.index.try_reserve(&candidate.courier_id) {
                self.claims.remove(&candidate.courier_id);
                continue;
            }

            match self.offer_to(&order, candidate, item.radius_km).await {
                Ok(offer) => {
                    self.deliver(offer).await;
                    return Ok(MatchOutcome::Offered);
                }
                Err(err) => {
                    self.index.release(&candidate.courier_id);
                    self.claims.remove(&candidate.courier_id);
                    if let DispatchError::LedgerUnavailable(_) = err {
                        self.on_ledger_error(&err);
                        return Err(err);
                    }
                    // The order was taken by a concurrent pass or can no longer be offered.
                    debug!(order_id = %order.id, error = %err, "order not offerable");
                    return Ok(MatchOutcome::Skipped);
                }
            }
        }

        let next_radius_km = if candidates.is_empty() {
            self.policy.widen(item.radius_km)
        } else {
            item.radius_km
        };
        self.sink.record(&DispatchEvent::NoCandidates {
            order_id: order.id,
            radius_km: item.radius_km,
            next_radius_km,
        });
        self.queue.schedule(
            WorkItem {
                order_id: order.id,
                radius_km: next_radius_km,
                pass: item.pass.saturating_add(1),
            },
            self.policy.no_candidate_backoff,
        );
        Ok(MatchOutcome::BackedOff)
    }

    async fn offer_to(&self, anchor: &Order, candidate: &Candidate, radius_km: f64) -> Result<Offer, DispatchError> {
        let courier_id = &candidate.courier_id;
        let ttl = self.policy.offer_ttl;

        let pending = self.ledger.pending_orders();
        let members: Vec<Uuid> = self
            .batching
            .plan(anchor, &candidate.location, radius_km, &pending)
            .into_iter()
            .filter(|id| *id == anchor.id || !self.has_declined(id, courier_id))
            .collect();

        if members.len() > 1 {
            match self.ledger.try_offer_batch(&members, courier_id, ttl).await {
                Ok(offer) => return Ok(offer),
                Err(
                    DispatchError::AlreadyAssigned(id)
                    | DispatchError::NotPending(id)
                    | DispatchError::Unassignable(id),
                ) if id != anchor.id => {
                    debug!(order_id = %anchor.id, conflicting = %id, "batch conflict; offering anchor alone");
                }
                Err(err) => return Err(err),
            }
        }

        self.ledger.try_offer(anchor.id, courier_id, ttl).await
    }

    fn has_declined(&self, order_id: &Uuid, courier_id: &CourierId) -> bool {
        self.declined
            .get(order_id)
            .is_some_and(|couriers| couriers.contains(courier_id))
    }

    async fn offer_message(&self, offer: &Offer) -> OutboundEvent {
        let mut orders = Vec::with_capacity(offer.order_ids.len());
        for order_id in &offer.order_ids {
            if let Some(order) = self.ledger.get(*order_id).await {
                orders.push(OrderView::from(&order));
            }
        }

        if !offer.is_batch()
            && let Some(order) = orders.pop()
        {
            return OutboundEvent::NewOrder {
                order,
                offer_id: offer.id,
                expires_at: offer.expires_at,
            };
        }
        OutboundEvent::BatchOrders {
            orders,
            offer_id: offer.id,
            expires_at: offer.expires_at,
        }
    }

    async fn deliver(self: &Arc<Self>, offer: Offer) {
        self.active_offers.insert(offer.courier_id.clone(), offer.clone());
        // A reconnect during the ledger write rebuilt the index entry.
        if let Err(err) = self.index.mark_offered(&offer.courier_id) {
            debug!(courier_id = %offer.courier_id, error = %err, "offered courier left the index");
        }
        self.sink.record(&DispatchEvent::OfferIssued {
            offer_id: offer.id,
            courier_id: offer.courier_id.clone(),
            order_ids: offer.order_ids.clone(),
            expires_at: offer.expires_at,
        });

        let message = self.offer_message(&offer).await;
        if !self.push(&offer.courier_id, message) {
            return;
        }

        let engine = Arc::clone(self);
        let ttl = self.policy.offer_ttl;
        tokio::spawn(async move {
            sleep(ttl).await;
            engine.expire_offer(&offer, ExpiryCause::Timeout).await;
        });
    }

    async fn expire_offer(&self, offer: &Offer, cause: ExpiryCause) {
        match self.ledger.expire_offer(offer.id).await {
            Ok(Release::NoOp) => {}
            Ok(release) => {
                if cause == ExpiryCause::Timeout
                    && let Some(order_id) = offer.order_ids.first()
                {
                    self.push(
                        &offer.courier_id,
                        OutboundEvent::OfferUnavailable {
                            order_id: *order_id,
                            reason: UnavailableReason::Expired,
                        },
                    );
                }
                self.after_release(release, OfferEnd::Expired(cause)).await;
            }
            Err(err) => self.on_ledger_error(&err),
        }
    }

    async fn after_release(&self, release: Release, end: OfferEnd) {
        let Release::ReturnedToPending {
            offer_id,
            courier_id,
            pending,
            unassignable,
        } = release
        else {
            return;
        };

        self.active_offers
            .remove_if(&courier_id, |_, active| active.id == offer_id);
        self.claims.remove(&courier_id);
        self.index.release(&courier_id);

        let order_ids: Vec<Uuid> = pending.iter().chain(unassignable.iter()).copied().collect();
        self.sink.record(&match end {
            OfferEnd::Rejected => DispatchEvent::OfferRejected {
                offer_id,
                courier_id: courier_id.clone(),
                order_ids,
            },
            OfferEnd::Expired(cause) => DispatchEvent::OfferExpired {
                offer_id,
                courier_id: courier_id.clone(),
                order_ids,
                cause,
            },
        });

        for order_id in pending {
            self.queue.schedule(self.initial_item(order_id), Duration::ZERO);
        }

        for order_id in unassignable {
            self.declined.remove(&order_id);
            let attempts = self
                .ledger
                .get(order_id)
                .await
                .map(|order| order.offer_attempts)
                .unwrap_or_default();
            self.sink.record(&DispatchEvent::OrderUnassignable { order_id, attempts });
        }
    }

    pub async fn accept(&self, courier_id: &CourierId, order_id: Uuid) -> Result<Acceptance, DispatchError> {
        let acceptance = match self.ledger.accept(order_id, courier_id).await {
            Ok(acceptance) => acceptance,
            Err(err) => {
                self.on_late_response(courier_id, order_id, &err).await;
                return Err(err);
            }
        };

        self.active_offers
            .remove_if(courier_id, |_, active| active.id == acceptance.offer_id);
        self.claims.remove(courier_id);
        if let Err(err) = self.index.mark_busy(courier_id) {
            debug!(courier_id = %courier_id, error = %err, "accepted courier already left the index");
        }
        for id in &acceptance.order_ids {
            self.declined.remove(id);
        }

        self.sink.record(&DispatchEvent::OfferAccepted {
            offer_id: acceptance.offer_id,
            courier_id: courier_id.clone(),
            order_ids: acceptance.order_ids.clone(),
        });
        self.push(
            courier_id,
            OutboundEvent::OfferAccepted {
                offer_id: acceptance.offer_id,
                order_ids: acceptance.order_ids.clone(),
            },
        );

        Ok(acceptance)
    }

    pub async fn reject(&self, courier_id: &CourierId, order_id: Uuid) -> Result<Release, DispatchError> {
        let release = match self.ledger.reject(order_id, courier_id).await {
            Ok(release) => release,
            Err(err) => {
                self.on_late_response(courier_id, order_id, &err).await;
                return Err(err);
            }
        };

        if let Release::ReturnedToPending { pending, .. } = &release {
            for id in pending {
                self.declined.entry(*id).or_default().insert(courier_id.clone());
            }
        }
        self.after_release(release.clone(), OfferEnd::Rejected).await;
        Ok(release)
    }

    async fn on_late_response(&self, courier_id: &CourierId, order_id: Uuid, err: &DispatchError) {
        match err {
            DispatchError::LedgerUnavailable(_) => {
                self.on_ledger_error(err);
                return;
            }
            DispatchError::UnknownOrder(_) => {}
            DispatchError::OfferExpired(_) => {
                // Deadline passed before the timer fired: release the order now.
                match self.ledger.expire(order_id, courier_id).await {
                    Ok(release) => self.after_release(release, OfferEnd::Expired(ExpiryCause::Timeout)).await,
                    Err(err) => self.on_ledger_error(&err),
                }
            }
            _ => {}
        }

        self.sink.record(&DispatchEvent::LateResponse {
            order_id,
            courier_id: courier_id.clone(),
            reason: err.to_string(),
        });
        self.push(
            courier_id,
            OutboundEvent::OfferUnavailable {
                order_id,
                reason: UnavailableReason::from_error(err),
            },
        );
    }

    pub async fn complete_delivery(&self, courier_id: &CourierId, order_id: Uuid) -> Result<Order, DispatchError> {
        let order = self
            .ledger
            .complete(order_id, courier_id)
            .await
            .inspect_err(|err| self.on_ledger_error(err))?;

        self.sink.record(&DispatchEvent::OrderDelivered {
            order_id,
            courier_id: courier_id.clone(),
        });

        if !self.ledger.has_open_deliveries(courier_id)
            && self.index.status(courier_id) == Some(CourierStatus::Busy)
        {
            self.index.mark_available(courier_id)?;
        }
        Ok(order)
    }

    /// Binds a courier connection. An outstanding offer survives a reconnect and
    /// is pushed again to the new socket. Fails with `NotConnected` when the new
    /// socket cannot take the `registered` frame; that connection is dropped.
    pub async fn register(
        &self,
        courier_id: &CourierId,
        location: GeoPoint,
        handle: ConnectionHandle,
    ) -> Result<(), DispatchError> {
        let reconnect = self.registry.register(courier_id, handle).is_some();
        self.registry.mark_seen(courier_id)?;
        self.index.upsert(courier_id, location);
        self.metrics.connected_couriers.set(self.registry.len() as i64);

        let registered = OutboundEvent::Registered {
            user_id: courier_id.clone(),
        };
        if !self.push(courier_id, registered) {
            return Err(DispatchError::NotConnected(courier_id.clone()));
        }

        if self.claims.contains(courier_id) {
            // Outstanding, or still being written by a worker.
            self.index.mark_offered(courier_id)?;
            if let Some(offer) = self.active_offer(courier_id) {
                let message = self.offer_message(&offer).await;
                self.push(courier_id, message);
            }
        } else if self.ledger.has_open_deliveries(courier_id) {
            self.index.mark_busy(courier_id)?;
        } else {
            self.index.mark_available(courier_id)?;
        }

        self.sink.record(&DispatchEvent::CourierRegistered {
            courier_id: courier_id.clone(),
            reconnect,
        });
        Ok(())
    }

    pub fn update_location(&self, courier_id: &CourierId, location: GeoPoint) -> Result<(), DispatchError> {
        self.registry.mark_seen(courier_id)?;
        self.index.upsert(courier_id, location);
        Ok(())
    }

    /// Queues `event` for the courier. A failed push drops the connection it
    /// was aimed at and expires whatever offer the courier held.
    fn push(&self, courier_id: &CourierId, event: OutboundEvent) -> bool {
        let connection_id = self.registry.connection_id(courier_id);
        let Err(err) = self.registry.send(courier_id, event) else {
            return true;
        };
        warn!(courier_id = %courier_id, error = %err, "push failed; dropping connection");

        if let Some(engine) = self.me.upgrade() {
            let courier_id = courier_id.clone();
            tokio::spawn(async move {
                match connection_id {
                    Some(connection_id) => {
                        engine
                            .disconnect(&courier_id, Some(connection_id), ExpiryCause::SendFailed)
                            .await;
                    }
                    None => engine.expire_orphaned(&courier_id).await,
                }
            });
        }
        false
    }

    /// Expires the offer of a courier that has no connection at all.
    async fn expire_orphaned(&self, courier_id: &CourierId) {
        if self.registry.contains(courier_id) {
            return;
        }
        if let Some((_, offer)) = self.active_offers.remove(courier_id) {
            self.expire_offer(&offer, ExpiryCause::SendFailed).await;
        }
    }

    /// Drops a courier and immediately expires any offer it held. With a
    /// `connection_id`, nothing happens unless that connection is still the
    /// courier's current one. Returns whether the courier was removed.
    pub async fn disconnect(
        &self,
        courier_id: &CourierId,
        connection_id: Option<Uuid>,
        cause: ExpiryCause,
    ) -> bool {
        let removed = match connection_id {
            Some(connection_id) => self.registry.unregister_connection(courier_id, connection_id),
            None => self.registry.unregister(courier_id),
        };
        if connection_id.is_some() && !removed {
            return false;
        }

        self.index.remove(courier_id);
        self.metrics.connected_couriers.set(self.registry.len() as i64);

        if let Some((_, offer)) = self.active_offers.remove(courier_id) {
            self.expire_offer(&offer, cause).await;
        }

        self.sink.record(&DispatchEvent::CourierDisconnected {
            courier_id: courier_id.clone(),
        });
        true
    }

    fn on_ledger_error(&self, err: &DispatchError) {
        if let DispatchError::LedgerUnavailable(reason) = err
            && !self.halted.swap(true, Ordering::SeqCst)
        {
            self.sink.record(&DispatchEvent::LedgerUnavailable {
                reason: reason.clone(),
            });
        }
    }
}

pub async fn run_dispatch_workers(
    engine: Arc<DispatchEngine>,
    order_rx: mpsc::Receiver<WorkItem>,
    workers: usize,
) {
    info!(workers, "dispatch workers started");

    let order_rx = Arc::new(Mutex::new(order_rx));
    let handles: Vec<_> = (0..workers.max(1))
        .map(|worker| tokio::spawn(run_worker(worker, engine.clone(), order_rx.clone())))
        .collect();
    futures::future::join_all(handles).await;

    warn!("dispatch workers stopped: queue channel closed");
}

async fn run_worker(
    worker: usize,
    engine: Arc<DispatchEngine>,
    order_rx: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
) {
    loop {
        let item = order_rx.lock().await.recv().await;
        let Some(item) = item else {
            break;
        };

        let start = Instant::now();
        let outcome = engine.process(item).await;
        let elapsed = start.elapsed().as_secs_f64();

        match outcome {
            Ok(outcome) => engine
                .metrics
                .match_latency_seconds
                .with_label_values(&[outcome.label()])
                .observe(elapsed),
            Err(err) => {
                engine
                    .metrics
                    .match_latency_seconds
                    .with_label_values(&["error"])
                    .observe(elapsed);
                error!(worker, order_id = %item.order_id, error = %err, "matching pass failed");
            }
        }
    }
}
