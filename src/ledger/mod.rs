pub mod store;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::error::DispatchError;
use crate::ledger::store::LedgerStore;
use crate::models::courier::CourierId;
use crate::models::offer::Offer;
use crate::models::order::{OfferOutcome, Order, OrderState};

/// Result of handing an offer back, either by rejection or expiry.
#[derive(Debug, Clone, PartialEq)]
pub enum Release {
    ReturnedToPending {
        offer_id: Uuid,
        courier_id: CourierId,
        pending: Vec<Uuid>,
        unassignable: Vec<Uuid>,
    },
    NoOp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Acceptance {
    pub offer_id: Uuid,
    pub courier_id: CourierId,
    pub order_ids: Vec<Uuid>,
}

/// Authority over order assignment state.
///
/// Each order sits behind its own async mutex. Multi-order transitions lock
/// their members in ascending id order, so batches never deadlock against each
/// other and no lock spans more than the orders involved. A transition is
/// written to the store while the locks are held and only then applied in
/// memory; a failed write leaves every order untouched.
pub struct Ledger {
    orders: DashMap<Uuid, Arc<Mutex<Order>>>,
    offers: DashMap<Uuid, Vec<Uuid>>,
    accepted_by: DashMap<CourierId, BTreeSet<Uuid>>,
    store: Arc<dyn LedgerStore>,
    max_offer_attempts: u32,
}

impl Ledger {
    pub fn new(store: Arc<dyn LedgerStore>, max_offer_attempts: u32) -> Self {
        Self {
            orders: DashMap::new(),
            offers: DashMap::new(),
            accepted_by: DashMap::new(),
            store,
            max_offer_attempts: max_offer_attempts.max(1),
        }
    }

    /// Rebuilds memory from the store. Offers do not survive a restart, so any
    /// order left offered goes back to pending. Returns pending order ids,
    /// oldest first.
    pub async fn recover(&self) -> Result<Vec<Uuid>, DispatchError> {
        let mut orders = self.store.load().await.map_err(unavailable)?;
        orders.sort_by_key(|order| (order.created_at, order.id));

        let mut pending = Vec::new();
        for mut order in orders {
            if matches!(order.state, OrderState::Offered { .. }) {
                order.state = OrderState::Pending;
                order.updated_at = Utc::now();
                self.store.save(&order).await.map_err(unavailable)?;
            }

            match &order.state {
                OrderState::Pending => pending.push(order.id),
                OrderState::Accepted { courier_id } => {
                    self.accepted_by
                        .entry(courier_id.clone())
                        .or_default()
                        .insert(order.id);
                }
                _ => {}
            }

            self.orders.insert(order.id, Arc::new(Mutex::new(order)));
        }

        Ok(pending)
    }

    pub async fn create_order(&self, order: Order) -> Result<Order, DispatchError> {
        if self.orders.contains_key(&order.id) {
            return Err(DispatchError::DuplicateOrder(order.id));
        }

        self.store.save(&order).await.map_err(unavailable)?;

        match self.orders.entry(order.id) {
            Entry::Occupied(_) => Err(DispatchError::DuplicateOrder(order.id)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(order.clone())));
                Ok(order)
            }
        }
    }

    pub async fn try_offer(
        &self,
        order_id: Uuid,
        courier_id: &CourierId,
        ttl: Duration,
    ) -> Result<Offer, DispatchError> {
        self.try_offer_batch(&[order_id], courier_id, ttl).await
    }

    /// Offers every order in `order_ids` to one courier, or none of them.
    pub async fn try_offer_batch(
        &self,
        order_ids: &[Uuid],
        courier_id: &CourierId,
        ttl: Duration,
    ) -> Result<Offer, DispatchError> {
        let mut members: Vec<Uuid> = Vec::with_capacity(order_ids.len());
        for id in order_ids {
            if !members.contains(id) {
                members.push(*id);
            }
        }
        let Some(anchor) = members.first().copied() else {
            return Err(DispatchError::UnknownOrder(Uuid::nil()));
        };

        let mut guards = self.lock_all(&members).await?;
        for order in guards.iter() {
            match &order.state {
                OrderState::Pending => {}
                OrderState::Offered { .. } | OrderState::Accepted { .. } => {
                    return Err(DispatchError::AlreadyAssigned(order.id));
                }
                OrderState::Delivered { .. } => return Err(DispatchError::NotPending(order.id)),
                OrderState::Unassignable => return Err(DispatchError::Unassignable(order.id)),
            }
        }

        let now = Utc::now();
        let expires_at = now + chrono::Duration::milliseconds(ttl.as_millis().min(i64::MAX as u128) as i64);
        let offer_id = Uuid::new_v4();

        let updated: Vec<Order> = guards
            .iter()
            .map(|order| {
                let mut next = (**order).clone();
                next.state = OrderState::Offered {
                    courier_id: courier_id.clone(),
                    offer_id,
                    expires_at,
                };
                next.updated_at = now;
                next
            })
            .collect();

        self.persist(&updated).await?;
        commit(&mut guards, updated);
        self.offers.insert(offer_id, members.clone());

        tracing::trace!(order_id = %anchor, offer_id = %offer_id, "ledger offer recorded");

        Ok(Offer {
            id: offer_id,
            courier_id: courier_id.clone(),
            order_ids: members,
            expires_at,
        })
    }

    /// Accepts the offer covering `order_id`; every order of a batch is accepted together.
    pub async fn accept(&self, order_id: Uuid, courier_id: &CourierId) -> Result<Acceptance, DispatchError> {
        let state = self.state_of(order_id).await?;
        let offer_id = match state {
            OrderState::Offered {
                courier_id: holder,
                offer_id,
                expires_at,
            } => {
                if holder != *courier_id {
                    return Err(wrong_courier(order_id, courier_id));
                }
                if Utc::now() > expires_at {
                    return Err(DispatchError::OfferExpired(order_id));
                }
                offer_id
            }
            OrderState::Accepted { courier_id: holder } | OrderState::Delivered { courier_id: holder } => {
                if holder == *courier_id {
                    return Err(DispatchError::NotPending(order_id));
                }
                return Err(wrong_courier(order_id, courier_id));
            }
            OrderState::Pending | OrderState::Unassignable => {
                return Err(DispatchError::OfferExpired(order_id));
            }
        };

        let members = self.offer_members(offer_id, order_id);
        let mut guards = self.lock_all(&members).await?;
        if !guards.iter().all(|order| holds_offer(order, offer_id)) {
            return Err(DispatchError::OfferExpired(order_id));
        }

        let now = Utc::now();
        let updated: Vec<Order> = guards
            .iter()
            .map(|order| {
                let mut next = (**order).clone();
                next.state = OrderState::Accepted {
                    courier_id: courier_id.clone(),
                };
                next.updated_at = now;
                next
            })
            .collect();

        self.persist(&updated).await?;
        commit(&mut guards, updated);
        self.offers.remove(&offer_id);
        self.accepted_by
            .entry(courier_id.clone())
            .or_default()
            .extend(members.iter().copied());

        Ok(Acceptance {
            offer_id,
            courier_id: courier_id.clone(),
            order_ids: members,
        })
    }

    pub async fn reject(&self, order_id: Uuid, courier_id: &CourierId) -> Result<Release, DispatchError> {
        match self.state_of(order_id).await? {
            OrderState::Offered {
                courier_id: holder,
                offer_id,
                ..
            } => {
                if holder != *courier_id {
                    return Err(wrong_courier(order_id, courier_id));
                }
                self.release(offer_id, OfferOutcome::Rejected).await
            }
            OrderState::Accepted { courier_id: holder } | OrderState::Delivered { courier_id: holder }
                if holder != *courier_id =>
            {
                Err(wrong_courier(order_id, courier_id))
            }
            _ => Err(DispatchError::OfferExpired(order_id)),
        }
    }

    /// Expires the courier's offer on `order_id`; a no-op once it was accepted,
    /// rejected or re-offered to someone else.
    pub async fn expire(&self, order_id: Uuid, courier_id: &CourierId) -> Result<Release, DispatchError> {
        match self.state_of(order_id).await? {
            OrderState::Offered {
                courier_id: holder,
                offer_id,
                ..
            } if holder == *courier_id => self.release(offer_id, OfferOutcome::Expired).await,
            _ => Ok(Release::NoOp),
        }
    }

    /// Expires one specific offer. A timer holding an old offer id never
    /// disturbs a newer offer on the same orders.
    pub async fn expire_offer(&self, offer_id: Uuid) -> Result<Release, DispatchError> {
        self.release(offer_id, OfferOutcome::Expired).await
    }

    async fn release(&self, offer_id: Uuid, outcome: OfferOutcome) -> Result<Release, DispatchError> {
        let Some(members) = self.offers.get(&offer_id).map(|entry| entry.value().clone()) else {
            return Ok(Release::NoOp);
        };

        let mut guards = self.lock_all(&members).await?;
        let holder = guards.iter().find_map(|order| match &order.state {
            OrderState::Offered {
                offer_id: current,
                courier_id,
                ..
            } if *current == offer_id => Some(courier_id.clone()),
            _ => None,
        });
        let Some(courier_id) = holder else {
            self.offers.remove(&offer_id);
            return Ok(Release::NoOp);
        };

        let now = Utc::now();
        let mut pending = Vec::new();
        let mut unassignable = Vec::new();
        let updated: Vec<Order> = guards
            .iter()
            .map(|order| {
                let mut next = (**order).clone();
                if holds_offer(order, offer_id) {
                    next.offer_attempts = next.offer_attempts.saturating_add(1);
                    next.last_offer_outcome = Some(outcome);
                    next.state = if next.offer_attempts >= self.max_offer_attempts {
                        unassignable.push(next.id);
                        OrderState::Unassignable
                    } else {
                        pending.push(next.id);
                        OrderState::Pending
                    };
                    next.updated_at = now;
                }
                next
            })
            .collect();

        self.persist(&updated).await?;
        commit(&mut guards, updated);
        self.offers.remove(&offer_id);

        Ok(Release::ReturnedToPending {
            offer_id,
            courier_id,
            pending,
            unassignable,
        })
    }

    /// Marks an accepted order delivered by its courier.
    pub async fn complete(&self, order_id: Uuid, courier_id: &CourierId) -> Result<Order, DispatchError> {
        let record = self.record(order_id)?;
        let mut order = record.lock().await;

        match &order.state {
            OrderState::Accepted { courier_id: holder } if holder == courier_id => {}
            OrderState::Accepted { .. } | OrderState::Offered { .. } | OrderState::Delivered { .. }
                if !is_holder(&order.state, courier_id) =>
            {
                return Err(wrong_courier(order_id, courier_id));
            }
            _ => return Err(DispatchError::NotPending(order_id)),
        }

        let mut next = order.clone();
        next.state = OrderState::Delivered {
            courier_id: courier_id.clone(),
        };
        next.updated_at = Utc::now();
        self.persist(std::slice::from_ref(&next)).await?;
        *order = next.clone();
        drop(order);

        if let Some(mut open) = self.accepted_by.get_mut(courier_id) {
            open.remove(&order_id);
        }
        self.accepted_by.remove_if(courier_id, |_, open| open.is_empty());

        Ok(next)
    }

    pub fn has_open_deliveries(&self, courier_id: &CourierId) -> bool {
        self.accepted_by
            .get(courier_id)
            .is_some_and(|open| !open.is_empty())
    }

    pub async fn get(&self, order_id: Uuid) -> Option<Order> {
        let record = self.orders.get(&order_id).map(|entry| entry.value().clone())?;
        let order = record.lock().await;
        Some(order.clone())
    }

    pub async fn list(&self, state: Option<&str>) -> Vec<Order> {
        let records: Vec<Arc<Mutex<Order>>> = self
            .orders
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut orders = Vec::with_capacity(records.len());
        for record in records {
            let order = record.lock().await;
            if state.is_none_or(|name| order.state.name() == name) {
                orders.push(order.clone());
            }
        }
        orders.sort_by_key(|order| (order.created_at, order.id));
        orders
    }

    /// Pending orders that are not mid-transition, oldest first. Orders whose
    /// lock is held are skipped rather than waited on.
    pub fn pending_orders(&self) -> Vec<Order> {
        let mut orders: Vec<Order> = self
            .orders
            .iter()
            .filter_map(|entry| {
                let order = entry.value().try_lock().ok()?;
                order.state.is_pending().then(|| order.clone())
            })
            .collect();
        orders.sort_by_key(|order| (order.created_at, order.id));
        orders
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    pub fn open_offers(&self) -> usize {
        self.offers.len()
    }

    fn record(&self, order_id: Uuid) -> Result<Arc<Mutex<Order>>, DispatchError> {
        self.orders
            .get(&order_id)
            .map(|entry| entry.value().clone())
            .ok_or(DispatchError::UnknownOrder(order_id))
    }

    async fn state_of(&self, order_id: Uuid) -> Result<OrderState, DispatchError> {
        let record = self.record(order_id)?;
        let order = record.lock().await;
        Ok(order.state.clone())
    }

    fn offer_members(&self, offer_id: Uuid, fallback: Uuid) -> Vec<Uuid> {
        self.offers
            .get(&offer_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| vec![fallback])
    }

    async fn lock_all(&self, order_ids: &[Uuid]) -> Result<Vec<OwnedMutexGuard<Order>>, DispatchError> {
        let mut sorted: Vec<Uuid> = order_ids.to_vec();
        sorted.sort();
        sorted.dedup();

        let records = sorted
            .iter()
            .map(|id| self.record(*id))
            .collect::<Result<Vec<_>, _>>()?;

        let mut guards = Vec::with_capacity(records.len());
        for record in records {
            guards.push(record.lock_owned().await);
        }
        Ok(guards)
    }

    async fn persist(&self, orders: &[Order]) -> Result<(), DispatchError> {
        for order in orders {
            self.store.save(order).await.map_err(unavailable)?;
        }
        Ok(())
    }
}

fn commit(guards: &mut [OwnedMutexGuard<Order>], updated: Vec<Order>) {
    for (guard, next) in guards.iter_mut().zip(updated) {
        **guard = next;
    }
}

fn holds_offer(order: &Order, offer_id: Uuid) -> bool {
    matches!(&order.state, OrderState::Offered { offer_id: current, .. } if *current == offer_id)
}

fn is_holder(state: &OrderState, courier_id: &CourierId) -> bool {
    match state {
        OrderState::Offered { courier_id: holder, .. }
        | OrderState::Accepted { courier_id: holder }
        | OrderState::Delivered { courier_id: holder } => holder == courier_id,
        _ => false,
    }
}

fn wrong_courier(order_id: Uuid, courier_id: &CourierId) -> DispatchError {
    DispatchError::WrongCourier {
        order_id,
        courier_id: courier_id.clone(),
    }
}

fn unavailable(err: store::StoreError) -> DispatchError {
    DispatchError::LedgerUnavailable(err.to_string())
}
