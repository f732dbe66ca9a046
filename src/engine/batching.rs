use uuid::Uuid;

use crate::config::BatchPolicy;
use crate::geo::haversine_km;
use crate::models::courier::GeoPoint;
use crate::models::order::Order;

/// Picks pending orders that can ride along with an anchor order on one trip.
pub struct BatchingCoordinator {
    policy: BatchPolicy,
}

impl BatchingCoordinator {
    pub fn new(policy: BatchPolicy) -> Self {
        Self { policy }
    }

    /// Member ids for an offer to a courier at `courier_at`, anchor first.
    ///
    /// A companion must share the anchor's pickup within the tolerance, have
    /// been created within the batching window of the anchor, and itself lie
    /// within `radius_km` of the courier.
    pub fn plan(&self, anchor: &Order, courier_at: &GeoPoint, radius_km: f64, pending: &[Order]) -> Vec<Uuid> {
        let mut members = vec![anchor.id];
        if self.policy.max_batch_size <= 1 {
            return members;
        }

        let mut companions: Vec<&Order> = pending
            .iter()
            .filter(|order| order.id != anchor.id && order.state.is_pending())
            .filter(|order| haversine_km(&anchor.pickup, &order.pickup) <= self.policy.pickup_tolerance_km)
            .filter(|order| self.within_window(anchor, order))
            .filter(|order| haversine_km(courier_at, &order.pickup) <= radius_km)
            .collect();

        companions.sort_by_key(|order| (order.created_at, order.id));
        members.extend(
            companions
                .into_iter()
                .take(self.policy.max_batch_size - 1)
                .map(|order| order.id),
        );
        members
    }

    fn within_window(&self, anchor: &Order, other: &Order) -> bool {
        let gap = (other.created_at - anchor.created_at).abs();
        gap.to_std().is_ok_and(|gap| gap <= self.policy.window)
    }
}
