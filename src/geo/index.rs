use std::collections::BTreeSet;

use chrono::Utc;
use dashmap::DashMap;

use crate::error::DispatchError;
use crate::geo::{degree_span, haversine_km};
use crate::models::courier::{Courier, CourierId, CourierStatus, GeoPoint};

type CellKey = (i64, i64);

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub courier_id: CourierId,
    pub location: GeoPoint,
    pub distance_km: f64,
}

/// Uniform lat/lng grid over courier positions.
///
/// Courier records are locked per entry; a courier moving between cells takes
/// its own entry lock first and the cell locks second. Queries copy a cell's
/// members out before touching courier entries, so the two lock orders never
/// interleave.
pub struct GeoIndex {
    cell_deg: f64,
    couriers: DashMap<CourierId, Courier>,
    cells: DashMap<CellKey, BTreeSet<CourierId>>,
}

impl GeoIndex {
    pub fn new(cell_deg: f64) -> Self {
        Self {
            cell_deg,
            couriers: DashMap::new(),
            cells: DashMap::new(),
        }
    }

    fn cell_of(&self, point: &GeoPoint) -> CellKey {
        (
            (point.lat / self.cell_deg).floor() as i64,
            (point.lng / self.cell_deg).floor() as i64,
        )
    }

    /// Inserts or moves a courier. New entries start `Offline` until marked.
    pub fn upsert(&self, courier_id: &CourierId, location: GeoPoint) {
        let now = Utc::now();
        let new_cell = self.cell_of(&location);

        let mut entry = self
            .couriers
            .entry(courier_id.clone())
            .or_insert_with(|| Courier {
                id: courier_id.clone(),
                location,
                location_at: now,
                status: CourierStatus::Offline,
                updated_at: now,
            });

        let old_cell = self.cell_of(&entry.location);
        entry.location = location;
        entry.location_at = now;
        entry.updated_at = now;

        if old_cell != new_cell {
            self.remove_from_cell(old_cell, courier_id);
        }
        self.cells
            .entry(new_cell)
            .or_default()
            .insert(courier_id.clone());
    }

    pub fn remove(&self, courier_id: &CourierId) -> Option<Courier> {
        let (_, courier) = self.couriers.remove(courier_id)?;
        self.remove_from_cell(self.cell_of(&courier.location), courier_id);
        Some(courier)
    }

    fn remove_from_cell(&self, cell: CellKey, courier_id: &CourierId) {
        if let Some(mut members) = self.cells.get_mut(&cell) {
            members.remove(courier_id);
        }
        self.cells.remove_if(&cell, |_, members| members.is_empty());
    }

    pub fn mark_available(&self, courier_id: &CourierId) -> Result<(), DispatchError> {
        self.set_status(courier_id, CourierStatus::Available)
    }

    pub fn mark_busy(&self, courier_id: &CourierId) -> Result<(), DispatchError> {
        self.set_status(courier_id, CourierStatus::Busy)
    }

    pub fn mark_offline(&self, courier_id: &CourierId) -> Result<(), DispatchError> {
        self.set_status(courier_id, CourierStatus::Offline)
    }

    /// Re-asserts `Offered` for a courier whose offer is already claimed.
    pub fn mark_offered(&self, courier_id: &CourierId) -> Result<(), DispatchError> {
        self.set_status(courier_id, CourierStatus::Offered)
    }

    fn set_status(&self, courier_id: &CourierId, status: CourierStatus) -> Result<(), DispatchError> {
        let mut courier = self
            .couriers
            .get_mut(courier_id)
            .ok_or_else(|| DispatchError::NotRegistered(courier_id.clone()))?;
        courier.status = status;
        courier.updated_at = Utc::now();
        Ok(())
    }

    /// Moves an available courier to `Offered`. Returns false when the courier is
    /// unknown or already holds something.
    pub fn try_reserve(&self, courier_id: &CourierId) -> bool {
        self.transition(courier_id, CourierStatus::Available, CourierStatus::Offered)
    }

    /// Returns an `Offered` courier to `Available`; other states are left alone.
    pub fn release(&self, courier_id: &CourierId) -> bool {
        self.transition(courier_id, CourierStatus::Offered, CourierStatus::Available)
    }

    fn transition(&self, courier_id: &CourierId, from: CourierStatus, to: CourierStatus) -> bool {
        match self.couriers.get_mut(courier_id) {
            Some(mut courier) if courier.status == from => {
                courier.status = to;
                courier.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }

    /// Operator override. Refused with `None` while the courier holds an offer.
    pub fn override_status(
        &self,
        courier_id: &CourierId,
        status: CourierStatus,
    ) -> Result<Option<Courier>, DispatchError> {
        let mut courier = self
            .couriers
            .get_mut(courier_id)
            .ok_or_else(|| DispatchError::NotRegistered(courier_id.clone()))?;
        if courier.status == CourierStatus::Offered {
            return Ok(None);
        }
        courier.status = status;
        courier.updated_at = Utc::now();
        Ok(Some(courier.clone()))
    }

    pub fn get(&self, courier_id: &CourierId) -> Option<Courier> {
        self.couriers.get(courier_id).map(|entry| entry.value().clone())
    }

    pub fn status(&self, courier_id: &CourierId) -> Option<CourierStatus> {
        self.couriers.get(courier_id).map(|entry| entry.status)
    }

    pub fn snapshot(&self) -> Vec<Courier> {
        let mut couriers: Vec<Courier> = self
            .couriers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        couriers.sort_by(|a, b| a.id.cmp(&b.id));
        couriers
    }

    pub fn len(&self) -> usize {
        self.couriers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.couriers.is_empty()
    }

    pub fn available_count(&self) -> usize {
        self.couriers
            .iter()
            .filter(|entry| entry.status == CourierStatus::Available)
            .count()
    }

    /// Up to `k` available couriers within `max_radius_km` of `point`, nearest
    /// first, equal distances ordered by courier id.
    pub fn nearest(&self, point: &GeoPoint, k: usize, max_radius_km: f64) -> Vec<Candidate> {
        if k == 0 || max_radius_km < 0.0 {
            return Vec::new();
        }

        let ids = self.ids_near(point, max_radius_km);

        let mut candidates: Vec<Candidate> = ids
            .into_iter()
            .filter_map(|id| {
                let courier = self.couriers.get(&id)?;
                if courier.status != CourierStatus::Available {
                    return None;
                }
                let distance_km = haversine_km(point, &courier.location);
                (distance_km <= max_radius_km).then(|| Candidate {
                    courier_id: id.clone(),
                    location: courier.location,
                    distance_km,
                })
            })
            .collect();

        candidates.sort_by(|a, b| {
            a.distance_km
                .total_cmp(&b.distance_km)
                .then_with(|| a.courier_id.cmp(&b.courier_id))
        });
        candidates.truncate(k);
        candidates
    }

    fn ids_near(&self, point: &GeoPoint, radius_km: f64) -> Vec<CourierId> {
        let (lat_span, lng_span) = degree_span(point, radius_km);
        // The grid does not wrap at the antimeridian.
        if point.lng - lng_span < -180.0 || point.lng + lng_span > 180.0 {
            return self.all_ids();
        }

        let (min_lat, min_lng) = self.cell_of(&GeoPoint::new(point.lat - lat_span, point.lng - lng_span));
        let (max_lat, max_lng) = self.cell_of(&GeoPoint::new(point.lat + lat_span, point.lng + lng_span));

        let cell_count = (max_lat - min_lat + 1).saturating_mul(max_lng - min_lng + 1);
        if cell_count as usize > self.cells.len() {
            return self.all_ids();
        }

        let mut ids = Vec::new();
        for lat in min_lat..=max_lat {
            for lng in min_lng..=max_lng {
                if let Some(members) = self.cells.get(&(lat, lng)) {
                    ids.extend(members.iter().cloned());
                }
            }
        }
        ids
    }

    fn all_ids(&self) -> Vec<CourierId> {
        self.cells
            .iter()
            .flat_map(|cell| cell.value().iter().cloned().collect::<Vec<_>>())
            .collect()
    }
}
