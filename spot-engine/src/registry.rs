//! Canonical record of every spot
//!
//! The registry is a versioned store with optimistic-concurrency writes. It
//! never decides a spot's status on its own: status changes arrive from the
//! reservation ledger as a [`StatusChange`] already derived from reservation
//! state.
//!
//! Each zone carries a revision that the store advances on every write to one
//! of its spots. The availability feed stamps snapshots with it, which makes
//! `as_of_version` monotonic per zone, across restarts included.

use crate::store::Store;
use crate::types::{
    GeoPoint, Reservation, ReservationId, ReservationState, Spot, SpotId, SpotStatus, ZoneId,
};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// New status-bearing fields of a spot, derived by the ledger
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StatusChange {
    pub status: SpotStatus,
    pub reservation_id: Option<ReservationId>,
    pub held_until: Option<DateTime<Utc>>,
    pub out_of_service: bool,
}

impl StatusChange {
    /// Current fields of a spot (used to roll back)
    pub fn of(spot: &Spot) -> Self {
        Self {
            status: spot.status,
            reservation_id: spot.reservation_id,
            held_until: spot.held_until,
            out_of_service: spot.out_of_service,
        }
    }

    /// Fields after `reservation` reached its current state
    pub fn bind(reservation: &Reservation, out_of_service: bool) -> Self {
        let live = reservation.state.is_live();
        Self {
            status: SpotStatus::derive(Some(reservation.state), out_of_service),
            reservation_id: live.then_some(reservation.id),
            held_until: (reservation.state == ReservationState::Pending)
                .then_some(reservation.expires_at),
            out_of_service,
        }
    }

    /// Operator override toggled, binding unchanged
    pub fn service(spot: &Spot, bound: Option<ReservationState>, out_of_service: bool) -> Self {
        Self {
            status: SpotStatus::derive(bound, out_of_service),
            reservation_id: spot.reservation_id,
            held_until: spot.held_until,
            out_of_service,
        }
    }
}

/// Versioned spot registry
pub struct SpotRegistry {
    store: Arc<dyn Store>,
}

impl SpotRegistry {
    /// Create registry over a store
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Onboard a new spot (Free unless flagged out of service, version 1)
    pub fn register(&self, mut spot: Spot) -> Result<Spot> {
        spot.location.validate()?;
        if spot.id.as_str().is_empty() || spot.zone_id.as_str().is_empty() {
            return Err(Error::InvalidArgument(
                "spot id and zone id must not be empty".to_string(),
            ));
        }

        spot.reservation_id = None;
        spot.held_until = None;
        spot.status = SpotStatus::derive(None, spot.out_of_service);
        spot.version = 1;

        match self.store.put_spot(&spot, None) {
            Ok(()) => {}
            Err(Error::VersionConflict { .. }) => {
                return Err(Error::InvalidArgument(format!(
                    "spot {} already registered",
                    spot.id
                )))
            }
            Err(e) => return Err(e),
        }

        tracing::info!(spot_id = %spot.id, zone_id = %spot.zone_id, "Spot registered");
        Ok(spot)
    }

    /// Get spot by ID
    pub fn get(&self, spot_id: &SpotId) -> Result<Spot> {
        self.store
            .get_spot(spot_id)?
            .ok_or_else(|| Error::NotFound(format!("spot {}", spot_id)))
    }

    /// All spots of a zone, ordered by id
    pub fn list(&self, zone_id: &ZoneId) -> Result<Vec<Spot>> {
        let mut spots = self.store.spots_in_zone(zone_id)?;
        spots.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(spots)
    }

    /// Every registered spot
    pub fn all(&self) -> Result<Vec<Spot>> {
        self.store.all_spots()
    }

    /// Spots whose id, label or address contains `query` (case-insensitive), ordered by id
    pub fn search(&self, query: &str, limit: Option<usize>) -> Result<Vec<Spot>> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Err(Error::InvalidArgument(
                "search query must not be empty".to_string(),
            ));
        }

        let mut hits: Vec<Spot> = self
            .store
            .all_spots()?
            .into_iter()
            .filter(|spot| {
                spot.id.as_str().to_lowercase().contains(&needle)
                    || spot.label.to_lowercase().contains(&needle)
                    || spot
                        .address
                        .as_deref()
                        .is_some_and(|address| address.to_lowercase().contains(&needle))
            })
            .collect();
        hits.sort_by(|a, b| a.id.cmp(&b.id));
        if let Some(limit) = limit {
            hits.truncate(limit);
        }
        Ok(hits)
    }

    /// Conditionally write new status fields; fails with VersionConflict on a stale version
    pub(crate) fn set_status(
        &self,
        spot_id: &SpotId,
        change: StatusChange,
        expected_version: u64,
    ) -> Result<Spot> {
        let mut spot = self.get(spot_id)?;
        if spot.version != expected_version {
            return Err(Error::VersionConflict {
                key: format!("spot/{}", spot_id),
                expected: expected_version,
                actual: spot.version,
            });
        }

        spot.status = change.status;
        spot.reservation_id = change.reservation_id;
        spot.held_until = change.held_until;
        spot.out_of_service = change.out_of_service;
        spot.version = expected_version + 1;

        self.store.put_spot(&spot, Some(expected_version))?;

        tracing::debug!(
            spot_id = %spot.id,
            status = %spot.status,
            version = spot.version,
            "Spot status written"
        );
        Ok(spot)
    }

    /// Move a spot; a stale `expected_version` fails with VersionConflict
    pub fn relocate(&self, spot_id: &SpotId, location: GeoPoint, expected_version: u64) -> Result<Spot> {
        location.validate()?;
        let mut spot = self.get(spot_id)?;
        if spot.version != expected_version {
            return Err(Error::VersionConflict {
                key: format!("spot/{}", spot_id),
                expected: expected_version,
                actual: spot.version,
            });
        }

        spot.location = location;
        spot.version = expected_version + 1;
        self.store.put_spot(&spot, Some(expected_version))?;

        tracing::info!(
            spot_id = %spot.id,
            latitude = location.latitude,
            longitude = location.longitude,
            "Spot relocated"
        );
        Ok(spot)
    }

    /// Delete a spot record at `expected_version`
    pub(crate) fn remove(&self, spot: &Spot) -> Result<()> {
        self.store.delete_spot(&spot.id, spot.version)?;
        tracing::info!(spot_id = %spot.id, zone_id = %spot.zone_id, "Spot removed");
        Ok(())
    }

    /// Current revision of a zone
    pub fn zone_revision(&self, zone_id: &ZoneId) -> Result<u64> {
        self.store.zone_revision(zone_id)
    }
}

impl std::fmt::Debug for SpotRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpotRegistry").finish_non_exhaustive()
    }
}
