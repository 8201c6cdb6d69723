//! Persistent store interface
//!
//! The engine talks to its transactional key-value store through [`Store`]:
//! get / put-with-version-check / delete per record plus a zone secondary
//! index. Conditional writes fail with [`Error::VersionConflict`], which the
//! ledger treats as retryable.
//!
//! Every spot write or delete also advances its zone's revision in the same
//! atomic step, so the revision survives restarts and never moves backwards.
//!
//! Two implementations ship with the crate:
//! - [`MemoryStore`] - sharded in-process maps (default, tests)
//! - [`crate::storage::RocksStore`] - RocksDB column families (feature `rocksdb`)

use crate::types::{HolderId, Reservation, ReservationId, ReservationState, Spot, SpotId, ZoneId};
use crate::{Error, Result};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use std::collections::BTreeSet;

/// Versioned record store
///
/// `expected_version` semantics for every conditional write:
/// - `None` - create; fails if the key already exists
/// - `Some(v)` - replace; fails unless the stored version is exactly `v`
pub trait Store: Send + Sync {
    /// Get spot by ID
    fn get_spot(&self, spot_id: &SpotId) -> Result<Option<Spot>>;

    /// Conditionally write a spot (and maintain the zone index and revision)
    fn put_spot(&self, spot: &Spot, expected_version: Option<u64>) -> Result<()>;

    /// Conditionally delete a spot (and advance its zone's revision)
    fn delete_spot(&self, spot_id: &SpotId, expected_version: u64) -> Result<()>;

    /// Number of spot writes ever applied to a zone; 0 for an unknown zone
    fn zone_revision(&self, zone_id: &ZoneId) -> Result<u64>;

    /// All spots in a zone (via the zone index)
    fn spots_in_zone(&self, zone_id: &ZoneId) -> Result<Vec<Spot>>;

    /// Every spot (index rebuild on open)
    fn all_spots(&self) -> Result<Vec<Spot>>;

    /// Get reservation by ID
    fn get_reservation(&self, reservation_id: &ReservationId) -> Result<Option<Reservation>>;

    /// Conditionally write a reservation (and maintain holder/pending indices)
    fn put_reservation(
        &self,
        reservation: &Reservation,
        expected_version: Option<u64>,
    ) -> Result<()>;

    /// Delete a reservation (rollback of a failed hold)
    fn delete_reservation(&self, reservation_id: &ReservationId) -> Result<()>;

    /// Reservations stored as Pending
    fn pending_reservations(&self) -> Result<Vec<Reservation>>;

    /// Reservations of one holder, any state
    fn reservations_for_holder(&self, holder_id: &HolderId) -> Result<Vec<Reservation>>;
}

pub(crate) fn conflict(kind: &str, key: impl std::fmt::Display, expected: Option<u64>, actual: Option<u64>) -> Error {
    Error::VersionConflict {
        key: format!("{}/{}", kind, key),
        expected: expected.unwrap_or(0),
        actual: actual.unwrap_or(0),
    }
}

/// Check a conditional write against the currently stored version
pub(crate) fn check_version(
    kind: &str,
    key: impl std::fmt::Display,
    expected: Option<u64>,
    actual: Option<u64>,
) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(conflict(kind, key, expected, actual))
    }
}

/// In-process store backed by sharded maps
#[derive(Default)]
pub struct MemoryStore {
    spots: DashMap<SpotId, Spot>,
    reservations: DashMap<ReservationId, Reservation>,
    zone_index: DashMap<ZoneId, BTreeSet<SpotId>>,
    holder_index: DashMap<HolderId, BTreeSet<ReservationId>>,
    pending_index: DashSet<ReservationId>,
    zone_revisions: DashMap<ZoneId, u64>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn index_zone(&self, zone_id: &ZoneId, spot_id: &SpotId) {
        self.zone_index
            .entry(zone_id.clone())
            .or_default()
            .insert(spot_id.clone());
    }

    fn bump_zone(&self, zone_id: &ZoneId) {
        *self.zone_revisions.entry(zone_id.clone()).or_insert(0) += 1;
    }

    fn unindex_zone(&self, zone_id: &ZoneId, spot_id: &SpotId) {
        if let Some(mut ids) = self.zone_index.get_mut(zone_id) {
            ids.remove(spot_id);
        }
        self.zone_index.remove_if(zone_id, |_, ids| ids.is_empty());
    }

    fn index_reservation(&self, reservation: &Reservation) {
        self.holder_index
            .entry(reservation.holder_id.clone())
            .or_default()
            .insert(reservation.id);
        if reservation.state == ReservationState::Pending {
            self.pending_index.insert(reservation.id);
        } else {
            self.pending_index.remove(&reservation.id);
        }
    }
}

impl Store for MemoryStore {
    fn get_spot(&self, spot_id: &SpotId) -> Result<Option<Spot>> {
        Ok(self.spots.get(spot_id).map(|entry| entry.value().clone()))
    }

    fn put_spot(&self, spot: &Spot, expected_version: Option<u64>) -> Result<()> {
        match self.spots.entry(spot.id.clone()) {
            Entry::Occupied(mut entry) => {
                check_version("spot", &spot.id, expected_version, Some(entry.get().version))?;
                if entry.get().zone_id != spot.zone_id {
                    self.unindex_zone(&entry.get().zone_id, &spot.id);
                    self.index_zone(&spot.zone_id, &spot.id);
                    self.bump_zone(&entry.get().zone_id);
                }
                self.bump_zone(&spot.zone_id);
                entry.insert(spot.clone());
            }
            Entry::Vacant(entry) => {
                check_version("spot", &spot.id, expected_version, None)?;
                self.index_zone(&spot.zone_id, &spot.id);
                self.bump_zone(&spot.zone_id);
                entry.insert(spot.clone());
            }
        }
        Ok(())
    }

    fn delete_spot(&self, spot_id: &SpotId, expected_version: u64) -> Result<()> {
        match self.spots.entry(spot_id.clone()) {
            Entry::Occupied(entry) => {
                check_version("spot", spot_id, Some(expected_version), Some(entry.get().version))?;
                self.unindex_zone(&entry.get().zone_id, spot_id);
                self.bump_zone(&entry.get().zone_id);
                entry.remove();
                Ok(())
            }
            Entry::Vacant(_) => Err(Error::NotFound(format!("spot {}", spot_id))),
        }
    }

    fn zone_revision(&self, zone_id: &ZoneId) -> Result<u64> {
        Ok(self.zone_revisions.get(zone_id).map(|rev| *rev).unwrap_or(0))
    }

    fn spots_in_zone(&self, zone_id: &ZoneId) -> Result<Vec<Spot>> {
        let ids: Vec<SpotId> = match self.zone_index.get(zone_id) {
            Some(ids) => ids.iter().cloned().collect(),
            None => return Ok(Vec::new()),
        };

        Ok(ids
            .iter()
            .filter_map(|id| self.spots.get(id).map(|entry| entry.value().clone()))
            .filter(|spot| &spot.zone_id == zone_id)
            .collect())
    }

    fn all_spots(&self) -> Result<Vec<Spot>> {
        Ok(self.spots.iter().map(|entry| entry.value().clone()).collect())
    }

    fn get_reservation(&self, reservation_id: &ReservationId) -> Result<Option<Reservation>> {
        Ok(self
            .reservations
            .get(reservation_id)
            .map(|entry| entry.value().clone()))
    }

    fn put_reservation(
        &self,
        reservation: &Reservation,
        expected_version: Option<u64>,
    ) -> Result<()> {
        match self.reservations.entry(reservation.id) {
            Entry::Occupied(mut entry) => {
                check_version(
                    "reservation",
                    reservation.id,
                    expected_version,
                    Some(entry.get().version),
                )?;
                self.index_reservation(reservation);
                entry.insert(reservation.clone());
            }
            Entry::Vacant(entry) => {
                check_version("reservation", reservation.id, expected_version, None)?;
                self.index_reservation(reservation);
                entry.insert(reservation.clone());
            }
        }
        Ok(())
    }

    fn delete_reservation(&self, reservation_id: &ReservationId) -> Result<()> {
        if let Some((_, reservation)) = self.reservations.remove(reservation_id) {
            if let Some(mut ids) = self.holder_index.get_mut(&reservation.holder_id) {
                ids.remove(reservation_id);
            }
            self.pending_index.remove(reservation_id);
        }
        Ok(())
    }

    fn pending_reservations(&self) -> Result<Vec<Reservation>> {
        let ids: Vec<ReservationId> = self.pending_index.iter().map(|id| *id).collect();
        Ok(ids
            .iter()
            .filter_map(|id| self.reservations.get(id).map(|entry| entry.value().clone()))
            .filter(|r| r.state == ReservationState::Pending)
            .collect())
    }

    fn reservations_for_holder(&self, holder_id: &HolderId) -> Result<Vec<Reservation>> {
        let ids: Vec<ReservationId> = match self.holder_index.get(holder_id) {
            Some(ids) => ids.iter().copied().collect(),
            None => return Ok(Vec::new()),
        };
        Ok(ids
            .iter()
            .filter_map(|id| self.reservations.get(id).map(|entry| entry.value().clone()))
            .collect())
    }
}
