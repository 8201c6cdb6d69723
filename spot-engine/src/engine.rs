//! Engine orchestration layer
//!
//! This module ties together the store, registry, spatial index, ledger,
//! check-in protocol, availability feed and background actors into the
//! high-level API served over HTTP.
//!
//! # Example
//!
//! ```no_run
//! use spot_engine::{Config, SpotEngine};
//!
//! #[tokio::main]
//! async fn main() -> spot_engine::Result<()> {
//!     let engine = SpotEngine::open(Config::default()).await?;
//!
//!     // let nearby = engine.nearby(&center, 500.0, Some(20), true)?;
//!     // let reservation = engine.hold(&holder, &spot_id, HoldRequest::default())?;
//!
//!     engine.shutdown().await
//! }
//! ```

use crate::audit::{spawn_audit_actor, AuditHandle, AuditTrail};
use crate::checkin::CheckInProtocol;
use crate::config::StorageBackend;
use crate::feed::{spawn_feed_actor, AvailabilityFeed, FeedHandle, SnapshotStream};
use crate::geo::{Cluster, GeoIndex};
use crate::ledger::{HoldRequest, ReservationLedger};
use crate::metrics::Metrics;
use crate::notify::{spawn_notifier, LogDispatcher, NotificationDispatcher};
use crate::registry::SpotRegistry;
use crate::store::{MemoryStore, Store};
use crate::sweeper::ExpirySweeper;
use crate::types::{
    AvailabilitySnapshot, BoundingBox, CheckInEvent, CheckInToken, Direction, GeoPoint, HolderId,
    Reservation, ReservationId, Spot, SpotId, SpotStatus, ZoneId,
};
use crate::{Config, Error, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Spot returned by a radius query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearbySpot {
    /// Spot with its status as seen now
    pub spot: Spot,
    /// Distance from the query center (meters)
    pub distance_m: f64,
}

/// Main engine interface
pub struct SpotEngine {
    config: Config,
    registry: Arc<SpotRegistry>,
    geo: Arc<GeoIndex>,
    ledger: Arc<ReservationLedger>,
    checkin: CheckInProtocol,
    feed: Arc<AvailabilityFeed>,
    feed_handle: FeedHandle,
    audit: AuditTrail,
    audit_handle: AuditHandle,
    metrics: Arc<Metrics>,
    sweeper: Mutex<Option<ExpirySweeper>>,
}

impl SpotEngine {
    /// Open engine with configuration
    pub async fn open(config: Config) -> Result<Self> {
        let store = open_store(&config)?;
        Self::open_with(config, store, Arc::new(LogDispatcher)).await
    }

    /// Open engine over an existing store with a custom notification dispatcher
    pub async fn open_with(
        config: Config,
        store: Arc<dyn Store>,
        dispatcher: Arc<dyn NotificationDispatcher>,
    ) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(
            Metrics::new().map_err(|e| Error::Config(format!("Failed to create metrics: {}", e)))?,
        );

        let registry = Arc::new(SpotRegistry::new(store.clone()));

        // Rebuild the spatial index from the store
        let geo = Arc::new(GeoIndex::new(config.geo.cell_size_deg));
        for spot in registry.all()? {
            geo.insert(spot.id.clone(), spot.location)?;
        }

        let feed = Arc::new(AvailabilityFeed::new(registry.clone()));
        let (feed_handle, _) = spawn_feed_actor(feed.clone(), &config.feed, metrics.clone());
        let (notifier, _) = spawn_notifier(dispatcher, &config.notify, metrics.clone());
        let (audit_handle, audit, _) = spawn_audit_actor(&config.audit, metrics.clone());

        let ledger = Arc::new(
            ReservationLedger::new(store, registry.clone(), config.ledger.clone(), metrics.clone())
                .with_feed(feed_handle.clone())
                .with_notifier(notifier),
        );
        let checkin = CheckInProtocol::new(ledger.clone(), audit_handle.clone(), metrics.clone());

        let sweeper = if config.sweeper.enabled {
            Some(ExpirySweeper::start(
                ledger.clone(),
                Duration::from_secs(config.sweeper.interval_secs),
                config.sweeper.reminder_lead(),
            ))
        } else {
            None
        };

        tracing::info!(
            service = %config.service_name,
            version = %config.service_version,
            spots = geo.len(),
            "Spot engine opened"
        );

        Ok(Self {
            config,
            registry,
            geo,
            ledger,
            checkin,
            feed,
            feed_handle,
            audit,
            audit_handle,
            metrics,
            sweeper: Mutex::new(sweeper),
        })
    }

    /// Onboard a spot
    pub fn register_spot(&self, spot: Spot) -> Result<Spot> {
        let spot = self.registry.register(spot)?;
        self.geo.insert(spot.id.clone(), spot.location)?;
        self.feed_handle.zone_changed(&spot.zone_id);
        Ok(spot)
    }

    /// Decommission a spot with no live reservation
    pub fn remove_spot(&self, spot_id: &SpotId) -> Result<Spot> {
        let spot = self.ledger.remove_spot(spot_id, Utc::now())?;
        self.geo.remove(spot_id);
        Ok(spot)
    }

    /// Move a spot
    pub fn relocate_spot(
        &self,
        spot_id: &SpotId,
        location: GeoPoint,
        expected_version: u64,
    ) -> Result<Spot> {
        let spot = self.registry.relocate(spot_id, location, expected_version)?;
        self.geo.update(spot.id.clone(), spot.location)?;
        self.feed_handle.zone_changed(&spot.zone_id);
        Ok(self.project(spot))
    }

    /// Spot with its status as seen now
    pub fn spot(&self, spot_id: &SpotId) -> Result<Spot> {
        self.registry.get(spot_id).map(|spot| self.project(spot))
    }

    /// Spots within `radius_m` of `center`, nearest first
    pub fn nearby(
        &self,
        center: &GeoPoint,
        radius_m: f64,
        limit: Option<usize>,
        free_only: bool,
    ) -> Result<Vec<NearbySpot>> {
        let started = Instant::now();
        let hits = self
            .geo
            .query(center, radius_m, if free_only { None } else { limit })?;
        self.metrics
            .record_geo_query(started.elapsed().as_secs_f64());

        let mut spots = Vec::with_capacity(hits.len());
        for hit in hits {
            // Index may briefly lead the registry on concurrent removal
            let spot = match self.registry.get(&hit.spot_id) {
                Ok(spot) => self.project(spot),
                Err(Error::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if free_only && spot.status != SpotStatus::Free {
                continue;
            }
            spots.push(NearbySpot {
                spot,
                distance_m: hit.distance_m,
            });
            if limit.is_some_and(|limit| spots.len() >= limit) {
                break;
            }
        }

        Ok(spots)
    }

    /// Spots matching a text query on id, label or address
    pub fn search(&self, query: &str, limit: Option<usize>) -> Result<Vec<Spot>> {
        Ok(self
            .registry
            .search(query, limit)?
            .into_iter()
            .map(|spot| self.project(spot))
            .collect())
    }

    /// Spots inside a bounding box
    pub fn within(&self, bounds: &BoundingBox) -> Result<Vec<Spot>> {
        let ids = self.geo.query_bounding_box(bounds)?;
        let mut spots = Vec::with_capacity(ids.len());
        for id in ids {
            match self.registry.get(&id) {
                Ok(spot) => spots.push(self.project(spot)),
                Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(spots)
    }

    /// Map clusters inside a bounding box
    pub fn clusters(&self, bounds: &BoundingBox, precision_deg: f64) -> Result<Vec<Cluster>> {
        self.geo.clusters(bounds, precision_deg)
    }

    /// Place a hold
    pub fn hold(
        &self,
        holder_id: &HolderId,
        spot_id: &SpotId,
        request: HoldRequest,
    ) -> Result<Reservation> {
        self.ledger.hold(spot_id, holder_id, request)
    }

    /// Confirm check-in from the holder's device
    pub fn confirm(
        &self,
        holder_id: &HolderId,
        reservation_id: &ReservationId,
        token: &CheckInToken,
    ) -> Result<Reservation> {
        self.owned(holder_id, reservation_id)?;
        self.ledger.confirm(reservation_id, token)
    }

    /// Check out
    pub fn release(&self, holder_id: &HolderId, reservation_id: &ReservationId) -> Result<Reservation> {
        self.owned(holder_id, reservation_id)?;
        self.ledger.release(reservation_id)
    }

    /// Withdraw a hold
    pub fn cancel(&self, holder_id: &HolderId, reservation_id: &ReservationId) -> Result<Reservation> {
        self.owned(holder_id, reservation_id)?;
        self.ledger.cancel(reservation_id)
    }

    /// One of the holder's reservations
    pub fn reservation(
        &self,
        holder_id: &HolderId,
        reservation_id: &ReservationId,
    ) -> Result<Reservation> {
        self.owned(holder_id, reservation_id)
    }

    /// The holder's reservations, newest first
    pub fn reservations(&self, holder_id: &HolderId) -> Result<Vec<Reservation>> {
        self.ledger.reservations_for_holder(holder_id)
    }

    /// Operator override
    pub fn set_out_of_service(
        &self,
        spot_id: &SpotId,
        out_of_service: bool,
        expected_version: u64,
    ) -> Result<Spot> {
        self.ledger
            .set_out_of_service(spot_id, out_of_service, expected_version)
    }

    /// Handle a gate scan
    pub fn check_in(&self, event: &CheckInEvent) -> Result<Reservation> {
        self.checkin.handle(event)
    }

    /// Handle a raw QR payload scanned now
    pub fn scan(&self, payload: &str, direction: Direction) -> Result<Reservation> {
        self.checkin.scan(payload, direction)
    }

    /// Current availability of a zone
    pub fn snapshot(&self, zone_id: &ZoneId) -> Result<AvailabilitySnapshot> {
        self.feed.snapshot(zone_id)
    }

    /// Stream of availability snapshots for a zone
    pub fn subscribe(&self, zone_id: &ZoneId) -> Result<SnapshotStream> {
        self.feed.subscribe(zone_id)
    }

    /// Expire lapsed holds now
    pub fn expire_due(&self) -> Result<Vec<Reservation>> {
        self.ledger.expire_due()
    }

    /// Publish pending availability changes and append queued audit records
    pub async fn flush(&self) -> Result<()> {
        self.feed_handle.flush().await?;
        self.audit_handle.flush().await
    }

    /// Check-in audit trail
    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    /// Metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Reservation ledger
    pub fn ledger(&self) -> &Arc<ReservationLedger> {
        &self.ledger
    }

    /// Spot registry
    pub fn registry(&self) -> &Arc<SpotRegistry> {
        &self.registry
    }

    /// Stop background work
    pub async fn shutdown(&self) -> Result<()> {
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            sweeper.stop().await;
        }

        self.audit_handle.flush().await?;
        self.feed_handle.shutdown().await?;

        tracing::info!("Spot engine shut down");
        Ok(())
    }

    fn owned(&self, holder_id: &HolderId, reservation_id: &ReservationId) -> Result<Reservation> {
        let reservation = self.ledger.get(reservation_id)?;
        if &reservation.holder_id != holder_id {
            // Not revealed to other holders
            return Err(Error::NotFound(format!("reservation {}", reservation_id)));
        }
        Ok(reservation)
    }

    fn project(&self, mut spot: Spot) -> Spot {
        spot.status = spot.effective_status(Utc::now());
        spot
    }
}

impl std::fmt::Debug for SpotEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpotEngine")
            .field("service", &self.config.service_name)
            .field("spots", &self.geo.len())
            .finish()
    }
}

fn open_store(config: &Config) -> Result<Arc<dyn Store>> {
    match config.storage.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        #[cfg(feature = "rocksdb")]
        StorageBackend::Rocksdb => Ok(Arc::new(crate::storage::RocksStore::open(&config.storage)?)),
        #[cfg(not(feature = "rocksdb"))]
        StorageBackend::Rocksdb => Err(Error::Config(
            "storage.backend = \"rocksdb\" requires the `rocksdb` feature".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_engine() -> SpotEngine {
        let mut config = Config::default();
        config.sweeper.enabled = false;
        let engine = SpotEngine::open(config).await.unwrap();

        for (id, lat, lon) in [
            ("S1", 52.5200, 13.4050),
            ("S2", 52.5205, 13.4055),
            ("S3", 52.5300, 13.4200),
        ] {
            engine
                .register_spot(Spot::new(id, GeoPoint::new(lat, lon), "Z1", id))
                .unwrap();
        }
        engine
    }

    fn driver(name: &str) -> HolderId {
        HolderId::new(name)
    }

    #[tokio::test]
    async fn test_nearby_projects_status() {
        let engine = test_engine().await;
        let center = GeoPoint::new(52.5200, 13.4050);

        let all = engine.nearby(&center, 200.0, None, false).unwrap();
        assert_eq!(
            all.iter().map(|n| n.spot.id.as_str()).collect::<Vec<_>>(),
            vec!["S1", "S2"]
        );

        engine
            .hold(&driver("a"), &SpotId::new("S1"), HoldRequest::default())
            .unwrap();

        let free = engine.nearby(&center, 200.0, Some(1), true).unwrap();
        assert_eq!(free.len(), 1);
        assert_eq!(free[0].spot.id, SpotId::new("S2"));

        let held = engine.nearby(&center, 200.0, Some(1), false).unwrap();
        assert_eq!(held[0].spot.status, SpotStatus::Held);
    }

    #[tokio::test]
    async fn test_other_holders_cannot_see_reservation() {
        let engine = test_engine().await;
        let reservation = engine
            .hold(&driver("a"), &SpotId::new("S1"), HoldRequest::default())
            .unwrap();

        assert!(engine.reservation(&driver("a"), &reservation.id).is_ok());
        let err = engine.cancel(&driver("b"), &reservation.id).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_search_projects_status() {
        let engine = test_engine().await;
        engine
            .hold(&driver("a"), &SpotId::new("S2"), HoldRequest::default())
            .unwrap();

        let hits = engine.search("s2", None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].status, SpotStatus::Held);
        assert_eq!(engine.search("s", Some(2)).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_remove_and_relocate() {
        let engine = test_engine().await;

        let moved = engine
            .relocate_spot(&SpotId::new("S3"), GeoPoint::new(52.5201, 13.4051), 1)
            .unwrap();
        assert_eq!(moved.version, 2);
        let center = GeoPoint::new(52.5200, 13.4050);
        assert_eq!(engine.nearby(&center, 200.0, None, false).unwrap().len(), 3);

        engine.remove_spot(&SpotId::new("S3")).unwrap();
        assert_eq!(engine.nearby(&center, 200.0, None, false).unwrap().len(), 2);
        assert!(matches!(
            engine.spot(&SpotId::new("S3")),
            Err(Error::NotFound(_))
        ));
    }

    #[cfg(not(feature = "rocksdb"))]
    #[test]
    fn test_rocksdb_backend_requires_feature() {
        let mut config = Config::default();
        config.storage.backend = StorageBackend::Rocksdb;
        assert!(matches!(open_store(&config), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_shutdown_stops_sweeper() {
        let engine = SpotEngine::open(Config::default()).await.unwrap();
        engine.shutdown().await.unwrap();
        assert!(engine.sweeper.lock().is_none());
    }
}
