//! Reservation lifecycle
//!
//! The ledger is the only writer of spot status. Every transition runs under
//! a per-spot lock with a bounded wait, and the spot write itself is a
//! conditional write on `Spot.version`. Those two together are the atomic
//! point that guarantees a single live reservation per spot.
//!
//! Lifecycle:
//!
//! ```text
//!            confirm             release
//! Pending ───────────▶ Active ───────────▶ Completed
//!    │
//!    ├──── ttl passes ────▶ Expired
//!    └──── cancel ────────▶ Cancelled
//! ```
//!
//! Expiry is lazy: a Pending reservation past `expires_at` reads as Expired
//! immediately and is written back by the next operation that touches it or
//! by the periodic sweep.
//!
//! A holder may have at most `max_live_per_holder` live reservations. Holds
//! by the same holder serialize on a per-holder lock taken before the spot
//! lock; no other path takes a holder lock.

use crate::config::LedgerConfig;
use crate::feed::FeedHandle;
use crate::metrics::Metrics;
use crate::notify::{NoticeKind, NotifierHandle, ReservationNotice};
use crate::registry::{SpotRegistry, StatusChange};
use crate::store::Store;
use crate::types::{
    CheckInToken, HolderId, Reservation, ReservationId, ReservationState, Spot, SpotId, ZoneId,
};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Options for a hold
#[derive(Debug, Clone, Default)]
pub struct HoldRequest {
    /// Hold duration; the configured default when absent, clamped to the maximum
    pub ttl: Option<Duration>,

    /// Vehicle reference
    pub vehicle_id: Option<String>,

    /// Spot version the caller last saw; stale versions are rejected
    pub expected_version: Option<u64>,
}

/// Reservation ledger
pub struct ReservationLedger {
    store: Arc<dyn Store>,
    registry: Arc<SpotRegistry>,
    locks: DashMap<SpotId, Arc<Mutex<()>>>,
    holder_locks: DashMap<HolderId, Arc<Mutex<()>>>,
    reminded: DashSet<ReservationId>,
    config: LedgerConfig,
    metrics: Arc<Metrics>,
    feed: Option<FeedHandle>,
    notifier: Option<NotifierHandle>,
}

impl ReservationLedger {
    /// Create ledger over a store and the registry sharing it
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<SpotRegistry>,
        config: LedgerConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            registry,
            locks: DashMap::new(),
            holder_locks: DashMap::new(),
            reminded: DashSet::new(),
            config,
            metrics,
            feed: None,
            notifier: None,
        }
    }

    /// Publish zone changes to the availability feed
    pub fn with_feed(mut self, feed: FeedHandle) -> Self {
        self.feed = Some(feed);
        self
    }

    /// Deliver holder notifications
    pub fn with_notifier(mut self, notifier: NotifierHandle) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Place a hold on a spot
    pub fn hold(
        &self,
        spot_id: &SpotId,
        holder_id: &HolderId,
        request: HoldRequest,
    ) -> Result<Reservation> {
        self.hold_at(spot_id, holder_id, request, Utc::now())
    }

    /// Place a hold on a spot at `now`
    ///
    /// Fails with `SpotUnavailable` when the spot is out of service or has a
    /// live reservation, and with `HolderLimitReached` when the holder already
    /// has `max_live_per_holder` live reservations. A lapsed hold still bound
    /// to the spot is expired in the same call.
    pub fn hold_at(
        &self,
        spot_id: &SpotId,
        holder_id: &HolderId,
        request: HoldRequest,
        now: DateTime<Utc>,
    ) -> Result<Reservation> {
        let ttl = self.hold_ttl(request.ttl)?;
        let limit = self.config.max_live_per_holder;
        let holder_lock = (limit > 0).then(|| self.holder_lock(holder_id));
        let _holder_guard = match &holder_lock {
            Some(lock) => Some(self.acquire_holder(holder_id, lock)?),
            None => None,
        };
        let lock = self.spot_lock(spot_id);
        let _guard = self.acquire(spot_id, &lock)?;

        if let Some(expected) = request.expected_version {
            let spot = self.registry.get(spot_id)?;
            if spot.version != expected {
                return Err(Error::VersionConflict {
                    key: format!("spot/{}", spot_id),
                    expected,
                    actual: spot.version,
                });
            }
        }

        let reservation = Reservation::pending(
            spot_id.clone(),
            holder_id.clone(),
            request.vehicle_id,
            now,
            ttl,
        );

        let mut displaced = None;
        let written = self.update_spot(spot_id, |spot| {
            displaced = None;
            if spot.out_of_service {
                return Err(Error::SpotUnavailable(spot.id.clone()));
            }
            if let Some(bound_id) = spot.reservation_id {
                if let Some(bound) = self.store.get_reservation(&bound_id)? {
                    if bound.is_live_at(now) {
                        return Err(Error::SpotUnavailable(spot.id.clone()));
                    }
                    if bound.state == ReservationState::Pending {
                        displaced = Some(bound);
                    }
                }
            }
            if limit > 0 {
                self.check_holder_limit(holder_id, limit, now)?;
            }
            Ok(Some(StatusChange::bind(&reservation, false)))
        });

        let (before, after) = match written {
            Ok(pair) => pair,
            Err(e) => {
                if matches!(e, Error::SpotUnavailable(_)) {
                    self.metrics.hold_rejections_total.inc();
                }
                return Err(e);
            }
        };

        if let Err(e) = self.store.put_reservation(&reservation, None) {
            self.rollback_spot(&before, &after);
            return Err(e);
        }

        if let Some(stale) = displaced {
            if let Err(e) = self.expire_locked(stale, now) {
                tracing::warn!(spot_id = %spot_id, error = %e, "Failed to close displaced hold");
            }
        }

        self.metrics.holds_total.inc();
        self.publish(&after.zone_id);

        tracing::info!(
            reservation_id = %reservation.id,
            spot_id = %spot_id,
            holder_id = %holder_id,
            expires_at = %reservation.expires_at,
            "Hold placed"
        );

        Ok(reservation)
    }

    /// Confirm check-in
    pub fn confirm(&self, reservation_id: &ReservationId, token: &CheckInToken) -> Result<Reservation> {
        self.confirm_at(reservation_id, token, Utc::now())
    }

    /// Confirm check-in at `now`: Pending → Active, spot Held → Occupied
    ///
    /// A lapsed hold is `AlreadyExpired` whatever token is presented, whether
    /// or not the sweep has written the expiry back yet.
    pub fn confirm_at(
        &self,
        reservation_id: &ReservationId,
        token: &CheckInToken,
        now: DateTime<Utc>,
    ) -> Result<Reservation> {
        let spot_id = self.load(reservation_id)?.spot_id;
        let lock = self.spot_lock(&spot_id);
        let _guard = self.acquire(&spot_id, &lock)?;

        let mut reservation = self.load(reservation_id)?;
        match reservation.state {
            ReservationState::Pending => {}
            ReservationState::Expired => return Err(Error::AlreadyExpired(*reservation_id)),
            state => {
                return Err(Error::WrongState {
                    reservation_id: *reservation_id,
                    state,
                    attempted: ReservationState::Active,
                })
            }
        }

        if reservation.is_expired_at(now) {
            self.expire_locked(reservation, now)?;
            return Err(Error::AlreadyExpired(*reservation_id));
        }

        if !reservation.check_in_token.matches(token) {
            return Err(Error::InvalidToken(reservation_id.to_string()));
        }

        let spot = self.commit(&mut reservation, ReservationState::Active, now)?;
        self.metrics.confirmations_total.inc();
        self.announce(&reservation, NoticeKind::Confirmed, spot.as_ref(), now);

        tracing::info!(
            reservation_id = %reservation.id,
            spot_id = %reservation.spot_id,
            "Check-in confirmed"
        );
        Ok(reservation)
    }

    /// Check out
    pub fn release(&self, reservation_id: &ReservationId) -> Result<Reservation> {
        self.release_at(reservation_id, Utc::now())
    }

    /// Check out at `now`: Active → Completed, spot → Free
    ///
    /// Releasing a Completed reservation again returns it unchanged.
    pub fn release_at(&self, reservation_id: &ReservationId, now: DateTime<Utc>) -> Result<Reservation> {
        let spot_id = self.load(reservation_id)?.spot_id;
        let lock = self.spot_lock(&spot_id);
        let _guard = self.acquire(&spot_id, &lock)?;

        let mut reservation = self.load(reservation_id)?;
        match reservation.state {
            ReservationState::Active => {}
            ReservationState::Completed => return Ok(reservation),
            state => {
                return Err(Error::WrongState {
                    reservation_id: *reservation_id,
                    state,
                    attempted: ReservationState::Completed,
                })
            }
        }

        let spot = self.commit(&mut reservation, ReservationState::Completed, now)?;
        self.metrics.releases_total.inc();
        self.announce(&reservation, NoticeKind::Released, spot.as_ref(), now);

        tracing::info!(
            reservation_id = %reservation.id,
            spot_id = %reservation.spot_id,
            "Reservation released"
        );
        Ok(reservation)
    }

    /// Withdraw a hold
    pub fn cancel(&self, reservation_id: &ReservationId) -> Result<Reservation> {
        self.cancel_at(reservation_id, Utc::now())
    }

    /// Withdraw a hold at `now`: Pending → Cancelled, spot → Free
    pub fn cancel_at(&self, reservation_id: &ReservationId, now: DateTime<Utc>) -> Result<Reservation> {
        let spot_id = self.load(reservation_id)?.spot_id;
        let lock = self.spot_lock(&spot_id);
        let _guard = self.acquire(&spot_id, &lock)?;

        let mut reservation = self.load(reservation_id)?;
        match reservation.state {
            ReservationState::Pending => {}
            ReservationState::Expired => return Err(Error::AlreadyExpired(*reservation_id)),
            state => {
                return Err(Error::WrongState {
                    reservation_id: *reservation_id,
                    state,
                    attempted: ReservationState::Cancelled,
                })
            }
        }

        if reservation.is_expired_at(now) {
            self.expire_locked(reservation, now)?;
            return Err(Error::AlreadyExpired(*reservation_id));
        }

        let spot = self.commit(&mut reservation, ReservationState::Cancelled, now)?;
        self.metrics.cancellations_total.inc();
        if let Some(spot) = &spot {
            self.publish(&spot.zone_id);
        }

        tracing::info!(
            reservation_id = %reservation.id,
            spot_id = %reservation.spot_id,
            "Hold cancelled"
        );
        Ok(reservation)
    }

    /// Expire every lapsed hold
    pub fn expire_due(&self) -> Result<Vec<Reservation>> {
        self.expire_due_at(Utc::now())
    }

    /// Expire every hold with `now > expires_at`
    ///
    /// A failure on one reservation is logged and left for the next sweep.
    pub fn expire_due_at(&self, now: DateTime<Utc>) -> Result<Vec<Reservation>> {
        let due: Vec<Reservation> = self
            .store
            .pending_reservations()?
            .into_iter()
            .filter(|r| r.is_expired_at(now))
            .collect();

        let mut expired = Vec::with_capacity(due.len());
        for candidate in due {
            match self.expire_one(&candidate, now) {
                Ok(Some(reservation)) => expired.push(reservation),
                Ok(None) => {}
                Err(e) => tracing::warn!(
                    reservation_id = %candidate.id,
                    error = %e,
                    "Expiry deferred to next sweep"
                ),
            }
        }

        Ok(expired)
    }

    /// Remind holders whose hold lapses within `lead`
    pub fn remind_expiring(&self, lead: Duration) -> Result<Vec<Reservation>> {
        self.remind_expiring_at(Utc::now(), lead)
    }

    /// Send one `ExpiringSoon` notice per Pending hold with
    /// `expires_at - lead <= now <= expires_at`
    ///
    /// Each hold is reminded at most once while it stays Pending.
    pub fn remind_expiring_at(&self, now: DateTime<Utc>, lead: Duration) -> Result<Vec<Reservation>> {
        let lead = chrono::Duration::from_std(lead).map_err(|e| Error::InvalidArgument(e.to_string()))?;
        let pending = self.store.pending_reservations()?;

        let still_pending: HashSet<ReservationId> = pending.iter().map(|r| r.id).collect();
        self.reminded.retain(|id| still_pending.contains(id));

        let mut reminded = Vec::new();
        for reservation in pending {
            if reservation.is_expired_at(now) || reservation.expires_at - now > lead {
                continue;
            }
            if !self.reminded.insert(reservation.id) {
                continue;
            }

            self.metrics.reminders_total.inc();
            if let Some(notifier) = &self.notifier {
                notifier.notify(ReservationNotice::new(NoticeKind::ExpiringSoon, &reservation, now));
            }
            tracing::debug!(
                reservation_id = %reservation.id,
                expires_at = %reservation.expires_at,
                "Expiry reminder sent"
            );
            reminded.push(reservation);
        }

        Ok(reminded)
    }

    /// Reservation as seen now
    pub fn get(&self, reservation_id: &ReservationId) -> Result<Reservation> {
        self.get_at(reservation_id, Utc::now())
    }

    /// Reservation as seen at `now` (lapsed holds read as Expired)
    pub fn get_at(&self, reservation_id: &ReservationId, now: DateTime<Utc>) -> Result<Reservation> {
        let mut reservation = self.load(reservation_id)?;
        reservation.state = reservation.effective_state(now);
        Ok(reservation)
    }

    /// A holder's reservations, newest first
    pub fn reservations_for_holder(&self, holder_id: &HolderId) -> Result<Vec<Reservation>> {
        let now = Utc::now();
        let mut reservations = self.store.reservations_for_holder(holder_id)?;
        for reservation in &mut reservations {
            reservation.state = reservation.effective_state(now);
        }
        reservations.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(reservations)
    }

    /// Operator override: take a spot out of service or return it
    ///
    /// A live reservation keeps its binding; the spot reads OutOfService
    /// until the flag is cleared.
    pub fn set_out_of_service(
        &self,
        spot_id: &SpotId,
        out_of_service: bool,
        expected_version: u64,
    ) -> Result<Spot> {
        let lock = self.spot_lock(spot_id);
        let _guard = self.acquire(spot_id, &lock)?;

        let spot = self.registry.get(spot_id)?;
        let bound = match spot.reservation_id {
            Some(id) => self.store.get_reservation(&id)?.map(|r| r.state),
            None => None,
        };

        let spot = self.registry.set_status(
            spot_id,
            StatusChange::service(&spot, bound, out_of_service),
            expected_version,
        )?;
        self.publish(&spot.zone_id);

        tracing::info!(spot_id = %spot_id, out_of_service, "Service flag changed");
        Ok(spot)
    }

    /// Decommission a spot with no live reservation
    pub fn remove_spot(&self, spot_id: &SpotId, now: DateTime<Utc>) -> Result<Spot> {
        let lock = self.spot_lock(spot_id);
        let _guard = self.acquire(spot_id, &lock)?;

        let spot = self.registry.get(spot_id)?;
        if let Some(bound_id) = spot.reservation_id {
            if let Some(bound) = self.store.get_reservation(&bound_id)? {
                if bound.is_live_at(now) {
                    return Err(Error::SpotUnavailable(spot_id.clone()));
                }
                if bound.state == ReservationState::Pending {
                    self.expire_locked(bound, now)?;
                }
            }
        }

        let spot = self.registry.get(spot_id)?;
        self.registry.remove(&spot)?;
        self.locks.remove_if(spot_id, |_, entry| Arc::ptr_eq(entry, &lock));
        self.publish(&spot.zone_id);
        Ok(spot)
    }

    fn expire_one(&self, candidate: &Reservation, now: DateTime<Utc>) -> Result<Option<Reservation>> {
        let lock = self.spot_lock(&candidate.spot_id);
        let _guard = self.acquire(&candidate.spot_id, &lock)?;

        let reservation = self.load(&candidate.id)?;
        if !reservation.is_expired_at(now) {
            return Ok(None);
        }
        self.expire_locked(reservation, now).map(Some)
    }

    /// Pending → Expired; caller holds the spot lock
    fn expire_locked(&self, mut reservation: Reservation, now: DateTime<Utc>) -> Result<Reservation> {
        let spot = self.commit(&mut reservation, ReservationState::Expired, now)?;
        self.metrics.expirations_total.inc();
        self.announce(&reservation, NoticeKind::Expired, spot.as_ref(), now);

        tracing::info!(
            reservation_id = %reservation.id,
            spot_id = %reservation.spot_id,
            expires_at = %reservation.expires_at,
            "Hold expired"
        );
        Ok(reservation)
    }

    /// Apply a transition and rewrite the spot; caller holds the spot lock
    ///
    /// Returns the spot after the write, or `None` when the spot was not
    /// touched (already rebound, or removed).
    fn commit(
        &self,
        reservation: &mut Reservation,
        next: ReservationState,
        now: DateTime<Utc>,
    ) -> Result<Option<Spot>> {
        let expected = reservation.version;
        let previous = reservation.clone();
        reservation.transition(next, now)?;

        let current: &Reservation = reservation;
        let written = match self.update_spot(&current.spot_id, |spot| match spot.reservation_id {
            Some(bound) if bound == current.id => {
                Ok(Some(StatusChange::bind(current, spot.out_of_service)))
            }
            _ if next == ReservationState::Active => Err(Error::SpotUnavailable(spot.id.clone())),
            _ => Ok(None),
        }) {
            Ok(pair) => Some(pair),
            Err(Error::NotFound(_)) if next.is_terminal() => None,
            Err(e) => {
                *reservation = previous;
                return Err(e);
            }
        };

        if let Err(e) = self.store.put_reservation(reservation, Some(expected)) {
            *reservation = previous;
            if let Some((before, after)) = &written {
                self.rollback_spot(before, after);
            }
            return Err(e);
        }

        Ok(written
            .filter(|(before, after)| before.version != after.version)
            .map(|(_, after)| after))
    }

    /// Conditionally rewrite a spot, re-reading it on version conflicts
    ///
    /// `change` returning `None` leaves the spot untouched. Returns the spot
    /// before and after.
    fn update_spot<F>(&self, spot_id: &SpotId, mut change: F) -> Result<(Spot, Spot)>
    where
        F: FnMut(&Spot) -> Result<Option<StatusChange>>,
    {
        let mut attempt = 0;
        loop {
            let before = self.registry.get(spot_id)?;
            let Some(next) = change(&before)? else {
                return Ok((before.clone(), before));
            };

            match self.registry.set_status(spot_id, next, before.version) {
                Ok(after) => return Ok((before, after)),
                Err(e @ Error::VersionConflict { .. }) => {
                    if attempt >= self.config.max_version_retries {
                        return Err(e);
                    }
                    attempt += 1;
                    self.metrics.version_conflicts_total.inc();
                    tracing::debug!(spot_id = %spot_id, attempt, "Version conflict on spot, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn rollback_spot(&self, before: &Spot, after: &Spot) {
        if before.version == after.version {
            return;
        }
        if let Err(e) =
            self.registry
                .set_status(&before.id, StatusChange::of(before), after.version)
        {
            tracing::error!(spot_id = %before.id, error = %e, "Failed to roll back spot binding");
        }
    }

    fn load(&self, reservation_id: &ReservationId) -> Result<Reservation> {
        self.store
            .get_reservation(reservation_id)?
            .ok_or_else(|| Error::NotFound(format!("reservation {}", reservation_id)))
    }

    fn hold_ttl(&self, ttl: Option<Duration>) -> Result<chrono::Duration> {
        let ttl = ttl.unwrap_or_else(|| self.config.default_hold_ttl());
        if ttl.is_zero() {
            return Err(Error::InvalidArgument("hold ttl must be positive".to_string()));
        }
        let ttl = ttl.min(self.config.max_hold_ttl());
        chrono::Duration::from_std(ttl).map_err(|e| Error::InvalidArgument(e.to_string()))
    }

    fn spot_lock(&self, spot_id: &SpotId) -> Arc<Mutex<()>> {
        self.locks.entry(spot_id.clone()).or_default().clone()
    }

    fn holder_lock(&self, holder_id: &HolderId) -> Arc<Mutex<()>> {
        self.holder_locks.entry(holder_id.clone()).or_default().clone()
    }

    fn acquire_holder<'a>(&self, holder_id: &HolderId, lock: &'a Mutex<()>) -> Result<MutexGuard<'a, ()>> {
        lock.try_lock_for(self.config.lock_timeout()).ok_or_else(|| {
            self.metrics.lock_timeouts_total.inc();
            Error::Timeout(format!("lock on holder {}", holder_id))
        })
    }

    /// Refuse a new hold once the holder has `limit` live reservations
    fn check_holder_limit(&self, holder_id: &HolderId, limit: usize, now: DateTime<Utc>) -> Result<()> {
        let live = self
            .store
            .reservations_for_holder(holder_id)?
            .iter()
            .filter(|r| r.is_live_at(now))
            .count();
        if live >= limit {
            return Err(Error::HolderLimitReached {
                holder_id: holder_id.clone(),
                limit,
            });
        }
        Ok(())
    }

    fn acquire<'a>(&self, spot_id: &SpotId, lock: &'a Mutex<()>) -> Result<MutexGuard<'a, ()>> {
        lock.try_lock_for(self.config.lock_timeout()).ok_or_else(|| {
            self.metrics.lock_timeouts_total.inc();
            Error::Timeout(format!("lock on spot {}", spot_id))
        })
    }

    fn publish(&self, zone_id: &ZoneId) {
        if let Some(feed) = &self.feed {
            feed.zone_changed(zone_id);
        }
    }

    fn announce(
        &self,
        reservation: &Reservation,
        kind: NoticeKind,
        spot: Option<&Spot>,
        now: DateTime<Utc>,
    ) {
        if let Some(spot) = spot {
            self.publish(&spot.zone_id);
        }
        if let Some(notifier) = &self.notifier {
            notifier.notify(ReservationNotice::new(kind, reservation, now));
        }
    }
}

impl std::fmt::Debug for ReservationLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservationLedger")
            .field("config", &self.config)
            .field("locks", &self.locks.len())
            .field("holders", &self.holder_locks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{GeoPoint, SpotStatus};
    use chrono::Duration as ChronoDuration;

    struct Fixture {
        registry: Arc<SpotRegistry>,
        ledger: ReservationLedger,
    }

    fn fixture() -> Fixture {
        fixture_with(LedgerConfig::default())
    }

    fn fixture_with(config: LedgerConfig) -> Fixture {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let registry = Arc::new(SpotRegistry::new(store.clone()));
        for id in ["S1", "S2"] {
            registry
                .register(Spot::new(id, GeoPoint::new(52.52, 13.405), "Z1", id))
                .unwrap();
        }
        let ledger = ReservationLedger::new(
            store,
            registry.clone(),
            config,
            Arc::new(Metrics::new().unwrap()),
        );
        Fixture { registry, ledger }
    }

    fn s1() -> SpotId {
        SpotId::new("S1")
    }

    fn driver(name: &str) -> HolderId {
        HolderId::new(name)
    }

    #[test]
    fn test_hold_marks_spot_held() {
        let f = fixture();
        let now = Utc::now();
        let reservation = f
            .ledger
            .hold_at(&s1(), &driver("a"), HoldRequest::default(), now)
            .unwrap();

        assert_eq!(reservation.state, ReservationState::Pending);
        assert_eq!(reservation.expires_at, now + ChronoDuration::seconds(300));

        let spot = f.registry.get(&s1()).unwrap();
        assert_eq!(spot.status, SpotStatus::Held);
        assert_eq!(spot.reservation_id, Some(reservation.id));
        assert_eq!(spot.version, 2);
    }

    #[test]
    fn test_second_hold_is_refused() {
        let f = fixture();
        let now = Utc::now();
        f.ledger
            .hold_at(&s1(), &driver("a"), HoldRequest::default(), now)
            .unwrap();

        let err = f
            .ledger
            .hold_at(&s1(), &driver("b"), HoldRequest::default(), now)
            .unwrap_err();
        assert!(matches!(err, Error::SpotUnavailable(_)));
        assert_eq!(f.ledger.metrics.hold_rejections_total.get(), 1);
    }

    #[test]
    fn test_hold_ttl_bounds() {
        let f = fixture();
        let now = Utc::now();

        let err = f
            .ledger
            .hold_at(
                &s1(),
                &driver("a"),
                HoldRequest {
                    ttl: Some(Duration::ZERO),
                    ..Default::default()
                },
                now,
            )
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");

        let reservation = f
            .ledger
            .hold_at(
                &s1(),
                &driver("a"),
                HoldRequest {
                    ttl: Some(Duration::from_secs(3600)),
                    ..Default::default()
                },
                now,
            )
            .unwrap();
        assert_eq!(reservation.expires_at, now + ChronoDuration::seconds(900));
    }

    #[test]
    fn test_hold_unknown_spot() {
        let f = fixture();
        let err = f
            .ledger
            .hold(&SpotId::new("nope"), &driver("a"), HoldRequest::default())
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_hold_with_stale_version() {
        let f = fixture();
        let err = f
            .ledger
            .hold(
                &s1(),
                &driver("a"),
                HoldRequest {
                    expected_version: Some(7),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::VersionConflict { expected: 7, actual: 1, .. }));
    }

    #[test]
    fn test_confirm_and_release() {
        let f = fixture();
        let now = Utc::now();
        let held = f
            .ledger
            .hold_at(&s1(), &driver("a"), HoldRequest::default(), now)
            .unwrap();

        let active = f
            .ledger
            .confirm_at(&held.id, &held.check_in_token, now + ChronoDuration::minutes(1))
            .unwrap();
        assert_eq!(active.state, ReservationState::Active);
        assert_eq!(f.registry.get(&s1()).unwrap().status, SpotStatus::Occupied);

        let done = f
            .ledger
            .release_at(&held.id, now + ChronoDuration::hours(2))
            .unwrap();
        assert_eq!(done.state, ReservationState::Completed);

        let spot = f.registry.get(&s1()).unwrap();
        assert_eq!(spot.status, SpotStatus::Free);
        assert_eq!(spot.reservation_id, None);

        // Second release is a no-op
        let again = f.ledger.release(&held.id).unwrap();
        assert_eq!(again.version, done.version);
        assert_eq!(f.registry.get(&s1()).unwrap().version, spot.version);
    }

    #[test]
    fn test_confirm_with_wrong_token() {
        let f = fixture();
        let held = f
            .ledger
            .hold(&s1(), &driver("a"), HoldRequest::default())
            .unwrap();

        let err = f
            .ledger
            .confirm(&held.id, &CheckInToken::new("forged"))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidToken(_)));
        assert_eq!(
            f.ledger.get(&held.id).unwrap().state,
            ReservationState::Pending
        );
    }

    #[test]
    fn test_confirm_after_expiry() {
        let f = fixture();
        let now = Utc::now();
        let held = f
            .ledger
            .hold_at(&s1(), &driver("a"), HoldRequest::default(), now)
            .unwrap();

        let late = held.expires_at + ChronoDuration::seconds(1);
        let err = f
            .ledger
            .confirm_at(&held.id, &held.check_in_token, late)
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExpired(_)));

        let stored = f.ledger.load(&held.id).unwrap();
        assert_eq!(stored.state, ReservationState::Expired);
        assert_eq!(f.registry.get(&s1()).unwrap().status, SpotStatus::Free);

        // Expired is terminal
        let err = f
            .ledger
            .confirm_at(&held.id, &held.check_in_token, late)
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExpired(_)));
    }

    #[test]
    fn test_lapsed_hold_with_wrong_token_is_expired() {
        let swept = fixture();
        let unswept = fixture();
        let now = Utc::now();
        let forged = CheckInToken::new("forged");

        let a = swept
            .ledger
            .hold_at(&s1(), &driver("a"), HoldRequest::default(), now)
            .unwrap();
        let b = unswept
            .ledger
            .hold_at(&s1(), &driver("a"), HoldRequest::default(), now)
            .unwrap();

        let late = a.expires_at + ChronoDuration::seconds(1);
        assert_eq!(swept.ledger.expire_due_at(late).unwrap().len(), 1);

        let after_sweep = swept.ledger.confirm_at(&a.id, &forged, late).unwrap_err();
        let without_sweep = unswept.ledger.confirm_at(&b.id, &forged, late).unwrap_err();
        assert!(matches!(after_sweep, Error::AlreadyExpired(_)));
        assert!(matches!(without_sweep, Error::AlreadyExpired(_)));

        // The refused confirm still writes the expiry back
        let stored = unswept.ledger.load(&b.id).unwrap();
        assert_eq!(stored.state, ReservationState::Expired);
        assert_eq!(unswept.registry.get(&s1()).unwrap().status, SpotStatus::Free);
    }

    #[test]
    fn test_release_of_pending_is_wrong_state() {
        let f = fixture();
        let held = f
            .ledger
            .hold(&s1(), &driver("a"), HoldRequest::default())
            .unwrap();

        let err = f.ledger.release(&held.id).unwrap_err();
        assert!(matches!(
            err,
            Error::WrongState {
                state: ReservationState::Pending,
                attempted: ReservationState::Completed,
                ..
            }
        ));
    }

    #[test]
    fn test_cancel_frees_spot() {
        let f = fixture();
        let held = f
            .ledger
            .hold(&s1(), &driver("a"), HoldRequest::default())
            .unwrap();

        let cancelled = f.ledger.cancel(&held.id).unwrap();
        assert_eq!(cancelled.state, ReservationState::Cancelled);
        assert_eq!(f.registry.get(&s1()).unwrap().status, SpotStatus::Free);

        let err = f.ledger.cancel(&held.id).unwrap_err();
        assert_eq!(err.kind(), "wrong_state");

        // Spot can be held again
        f.ledger
            .hold(&s1(), &driver("b"), HoldRequest::default())
            .unwrap();
    }

    #[test]
    fn test_lapsed_hold_is_displaced() {
        let f = fixture();
        let now = Utc::now();
        let first = f
            .ledger
            .hold_at(&s1(), &driver("a"), HoldRequest::default(), now)
            .unwrap();

        let later = first.expires_at + ChronoDuration::seconds(1);
        let spot = f.registry.get(&s1()).unwrap();
        assert_eq!(spot.effective_status(later), SpotStatus::Free);

        let second = f
            .ledger
            .hold_at(&s1(), &driver("b"), HoldRequest::default(), later)
            .unwrap();

        assert_eq!(
            f.ledger.load(&first.id).unwrap().state,
            ReservationState::Expired
        );
        let spot = f.registry.get(&s1()).unwrap();
        assert_eq!(spot.reservation_id, Some(second.id));
        assert_eq!(spot.status, SpotStatus::Held);
    }

    #[test]
    fn test_expire_due() {
        let f = fixture();
        let now = Utc::now();
        let short = HoldRequest {
            ttl: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        let a = f.ledger.hold_at(&s1(), &driver("a"), short.clone(), now).unwrap();
        let b = f
            .ledger
            .hold_at(&SpotId::new("S2"), &driver("b"), HoldRequest::default(), now)
            .unwrap();

        let expired = f
            .ledger
            .expire_due_at(now + ChronoDuration::seconds(61))
            .unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, a.id);
        assert_eq!(f.ledger.load(&b.id).unwrap().state, ReservationState::Pending);
        assert_eq!(f.registry.get(&s1()).unwrap().status, SpotStatus::Free);

        // Nothing left to do
        assert!(f
            .ledger
            .expire_due_at(now + ChronoDuration::seconds(61))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_get_projects_lazy_expiry() {
        let f = fixture();
        let now = Utc::now();
        let held = f
            .ledger
            .hold_at(&s1(), &driver("a"), HoldRequest::default(), now)
            .unwrap();

        let seen = f
            .ledger
            .get_at(&held.id, held.expires_at + ChronoDuration::seconds(1))
            .unwrap();
        assert_eq!(seen.state, ReservationState::Expired);
        assert_eq!(f.ledger.load(&held.id).unwrap().state, ReservationState::Pending);
    }

    #[test]
    fn test_out_of_service() {
        let f = fixture();
        let spot = f.registry.get(&s1()).unwrap();

        let err = f
            .ledger
            .set_out_of_service(&s1(), true, spot.version + 1)
            .unwrap_err();
        assert!(err.is_retryable());

        let spot = f.ledger.set_out_of_service(&s1(), true, spot.version).unwrap();
        assert_eq!(spot.status, SpotStatus::OutOfService);

        let err = f
            .ledger
            .hold(&s1(), &driver("a"), HoldRequest::default())
            .unwrap_err();
        assert!(matches!(err, Error::SpotUnavailable(_)));

        let spot = f.ledger.set_out_of_service(&s1(), false, spot.version).unwrap();
        assert_eq!(spot.status, SpotStatus::Free);
    }

    #[test]
    fn test_remove_spot_with_live_reservation() {
        let f = fixture();
        let now = Utc::now();
        let held = f
            .ledger
            .hold_at(&s1(), &driver("a"), HoldRequest::default(), now)
            .unwrap();

        let err = f.ledger.remove_spot(&s1(), now).unwrap_err();
        assert!(matches!(err, Error::SpotUnavailable(_)));

        // Once the hold lapses the spot can go
        let later = held.expires_at + ChronoDuration::seconds(1);
        f.ledger.remove_spot(&s1(), later).unwrap();
        assert!(f.registry.get(&s1()).is_err());
        assert_eq!(f.ledger.load(&held.id).unwrap().state, ReservationState::Expired);

        // The lock table does not keep removed spots
        assert!(!f.ledger.locks.contains_key(&s1()));
    }

    #[test]
    fn test_holder_limit() {
        let f = fixture();
        let now = Utc::now();
        let s2 = SpotId::new("S2");
        let first = f
            .ledger
            .hold_at(&s1(), &driver("a"), HoldRequest::default(), now)
            .unwrap();

        let err = f
            .ledger
            .hold_at(&s2, &driver("a"), HoldRequest::default(), now)
            .unwrap_err();
        assert!(matches!(err, Error::HolderLimitReached { limit: 1, .. }));
        assert_eq!(f.registry.get(&s2).unwrap().status, SpotStatus::Free);

        // Another holder is unaffected
        let other = f
            .ledger
            .hold_at(&s2, &driver("b"), HoldRequest::default(), now)
            .unwrap();
        f.ledger.cancel_at(&other.id, now).unwrap();

        // A lapsed hold no longer counts
        let later = first.expires_at + ChronoDuration::seconds(1);
        f.ledger
            .hold_at(&s2, &driver("a"), HoldRequest::default(), later)
            .unwrap();
    }

    #[test]
    fn test_holder_limit_holds_under_concurrency() {
        let f = fixture_with(LedgerConfig {
            lock_timeout_ms: 5_000,
            ..LedgerConfig::default()
        });
        for id in ["S3", "S4", "S5", "S6"] {
            f.registry
                .register(Spot::new(id, GeoPoint::new(52.52, 13.405), "Z1", id))
                .unwrap();
        }
        let ledger = Arc::new(f.ledger);

        let handles: Vec<_> = ["S1", "S2", "S3", "S4", "S5", "S6"]
            .into_iter()
            .map(|id| {
                let ledger = ledger.clone();
                std::thread::spawn(move || {
                    ledger.hold(&SpotId::new(id), &driver("a"), HoldRequest::default())
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        for result in results.iter().filter(|r| r.is_err()) {
            let err = result.as_ref().unwrap_err();
            assert!(matches!(err, Error::HolderLimitReached { .. }));
        }
    }

    #[test]
    fn test_unlimited_holder() {
        let f = fixture_with(LedgerConfig {
            max_live_per_holder: 0,
            ..LedgerConfig::default()
        });
        f.ledger
            .hold(&s1(), &driver("a"), HoldRequest::default())
            .unwrap();
        f.ledger
            .hold(&SpotId::new("S2"), &driver("a"), HoldRequest::default())
            .unwrap();
    }

    #[test]
    fn test_reminders_sent_once() {
        let f = fixture();
        let now = Utc::now();
        let lead = Duration::from_secs(60);
        let held = f
            .ledger
            .hold_at(&s1(), &driver("a"), HoldRequest::default(), now)
            .unwrap();

        // Too early
        assert!(f.ledger.remind_expiring_at(now, lead).unwrap().is_empty());

        let soon = held.expires_at - ChronoDuration::seconds(30);
        let reminded = f.ledger.remind_expiring_at(soon, lead).unwrap();
        assert_eq!(reminded.len(), 1);
        assert_eq!(reminded[0].id, held.id);

        // Once per hold
        let sooner = held.expires_at - ChronoDuration::seconds(10);
        assert!(f.ledger.remind_expiring_at(sooner, lead).unwrap().is_empty());
        assert_eq!(f.ledger.metrics.reminders_total.get(), 1);

        // A lapsed hold gets no reminder
        let late = held.expires_at + ChronoDuration::seconds(1);
        f.ledger.cancel_at(&held.id, soon).unwrap();
        assert!(f.ledger.remind_expiring_at(late, lead).unwrap().is_empty());
        assert!(f.ledger.reminded.is_empty());
    }

    #[test]
    fn test_lock_timeout() {
        let f = fixture_with(LedgerConfig {
            lock_timeout_ms: 10,
            ..LedgerConfig::default()
        });

        let lock = f.ledger.spot_lock(&s1());
        let _held = lock.lock();

        let err = f
            .ledger
            .hold(&s1(), &driver("a"), HoldRequest::default())
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(f.ledger.metrics.lock_timeouts_total.get(), 1);
    }

    #[test]
    fn test_concurrent_holds_single_winner() {
        let f = fixture();
        let ledger = Arc::new(f.ledger);

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let ledger = ledger.clone();
                std::thread::spawn(move || {
                    ledger.hold(&s1(), &driver(&format!("d{}", i)), HoldRequest::default())
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        for result in results.iter().filter(|r| r.is_err()) {
            let err = result.as_ref().unwrap_err();
            assert!(matches!(err, Error::SpotUnavailable(_) | Error::Timeout(_)));
        }
    }

    #[test]
    fn test_holder_listing_newest_first() {
        let f = fixture_with(LedgerConfig {
            max_live_per_holder: 0,
            ..LedgerConfig::default()
        });
        let now = Utc::now();
        let first = f
            .ledger
            .hold_at(&s1(), &driver("a"), HoldRequest::default(), now)
            .unwrap();
        let second = f
            .ledger
            .hold_at(
                &SpotId::new("S2"),
                &driver("a"),
                HoldRequest::default(),
                now + ChronoDuration::seconds(1),
            )
            .unwrap();

        let mine = f.ledger.reservations_for_holder(&driver("a")).unwrap();
        assert_eq!(
            mine.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![second.id, first.id]
        );
        assert!(f.ledger.reservations_for_holder(&driver("b")).unwrap().is_empty());
    }
}
