//! Core types for the engine
//!
//! All persisted types are designed for:
//! - Deterministic serialization (bincode in the store, JSON on the wire)
//! - Optimistic concurrency (every mutable record carries a `version`)
//! - Derived state (spot status is a projection of reservation state)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create new identifier
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get as string
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Stable spot identifier (operator assigned)
    SpotId
);

string_id!(
    /// Operator-defined grouping of spots (e.g. a garage level)
    ZoneId
);

string_id!(
    /// Verified driver identity, supplied by the identity provider
    HolderId
);

/// Reservation identifier (UUIDv7 for time-ordering)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReservationId(Uuid);

impl ReservationId {
    /// Generate a new time-ordered id
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Wrap an existing UUID
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ReservationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ReservationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// WGS84 coordinate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Latitude in degrees, [-90, 90]
    pub latitude: f64,
    /// Longitude in degrees, [-180, 180]
    pub longitude: f64,
}

impl GeoPoint {
    /// Create a point
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check coordinate ranges
    pub fn validate(&self) -> crate::Result<()> {
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(crate::Error::InvalidArgument(format!(
                "latitude out of range: {}",
                self.latitude
            )));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(crate::Error::InvalidArgument(format!(
                "longitude out of range: {}",
                self.longitude
            )));
        }
        Ok(())
    }

    /// Great-circle distance in meters
    pub fn distance_to(&self, other: &GeoPoint) -> f64 {
        crate::geo::haversine_distance(self, other)
    }
}

/// Axis-aligned latitude/longitude rectangle
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Southern edge
    pub min_lat: f64,
    /// Western edge
    pub min_lon: f64,
    /// Northern edge
    pub max_lat: f64,
    /// Eastern edge
    pub max_lon: f64,
}

impl BoundingBox {
    /// Create from corners
    pub fn new(min_lat: f64, min_lon: f64, max_lat: f64, max_lon: f64) -> Self {
        Self {
            min_lat,
            min_lon,
            max_lat,
            max_lon,
        }
    }

    /// Smallest box containing the circle of `radius_m` around `center`
    ///
    /// Bounds are spherical, on the same earth radius as the distance
    /// check, and padded by a hair so points exactly on the circle survive
    /// float rounding.
    pub fn around(center: &GeoPoint, radius_m: f64) -> Self {
        const PAD_DEG: f64 = 1e-9;

        let angular = radius_m / crate::geo::EARTH_RADIUS_METERS;
        let lat_delta = angular.to_degrees() + PAD_DEG;
        let min_lat = center.latitude - lat_delta;
        let max_lat = center.latitude + lat_delta;

        let cos_lat = center.latitude.to_radians().cos();
        let lon_delta = if min_lat <= -90.0 || max_lat >= 90.0 || angular.sin() >= cos_lat {
            // The circle reaches a pole
            360.0
        } else {
            (angular.sin() / cos_lat).asin().to_degrees() + PAD_DEG
        };

        Self {
            min_lat: min_lat.max(-90.0),
            min_lon: (center.longitude - lon_delta).max(-180.0),
            max_lat: max_lat.min(90.0),
            max_lon: (center.longitude + lon_delta).min(180.0),
        }
    }

    /// Check corner ordering and ranges
    pub fn validate(&self) -> crate::Result<()> {
        GeoPoint::new(self.min_lat, self.min_lon).validate()?;
        GeoPoint::new(self.max_lat, self.max_lon).validate()?;
        if self.min_lat > self.max_lat || self.min_lon > self.max_lon {
            return Err(crate::Error::InvalidArgument(
                "bounding box corners are inverted".to_string(),
            ));
        }
        Ok(())
    }

    /// Point containment (edges inclusive)
    pub fn contains(&self, point: &GeoPoint) -> bool {
        point.latitude >= self.min_lat
            && point.latitude <= self.max_lat
            && point.longitude >= self.min_lon
            && point.longitude <= self.max_lon
    }
}

/// Published spot status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SpotStatus {
    /// No live reservation
    Free = 1,
    /// Pending reservation (hold)
    Held = 2,
    /// Active reservation (checked in)
    Occupied = 3,
    /// Operator override
    OutOfService = 4,
}

impl SpotStatus {
    /// Status as a pure function of the bound reservation state
    pub fn derive(reservation: Option<ReservationState>, out_of_service: bool) -> Self {
        if out_of_service {
            return SpotStatus::OutOfService;
        }
        match reservation {
            Some(ReservationState::Pending) => SpotStatus::Held,
            Some(ReservationState::Active) => SpotStatus::Occupied,
            _ => SpotStatus::Free,
        }
    }
}

impl fmt::Display for SpotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SpotStatus::Free => "free",
            SpotStatus::Held => "held",
            SpotStatus::Occupied => "occupied",
            SpotStatus::OutOfService => "out_of_service",
        };
        f.write_str(s)
    }
}

/// Parking spot record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spot {
    /// Spot ID
    pub id: SpotId,

    /// Physical location
    pub location: GeoPoint,

    /// Zone this spot reports into
    pub zone_id: ZoneId,

    /// Display label ("Level 2 - B14")
    pub label: String,

    /// Street address
    pub address: Option<String>,

    /// Current status (derived, see [`SpotStatus::derive`])
    pub status: SpotStatus,

    /// Operator override flag
    pub out_of_service: bool,

    /// Reservation currently bound to this spot
    pub reservation_id: Option<ReservationId>,

    /// Expiry of the bound hold, while status is Held
    pub held_until: Option<DateTime<Utc>>,

    /// Optimistic concurrency counter
    pub version: u64,
}

impl Spot {
    /// Create a free spot at version 1
    pub fn new(
        id: impl Into<SpotId>,
        location: GeoPoint,
        zone_id: impl Into<ZoneId>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            location,
            zone_id: zone_id.into(),
            label: label.into(),
            address: None,
            status: SpotStatus::Free,
            out_of_service: false,
            reservation_id: None,
            held_until: None,
            version: 1,
        }
    }

    /// Set street address
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Status as seen by a reader at `now`
    ///
    /// A hold past its expiry reads as Free even before the sweep runs.
    pub fn effective_status(&self, now: DateTime<Utc>) -> SpotStatus {
        match (self.status, self.held_until) {
            (SpotStatus::Held, Some(until)) if now > until => SpotStatus::Free,
            (status, _) => status,
        }
    }
}

/// Reservation lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ReservationState {
    /// Hold placed, awaiting check-in
    Pending = 1,
    /// Checked in
    Active = 2,
    /// Checked out (terminal)
    Completed = 3,
    /// Hold lapsed (terminal)
    Expired = 4,
    /// Hold withdrawn by the driver (terminal)
    Cancelled = 5,
}

impl ReservationState {
    /// Legal edges: Pending→Active→Completed, Pending→Expired, Pending→Cancelled
    pub fn can_transition_to(self, next: ReservationState) -> bool {
        use ReservationState::*;
        matches!(
            (self, next),
            (Pending, Active) | (Active, Completed) | (Pending, Expired) | (Pending, Cancelled)
        )
    }

    /// Pending or Active
    pub fn is_live(self) -> bool {
        matches!(self, ReservationState::Pending | ReservationState::Active)
    }

    /// Completed, Expired or Cancelled
    pub fn is_terminal(self) -> bool {
        !self.is_live()
    }
}

impl fmt::Display for ReservationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReservationState::Pending => "pending",
            ReservationState::Active => "active",
            ReservationState::Completed => "completed",
            ReservationState::Expired => "expired",
            ReservationState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Opaque check-in credential bound to a reservation at creation
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckInToken(String);

impl CheckInToken {
    /// Generate a random 128-bit token (32 hex chars)
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self(hex::encode(bytes))
    }

    /// Wrap a scanned value
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Constant-time comparison against a presented token
    pub fn matches(&self, presented: &CheckInToken) -> bool {
        let a = self.0.as_bytes();
        let b = presented.0.as_bytes();
        if a.len() != b.len() {
            return false;
        }
        a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
    }
}

// Tokens are credentials; keep them out of logs.
impl fmt::Debug for CheckInToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CheckInToken(..)")
    }
}

/// Reservation record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    /// Reservation ID
    pub id: ReservationId,

    /// Reserved spot
    pub spot_id: SpotId,

    /// Driver holding the reservation
    pub holder_id: HolderId,

    /// Vehicle reference supplied by the driver
    pub vehicle_id: Option<String>,

    /// Stored lifecycle state
    pub state: ReservationState,

    /// Hold creation time
    pub created_at: DateTime<Utc>,

    /// Hold expiry (check-in deadline)
    pub expires_at: DateTime<Utc>,

    /// Credential encoded into the QR code
    pub check_in_token: CheckInToken,

    /// Time of check-in
    pub checked_in_at: Option<DateTime<Utc>>,

    /// Time of the terminal transition
    pub closed_at: Option<DateTime<Utc>>,

    /// Optimistic concurrency counter
    pub version: u64,
}

impl Reservation {
    /// Create a pending hold
    pub fn pending(
        spot_id: SpotId,
        holder_id: HolderId,
        vehicle_id: Option<String>,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Self {
        Self {
            id: ReservationId::new(),
            spot_id,
            holder_id,
            vehicle_id,
            state: ReservationState::Pending,
            created_at: now,
            expires_at: now + ttl,
            check_in_token: CheckInToken::generate(),
            checked_in_at: None,
            closed_at: None,
            version: 1,
        }
    }

    /// Pending and past its deadline at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.state == ReservationState::Pending && now > self.expires_at
    }

    /// State as seen by a reader at `now` (lazy expiry)
    pub fn effective_state(&self, now: DateTime<Utc>) -> ReservationState {
        if self.is_expired_at(now) {
            ReservationState::Expired
        } else {
            self.state
        }
    }

    /// Pending-and-unexpired or Active at `now`
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.effective_state(now).is_live()
    }

    /// Apply a state transition, enforcing legal edges and bumping the version
    pub fn transition(&mut self, next: ReservationState, now: DateTime<Utc>) -> crate::Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(crate::Error::WrongState {
                reservation_id: self.id,
                state: self.state,
                attempted: next,
            });
        }

        self.state = next;
        match next {
            ReservationState::Active => self.checked_in_at = Some(now),
            _ => self.closed_at = Some(now),
        }
        self.version += 1;

        Ok(())
    }
}

/// Direction of a gate scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Arrival
    In,
    /// Departure
    Out,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::In => f.write_str("in"),
            Direction::Out => f.write_str("out"),
        }
    }
}

/// A QR scan at the spot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckInEvent {
    /// Reservation encoded in the QR payload
    pub reservation_id: ReservationId,

    /// Token read from the QR payload
    pub scanned_token: CheckInToken,

    /// Scan time
    pub timestamp: DateTime<Utc>,

    /// Arrival or departure
    pub direction: Direction,
}

/// Point-in-time availability of one zone
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailabilitySnapshot {
    /// Zone
    pub zone_id: ZoneId,

    /// Number of spots reading Free
    pub free_count: usize,

    /// Status per spot
    pub spot_statuses: BTreeMap<SpotId, SpotStatus>,

    /// Zone revision this snapshot reflects
    pub as_of_version: u64,

    /// When the snapshot was derived
    pub generated_at: DateTime<Utc>,
}

impl AvailabilitySnapshot {
    /// Empty snapshot for a zone with no spots
    pub fn empty(zone_id: ZoneId) -> Self {
        Self {
            zone_id,
            free_count: 0,
            spot_statuses: BTreeMap::new(),
            as_of_version: 0,
            generated_at: Utc::now(),
        }
    }
}
