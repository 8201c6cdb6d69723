//! Spot Reservation & Availability Engine
//!
//! Real-time parking availability with conflict-free reservations.
//!
//! # Architecture
//!
//! - **Spatial index**: grid-sharded radius, bounding-box and cluster queries
//! - **Derived status**: a spot's status is a projection of its reservation
//! - **Atomic holds**: per-spot lock plus version compare-and-set
//! - **Lazy expiry**: lapsed holds read as expired before any sweep runs
//! - **Coalesced feed**: per-zone snapshots pushed to subscribers
//!
//! # Invariants
//!
//! - At most one live (Pending or Active) reservation per spot
//! - Reservation states only move forward
//! - Snapshot `as_of_version` never decreases per zone

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, clippy::all)]

pub mod api;
pub mod audit;
pub mod checkin;
pub mod config;
pub mod engine;
pub mod error;
pub mod feed;
pub mod geo;
pub mod ledger;
pub mod metrics;
pub mod notify;
pub mod registry;
#[cfg(feature = "rocksdb")]
pub mod storage;
pub mod store;
pub mod sweeper;
pub mod types;

// Re-exports
pub use config::Config;
pub use engine::{NearbySpot, SpotEngine};
pub use error::{Error, Result};
pub use ledger::{HoldRequest, ReservationLedger};
pub use types::{
    AvailabilitySnapshot, BoundingBox, CheckInEvent, CheckInToken, Direction, GeoPoint, HolderId,
    Reservation, ReservationId, ReservationState, Spot, SpotId, SpotStatus, ZoneId,
};
