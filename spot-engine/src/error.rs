//! Error types for the engine

use crate::types::{HolderId, ReservationId, ReservationState, SpotId};
use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Engine errors
#[derive(Error, Debug)]
pub enum Error {
    /// Spot already has a live reservation, or is out of service
    #[error("Spot unavailable: {0}")]
    SpotUnavailable(SpotId),

    /// Holder already has as many live reservations as allowed
    #[error("Holder {holder_id} already has {limit} live reservation(s)")]
    HolderLimitReached {
        /// Holder
        holder_id: HolderId,
        /// Configured limit
        limit: usize,
    },

    /// Optimistic write against a stale version
    #[error("Version conflict on {key}: expected {expected}, found {actual}")]
    VersionConflict {
        /// Record key
        key: String,
        /// Version the caller presented
        expected: u64,
        /// Version currently stored (0 if absent)
        actual: u64,
    },

    /// Token presented to `confirm` does not match, or QR payload is malformed
    #[error("Invalid token for reservation {0}")]
    InvalidToken(String),

    /// Token scanned at the gate does not match the reservation
    #[error("Token mismatch for reservation {0}")]
    TokenMismatch(ReservationId),

    /// Hold passed its check-in deadline
    #[error("Reservation {0} already expired")]
    AlreadyExpired(ReservationId),

    /// Transition not allowed from the current state
    #[error("Reservation {reservation_id} is {state}, cannot move to {attempted}")]
    WrongState {
        /// Reservation
        reservation_id: ReservationId,
        /// Current state
        state: ReservationState,
        /// Requested state
        attempted: ReservationState,
    },

    /// Unknown id
    #[error("Not found: {0}")]
    NotFound(String),

    /// Bounded wait exceeded
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Rejected input
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Concurrency error (actor mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable snake_case name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Error::SpotUnavailable(_) => "spot_unavailable",
            Error::HolderLimitReached { .. } => "holder_limit_reached",
            Error::VersionConflict { .. } => "version_conflict",
            Error::InvalidToken(_) => "invalid_token",
            Error::TokenMismatch(_) => "token_mismatch",
            Error::AlreadyExpired(_) => "already_expired",
            Error::WrongState { .. } => "wrong_state",
            Error::NotFound(_) => "not_found",
            Error::Timeout(_) => "timeout",
            Error::InvalidArgument(_) => "invalid_argument",
            Error::Storage(_) => "storage",
            Error::Serialization(_) => "serialization",
            Error::Concurrency(_) => "concurrency",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
        }
    }

    /// Whether the caller may retry the same operation unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::VersionConflict { .. } | Error::Timeout(_))
    }
}

#[cfg(feature = "rocksdb")]
impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        let conflict = Error::VersionConflict {
            key: "spot/S1".to_string(),
            expected: 3,
            actual: 4,
        };
        assert!(conflict.is_retryable());
        assert_eq!(conflict.kind(), "version_conflict");

        let unavailable = Error::SpotUnavailable(SpotId::new("S1"));
        assert!(!unavailable.is_retryable());
        assert_eq!(unavailable.to_string(), "Spot unavailable: S1");

        let limited = Error::HolderLimitReached {
            holder_id: HolderId::new("driver-a"),
            limit: 1,
        };
        assert!(!limited.is_retryable());
        assert_eq!(limited.kind(), "holder_limit_reached");
    }
}
