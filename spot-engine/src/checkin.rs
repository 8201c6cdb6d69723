//! Gate check-in protocol
//!
//! Binds a scanned QR token to its reservation and drives the two gate
//! transitions:
//! - `In`: Pending → Active (requires matching token and a scan time no
//!   later than the hold's expiry)
//! - `Out`: Active → Completed
//!
//! Every scan that names a reservation is audited, whatever its outcome.
//!
//! QR payloads have the form `spot:<reservation id>:<token>`.

use crate::audit::{AuditEntry, AuditHandle, AuditOutcome};
use crate::ledger::ReservationLedger;
use crate::metrics::Metrics;
use crate::types::{
    CheckInEvent, CheckInToken, Direction, Reservation, ReservationId, ReservationState,
};
use crate::{Error, Result};
use chrono::Utc;
use std::sync::Arc;

const QR_PREFIX: &str = "spot";

/// QR payload for a reservation
pub fn qr_payload(reservation: &Reservation) -> String {
    format!(
        "{}:{}:{}",
        QR_PREFIX,
        reservation.id,
        reservation.check_in_token.as_str()
    )
}

/// Split a QR payload into reservation id and token
pub fn parse_qr_payload(payload: &str) -> Result<(ReservationId, CheckInToken)> {
    let malformed = || Error::InvalidToken("malformed QR payload".to_string());

    let mut parts = payload.trim().splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(QR_PREFIX), Some(id), Some(token)) if !token.is_empty() => {
            let reservation_id = id.parse().map_err(|_| malformed())?;
            Ok((reservation_id, CheckInToken::new(token)))
        }
        _ => Err(malformed()),
    }
}

/// Check-in state machine
pub struct CheckInProtocol {
    ledger: Arc<ReservationLedger>,
    audit: AuditHandle,
    metrics: Arc<Metrics>,
}

impl CheckInProtocol {
    /// Create protocol over the ledger
    pub fn new(ledger: Arc<ReservationLedger>, audit: AuditHandle, metrics: Arc<Metrics>) -> Self {
        Self {
            ledger,
            audit,
            metrics,
        }
    }

    /// Parse a QR payload scanned now and handle it
    pub fn scan(&self, payload: &str, direction: Direction) -> Result<Reservation> {
        let (reservation_id, scanned_token) = parse_qr_payload(payload).map_err(|e| {
            self.metrics.checkin_rejections_total.inc();
            e
        })?;

        self.handle(&CheckInEvent {
            reservation_id,
            scanned_token,
            timestamp: Utc::now(),
            direction,
        })
    }

    /// Handle one scan
    ///
    /// Failures name the exact reason: `TokenMismatch`, `AlreadyExpired` or
    /// `WrongState` (plus `NotFound` for an unknown reservation).
    pub fn handle(&self, event: &CheckInEvent) -> Result<Reservation> {
        let current = self.ledger.get(&event.reservation_id);
        let spot_id = current.as_ref().ok().map(|r| r.spot_id.clone());

        let result = current.and_then(|current| match event.direction {
            Direction::In => self.check_in(&current, event),
            Direction::Out => self.check_out(&current, event),
        });

        let outcome = match &result {
            Ok(reservation) => AuditOutcome::Accepted {
                state: reservation.state,
            },
            Err(e) => {
                self.metrics.checkin_rejections_total.inc();
                tracing::info!(
                    reservation_id = %event.reservation_id,
                    direction = %event.direction,
                    reason = e.kind(),
                    "Gate scan rejected"
                );
                AuditOutcome::Rejected {
                    reason: e.kind().to_string(),
                }
            }
        };

        self.audit.record(AuditEntry {
            reservation_id: event.reservation_id,
            spot_id,
            direction: event.direction,
            scanned_at: event.timestamp,
            outcome,
        });

        result
    }

    fn check_in(&self, current: &Reservation, event: &CheckInEvent) -> Result<Reservation> {
        match current.state {
            ReservationState::Pending => {}
            ReservationState::Expired => return Err(Error::AlreadyExpired(current.id)),
            state => {
                return Err(Error::WrongState {
                    reservation_id: current.id,
                    state,
                    attempted: ReservationState::Active,
                })
            }
        }

        if event.timestamp > current.expires_at {
            return Err(Error::AlreadyExpired(current.id));
        }

        if !current.check_in_token.matches(&event.scanned_token) {
            return Err(Error::TokenMismatch(current.id));
        }

        self.ledger
            .confirm(&current.id, &event.scanned_token)
            .map_err(|e| match e {
                Error::InvalidToken(_) => Error::TokenMismatch(current.id),
                other => other,
            })
    }

    fn check_out(&self, current: &Reservation, event: &CheckInEvent) -> Result<Reservation> {
        if current.state != ReservationState::Active {
            return Err(Error::WrongState {
                reservation_id: current.id,
                state: current.state,
                attempted: ReservationState::Completed,
            });
        }

        if !current.check_in_token.matches(&event.scanned_token) {
            return Err(Error::TokenMismatch(current.id));
        }

        self.ledger.release(&current.id)
    }
}
