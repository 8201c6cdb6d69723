//! Check-in audit trail
//!
//! Every gate scan (accepted or rejected) becomes an [`AuditRecord`]. Records
//! form a SHA-256 hash chain so tampering with the retained window is
//! detectable, and each one is also emitted as a structured log line under
//! the `spot_engine::audit` target.
//!
//! Recording never blocks the scan: entries go through a bounded mailbox
//! with `try_send`, and an entry that finds the mailbox full is dropped and
//! counted in `spot_audit_dropped_total`.

use crate::config::AuditConfig;
use crate::metrics::Metrics;
use crate::types::{Direction, ReservationId, ReservationState, SpotId};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Result of a scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AuditOutcome {
    /// Scan moved the reservation to `state`
    Accepted { state: ReservationState },
    /// Scan refused with the given error kind
    Rejected { reason: String },
}

impl AuditOutcome {
    fn label(&self) -> String {
        match self {
            AuditOutcome::Accepted { state } => format!("accepted:{}", state),
            AuditOutcome::Rejected { reason } => format!("rejected:{}", reason),
        }
    }
}

/// Scan details handed to the audit actor
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub reservation_id: ReservationId,
    pub spot_id: Option<SpotId>,
    pub direction: Direction,
    pub scanned_at: DateTime<Utc>,
    pub outcome: AuditOutcome,
}

/// Chained audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Position in the trail
    pub sequence: u64,

    pub reservation_id: ReservationId,
    pub spot_id: Option<SpotId>,
    pub direction: Direction,

    /// Timestamp carried by the scan
    pub scanned_at: DateTime<Utc>,

    /// When the record was appended
    pub recorded_at: DateTime<Utc>,

    pub outcome: AuditOutcome,

    /// Hash of the preceding record (empty for the first)
    pub previous_hash: String,

    /// Hash over all fields above
    pub hash: String,
}

impl AuditRecord {
    fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.sequence.to_be_bytes());
        hasher.update(self.reservation_id.to_string().as_bytes());
        if let Some(spot_id) = &self.spot_id {
            hasher.update(spot_id.as_str().as_bytes());
        }
        hasher.update(self.direction.to_string().as_bytes());
        hasher.update(self.scanned_at.to_rfc3339().as_bytes());
        hasher.update(self.recorded_at.to_rfc3339().as_bytes());
        hasher.update(self.outcome.label().as_bytes());
        hasher.update(self.previous_hash.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Check the record against its own hash
    pub fn verify_hash(&self) -> bool {
        self.hash == self.compute_hash()
    }
}

#[derive(Debug)]
struct AuditLog {
    records: VecDeque<AuditRecord>,
    next_sequence: u64,
    last_hash: String,
    retained: usize,
}

impl AuditLog {
    fn append(&mut self, entry: AuditEntry) -> AuditRecord {
        let mut record = AuditRecord {
            sequence: self.next_sequence,
            reservation_id: entry.reservation_id,
            spot_id: entry.spot_id,
            direction: entry.direction,
            scanned_at: entry.scanned_at,
            recorded_at: Utc::now(),
            outcome: entry.outcome,
            previous_hash: self.last_hash.clone(),
            hash: String::new(),
        };
        record.hash = record.compute_hash();

        self.next_sequence += 1;
        self.last_hash = record.hash.clone();
        self.records.push_back(record.clone());
        while self.records.len() > self.retained {
            self.records.pop_front();
        }

        record
    }
}

/// Read side of the audit trail
#[derive(Clone)]
pub struct AuditTrail {
    log: Arc<RwLock<AuditLog>>,
}

impl AuditTrail {
    fn new(retained: usize) -> Self {
        Self {
            log: Arc::new(RwLock::new(AuditLog {
                records: VecDeque::new(),
                next_sequence: 0,
                last_hash: String::new(),
                retained: retained.max(1),
            })),
        }
    }

    /// Most recent records, newest first
    pub fn recent(&self, limit: usize) -> Vec<AuditRecord> {
        self.log.read().records.iter().rev().take(limit).cloned().collect()
    }

    /// Retained records for one reservation, oldest first
    pub fn for_reservation(&self, reservation_id: &ReservationId) -> Vec<AuditRecord> {
        self.log
            .read()
            .records
            .iter()
            .filter(|record| &record.reservation_id == reservation_id)
            .cloned()
            .collect()
    }

    /// Records currently retained
    pub fn len(&self) -> usize {
        self.log.read().records.len()
    }

    /// Whether nothing is retained
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Verify the hash chain over the retained window
    pub fn verify_integrity(&self) -> Result<()> {
        let log = self.log.read();
        let mut previous: Option<&AuditRecord> = None;

        for record in &log.records {
            if !record.verify_hash() {
                return Err(Error::Storage(format!(
                    "audit record {} hash mismatch",
                    record.sequence
                )));
            }
            if let Some(prev) = previous {
                if record.previous_hash != prev.hash {
                    return Err(Error::Storage(format!(
                        "audit chain broken at record {}",
                        record.sequence
                    )));
                }
            }
            previous = Some(record);
        }

        Ok(())
    }
}

impl std::fmt::Debug for AuditTrail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditTrail").field("len", &self.len()).finish()
    }
}

/// Message sent to the audit actor
pub enum AuditMessage {
    /// Append an entry
    Record(AuditEntry),

    /// Reply once every earlier entry is appended
    Flush { response: oneshot::Sender<()> },
}

/// Sending side of the audit trail
#[derive(Clone)]
pub struct AuditHandle {
    sender: mpsc::Sender<AuditMessage>,
    metrics: Arc<Metrics>,
}

impl AuditHandle {
    /// Record a scan without waiting
    pub fn record(&self, entry: AuditEntry) {
        match self.sender.try_send(AuditMessage::Record(entry)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(AuditMessage::Record(entry))) => {
                self.metrics.audit_dropped_total.inc();
                tracing::warn!(
                    reservation_id = %entry.reservation_id,
                    "Audit mailbox full, record dropped"
                );
            }
            Err(_) => tracing::warn!("Audit actor stopped, record dropped"),
        }
    }

    /// Wait until every entry sent so far is appended
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(AuditMessage::Flush { response: tx })
            .await
            .map_err(|_| Error::Concurrency("Audit mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))
    }
}

/// Spawn the audit actor
///
/// The actor stops once every [`AuditHandle`] is dropped.
pub fn spawn_audit_actor(
    config: &AuditConfig,
    metrics: Arc<Metrics>,
) -> (AuditHandle, AuditTrail, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(config.mailbox_capacity);
    let trail = AuditTrail::new(config.retained_records);
    let log = trail.log.clone();

    let task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match msg {
                AuditMessage::Record(entry) => {
                    let record = log.write().append(entry);
                    tracing::info!(
                        target: "spot_engine::audit",
                        sequence = record.sequence,
                        reservation_id = %record.reservation_id,
                        direction = %record.direction,
                        outcome = %record.outcome.label(),
                        hash = %record.hash,
                        "Check-in scan"
                    );
                }
                AuditMessage::Flush { response } => {
                    let _ = response.send(());
                }
            }
        }
        tracing::debug!("Audit actor stopped");
    });

    (AuditHandle { sender: tx, metrics }, trail, task)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(reservation_id: ReservationId, outcome: AuditOutcome) -> AuditEntry {
        AuditEntry {
            reservation_id,
            spot_id: Some(SpotId::new("S1")),
            direction: Direction::In,
            scanned_at: Utc::now(),
            outcome,
        }
    }

    fn accepted() -> AuditOutcome {
        AuditOutcome::Accepted {
            state: ReservationState::Active,
        }
    }

    #[tokio::test]
    async fn test_records_are_chained() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let (handle, trail, _task) = spawn_audit_actor(&AuditConfig::default(), metrics);

        let rid = ReservationId::new();
        handle.record(entry(rid, accepted()));
        handle.record(entry(
            rid,
            AuditOutcome::Rejected {
                reason: "token_mismatch".to_string(),
            },
        ));
        handle.record(entry(ReservationId::new(), accepted()));
        handle.flush().await.unwrap();

        assert_eq!(trail.len(), 3);
        trail.verify_integrity().unwrap();

        let mine = trail.for_reservation(&rid);
        assert_eq!(mine.len(), 2);
        assert_eq!(mine[0].sequence, 0);
        assert_eq!(mine[1].previous_hash, mine[0].hash);

        let recent = trail.recent(1);
        assert_eq!(recent[0].sequence, 2);
    }

    #[tokio::test]
    async fn test_tampering_detected() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let (handle, trail, _task) = spawn_audit_actor(&AuditConfig::default(), metrics);

        handle.record(entry(ReservationId::new(), accepted()));
        handle.record(entry(ReservationId::new(), accepted()));
        handle.flush().await.unwrap();

        trail.log.write().records[0].outcome = AuditOutcome::Rejected {
            reason: "forged".to_string(),
        };
        assert!(trail.verify_integrity().is_err());
    }

    #[tokio::test]
    async fn test_retention_window() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let config = AuditConfig {
            retained_records: 2,
            ..AuditConfig::default()
        };
        let (handle, trail, _task) = spawn_audit_actor(&config, metrics);

        for _ in 0..5 {
            handle.record(entry(ReservationId::new(), accepted()));
        }
        handle.flush().await.unwrap();

        assert_eq!(trail.len(), 2);
        assert_eq!(trail.recent(10)[1].sequence, 3);
        trail.verify_integrity().unwrap();
    }

    #[tokio::test]
    async fn test_full_mailbox_drops() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let (tx, _rx) = mpsc::channel(1);
        let handle = AuditHandle {
            sender: tx,
            metrics: metrics.clone(),
        };

        handle.record(entry(ReservationId::new(), accepted()));
        handle.record(entry(ReservationId::new(), accepted()));
        assert_eq!(metrics.audit_dropped_total.get(), 1);
    }
}
