//! Holder notifications
//!
//! The ledger emits a [`ReservationNotice`] on check-in, check-out, hold
//! expiry, and shortly before a hold lapses. Delivery is fire-and-forget:
//! notices go through a bounded mailbox to a background task that hands them
//! to a [`NotificationDispatcher`]. A notice that finds the mailbox full is
//! dropped and counted in `spot_notifications_dropped_total`. Dispatch
//! failures are logged and never reach the operation that produced the
//! notice.

use crate::config::NotifyConfig;
use crate::metrics::Metrics;
use crate::types::{HolderId, Reservation, ReservationId, SpotId};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// What happened to the reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    /// Checked in
    Confirmed,
    /// Checked out
    Released,
    /// Hold lapsed before check-in
    Expired,
    /// Hold lapses soon
    ExpiringSoon,
}

/// Notice addressed to the reservation holder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationNotice {
    pub kind: NoticeKind,
    pub reservation_id: ReservationId,
    pub spot_id: SpotId,
    pub holder_id: HolderId,
    pub at: DateTime<Utc>,
}

impl ReservationNotice {
    /// Notice for a reservation that just changed state
    pub fn new(kind: NoticeKind, reservation: &Reservation, at: DateTime<Utc>) -> Self {
        Self {
            kind,
            reservation_id: reservation.id,
            spot_id: reservation.spot_id.clone(),
            holder_id: reservation.holder_id.clone(),
            at,
        }
    }

    /// Human-readable message
    pub fn message(&self) -> String {
        match self.kind {
            NoticeKind::Confirmed => format!("Checked in at spot {}", self.spot_id),
            NoticeKind::Released => format!("Checked out of spot {}", self.spot_id),
            NoticeKind::Expired => format!("Your hold on spot {} has expired", self.spot_id),
            NoticeKind::ExpiringSoon => {
                format!("Your hold on spot {} expires soon, check in to keep it", self.spot_id)
            }
        }
    }
}

/// Delivery channel (push service, SMS gateway, ...)
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    /// Deliver one notice to its holder
    async fn notify(&self, holder_id: &HolderId, notice: &ReservationNotice) -> Result<()>;
}

/// Dispatcher that writes notices to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDispatcher;

#[async_trait]
impl NotificationDispatcher for LogDispatcher {
    async fn notify(&self, holder_id: &HolderId, notice: &ReservationNotice) -> Result<()> {
        tracing::info!(
            holder_id = %holder_id,
            reservation_id = %notice.reservation_id,
            kind = ?notice.kind,
            "{}",
            notice.message()
        );
        Ok(())
    }
}

/// Sending side of the notifier
#[derive(Clone)]
pub struct NotifierHandle {
    sender: mpsc::Sender<ReservationNotice>,
    metrics: Arc<Metrics>,
}

impl NotifierHandle {
    /// Queue a notice; never blocks or fails the caller
    pub fn notify(&self, notice: ReservationNotice) {
        match self.sender.try_send(notice) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(notice)) => {
                self.metrics.notifications_dropped_total.inc();
                tracing::warn!(
                    reservation_id = %notice.reservation_id,
                    kind = ?notice.kind,
                    "Notifier mailbox full, notice dropped"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!("Notifier stopped, notice dropped")
            }
        }
    }
}

/// Spawn the delivery task
///
/// The task ends once every [`NotifierHandle`] is dropped.
pub fn spawn_notifier(
    dispatcher: Arc<dyn NotificationDispatcher>,
    config: &NotifyConfig,
    metrics: Arc<Metrics>,
) -> (NotifierHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<ReservationNotice>(config.mailbox_capacity);

    let task = tokio::spawn(async move {
        while let Some(notice) = rx.recv().await {
            if let Err(e) = dispatcher.notify(&notice.holder_id, &notice).await {
                tracing::warn!(
                    reservation_id = %notice.reservation_id,
                    error = %e,
                    "Notification delivery failed"
                );
            }
        }
        tracing::debug!("Notifier stopped");
    });

    (NotifierHandle { sender: tx, metrics }, task)
}
