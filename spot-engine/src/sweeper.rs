//! Periodic expiry sweep
//!
//! Expiry is already enforced lazily by every reader; the sweep only writes
//! lapsed holds back so that spots and snapshots converge without waiting
//! for the next operation on each spot. A failed or skipped tick is harmless.
//!
//! The same tick sends `ExpiringSoon` reminders for holds that lapse within
//! the configured lead time.

use crate::ledger::ReservationLedger;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Running sweep task
pub struct ExpirySweeper {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ExpirySweeper {
    /// Start sweeping every `period`, reminding holders `reminder_lead` ahead
    pub fn start(
        ledger: Arc<ReservationLedger>,
        period: Duration,
        reminder_lead: Option<Duration>,
    ) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            tracing::info!(interval_ms = period.as_millis() as u64, "Expiry sweeper started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        sweep_once(ledger.clone(), reminder_lead).await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            tracing::info!("Expiry sweeper stopped");
        });

        Self { shutdown, task }
    }

    /// Stop the sweep and wait for the current tick to finish
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::error!("Expiry sweeper task failed: {}", e);
        }
    }
}

/// One pass over lapsed holds, then over holds due a reminder
///
/// Runs on the blocking pool since per-spot locks are synchronous. Returns
/// the number of holds expired.
pub async fn sweep_once(ledger: Arc<ReservationLedger>, reminder_lead: Option<Duration>) -> usize {
    let expired = match tokio::task::spawn_blocking({
        let ledger = ledger.clone();
        move || ledger.expire_due()
    })
    .await
    {
        Ok(Ok(expired)) => {
            if !expired.is_empty() {
                tracing::info!(count = expired.len(), "Expired lapsed holds");
            }
            expired.len()
        }
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "Expiry sweep failed, retrying next tick");
            0
        }
        Err(e) => {
            tracing::error!("Expiry sweep panicked: {}", e);
            0
        }
    };

    if let Some(lead) = reminder_lead {
        match tokio::task::spawn_blocking(move || ledger.remind_expiring(lead)).await {
            Ok(Ok(reminded)) if !reminded.is_empty() => {
                tracing::info!(count = reminded.len(), "Sent expiry reminders");
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "Reminder pass failed, retrying next tick"),
            Err(e) => tracing::error!("Reminder pass panicked: {}", e),
        }
    }

    expired
}
