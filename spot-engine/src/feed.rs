//! Availability feed
//!
//! Per-zone availability snapshots for point reads and streaming
//! subscriptions. Snapshots are derived from the registry; the feed never
//! holds state of its own beyond the last value published per zone.
//!
//! # Architecture
//!
//! ```text
//!   ReservationLedger ──zone_changed()──▶ FeedHandle
//!                                              │ dirty set + wake (bounded mpsc)
//!                                              ▼
//!                                        FeedActor (single task)
//!                                   timer: coalesce window, or max dirty zones
//!                                              │ refresh(zone)
//!                                              ▼
//!                               watch::Sender per zone ──▶ subscribers
//! ```
//!
//! Subscribers that fall behind only ever see the latest snapshot (watch
//! semantics), and a published snapshot never carries an `as_of_version`
//! lower than the one before it.

use crate::config::FeedConfig;
use crate::metrics::Metrics;
use crate::registry::SpotRegistry;
use crate::types::{AvailabilitySnapshot, SpotStatus, ZoneId};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_stream::wrappers::WatchStream;

/// Stream of snapshots for one zone; yields the current snapshot first
pub type SnapshotStream = WatchStream<Arc<AvailabilitySnapshot>>;

const MAX_SNAPSHOT_ATTEMPTS: usize = 3;

/// Snapshot derivation and subscriber registry
pub struct AvailabilityFeed {
    registry: Arc<SpotRegistry>,
    channels: DashMap<ZoneId, watch::Sender<Arc<AvailabilitySnapshot>>>,
}

impl AvailabilityFeed {
    /// Create feed over the registry
    pub fn new(registry: Arc<SpotRegistry>) -> Self {
        Self {
            registry,
            channels: DashMap::new(),
        }
    }

    /// Current availability of a zone
    pub fn snapshot(&self, zone_id: &ZoneId) -> Result<AvailabilitySnapshot> {
        self.snapshot_at(zone_id, Utc::now())
    }

    /// Availability of a zone as seen at `now`
    ///
    /// The zone revision is read on both sides of the listing; a listing
    /// that raced a write is retried a bounded number of times.
    pub fn snapshot_at(&self, zone_id: &ZoneId, now: DateTime<Utc>) -> Result<AvailabilitySnapshot> {
        let mut attempt = 0;
        loop {
            let before = self.registry.zone_revision(zone_id)?;
            let spots = self.registry.list(zone_id)?;
            let after = self.registry.zone_revision(zone_id)?;

            attempt += 1;
            if before != after && attempt < MAX_SNAPSHOT_ATTEMPTS {
                continue;
            }

            let spot_statuses: std::collections::BTreeMap<_, _> = spots
                .iter()
                .map(|spot| (spot.id.clone(), spot.effective_status(now)))
                .collect();
            let free_count = spot_statuses
                .values()
                .filter(|status| **status == SpotStatus::Free)
                .count();

            return Ok(AvailabilitySnapshot {
                zone_id: zone_id.clone(),
                free_count,
                spot_statuses,
                as_of_version: after,
                generated_at: now,
            });
        }
    }

    /// Subscribe to a zone
    ///
    /// Reconnecting clients simply subscribe again; the stream starts with
    /// the current snapshot.
    pub fn subscribe(&self, zone_id: &ZoneId) -> Result<SnapshotStream> {
        let receiver = match self.channels.entry(zone_id.clone()) {
            Entry::Occupied(entry) => entry.get().subscribe(),
            Entry::Vacant(entry) => {
                let snapshot = self.snapshot(zone_id)?;
                let (tx, rx) = watch::channel(Arc::new(snapshot));
                entry.insert(tx);
                rx
            }
        };

        // An existing channel may lag by up to one coalesce window
        self.refresh(zone_id)?;

        tracing::debug!(zone_id = %zone_id, "Availability subscriber added");
        Ok(WatchStream::new(receiver))
    }

    /// Zones with an open channel
    pub fn subscribed_zones(&self) -> usize {
        self.channels.len()
    }

    /// Recompute and publish a zone's snapshot to its subscribers
    pub(crate) fn refresh(&self, zone_id: &ZoneId) -> Result<()> {
        self.channels.remove_if(zone_id, |_, tx| tx.is_closed());

        let Some(tx) = self.channels.get(zone_id) else {
            return Ok(());
        };

        let next = self.snapshot(zone_id)?;
        let published = tx.send_if_modified(|current| {
            let newer = next.as_of_version > current.as_of_version
                || (next.as_of_version == current.as_of_version
                    && next.spot_statuses != current.spot_statuses);
            if newer {
                *current = Arc::new(next);
            }
            newer
        });

        if published {
            tracing::trace!(zone_id = %zone_id, "Availability snapshot published");
        }
        Ok(())
    }
}

impl std::fmt::Debug for AvailabilityFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AvailabilityFeed")
            .field("subscribed_zones", &self.channels.len())
            .finish()
    }
}

/// Message sent to the feed actor
pub enum FeedMessage {
    /// A zone became dirty
    ZonesDirty,

    /// Publish dirty zones now
    Flush { response: oneshot::Sender<()> },

    /// Publish dirty zones and stop
    Shutdown,
}

/// Actor that coalesces zone changes and republishes snapshots
pub struct FeedActor {
    feed: Arc<AvailabilityFeed>,
    mailbox: mpsc::Receiver<FeedMessage>,
    dirty: Arc<DashSet<ZoneId>>,
    coalesce_window: Duration,
    max_dirty_zones: usize,
    metrics: Arc<Metrics>,
}

impl FeedActor {
    /// Run the actor event loop
    pub async fn run(mut self) {
        let mut timer = interval(self.coalesce_window);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(msg) = self.mailbox.recv() => {
                    match msg {
                        FeedMessage::ZonesDirty => {
                            if self.dirty.len() >= self.max_dirty_zones {
                                self.flush();
                            }
                        }
                        FeedMessage::Flush { response } => {
                            self.flush();
                            let _ = response.send(());
                        }
                        FeedMessage::Shutdown => {
                            self.flush();
                            break;
                        }
                    }
                }

                _ = timer.tick(), if !self.dirty.is_empty() => {
                    self.flush();
                }

                else => {
                    self.flush();
                    break;
                }
            }
        }

        tracing::debug!("Feed actor stopped");
    }

    fn flush(&self) {
        if self.dirty.is_empty() {
            return;
        }

        let zones: Vec<ZoneId> = self.dirty.iter().map(|zone| zone.clone()).collect();
        for zone in &zones {
            // Cleared first so a change during refresh marks the zone again
            self.dirty.remove(zone);
            if let Err(e) = self.feed.refresh(zone) {
                tracing::error!(zone_id = %zone, error = %e, "Failed to publish availability");
            }
        }

        self.metrics.record_feed_flush(zones.len());
        tracing::debug!("Republished {} zones", zones.len());
    }
}

/// Handle for sending messages to the feed actor
#[derive(Clone)]
pub struct FeedHandle {
    sender: mpsc::Sender<FeedMessage>,
    dirty: Arc<DashSet<ZoneId>>,
}

impl FeedHandle {
    /// Mark a zone as changed; never blocks
    pub fn zone_changed(&self, zone_id: &ZoneId) {
        if !self.dirty.insert(zone_id.clone()) {
            return;
        }
        // A full mailbox already guarantees another loop iteration
        if let Err(mpsc::error::TrySendError::Closed(_)) = self.sender.try_send(FeedMessage::ZonesDirty) {
            tracing::debug!(zone_id = %zone_id, "Feed actor stopped, change not published");
        }
    }

    /// Publish dirty zones immediately
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(FeedMessage::Flush { response: tx })
            .await
            .map_err(|_| Error::Concurrency("Feed mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))
    }

    /// Shutdown actor
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(FeedMessage::Shutdown)
            .await
            .map_err(|_| Error::Concurrency("Feed mailbox closed".to_string()))
    }
}

/// Spawn the feed actor
pub fn spawn_feed_actor(
    feed: Arc<AvailabilityFeed>,
    config: &FeedConfig,
    metrics: Arc<Metrics>,
) -> (FeedHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(config.mailbox_capacity);
    let dirty = Arc::new(DashSet::new());

    let actor = FeedActor {
        feed,
        mailbox: rx,
        dirty: dirty.clone(),
        coalesce_window: Duration::from_millis(config.coalesce_window_ms.max(1)),
        max_dirty_zones: config.max_dirty_zones.max(1),
        metrics,
    };

    let task = tokio::spawn(async move {
        actor.run().await;
    });

    (FeedHandle { sender: tx, dirty }, task)
}
