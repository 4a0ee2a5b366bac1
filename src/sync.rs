//! Sync engine: moves queued sales to the remote ledger.
//!
//! Every trigger (reconnect, post-write delay, periodic timer, manual) ends in
//! [`SyncCoordinator::drain`], which is single-flight: a call made while a
//! drain is running returns [`DrainOutcome::InProgress`] and does nothing.
//! Records are sent one at a time; a record the ledger refuses stays queued
//! with its failure counted and the batch continues.

use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::api::{CONNECTIVITY_TIMEOUT, DEFAULT_TIMEOUT};
use crate::connectivity::{ConnectivityEvent, ConnectivityMonitor};
use crate::error::{RemoteErrorKind, Result, SyncError};
use crate::ledger::RemoteLedger;
use crate::model::PendingSale;
use crate::queue::LocalQueueStore;
use crate::status::{StatusHub, SyncCounts, SyncEvent};

pub const DEFAULT_POST_WRITE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_AUTO_SYNC_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub probe_timeout: Duration,
    pub insert_timeout: Duration,
    pub post_write_delay: Duration,
    pub auto_sync_interval: Duration,
    pub auto_sync_enabled: bool,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            probe_timeout: CONNECTIVITY_TIMEOUT,
            insert_timeout: DEFAULT_TIMEOUT,
            post_write_delay: DEFAULT_POST_WRITE_DELAY,
            auto_sync_interval: DEFAULT_AUTO_SYNC_INTERVAL,
            auto_sync_enabled: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Drain results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    Completed { synced: usize, failed: usize },
    /// Another drain was running; nothing was done.
    InProgress,
    /// The device is offline; nothing was done.
    NoConnection,
    /// The ledger probe failed (or the queue could not be read) before any
    /// record was touched.
    Aborted { error: String },
}

impl DrainOutcome {
    /// Result object returned to the ticket window.
    pub fn to_json(&self) -> Value {
        match self {
            DrainOutcome::Completed { synced, failed } => serde_json::json!({
                "success": true,
                "synced": synced,
                "failed": failed,
            }),
            DrainOutcome::InProgress => serde_json::json!({
                "success": false,
                "message": "sync in progress",
            }),
            DrainOutcome::NoConnection => serde_json::json!({
                "success": false,
                "message": "no connection",
            }),
            DrainOutcome::Aborted { error } => serde_json::json!({
                "success": false,
                "error": error,
            }),
        }
    }

    pub fn into_result(self) -> Result<SyncCounts> {
        match self {
            DrainOutcome::Completed { synced, failed } => Ok(SyncCounts { synced, failed }),
            DrainOutcome::InProgress => Err(SyncError::SyncInProgress),
            DrainOutcome::NoConnection => Err(SyncError::remote(
                RemoteErrorKind::Network,
                "no connection",
            )),
            DrainOutcome::Aborted { error } => {
                Err(SyncError::remote(RemoteErrorKind::Network, error))
            }
        }
    }
}

/// Coordinator state for status commands and badges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorStatus {
    pub online: bool,
    pub syncing: bool,
    pub auto_sync_enabled: bool,
    pub pending: usize,
}

/// Clears the in-flight flag when the drain that set it returns.
struct InFlightGuard<'a>(&'a AtomicBool);

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct SyncCoordinator {
    queue: Arc<LocalQueueStore>,
    ledger: Arc<dyn RemoteLedger>,
    connectivity: Arc<ConnectivityMonitor>,
    status: Arc<StatusHub>,
    options: CoordinatorOptions,
    in_flight: AtomicBool,
    auto_sync: AtomicBool,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl SyncCoordinator {
    pub fn new(
        queue: Arc<LocalQueueStore>,
        ledger: Arc<dyn RemoteLedger>,
        connectivity: Arc<ConnectivityMonitor>,
        status: Arc<StatusHub>,
        options: CoordinatorOptions,
    ) -> Self {
        let auto_sync = AtomicBool::new(options.auto_sync_enabled);
        Self {
            queue,
            ledger,
            connectivity,
            status,
            options,
            in_flight: AtomicBool::new(false),
            auto_sync,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Token cancelled by [`SyncCoordinator::shutdown`].
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Tracker awaited by [`SyncCoordinator::shutdown`].
    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    pub fn is_syncing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn status(&self) -> Result<CoordinatorStatus> {
        Ok(CoordinatorStatus {
            online: self.connectivity.is_online(),
            syncing: self.is_syncing(),
            auto_sync_enabled: self.auto_sync_enabled(),
            pending: self.queue.count()?,
        })
    }

    /// One reconciliation cycle.
    pub async fn drain(&self) -> DrainOutcome {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight) else {
            debug!("Drain requested while another is running");
            return DrainOutcome::InProgress;
        };

        if !self.connectivity.is_online() {
            debug!("Drain skipped: offline");
            return DrainOutcome::NoConnection;
        }

        self.status.publish(SyncEvent::SyncStarted);

        let reachable = tokio::time::timeout(self.options.probe_timeout, self.ledger.probe())
            .await
            .unwrap_or(false);
        if !reachable {
            return self.abort("remote ledger unreachable".to_string());
        }

        let pending = match self.queue.list_pending() {
            Ok(pending) => pending,
            Err(e) => return self.abort(e.to_string()),
        };

        if pending.is_empty() {
            self.status.publish(SyncEvent::SyncFinished {
                synced: 0,
                failed: 0,
            });
            return DrainOutcome::Completed {
                synced: 0,
                failed: 0,
            };
        }

        info!(pending = pending.len(), "Sync cycle started");

        let mut synced = 0;
        let mut failed = 0;
        for sale in &pending {
            if self.sync_one(sale).await {
                synced += 1;
            } else {
                failed += 1;
            }
        }

        info!(synced, failed, "Sync cycle complete");
        self.status.publish(SyncEvent::SyncFinished { synced, failed });
        DrainOutcome::Completed { synced, failed }
    }

    fn abort(&self, error: String) -> DrainOutcome {
        warn!(error = %error, "Sync cycle aborted");
        self.status.publish(SyncEvent::SyncAborted {
            error: error.clone(),
        });
        DrainOutcome::Aborted { error }
    }

    /// Send one record; true when it left the queue.
    async fn sync_one(&self, sale: &PendingSale) -> bool {
        let insert = self.ledger.insert(
            &sale.idempotency_token,
            &sale.payload,
            Some(sale.created_at),
        );
        let result = match tokio::time::timeout(self.options.insert_timeout, insert).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::remote(
                RemoteErrorKind::Timeout,
                format!(
                    "insert timed out after {}ms",
                    self.options.insert_timeout.as_millis()
                ),
            )),
        };

        match result {
            Ok(confirmed) => match self.queue.remove(sale.local_id) {
                Ok(()) | Err(SyncError::NotFound(_)) => {
                    info!(
                        local_id = sale.local_id,
                        token = %sale.idempotency_token,
                        folio = confirmed.folio,
                        deduplicated = confirmed.deduplicated,
                        "Queued sale confirmed"
                    );
                    true
                }
                Err(e) => {
                    // Still queued; the next cycle is answered by token.
                    warn!(
                        local_id = sale.local_id,
                        folio = confirmed.folio,
                        error = %e,
                        "Confirmed sale could not be removed locally"
                    );
                    false
                }
            },
            Err(e) => {
                warn!(
                    local_id = sale.local_id,
                    token = %sale.idempotency_token,
                    error = %e,
                    "Queued sale failed to sync"
                );
                if let Err(record_err) = self.queue.record_failure(sale.local_id, &e.to_string()) {
                    warn!(local_id = sale.local_id, error = %record_err, "Failed to record sync failure");
                }
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Triggers
    // -----------------------------------------------------------------------

    /// Manual trigger.
    pub async fn sync_now(&self) -> DrainOutcome {
        info!("Manual sync requested");
        self.drain().await
    }

    /// Drain after `delay` if still online. Used after an offline write.
    pub fn schedule_drain(self: &Arc<Self>, delay: Duration) {
        let coordinator = self.clone();
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if coordinator.connectivity.is_online() {
                let outcome = coordinator.drain().await;
                debug!(outcome = %outcome.to_json(), "Post-write drain finished");
            }
        });
    }

    /// [`SyncCoordinator::schedule_drain`] with the configured post-write delay.
    pub fn schedule_post_write_drain(self: &Arc<Self>) {
        self.schedule_drain(self.options.post_write_delay);
    }

    pub fn set_auto_sync(&self, enabled: bool) {
        let previous = self.auto_sync.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            info!(enabled, "Auto sync toggled");
        }
    }

    pub fn auto_sync_enabled(&self) -> bool {
        self.auto_sync.load(Ordering::SeqCst)
    }

    /// Spawn the reconnect listener and the periodic timer.
    pub fn start(self: &Arc<Self>) {
        self.spawn_reconnect_listener();
        self.spawn_periodic_timer();
    }

    fn spawn_reconnect_listener(self: &Arc<Self>) {
        let coordinator = self.clone();
        let cancel = self.cancel.clone();
        let mut events = self.connectivity.subscribe();
        self.tracker.spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(ConnectivityEvent::WentOnline) => {
                        let pending = coordinator.queue.count().unwrap_or(0);
                        if pending > 0 {
                            info!(pending, "Connection restored, syncing queued sales");
                            coordinator.drain().await;
                        }
                    }
                    Ok(ConnectivityEvent::WentOffline) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Connectivity events lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Reconnect listener stopped");
        });
    }

    fn spawn_periodic_timer(self: &Arc<Self>) {
        let coordinator = self.clone();
        let cancel = self.cancel.clone();
        let interval = self.options.auto_sync_interval;
        if interval.is_zero() {
            warn!("Auto sync interval is zero, periodic timer not started");
            return;
        }
        self.tracker.spawn(async move {
            info!("Auto sync timer started (interval: {}s)", interval.as_secs());
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if !coordinator.auto_sync_enabled()
                    || !coordinator.connectivity.is_online()
                    || coordinator.is_syncing()
                {
                    continue;
                }
                coordinator.drain().await;
            }
            info!("Auto sync timer stopped");
        });
    }

    /// Cancel timers and listeners and wait for running tasks.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}
