//! Process-wide sync status and its listeners.
//!
//! The hub owns the single [`SyncStatus`] value. Writers (the coordinator and
//! the connectivity monitor) publish [`SyncEvent`]s; the hub folds each event
//! into the status and fans it out to every registered listener. A listener
//! that fails or panics is logged and skipped, the rest still receive the
//! event.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Counters of the last completed drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncCounts {
    pub synced: usize,
    pub failed: usize,
}

/// Ephemeral sync state shown by badges and report screens. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub online: bool,
    pub syncing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_result: Option<SyncCounts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    ConnectivityChanged { online: bool },
    SyncStarted,
    SyncFinished { synced: usize, failed: usize },
    SyncAborted { error: String },
}

impl SyncEvent {
    /// Partial status update in the shape the ticket window consumes.
    pub fn to_json(&self) -> Value {
        match self {
            SyncEvent::ConnectivityChanged { online } => serde_json::json!({ "online": online }),
            SyncEvent::SyncStarted => serde_json::json!({ "syncing": true }),
            SyncEvent::SyncFinished { synced, failed } => serde_json::json!({
                "syncing": false,
                "synced": synced,
                "failed": failed,
            }),
            SyncEvent::SyncAborted { error } => serde_json::json!({
                "syncing": false,
                "error": error,
            }),
        }
    }

    fn apply(&self, status: &mut SyncStatus) {
        match self {
            SyncEvent::ConnectivityChanged { online } => status.online = *online,
            SyncEvent::SyncStarted => status.syncing = true,
            SyncEvent::SyncFinished { synced, failed } => {
                status.syncing = false;
                status.last_result = Some(SyncCounts {
                    synced: *synced,
                    failed: *failed,
                });
                status.last_error = None;
                status.last_sync_at = Some(Utc::now().to_rfc3339());
            }
            SyncEvent::SyncAborted { error } => {
                status.syncing = false;
                status.last_error = Some(error.clone());
            }
        }
    }
}

/// Receiver of status broadcasts.
pub trait SyncListener: Send + Sync {
    fn on_sync_event(&self, event: &SyncEvent, status: &SyncStatus) -> Result<(), String>;
}

impl<F> SyncListener for F
where
    F: Fn(&SyncEvent, &SyncStatus) -> Result<(), String> + Send + Sync,
{
    fn on_sync_event(&self, event: &SyncEvent, status: &SyncStatus) -> Result<(), String> {
        self(event, status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub struct StatusHub {
    status: Mutex<SyncStatus>,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn SyncListener>)>>,
    next_id: AtomicU64,
}

impl StatusHub {
    /// Fresh status with every field at its default except `online`.
    pub fn new(online: bool) -> Self {
        Self {
            status: Mutex::new(SyncStatus {
                online,
                ..SyncStatus::default()
            }),
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe(&self, listener: Arc<dyn SyncListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push((id, listener));
        }
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        match self.listeners.lock() {
            Ok(mut listeners) => {
                let before = listeners.len();
                listeners.retain(|(lid, _)| *lid != id);
                listeners.len() != before
            }
            Err(_) => false,
        }
    }

    pub fn snapshot(&self) -> SyncStatus {
        self.status.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Fold `event` into the status and deliver it to every listener.
    ///
    /// Returns how many listeners accepted the event. No lock is held while
    /// listeners run, so a listener may read the hub.
    pub fn publish(&self, event: SyncEvent) -> usize {
        let status = match self.status.lock() {
            Ok(mut guard) => {
                event.apply(&mut guard);
                guard.clone()
            }
            Err(e) => {
                warn!("status lock poisoned: {e}");
                return 0;
            }
        };

        let listeners: Vec<Arc<dyn SyncListener>> = match self.listeners.lock() {
            Ok(guard) => guard.iter().map(|(_, l)| l.clone()).collect(),
            Err(_) => Vec::new(),
        };

        debug!(event = %event.to_json(), listeners = listeners.len(), "Broadcasting sync status");

        let mut delivered = 0;
        for listener in listeners {
            let outcome =
                panic::catch_unwind(AssertUnwindSafe(|| listener.on_sync_event(&event, &status)));
            match outcome {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => warn!(error = %e, "Sync status listener failed"),
                Err(_) => warn!("Sync status listener panicked"),
            }
        }
        delivered
    }
}
