//! Entry point for recording a sale from the ticket window.
//!
//! Online, the sale goes straight to the ledger under a bounded timeout. Any
//! failure on that path (including a false online signal or a slow backend)
//! falls back to the local queue under the same idempotency token, so a sale
//! that did commit remotely is answered by token when the queue drains.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::connectivity::ConnectivityMonitor;
use crate::error::{Result, SyncError};
use crate::ledger::RemoteLedger;
use crate::model::{new_idempotency_token, ConfirmedSale, PendingSale, SalePayload};
use crate::queue::LocalQueueStore;
use crate::sync::SyncCoordinator;

pub const DEFAULT_ONLINE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    Online(ConfirmedSale),
    /// Queued locally; the folio is assigned when the queue drains.
    Offline(PendingSale),
}

impl RecordOutcome {
    pub fn mode(&self) -> &'static str {
        match self {
            RecordOutcome::Online(_) => "online",
            RecordOutcome::Offline(_) => "offline",
        }
    }

    pub fn folio(&self) -> Option<i64> {
        match self {
            RecordOutcome::Online(sale) => Some(sale.folio),
            RecordOutcome::Offline(_) => None,
        }
    }

    pub fn idempotency_token(&self) -> &str {
        match self {
            RecordOutcome::Online(sale) => &sale.idempotency_token,
            RecordOutcome::Offline(sale) => &sale.idempotency_token,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            RecordOutcome::Online(sale) => serde_json::json!({
                "success": true,
                "mode": "online",
                "folio": sale.folio,
                "data": sale.record,
            }),
            RecordOutcome::Offline(sale) => serde_json::json!({
                "success": true,
                "mode": "offline",
                "data": sale,
            }),
        }
    }
}

pub struct SaleRecorder {
    queue: Arc<LocalQueueStore>,
    ledger: Arc<dyn RemoteLedger>,
    connectivity: Arc<ConnectivityMonitor>,
    coordinator: Arc<SyncCoordinator>,
    online_timeout: Duration,
}

impl SaleRecorder {
    pub fn new(
        queue: Arc<LocalQueueStore>,
        ledger: Arc<dyn RemoteLedger>,
        connectivity: Arc<ConnectivityMonitor>,
        coordinator: Arc<SyncCoordinator>,
        online_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            ledger,
            connectivity,
            coordinator,
            online_timeout,
        }
    }

    /// Record one sale. Remote failures never reach the caller; only an
    /// unusable local queue does.
    pub async fn record(&self, payload: &SalePayload) -> Result<RecordOutcome> {
        if !self.queue.is_ready() {
            return Err(SyncError::StorageUnavailable);
        }

        let token = new_idempotency_token();

        if self.connectivity.is_online() {
            let insert = self.ledger.insert(&token, payload, None);
            match tokio::time::timeout(self.online_timeout, insert).await {
                Ok(Ok(confirmed)) => {
                    info!(folio = confirmed.folio, token = %token, "Sale recorded online");
                    return Ok(RecordOutcome::Online(confirmed));
                }
                Ok(Err(e)) => {
                    warn!(token = %token, error = %e, "Online record failed, queueing locally");
                }
                Err(_) => {
                    warn!(
                        token = %token,
                        timeout_ms = self.online_timeout.as_millis() as u64,
                        "Online record timed out, queueing locally"
                    );
                }
            }
        }

        let pending = self.queue.enqueue_with_token(&token, payload)?;
        self.coordinator.schedule_post_write_drain();
        Ok(RecordOutcome::Offline(pending))
    }

    /// Queued sales, for the pending badge.
    pub fn pending_count(&self) -> Result<usize> {
        self.queue.count()
    }
}
