//! La Gruta taquilla - offline-first sale recording.
//!
//! Sales are written to the remote ledger when it can be reached and to a
//! durable local queue when it cannot. The queue is drained back to the
//! ledger by [`sync::SyncCoordinator`] on reconnect, after offline writes,
//! on a timer and on demand. [`SyncRuntime`] wires the pieces together.

use std::path::Path;
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod api;
pub mod config;
pub mod connectivity;
mod db;
pub mod diagnostics;
pub mod error;
pub mod ledger;
pub mod model;
pub mod queue;
pub mod recorder;
pub mod status;
pub mod storage;
pub mod sync;

pub use config::{RemoteConfig, SyncConfig};
pub use connectivity::{ConnectivityEvent, ConnectivityMonitor, NetworkSignal, TcpNetworkSignal};
pub use db::DB_FILE_NAME;
pub use error::{RemoteErrorKind, Result, SyncError};
pub use ledger::{MemoryLedger, RemoteLedger, SupabaseLedger, SupabaseLedgerConfig};
pub use model::{ConfirmedSale, PaymentMethod, PendingSale, SalePayload};
pub use queue::LocalQueueStore;
pub use recorder::{RecordOutcome, SaleRecorder};
pub use status::{ListenerId, StatusHub, SyncEvent, SyncListener, SyncStatus};
pub use sync::{CoordinatorStatus, DrainOutcome, SyncCoordinator};

/// Initialize structured logging (console + daily rolling file in `log_dir`).
///
/// The returned guard flushes the file writer when dropped; keep it alive for
/// the lifetime of the process.
pub fn init_logging(log_dir: &Path) -> WorkerGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,taquilla_pos_lib=debug"));

    // Prune old log files before setting up the appender
    std::fs::create_dir_all(log_dir).ok();
    diagnostics::prune_old_logs(log_dir);

    let file_appender = tracing_appender::rolling::daily(log_dir, diagnostics::LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true).with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    guard
}

// ---------------------------------------------------------------------------
// Runtime wiring
// ---------------------------------------------------------------------------

/// Every sync component of one terminal, built around an opened queue.
pub struct SyncRuntime {
    queue: Arc<LocalQueueStore>,
    status: Arc<StatusHub>,
    connectivity: Arc<ConnectivityMonitor>,
    coordinator: Arc<SyncCoordinator>,
    recorder: SaleRecorder,
    ledger: Arc<dyn RemoteLedger>,
    config: SyncConfig,
}

impl SyncRuntime {
    /// Detect the initial network state, start the network watcher, the
    /// reconnect listener and the auto-sync timer.
    pub async fn start(
        queue: LocalQueueStore,
        config: SyncConfig,
        ledger: Arc<dyn RemoteLedger>,
        signal: Arc<dyn NetworkSignal>,
    ) -> Result<Self> {
        if !queue.is_ready() {
            return Err(SyncError::StorageUnavailable);
        }
        let queue = Arc::new(queue);
        let status = Arc::new(StatusHub::new(false));
        let connectivity =
            Arc::new(ConnectivityMonitor::detect(signal.as_ref(), status.clone()).await);

        let coordinator = Arc::new(SyncCoordinator::new(
            queue.clone(),
            ledger.clone(),
            connectivity.clone(),
            status.clone(),
            config.coordinator_options(),
        ));
        connectivity.spawn_watcher(
            signal,
            config.network_poll,
            coordinator.cancellation(),
            coordinator.tracker(),
        );
        coordinator.start();

        let recorder = SaleRecorder::new(
            queue.clone(),
            ledger.clone(),
            connectivity.clone(),
            coordinator.clone(),
            config.online_timeout,
        );

        let pending = queue.count()?;
        info!(
            online = connectivity.is_online(),
            pending,
            version = env!("CARGO_PKG_VERSION"),
            "Sync runtime started"
        );
        if pending > 0 && connectivity.is_online() {
            coordinator.schedule_post_write_drain();
        }

        Ok(Self {
            queue,
            status,
            connectivity,
            coordinator,
            recorder,
            ledger,
            config,
        })
    }

    pub async fn record(&self, payload: &SalePayload) -> Result<RecordOutcome> {
        self.recorder.record(payload).await
    }

    pub async fn sync_now(&self) -> DrainOutcome {
        self.coordinator.sync_now().await
    }

    pub fn status(&self) -> Result<CoordinatorStatus> {
        self.coordinator.status()
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.status.snapshot()
    }

    pub fn pending_count(&self) -> Result<usize> {
        self.recorder.pending_count()
    }

    pub fn list_pending(&self) -> Result<Vec<PendingSale>> {
        self.queue.list_pending()
    }

    pub fn subscribe(&self, listener: Arc<dyn SyncListener>) -> ListenerId {
        self.status.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.status.unsubscribe(id)
    }

    pub fn set_auto_sync(&self, enabled: bool) {
        self.coordinator.set_auto_sync(enabled);
    }

    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.connectivity
    }

    pub fn ledger(&self) -> &Arc<dyn RemoteLedger> {
        &self.ledger
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn diagnostics_snapshot(&self) -> Result<diagnostics::SyncSnapshot> {
        diagnostics::snapshot(&self.queue, &self.status)
    }

    /// Stop background tasks, wait for them and close the queue.
    pub async fn shutdown(self) {
        self.coordinator.shutdown().await;
        self.queue.shutdown();
        info!("Sync runtime stopped");
    }
}
