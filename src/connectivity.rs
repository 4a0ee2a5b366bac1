//! Network presence tracking.
//!
//! The monitor keeps a two-state flag (online/offline) fed by an OS-level
//! [`NetworkSignal`]. Presence is necessary but not sufficient for the
//! ledger to be reachable; the coordinator still probes the ledger before a
//! drain.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::status::{StatusHub, SyncEvent};

const EVENT_CHANNEL_CAPACITY: usize = 16;
const SIGNAL_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    WentOnline,
    WentOffline,
}

/// Source of OS-level network presence.
#[async_trait]
pub trait NetworkSignal: Send + Sync {
    async fn network_present(&self) -> bool;
}

/// Presence check that opens (and drops) a TCP connection to the ledger host.
pub struct TcpNetworkSignal {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpNetworkSignal {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: SIGNAL_CONNECT_TIMEOUT,
        }
    }

    /// Derive host and port from the ledger base URL.
    pub fn for_url(url: &str) -> Result<Self> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| SyncError::Config(format!("invalid ledger URL {url}: {e}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| SyncError::Config(format!("ledger URL has no host: {url}")))?;
        let port = parsed.port_or_known_default().unwrap_or(443);
        Ok(Self::new(host, port))
    }
}

#[async_trait]
impl NetworkSignal for TcpNetworkSignal {
    async fn network_present(&self) -> bool {
        let addr = format!("{}:{}", self.host, self.port);
        match tokio::time::timeout(self.timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(addr = %addr, error = %e, "Network presence check failed");
                false
            }
            Err(_) => {
                debug!(addr = %addr, "Network presence check timed out");
                false
            }
        }
    }
}

/// Online/offline state machine with transition notifications.
pub struct ConnectivityMonitor {
    online: AtomicBool,
    events: broadcast::Sender<ConnectivityEvent>,
    status: Arc<StatusHub>,
}

impl ConnectivityMonitor {
    pub fn new(initial_online: bool, status: Arc<StatusHub>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        if status.snapshot().online != initial_online {
            status.publish(SyncEvent::ConnectivityChanged {
                online: initial_online,
            });
        }
        Self {
            online: AtomicBool::new(initial_online),
            events,
            status,
        }
    }

    /// Build a monitor whose initial state comes from one signal reading.
    pub async fn detect(signal: &dyn NetworkSignal, status: Arc<StatusHub>) -> Self {
        let online = signal.network_present().await;
        info!(online, "Initial network state detected");
        Self::new(online, status)
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.events.subscribe()
    }

    /// Apply an OS network reading. Emits an event only on a real transition.
    pub fn set_online(&self, online: bool) -> Option<ConnectivityEvent> {
        let previous = self.online.swap(online, Ordering::SeqCst);
        if previous == online {
            return None;
        }

        let event = if online {
            info!("Network connection restored");
            ConnectivityEvent::WentOnline
        } else {
            warn!("Network connection lost");
            ConnectivityEvent::WentOffline
        };

        self.status.publish(SyncEvent::ConnectivityChanged { online });
        // No receivers is fine: nothing is waiting for transitions yet.
        let _ = self.events.send(event);
        Some(event)
    }

    /// Poll `signal` every `interval` until `cancel` fires.
    pub fn spawn_watcher(
        self: &Arc<Self>,
        signal: Arc<dyn NetworkSignal>,
        interval: Duration,
        cancel: CancellationToken,
        tracker: &TaskTracker,
    ) {
        let monitor = self.clone();
        tracker.spawn(async move {
            info!("Network watcher started (interval: {}s)", interval.as_secs());
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let present = tokio::select! {
                    _ = cancel.cancelled() => break,
                    present = signal.network_present() => present,
                };
                monitor.set_online(present);
            }
            info!("Network watcher stopped");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct ScriptedSignal {
        present: AtomicBool,
        reads: AtomicUsize,
    }

    #[async_trait]
    impl NetworkSignal for ScriptedSignal {
        async fn network_present(&self) -> bool {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.present.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_transitions_only_fire_on_change() {
        let hub = Arc::new(StatusHub::new(false));
        let monitor = ConnectivityMonitor::new(false, hub.clone());
        let mut rx = monitor.subscribe();

        assert_eq!(monitor.set_online(false), None);
        assert_eq!(monitor.set_online(true), Some(ConnectivityEvent::WentOnline));
        assert_eq!(monitor.set_online(true), None);
        assert_eq!(monitor.set_online(false), Some(ConnectivityEvent::WentOffline));

        assert_eq!(rx.try_recv().unwrap(), ConnectivityEvent::WentOnline);
        assert_eq!(rx.try_recv().unwrap(), ConnectivityEvent::WentOffline);
        assert!(rx.try_recv().is_err());
        assert!(!hub.snapshot().online);
    }

    #[test]
    fn test_initial_state_is_published() {
        let hub = Arc::new(StatusHub::new(false));
        let monitor = ConnectivityMonitor::new(true, hub.clone());
        assert!(monitor.is_online());
        assert!(hub.snapshot().online);
    }

    #[test]
    fn test_signal_for_url_uses_default_ports() {
        let https = TcpNetworkSignal::for_url("https://example.supabase.co").unwrap();
        assert_eq!(https.host, "example.supabase.co");
        assert_eq!(https.port, 443);

        let local = TcpNetworkSignal::for_url("http://localhost:54321").unwrap();
        assert_eq!(local.port, 54321);

        assert!(matches!(
            TcpNetworkSignal::for_url("not a url"),
            Err(SyncError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_watcher_follows_signal() {
        let hub = Arc::new(StatusHub::new(false));
        let signal = Arc::new(ScriptedSignal {
            present: AtomicBool::new(false),
            reads: AtomicUsize::new(0),
        });
        let monitor = Arc::new(ConnectivityMonitor::detect(signal.as_ref(), hub.clone()).await);
        assert!(!monitor.is_online());

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let mut rx = monitor.subscribe();
        monitor.spawn_watcher(signal.clone(), Duration::from_millis(10), cancel.clone(), &tracker);

        signal.present.store(true, Ordering::SeqCst);
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("transition within deadline")
            .unwrap();
        assert_eq!(event, ConnectivityEvent::WentOnline);
        assert!(hub.snapshot().online);

        cancel.cancel();
        tracker.close();
        tracker.wait().await;
        assert!(signal.reads.load(Ordering::SeqCst) >= 2);
    }
}
