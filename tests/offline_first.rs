//! End-to-end behaviour of the offline-first sale path against an in-memory
//! ledger.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use taquilla_pos_lib::sync::CoordinatorOptions;
use taquilla_pos_lib::{
    ConnectivityMonitor, DrainOutcome, LocalQueueStore, MemoryLedger, NetworkSignal,
    PaymentMethod, RemoteLedger, SaleRecorder, SalePayload, StatusHub, SyncConfig, SyncCoordinator,
    SyncEvent, SyncListener, SyncRuntime, SyncStatus,
};

struct Switch(AtomicBool);

#[async_trait]
impl NetworkSignal for Switch {
    async fn network_present(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct Terminal {
    recorder: SaleRecorder,
    coordinator: Arc<SyncCoordinator>,
    monitor: Arc<ConnectivityMonitor>,
    queue: Arc<LocalQueueStore>,
    ledger: Arc<MemoryLedger>,
    events: Arc<Mutex<Vec<Value>>>,
}

fn terminal(online: bool, ledger: MemoryLedger) -> Terminal {
    let queue = Arc::new(LocalQueueStore::open_in_memory().unwrap());
    let ledger = Arc::new(ledger);
    let hub = Arc::new(StatusHub::new(online));
    let monitor = Arc::new(ConnectivityMonitor::new(online, hub.clone()));
    let events = event_log(&hub);
    let options = CoordinatorOptions {
        post_write_delay: Duration::from_millis(5),
        auto_sync_enabled: false,
        ..CoordinatorOptions::default()
    };
    let coordinator = Arc::new(SyncCoordinator::new(
        queue.clone(),
        ledger.clone(),
        monitor.clone(),
        hub,
        options,
    ));
    let recorder = SaleRecorder::new(
        queue.clone(),
        ledger.clone(),
        monitor.clone(),
        coordinator.clone(),
        Duration::from_millis(200),
    );
    Terminal {
        recorder,
        coordinator,
        monitor,
        queue,
        ledger,
        events,
    }
}

fn event_log(hub: &StatusHub) -> Arc<Mutex<Vec<Value>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let listener: Arc<dyn SyncListener> =
        Arc::new(move |event: &SyncEvent, _: &SyncStatus| -> Result<(), String> {
            sink.lock().unwrap().push(event.to_json());
            Ok(())
        });
    hub.subscribe(listener);
    events
}

fn sale(tickets: u32, courtesies: u32) -> SalePayload {
    SalePayload {
        tickets,
        courtesies,
        charged_tickets: None,
        payment_method: PaymentMethod::Cash,
        terminal: Some("taquilla-1".into()),
        total: f64::from(tickets.saturating_sub(courtesies)) * 300.0,
        cash_received: None,
        change: None,
    }
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test]
async fn offline_sale_syncs_on_reconnect() {
    let signal = Arc::new(Switch(AtomicBool::new(false)));
    let queue = LocalQueueStore::open_in_memory().unwrap();
    let ledger = Arc::new(MemoryLedger::with_next_folio(42));
    let config = SyncConfig {
        network_poll: Duration::from_millis(20),
        post_write_delay: Duration::from_millis(10),
        ..SyncConfig::default()
    };
    let runtime = SyncRuntime::start(queue, config, ledger.clone(), signal.clone())
        .await
        .unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    runtime.subscribe(Arc::new(
        move |event: &SyncEvent, _: &SyncStatus| -> Result<(), String> {
            sink.lock().unwrap().push(event.to_json());
            Ok(())
        },
    ));

    let outcome = runtime.record(&sale(3, 1)).await.unwrap();
    assert_eq!(outcome.mode(), "offline");
    assert_eq!(outcome.to_json()["mode"], json!("offline"));
    assert_eq!(runtime.pending_count().unwrap(), 1);

    signal.0.store(true, Ordering::SeqCst);
    assert!(eventually(|| runtime.pending_count().unwrap() == 0).await);
    assert_eq!(ledger.folio_for(outcome.idempotency_token()), Some(42));
    assert!(
        eventually(|| events
            .lock()
            .unwrap()
            .contains(&json!({ "syncing": false, "synced": 1, "failed": 0 })))
        .await
    );
    assert!(events.lock().unwrap().contains(&json!({ "online": true })));

    runtime.shutdown().await;
}

#[tokio::test]
async fn interleaved_sales_are_neither_lost_nor_double_counted() {
    let t = terminal(true, MemoryLedger::new());
    let mut recorded = 0;

    for i in 0..40u32 {
        t.monitor.set_online(i % 7 < 4);
        if i % 5 == 0 {
            t.ledger.fail_next_inserts(1);
        }
        if i % 11 == 3 {
            // Committed remotely, but the answer arrives after the timeout.
            t.ledger.set_response_delay(Duration::from_millis(300));
        }
        t.recorder.record(&sale(1 + i % 3, 0)).await.unwrap();
        recorded += 1;
        t.ledger.set_response_delay(Duration::ZERO);

        if i % 4 == 1 {
            t.coordinator.drain().await;
        }
        let settled = t.ledger.confirmed_count() + t.queue.count().unwrap();
        assert!(settled >= recorded, "sale lost at step {i}");
    }

    t.monitor.set_online(true);
    t.ledger.clear_failures();
    // A post-write drain may still be inside a delayed response.
    assert!(eventually(|| !t.coordinator.is_syncing()).await);
    let mut last = DrainOutcome::InProgress;
    for _ in 0..20 {
        if t.queue.count().unwrap() == 0 {
            break;
        }
        last = t.coordinator.sync_now().await;
        if last == DrainOutcome::InProgress {
            assert!(eventually(|| !t.coordinator.is_syncing()).await);
        }
    }

    assert_eq!(t.queue.count().unwrap(), 0, "last drain: {last:?}");
    assert_eq!(t.ledger.confirmed_count(), recorded);
    t.coordinator.shutdown().await;
}

#[tokio::test]
async fn same_token_yields_one_sale_and_one_folio() {
    let ledger = MemoryLedger::with_next_folio(7);
    let first = ledger.insert("1700000000000-abcdefghi", &sale(2, 0), None).await.unwrap();
    let again = ledger.insert("1700000000000-abcdefghi", &sale(2, 0), None).await.unwrap();

    assert_eq!(first.folio, again.folio);
    assert_eq!(ledger.confirmed_count(), 1);
}

#[tokio::test]
async fn overlapping_drain_is_rejected_without_side_effects() {
    let t = terminal(true, MemoryLedger::new());
    for n in 1..=3 {
        t.queue.enqueue(&sale(n, 0)).unwrap();
    }
    // Each insert stalls long enough that nothing commits while the second
    // call runs.
    t.ledger.set_insert_delay(Duration::from_millis(300));

    let running = {
        let coordinator = t.coordinator.clone();
        tokio::spawn(async move { coordinator.drain().await })
    };
    assert!(eventually(|| t.coordinator.is_syncing()).await);

    let queued_tokens = |queue: &LocalQueueStore| -> BTreeSet<(String, u32)> {
        queue
            .list_all()
            .unwrap()
            .into_iter()
            .map(|s| (s.idempotency_token, s.attempts))
            .collect()
    };
    let before = queued_tokens(&t.queue);
    let calls_before = t.ledger.insert_calls();
    let rejected = t.coordinator.drain().await;
    assert_eq!(
        rejected.to_json(),
        json!({ "success": false, "message": "sync in progress" })
    );
    assert_eq!(queued_tokens(&t.queue), before);
    assert_eq!(t.ledger.insert_calls(), calls_before);

    assert_eq!(
        running.await.unwrap(),
        DrainOutcome::Completed { synced: 3, failed: 0 }
    );
    assert_eq!(t.queue.count().unwrap(), 0);
}

#[tokio::test]
async fn one_bad_record_leaves_the_rest_synced() {
    let t = terminal(true, MemoryLedger::new());
    let mut tokens = Vec::new();
    for n in 1..=5 {
        tokens.push(t.queue.enqueue(&sale(n, 0)).unwrap().idempotency_token);
    }
    t.ledger.fail_token(&tokens[2]);

    let outcome = t.coordinator.drain().await;
    assert_eq!(outcome, DrainOutcome::Completed { synced: 4, failed: 1 });

    let left = t.queue.list_pending().unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].idempotency_token, tokens[2]);
    assert_eq!(left[0].attempts, 1);
    assert_eq!(
        t.events.lock().unwrap().last().cloned(),
        Some(json!({ "syncing": false, "synced": 4, "failed": 1 }))
    );
}

#[tokio::test]
async fn transient_failures_converge() {
    let t = terminal(true, MemoryLedger::new());
    for n in 1..=3 {
        t.queue.enqueue(&sale(n, 0)).unwrap();
    }
    t.ledger.fail_next_inserts(7);

    let mut cycles = 0;
    while t.queue.count().unwrap() > 0 {
        cycles += 1;
        assert!(cycles <= 5, "queue did not converge");
        t.coordinator.drain().await;
    }
    assert_eq!(t.ledger.confirmed_count(), 3);
}

#[tokio::test]
async fn failed_probe_aborts_while_os_reports_online() {
    let ledger = MemoryLedger::new();
    ledger.set_reachable(false);
    let t = terminal(true, ledger);
    t.queue.enqueue(&sale(1, 0)).unwrap();

    let outcome = t.coordinator.drain().await;
    assert!(matches!(outcome, DrainOutcome::Aborted { .. }));
    assert_eq!(t.queue.count().unwrap(), 1);

    let last = t.events.lock().unwrap().last().cloned().unwrap();
    assert_eq!(last["syncing"], json!(false));
    assert!(last["error"].is_string());
    assert!(t.monitor.is_online());
}

#[tokio::test]
async fn queue_survives_restart() {
    let dir = std::env::temp_dir().join(format!("taquilla_restart_{}", uuid::Uuid::new_v4()));
    let path = dir.join(taquilla_pos_lib::DB_FILE_NAME);

    let queued = {
        let queue = LocalQueueStore::open(&path).unwrap();
        let sale = queue.enqueue(&sale(2, 0)).unwrap();
        queue.shutdown();
        sale
    };

    let queue = LocalQueueStore::open(&path).unwrap();
    let pending = queue.list_pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].idempotency_token, queued.idempotency_token);
    assert_eq!(pending[0].payload, queued.payload);
    queue.shutdown();

    let _ = std::fs::remove_dir_all(&dir);
}
