//! Durable queue of sales that have not been confirmed by the remote ledger.
//!
//! Every mutation runs as its own SQLite statement on a connection opened
//! with `synchronous = FULL`, so it is on disk before the call returns.
//! Records are keyed by an autoincrement local id with a uniqueness
//! constraint on the idempotency token.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::db;
use crate::error::{Result, SyncError};
use crate::model::{new_idempotency_token, PendingSale, RecordState, SalePayload};

const SELECT_COLUMNS: &str =
    "id, idempotency_token, created_at, payload, sync_state, attempts, last_error";

/// Local persistent store for [`PendingSale`] records.
///
/// Starts uninitialized; every operation fails with
/// [`SyncError::StorageUnavailable`] until [`LocalQueueStore::init`] (or one
/// of the opening constructors) succeeds, and again after
/// [`LocalQueueStore::shutdown`].
pub struct LocalQueueStore {
    conn: Mutex<Option<Connection>>,
    db_path: Mutex<Option<PathBuf>>,
}

impl Default for LocalQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalQueueStore {
    /// Create a store that is not yet backed by a database.
    pub fn new() -> Self {
        Self {
            conn: Mutex::new(None),
            db_path: Mutex::new(None),
        }
    }

    /// Open the queue database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let store = Self::new();
        store.init(path)?;
        Ok(store)
    }

    /// Volatile queue, used by tests and demos.
    pub fn open_in_memory() -> Result<Self> {
        let conn = db::open_in_memory().map_err(SyncError::Storage)?;
        let store = Self::new();
        *store.lock_conn()? = Some(conn);
        Ok(store)
    }

    /// Open the database file and make the store ready.
    pub fn init(&self, path: &Path) -> Result<()> {
        let conn = db::open(path).map_err(SyncError::Storage)?;
        *self.lock_conn()? = Some(conn);
        if let Ok(mut guard) = self.db_path.lock() {
            *guard = Some(path.to_path_buf());
        }
        info!(path = %path.display(), "Sale queue ready");
        Ok(())
    }

    /// Close the connection. Later calls fail with `StorageUnavailable`.
    pub fn shutdown(&self) {
        if let Ok(mut guard) = self.conn.lock() {
            if guard.take().is_some() {
                info!("Sale queue closed");
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        self.conn.lock().map(|g| g.is_some()).unwrap_or(false)
    }

    pub fn db_path(&self) -> Option<PathBuf> {
        self.db_path.lock().ok().and_then(|g| g.clone())
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Option<Connection>>> {
        self.conn
            .lock()
            .map_err(|e| SyncError::Storage(format!("queue lock poisoned: {e}")))
    }

    /// Run `f` against the open connection.
    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.lock_conn()?;
        let conn = guard.as_ref().ok_or(SyncError::StorageUnavailable)?;
        f(conn)
    }

    /// Run `f` against the open connection for settings access.
    pub(crate) fn with_settings<T>(
        &self,
        f: impl FnOnce(&Connection) -> std::result::Result<T, String>,
    ) -> Result<T> {
        self.with_conn(|conn| f(conn).map_err(SyncError::Storage))
    }

    // -----------------------------------------------------------------------
    // Queue operations
    // -----------------------------------------------------------------------

    /// Persist a new sale under a freshly generated idempotency token.
    pub fn enqueue(&self, payload: &SalePayload) -> Result<PendingSale> {
        self.enqueue_with_token(&new_idempotency_token(), payload)
    }

    /// Persist a sale under a caller-chosen token.
    ///
    /// If the token is already queued the stored record is returned unchanged,
    /// so one token never maps to two queued sales.
    pub fn enqueue_with_token(&self, token: &str, payload: &SalePayload) -> Result<PendingSale> {
        let payload_json = serde_json::to_string(payload)?;
        let created_at = Utc::now();

        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO pending_sales (idempotency_token, created_at, payload, sync_state)
                 VALUES (?1, ?2, ?3, 'pending')
                 ON CONFLICT(idempotency_token) DO NOTHING",
                params![token, created_at.to_rfc3339(), payload_json],
            )?;

            if inserted == 0 {
                debug!(token = %token, "Token already queued, returning existing record");
            }

            conn.query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM pending_sales WHERE idempotency_token = ?1"),
                params![token],
                row_to_pending,
            )
            .map_err(SyncError::from)
        })
        .map(|sale| {
            info!(
                local_id = sale.local_id,
                token = %sale.idempotency_token,
                "Sale queued locally"
            );
            sale
        })
    }

    /// All records still waiting for the ledger. No ordering is promised.
    pub fn list_pending(&self) -> Result<Vec<PendingSale>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM pending_sales WHERE sync_state = 'pending'"
            ))?;
            let rows = stmt.query_map([], row_to_pending)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(SyncError::from)
        })
    }

    /// Every stored record regardless of state, oldest first.
    pub fn list_all(&self) -> Result<Vec<PendingSale>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM pending_sales ORDER BY created_at, id"
            ))?;
            let rows = stmt.query_map([], row_to_pending)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(SyncError::from)
        })
    }

    pub fn get(&self, local_id: i64) -> Result<PendingSale> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM pending_sales WHERE id = ?1"),
                params![local_id],
                row_to_pending,
            )
            .optional()?
            .ok_or(SyncError::NotFound(local_id))
        })
    }

    /// Delete a record after the ledger confirmed it.
    ///
    /// The row passes through `synced` inside the same transaction, so the
    /// state is never visible to other readers.
    pub fn remove(&self, local_id: i64) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let marked = tx.execute(
                "UPDATE pending_sales SET sync_state = ?2 WHERE id = ?1",
                params![local_id, RecordState::Synced.as_str()],
            )?;
            if marked == 0 {
                return Err(SyncError::NotFound(local_id));
            }
            tx.execute("DELETE FROM pending_sales WHERE id = ?1", params![local_id])?;
            tx.commit()?;
            debug!(local_id, "Pending sale removed");
            Ok(())
        })
    }

    /// Record a failed remote attempt. The record stays pending.
    pub fn record_failure(&self, local_id: i64, error: &str) -> Result<()> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE pending_sales
                 SET attempts = attempts + 1, last_error = ?2, last_attempt_at = ?3
                 WHERE id = ?1",
                params![local_id, error, Utc::now().to_rfc3339()],
            )?;
            if updated == 0 {
                warn!(local_id, "Failure recorded for a sale that is no longer queued");
                return Err(SyncError::NotFound(local_id));
            }
            Ok(())
        })
    }

    /// Number of pending records, for UI badges.
    pub fn count(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM pending_sales WHERE sync_state = 'pending'",
                [],
                |row| row.get(0),
            )?;
            Ok(n.max(0) as usize)
        })
    }

    /// Number of pending records that failed at least one remote attempt.
    pub fn failing_count(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM pending_sales WHERE sync_state = 'pending' AND attempts > 0",
                [],
                |row| row.get(0),
            )?;
            Ok(n.max(0) as usize)
        })
    }
}

fn row_to_pending(row: &Row<'_>) -> rusqlite::Result<PendingSale> {
    let created_raw: String = row.get(2)?;
    let created_at = DateTime::parse_from_rfc3339(&created_raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
        })?;

    let payload_raw: String = row.get(3)?;
    let payload: SalePayload = serde_json::from_str(&payload_raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let state_raw: String = row.get(4)?;
    let sync_state = RecordState::parse(&state_raw).unwrap_or(RecordState::Pending);

    let attempts: i64 = row.get(5)?;

    Ok(PendingSale {
        local_id: row.get(0)?,
        idempotency_token: row.get(1)?,
        created_at,
        payload,
        sync_state,
        attempts: attempts.max(0) as u32,
        last_error: row.get(6)?,
    })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PaymentMethod;

    fn sale(tickets: u32, total: f64) -> SalePayload {
        SalePayload {
            tickets,
            courtesies: 0,
            charged_tickets: None,
            payment_method: PaymentMethod::Cash,
            terminal: None,
            total,
            cash_received: Some(total),
            change: Some(0.0),
        }
    }

    #[test]
    fn test_uninitialized_store_is_unavailable() {
        let store = LocalQueueStore::new();
        assert!(!store.is_ready());
        assert!(matches!(
            store.enqueue(&sale(1, 300.0)),
            Err(SyncError::StorageUnavailable)
        ));
        assert!(matches!(store.count(), Err(SyncError::StorageUnavailable)));
        assert!(matches!(store.list_pending(), Err(SyncError::StorageUnavailable)));
    }

    #[test]
    fn test_enqueue_assigns_token_and_local_id() {
        let store = LocalQueueStore::open_in_memory().unwrap();
        let first = store.enqueue(&sale(2, 600.0)).unwrap();
        let second = store.enqueue(&sale(1, 300.0)).unwrap();

        assert_ne!(first.local_id, second.local_id);
        assert_ne!(first.idempotency_token, second.idempotency_token);
        assert_eq!(first.sync_state, RecordState::Pending);
        assert_eq!(first.attempts, 0);
        assert_eq!(first.payload, sale(2, 600.0));
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn test_enqueue_with_existing_token_keeps_one_record() {
        let store = LocalQueueStore::open_in_memory().unwrap();
        let first = store.enqueue_with_token("1700000000000-abc123def", &sale(2, 600.0)).unwrap();
        let again = store.enqueue_with_token("1700000000000-abc123def", &sale(9, 2700.0)).unwrap();

        assert_eq!(first.local_id, again.local_id);
        assert_eq!(again.payload.tickets, 2);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_remove_and_not_found() {
        let store = LocalQueueStore::open_in_memory().unwrap();
        let queued = store.enqueue(&sale(1, 300.0)).unwrap();

        store.remove(queued.local_id).unwrap();
        assert_eq!(store.count().unwrap(), 0);
        assert!(matches!(
            store.remove(queued.local_id),
            Err(SyncError::NotFound(id)) if id == queued.local_id
        ));
        assert!(matches!(store.get(queued.local_id), Err(SyncError::NotFound(_))));
    }

    #[test]
    fn test_record_failure_keeps_record_pending() {
        let store = LocalQueueStore::open_in_memory().unwrap();
        let queued = store.enqueue(&sale(1, 300.0)).unwrap();

        store.record_failure(queued.local_id, "HTTP 503").unwrap();
        store.record_failure(queued.local_id, "HTTP 502").unwrap();

        let reloaded = store.get(queued.local_id).unwrap();
        assert_eq!(reloaded.sync_state, RecordState::Pending);
        assert_eq!(reloaded.attempts, 2);
        assert_eq!(reloaded.last_error.as_deref(), Some("HTTP 502"));
        assert_eq!(store.list_pending().unwrap().len(), 1);
        assert_eq!(store.failing_count().unwrap(), 1);
    }

    #[test]
    fn test_shutdown_makes_store_unavailable() {
        let store = LocalQueueStore::open_in_memory().unwrap();
        store.enqueue(&sale(1, 300.0)).unwrap();
        store.shutdown();
        assert!(!store.is_ready());
        assert!(matches!(store.count(), Err(SyncError::StorageUnavailable)));
    }

    #[test]
    fn test_queue_survives_reopen() {
        let dir = std::env::temp_dir().join(format!("taquilla_queue_{}", uuid::Uuid::new_v4()));
        let path = dir.join(db::DB_FILE_NAME);

        let token = {
            let store = LocalQueueStore::open(&path).unwrap();
            let queued = store.enqueue(&sale(3, 900.0)).unwrap();
            store.shutdown();
            queued.idempotency_token
        };

        let reopened = LocalQueueStore::open(&path).unwrap();
        let pending = reopened.list_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].idempotency_token, token);
        assert_eq!(pending[0].payload.tickets, 3);
        assert_eq!(reopened.db_path().as_deref(), Some(path.as_path()));

        reopened.shutdown();
        let _ = std::fs::remove_dir_all(&dir);
    }
}
