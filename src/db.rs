//! Local SQLite database layer for the ticket window.
//!
//! Uses rusqlite with WAL mode and `synchronous = FULL` so that a committed
//! write survives power loss. Provides schema migrations and the
//! `local_settings` helpers used by configuration.

use rusqlite::{params, Connection};
use std::fs;
use std::path::Path;
use tracing::{error, info};

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

/// File name of the queue database inside the data directory.
pub const DB_FILE_NAME: &str = "taquilla.db";

/// Open (creating if needed) the database at `path` and run migrations.
///
/// An open failure is returned to the caller. The file is never deleted and
/// recreated: it may hold sales that have not reached the ledger yet.
pub fn open(path: &Path) -> Result<Connection, String> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| format!("Failed to create data dir: {e}"))?;
        }
    }

    info!("Opening sale queue database at {}", path.display());
    let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;
    configure(&conn, true)?;
    run_migrations(&conn)?;
    Ok(conn)
}

/// In-memory database with the full schema. Nothing survives the connection.
pub fn open_in_memory() -> Result<Connection, String> {
    let conn = Connection::open_in_memory().map_err(|e| format!("sqlite open: {e}"))?;
    configure(&conn, false)?;
    run_migrations(&conn)?;
    Ok(conn)
}

fn configure(conn: &Connection, wal: bool) -> Result<(), String> {
    if wal {
        // journal_mode returns a row, so it cannot go through execute_batch
        // on every SQLite build.
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
            .map_err(|e| format!("pragma journal_mode: {e}"))?;
    }
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = FULL;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;
    Ok(())
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("create schema_version: {e}"))?;

    let current = schema_version(conn);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Highest applied migration, 0 for a fresh file.
pub fn schema_version(conn: &Connection) -> i32 {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .unwrap_or(0)
}

/// Migration v1: settings and the pending sale queue.
fn migrate_v1(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        BEGIN;
        CREATE TABLE IF NOT EXISTS local_settings (
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now')),
            PRIMARY KEY (setting_category, setting_key)
        );

        CREATE TABLE IF NOT EXISTS pending_sales (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            idempotency_token TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL,
            payload TEXT NOT NULL,
            sync_state TEXT NOT NULL DEFAULT 'pending'
        );

        CREATE INDEX IF NOT EXISTS idx_pending_sales_state ON pending_sales(sync_state);
        CREATE INDEX IF NOT EXISTS idx_pending_sales_created ON pending_sales(created_at);

        INSERT INTO schema_version (version) VALUES (1);
        COMMIT;
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        format!("migration v1: {e}")
    })?;

    info!("Applied migration v1 (local_settings, pending_sales)");
    Ok(())
}

/// Migration v2: per-record failure bookkeeping for the operator view.
fn migrate_v2(conn: &Connection) -> Result<(), String> {
    let mut sql = String::from("BEGIN;\n");
    if !column_exists(conn, "pending_sales", "attempts")? {
        sql.push_str("ALTER TABLE pending_sales ADD COLUMN attempts INTEGER NOT NULL DEFAULT 0;\n");
    }
    if !column_exists(conn, "pending_sales", "last_error")? {
        sql.push_str("ALTER TABLE pending_sales ADD COLUMN last_error TEXT;\n");
    }
    if !column_exists(conn, "pending_sales", "last_attempt_at")? {
        sql.push_str("ALTER TABLE pending_sales ADD COLUMN last_attempt_at TEXT;\n");
    }
    sql.push_str("INSERT INTO schema_version (version) VALUES (2);\nCOMMIT;");

    conn.execute_batch(&sql).map_err(|e| {
        error!("Migration v2 failed: {e}");
        format!("migration v2: {e}")
    })?;

    info!("Applied migration v2 (pending_sales attempt tracking)");
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, String> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .map_err(|e| format!("table_info {table}: {e}"))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))
        .map_err(|e| format!("table_info {table}: {e}"))?;
    for name in names.flatten() {
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(conn: &Connection, category: &str, key: &str, value: &str) -> Result<(), String> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )
    .map_err(|e| format!("set_setting: {e}"))?;
    Ok(())
}

/// Delete all settings in a category.
pub fn delete_all_settings(conn: &Connection, category: &str) -> Result<(), String> {
    conn.execute(
        "DELETE FROM local_settings WHERE setting_category = ?1",
        params![category],
    )
    .map_err(|e| format!("delete_all_settings: {e}"))?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
