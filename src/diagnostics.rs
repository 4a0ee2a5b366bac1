//! Operator diagnostics.
//!
//! Provides:
//! - **About info**: version, build timestamp, git SHA, platform
//! - **Sync snapshot**: pending and failing counts, per-record summaries and
//!   the current sync status
//! - **Diagnostics export**: packages the above plus recent logs into a zip
//! - **Log rotation helpers**: used by `lib.rs` to configure rolling log files

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::fs;
use std::io::{Read as _, Write as _};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::db;
use crate::error::Result;
use crate::queue::LocalQueueStore;
use crate::status::{StatusHub, SyncStatus};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

/// Maximum size per log file in bytes (5 MB).
pub const MAX_LOG_SIZE: u64 = 5 * 1024 * 1024;

/// Prefix of the rolling log files.
pub const LOG_FILE_PREFIX: &str = "taquilla";

#[derive(Debug, Clone, Copy)]
pub struct DiagnosticsExportOptions {
    pub include_logs: bool,
    pub redact_sensitive: bool,
}

impl Default for DiagnosticsExportOptions {
    fn default() -> Self {
        Self {
            include_logs: true,
            redact_sensitive: false,
        }
    }
}

// ---------------------------------------------------------------------------
// About info
// ---------------------------------------------------------------------------

/// Returns version, build timestamp, git SHA, and platform info.
pub fn about_info() -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "buildTimestamp": env!("BUILD_TIMESTAMP"),
        "gitSha": env!("BUILD_GIT_SHA"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "rustVersion": env!("CARGO_PKG_RUST_VERSION"),
    })
}

// ---------------------------------------------------------------------------
// Sync snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSummary {
    pub local_id: i64,
    pub idempotency_token: String,
    pub created_at: String,
    pub attempts: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSnapshot {
    pub generated_at: String,
    pub schema_version: i32,
    pub pending: usize,
    /// Pending records with at least one failed remote attempt.
    pub failing: usize,
    pub records: Vec<PendingSummary>,
    pub status: SyncStatus,
}

pub fn snapshot(queue: &LocalQueueStore, status: &StatusHub) -> Result<SyncSnapshot> {
    let schema_version = queue.with_settings(|conn| Ok(db::schema_version(conn)))?;
    let records: Vec<PendingSummary> = queue
        .list_all()?
        .into_iter()
        .map(|sale| PendingSummary {
            local_id: sale.local_id,
            idempotency_token: sale.idempotency_token,
            created_at: sale.created_at.to_rfc3339(),
            attempts: sale.attempts,
            last_error: sale.last_error,
        })
        .collect();

    Ok(SyncSnapshot {
        generated_at: Utc::now().to_rfc3339(),
        schema_version,
        pending: queue.count()?,
        failing: queue.failing_count()?,
        records,
        status: status.snapshot(),
    })
}

// ---------------------------------------------------------------------------
// Diagnostics export (zip bundle)
// ---------------------------------------------------------------------------

type ZipOut = zip::ZipWriter<fs::File>;

fn write_json(
    zip: &mut ZipOut,
    name: &str,
    value: Value,
    options: zip::write::SimpleFileOptions,
) -> std::result::Result<(), String> {
    let body = serde_json::to_string_pretty(&value).map_err(|e| e.to_string())?;
    zip.start_file(name, options).map_err(|e| e.to_string())?;
    zip.write_all(body.as_bytes()).map_err(|e| e.to_string())
}

/// Writes `taquilla-diagnostics-<ts>.zip` into `output_dir` and returns its
/// path.
pub fn export_bundle(
    output_dir: &Path,
    snapshot: &SyncSnapshot,
    log_dir: Option<&Path>,
    export_options: DiagnosticsExportOptions,
) -> std::result::Result<PathBuf, String> {
    fs::create_dir_all(output_dir)
        .map_err(|e| format!("Failed to create {}: {e}", output_dir.display()))?;

    let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
    let zip_path = output_dir.join(format!("taquilla-diagnostics-{timestamp}.zip"));

    let file = fs::File::create(&zip_path)
        .map_err(|e| format!("Failed to create diagnostics zip: {e}"))?;
    let mut zip = zip::ZipWriter::new(file);

    let zip_options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    let redact = export_options.redact_sensitive;

    // 1. About info
    write_json(&mut zip, "about.json", redact_value_for_export(about_info(), redact), zip_options)?;

    // 2. Queue and status
    let snapshot = serde_json::to_value(snapshot).map_err(|e| e.to_string())?;
    write_json(
        &mut zip,
        "sync_snapshot.json",
        redact_value_for_export(snapshot, redact),
        zip_options,
    )?;

    // 3. Log files; skipped when redacting since raw lines carry tokens.
    if let Some(log_dir) = log_dir.filter(|d| export_options.include_logs && !redact && d.exists()) {
        for path in log_files(log_dir) {
            let fname = path
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string();
            if zip.start_file(format!("logs/{fname}"), zip_options).is_ok() {
                if let Ok(f) = fs::File::open(&path) {
                    let mut buf = Vec::new();
                    // Cap at 5MB per file to keep zip manageable
                    let _ = f.take(MAX_LOG_SIZE).read_to_end(&mut buf);
                    let _ = zip.write_all(&buf);
                }
            }
        }
    }

    zip.finish().map_err(|e| e.to_string())?;
    info!(path = %zip_path.display(), "Diagnostics bundle written");
    Ok(zip_path)
}

fn redact_value_for_export(value: Value, enabled: bool) -> Value {
    if !enabled {
        return value;
    }
    redact_sensitive_fields(value)
}

fn redact_sensitive_fields(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut redacted = serde_json::Map::new();
            for (key, value) in map {
                if should_redact_key(&key) {
                    redacted.insert(key, Value::String("[REDACTED]".to_string()));
                } else {
                    redacted.insert(key, redact_sensitive_fields(value));
                }
            }
            Value::Object(redacted)
        }
        Value::Array(items) => {
            Value::Array(items.into_iter().map(redact_sensitive_fields).collect())
        }
        other => other,
    }
}

fn should_redact_key(key: &str) -> bool {
    let normalized = key.to_ascii_lowercase();
    let sensitive_markers = [
        "api_key",
        "apikey",
        "anon_key",
        "anonkey",
        "secret",
        "password",
        "token",
        "authorization",
    ];
    sensitive_markers
        .iter()
        .any(|marker| normalized.contains(marker))
}

// ---------------------------------------------------------------------------
// Log rotation
// ---------------------------------------------------------------------------

/// Log directory under the data directory.
pub fn get_log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

/// Rolling log files in `log_dir`, newest first.
fn log_files(log_dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let is_log = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(LOG_FILE_PREFIX));
            if is_log {
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::UNIX_EPOCH);
                files.push((path, modified));
            }
        }
    }
    files.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
    files.into_iter().map(|(path, _)| path).collect()
}

/// Prune old log files, keeping only the most recent `MAX_LOG_FILES`.
pub fn prune_old_logs(log_dir: &Path) -> usize {
    if !log_dir.exists() {
        return 0;
    }

    let mut removed = 0;
    for path in log_files(log_dir).iter().skip(MAX_LOG_FILES) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to prune log file {}: {e}", path.display()),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PaymentMethod, SalePayload};

    fn temp_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("{label}_{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn payload() -> SalePayload {
        SalePayload {
            tickets: 1,
            courtesies: 0,
            charged_tickets: None,
            payment_method: PaymentMethod::Cash,
            terminal: None,
            total: 300.0,
            cash_received: None,
            change: None,
        }
    }

    #[test]
    fn test_about_info_has_required_fields() {
        let info = about_info();
        assert!(info.get("version").is_some());
        assert!(info.get("buildTimestamp").is_some());
        assert!(info.get("gitSha").is_some());
        assert!(info.get("platform").is_some());
        assert!(info.get("arch").is_some());
    }

    #[test]
    fn test_snapshot_counts_failing_records() {
        let queue = LocalQueueStore::open_in_memory().unwrap();
        let hub = StatusHub::new(false);
        let first = queue.enqueue(&payload()).unwrap();
        queue.enqueue(&payload()).unwrap();
        queue.record_failure(first.local_id, "HTTP 503").unwrap();

        let snap = snapshot(&queue, &hub).unwrap();
        assert_eq!(snap.pending, 2);
        assert_eq!(snap.failing, 1);
        assert_eq!(snap.records.len(), 2);
        assert_eq!(snap.schema_version, 2);
        let failed = snap.records.iter().find(|r| r.local_id == first.local_id).unwrap();
        assert_eq!(failed.attempts, 1);
        assert_eq!(failed.last_error.as_deref(), Some("HTTP 503"));
        assert!(!snap.status.online);
    }

    #[test]
    fn test_export_bundle_creates_zip() {
        let dir = temp_dir("diag_export");
        let log_dir = dir.join("logs");
        fs::create_dir_all(&log_dir).unwrap();
        fs::write(log_dir.join("taquilla.2025-03-14"), "sync ok\n").unwrap();
        fs::write(log_dir.join("unrelated.txt"), "x").unwrap();

        let queue = LocalQueueStore::open_in_memory().unwrap();
        queue.enqueue(&payload()).unwrap();
        let snap = snapshot(&queue, &StatusHub::new(true)).unwrap();

        let zip_path = export_bundle(
            &dir.join("out"),
            &snap,
            Some(&log_dir),
            DiagnosticsExportOptions::default(),
        )
        .unwrap();
        assert!(zip_path.exists());

        let file = fs::File::open(&zip_path).unwrap();
        let mut archive = zip::ZipArchive::new(file).unwrap();
        let names: Vec<String> = archive.file_names().map(str::to_string).collect();
        assert!(names.contains(&"about.json".to_string()));
        assert!(names.contains(&"sync_snapshot.json".to_string()));
        assert!(names.contains(&"logs/taquilla.2025-03-14".to_string()));
        assert!(!names.iter().any(|n| n.contains("unrelated")));

        let mut body = String::new();
        archive
            .by_name("sync_snapshot.json")
            .unwrap()
            .read_to_string(&mut body)
            .unwrap();
        let json: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["pending"], json!(1));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_redacted_export_hides_tokens_and_logs() {
        let dir = temp_dir("diag_redact");
        let log_dir = dir.join("logs");
        fs::create_dir_all(&log_dir).unwrap();
        fs::write(log_dir.join("taquilla.2025-03-14"), "token=abc\n").unwrap();

        let queue = LocalQueueStore::open_in_memory().unwrap();
        queue.enqueue(&payload()).unwrap();
        let snap = snapshot(&queue, &StatusHub::new(true)).unwrap();

        let zip_path = export_bundle(
            &dir,
            &snap,
            Some(&log_dir),
            DiagnosticsExportOptions {
                include_logs: true,
                redact_sensitive: true,
            },
        )
        .unwrap();

        let mut archive = zip::ZipArchive::new(fs::File::open(&zip_path).unwrap()).unwrap();
        assert!(!archive.file_names().any(|n| n.starts_with("logs/")));
        let mut body = String::new();
        archive
            .by_name("sync_snapshot.json")
            .unwrap()
            .read_to_string(&mut body)
            .unwrap();
        let json: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["records"][0]["idempotencyToken"], json!("[REDACTED]"));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_should_redact_key_matches_sensitive_markers() {
        assert!(should_redact_key("supabase_anon_key"));
        assert!(should_redact_key("Authorization"));
        assert!(should_redact_key("idempotencyToken"));
        assert!(!should_redact_key("status"));
    }

    #[test]
    fn test_redact_sensitive_fields_recurses_through_objects() {
        let value = json!({
            "token": "tk-val",
            "nested": {
                "api_key": "key-value",
                "status": "ok"
            },
            "items": [
                { "password": "1234" },
                { "name": "safe" }
            ]
        });

        let redacted = redact_sensitive_fields(value);
        assert_eq!(redacted["token"], json!("[REDACTED]"));
        assert_eq!(redacted["nested"]["api_key"], json!("[REDACTED]"));
        assert_eq!(redacted["nested"]["status"], json!("ok"));
        assert_eq!(redacted["items"][0]["password"], json!("[REDACTED]"));
        assert_eq!(redacted["items"][1]["name"], json!("safe"));
    }

    #[test]
    fn test_prune_keeps_newest_logs() {
        let dir = temp_dir("diag_prune");
        for day in 1..=(MAX_LOG_FILES + 3) {
            fs::write(dir.join(format!("taquilla.2025-03-{day:02}")), "x").unwrap();
        }
        fs::write(dir.join("keep.me"), "x").unwrap();

        assert_eq!(prune_old_logs(&dir), 3);
        assert_eq!(log_files(&dir).len(), MAX_LOG_FILES);
        assert!(dir.join("keep.me").exists());
        let _ = fs::remove_dir_all(&dir);
    }
}
