//! Runtime configuration.
//!
//! Ledger credentials come from the environment or the OS credential store
//! (see [`crate::storage`]). Sync tunables live in `local_settings` under the
//! `sync` category; a missing or unparsable value falls back to its default.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::api;
use crate::db;
use crate::error::{Result, SyncError};
use crate::ledger::SupabaseLedgerConfig;
use crate::queue::LocalQueueStore;
use crate::storage;
use crate::sync::CoordinatorOptions;

pub const ENV_DATA_DIR: &str = "TAQUILLA_DATA_DIR";
pub const ENV_SUPABASE_URL: &str = "TAQUILLA_SUPABASE_URL";
pub const ENV_SUPABASE_ANON_KEY: &str = "TAQUILLA_SUPABASE_ANON_KEY";
pub const ENV_TERMINAL_ID: &str = "TAQUILLA_TERMINAL_ID";
pub const ENV_CONNECTION_STRING: &str = "TAQUILLA_CONNECTION_STRING";

const APP_IDENTIFIER: &str = "com.lagruta.taquilla";
const SETTINGS_CATEGORY: &str = "sync";

// ---------------------------------------------------------------------------
// Remote credentials
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    pub supabase_url: String,
    pub anon_key: String,
    pub terminal_id: Option<String>,
}

impl RemoteConfig {
    /// Provisioning string, then individual variables, then the keyring.
    pub fn load() -> Result<Self> {
        Self::resolve(|name| std::env::var(name).ok(), storage::get_credential)
    }

    fn resolve(
        env: impl Fn(&str) -> Option<String>,
        stored: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let env = |name: &str| env(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let provisioning = env(ENV_CONNECTION_STRING);

        let supabase_url = provisioning
            .as_deref()
            .and_then(api::extract_url_from_connection_string)
            .or_else(|| env(ENV_SUPABASE_URL))
            .or_else(|| stored(storage::KEY_SUPABASE_URL))
            .ok_or_else(|| SyncError::Config("ledger URL is not configured".into()))?;
        let anon_key = provisioning
            .as_deref()
            .and_then(api::extract_key_from_connection_string)
            .or_else(|| env(ENV_SUPABASE_ANON_KEY))
            .or_else(|| stored(storage::KEY_SUPABASE_ANON_KEY))
            .ok_or_else(|| SyncError::Config("ledger anon key is not configured".into()))?;
        let terminal_id = provisioning
            .as_deref()
            .and_then(api::extract_terminal_id_from_connection_string)
            .or_else(|| env(ENV_TERMINAL_ID))
            .or_else(|| stored(storage::KEY_TERMINAL_ID));

        Ok(Self {
            supabase_url: api::normalize_base_url(&supabase_url),
            anon_key,
            terminal_id,
        })
    }
}

// ---------------------------------------------------------------------------
// Sync tunables
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub auto_sync_enabled: bool,
    pub auto_sync_interval: Duration,
    pub post_write_delay: Duration,
    pub online_timeout: Duration,
    pub probe_timeout: Duration,
    pub insert_timeout: Duration,
    pub network_poll: Duration,
    pub unit_price: f64,
    pub utc_offset_hours: i32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auto_sync_enabled: true,
            auto_sync_interval: Duration::from_secs(300),
            post_write_delay: Duration::from_millis(1000),
            online_timeout: Duration::from_millis(5000),
            probe_timeout: Duration::from_millis(10_000),
            insert_timeout: Duration::from_millis(30_000),
            network_poll: Duration::from_secs(15),
            unit_price: 300.0,
            utc_offset_hours: -6,
        }
    }
}

fn parsed<T: FromStr>(raw: Option<String>, key: &str, default: T) -> T {
    match raw {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, value = %raw, "Invalid sync setting, using default");
                default
            }
        },
    }
}

impl SyncConfig {
    /// Read tunables from `local_settings`.
    pub fn load(queue: &LocalQueueStore) -> Result<Self> {
        queue.with_settings(|conn| {
            let get = |key: &str| db::get_setting(conn, SETTINGS_CATEGORY, key);
            let defaults = Self::default();
            // Timers and timeouts must be non-zero; a zero interval spins the timer.
            let nonzero = |key: &str, value: u64, default: u64| {
                if value == 0 {
                    warn!(key, "Sync setting must be non-zero, using default");
                    default
                } else {
                    value
                }
            };
            let secs = |key: &str, d: Duration| {
                Duration::from_secs(nonzero(key, parsed(get(key), key, d.as_secs()), d.as_secs()))
            };
            let millis = |key: &str, d: Duration| {
                let default = d.as_millis() as u64;
                Duration::from_millis(nonzero(key, parsed(get(key), key, default), default))
            };

            let utc_offset_hours = parsed(get("utc_offset_hours"), "utc_offset_hours", defaults.utc_offset_hours);
            let utc_offset_hours = if (-12..=14).contains(&utc_offset_hours) {
                utc_offset_hours
            } else {
                warn!(utc_offset_hours, "UTC offset out of range, using default");
                defaults.utc_offset_hours
            };

            let unit_price = parsed(get("unit_price"), "unit_price", defaults.unit_price);
            let unit_price = if unit_price.is_finite() && unit_price > 0.0 {
                unit_price
            } else {
                warn!(unit_price, "Unit price must be positive, using default");
                defaults.unit_price
            };

            Ok(Self {
                auto_sync_enabled: parsed(get("auto_sync_enabled"), "auto_sync_enabled", defaults.auto_sync_enabled),
                auto_sync_interval: secs("auto_sync_interval_secs", defaults.auto_sync_interval),
                post_write_delay: Duration::from_millis(parsed(
                    get("post_write_delay_ms"),
                    "post_write_delay_ms",
                    defaults.post_write_delay.as_millis() as u64,
                )),
                online_timeout: millis("online_timeout_ms", defaults.online_timeout),
                probe_timeout: millis("probe_timeout_ms", defaults.probe_timeout),
                insert_timeout: millis("insert_timeout_ms", defaults.insert_timeout),
                network_poll: secs("network_poll_secs", defaults.network_poll),
                unit_price,
                utc_offset_hours,
            })
        })
    }

    /// Write every tunable back to `local_settings`.
    pub fn save(&self, queue: &LocalQueueStore) -> Result<()> {
        let values = [
            ("auto_sync_enabled", self.auto_sync_enabled.to_string()),
            ("auto_sync_interval_secs", self.auto_sync_interval.as_secs().to_string()),
            ("post_write_delay_ms", self.post_write_delay.as_millis().to_string()),
            ("online_timeout_ms", self.online_timeout.as_millis().to_string()),
            ("probe_timeout_ms", self.probe_timeout.as_millis().to_string()),
            ("insert_timeout_ms", self.insert_timeout.as_millis().to_string()),
            ("network_poll_secs", self.network_poll.as_secs().to_string()),
            ("unit_price", self.unit_price.to_string()),
            ("utc_offset_hours", self.utc_offset_hours.to_string()),
        ];
        queue.with_settings(|conn| {
            for (key, value) in &values {
                db::set_setting(conn, SETTINGS_CATEGORY, key, value)?;
            }
            Ok(())
        })
    }

    /// Drop every stored tunable so the next load returns the defaults.
    pub fn reset(queue: &LocalQueueStore) -> Result<()> {
        queue.with_settings(|conn| db::delete_all_settings(conn, SETTINGS_CATEGORY))
    }

    pub fn coordinator_options(&self) -> CoordinatorOptions {
        CoordinatorOptions {
            probe_timeout: self.probe_timeout,
            insert_timeout: self.insert_timeout,
            post_write_delay: self.post_write_delay,
            auto_sync_interval: self.auto_sync_interval,
            auto_sync_enabled: self.auto_sync_enabled,
        }
    }

    pub fn ledger_config(&self, remote: &RemoteConfig) -> SupabaseLedgerConfig {
        SupabaseLedgerConfig {
            url: remote.supabase_url.clone(),
            anon_key: remote.anon_key.clone(),
            unit_price: self.unit_price,
            utc_offset_hours: self.utc_offset_hours,
            probe_timeout: self.probe_timeout,
            request_timeout: self.insert_timeout,
        }
    }
}

// ---------------------------------------------------------------------------
// Data directory
// ---------------------------------------------------------------------------

/// `TAQUILLA_DATA_DIR`, else the platform local-data directory plus the app
/// identifier.
pub fn data_dir() -> Result<PathBuf> {
    resolve_data_dir(|name| std::env::var_os(name).map(PathBuf::from))
}

fn resolve_data_dir(var: impl Fn(&str) -> Option<PathBuf>) -> Result<PathBuf> {
    if let Some(dir) = var(ENV_DATA_DIR).filter(|p| !p.as_os_str().is_empty()) {
        return Ok(dir);
    }

    let base = if cfg!(target_os = "windows") {
        var("LOCALAPPDATA")
    } else if cfg!(target_os = "macos") {
        var("HOME").map(|h| h.join("Library").join("Application Support"))
    } else {
        var("XDG_DATA_HOME").or_else(|| var("HOME").map(|h| h.join(".local").join("share")))
    };

    base.map(|b| b.join(APP_IDENTIFIER))
        .ok_or_else(|| SyncError::Config(format!("cannot resolve data directory; set {ENV_DATA_DIR}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_env_overrides_stored_credentials() {
        let env = vars(&[(ENV_SUPABASE_URL, "env.supabase.co")]);
        let stored = vars(&[
            (storage::KEY_SUPABASE_URL, "https://stored.supabase.co"),
            (storage::KEY_SUPABASE_ANON_KEY, "stored-key"),
        ]);
        let config = RemoteConfig::resolve(|k| env.get(k).cloned(), |k| stored.get(k).cloned()).unwrap();
        assert_eq!(config.supabase_url, "https://env.supabase.co");
        assert_eq!(config.anon_key, "stored-key");
        assert_eq!(config.terminal_id, None);
    }

    #[test]
    fn test_connection_string_wins() {
        let env = vars(&[
            (ENV_CONNECTION_STRING, r#"{"url":"cs.supabase.co","key":"cs-key","tid":"t1"}"#),
            (ENV_SUPABASE_URL, "env.supabase.co"),
        ]);
        let config = RemoteConfig::resolve(|k| env.get(k).cloned(), |_| None).unwrap();
        assert_eq!(config.supabase_url, "https://cs.supabase.co");
        assert_eq!(config.anon_key, "cs-key");
        assert_eq!(config.terminal_id.as_deref(), Some("t1"));
    }

    #[test]
    fn test_missing_credentials_are_config_errors() {
        let err = RemoteConfig::resolve(|_| None, |_| None).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn test_settings_defaults_and_overrides() {
        let queue = LocalQueueStore::open_in_memory().unwrap();
        assert_eq!(SyncConfig::load(&queue).unwrap(), SyncConfig::default());

        queue
            .with_settings(|conn| {
                db::set_setting(conn, SETTINGS_CATEGORY, "auto_sync_interval_secs", "60")?;
                db::set_setting(conn, SETTINGS_CATEGORY, "unit_price", "350")?;
                db::set_setting(conn, SETTINGS_CATEGORY, "online_timeout_ms", "soon")?;
                db::set_setting(conn, SETTINGS_CATEGORY, "utc_offset_hours", "40")
            })
            .unwrap();

        let config = SyncConfig::load(&queue).unwrap();
        assert_eq!(config.auto_sync_interval, Duration::from_secs(60));
        assert_eq!(config.unit_price, 350.0);
        assert_eq!(config.online_timeout, Duration::from_millis(5000));
        assert_eq!(config.utc_offset_hours, -6);
    }

    #[test]
    fn test_zero_timers_fall_back_to_defaults() {
        let queue = LocalQueueStore::open_in_memory().unwrap();
        let zeroed = SyncConfig {
            auto_sync_interval: Duration::ZERO,
            online_timeout: Duration::ZERO,
            probe_timeout: Duration::ZERO,
            insert_timeout: Duration::ZERO,
            network_poll: Duration::ZERO,
            post_write_delay: Duration::ZERO,
            unit_price: 0.0,
            ..SyncConfig::default()
        };
        zeroed.save(&queue).unwrap();

        let config = SyncConfig::load(&queue).unwrap();
        let defaults = SyncConfig::default();
        assert_eq!(config.auto_sync_interval, defaults.auto_sync_interval);
        assert_eq!(config.online_timeout, defaults.online_timeout);
        assert_eq!(config.probe_timeout, defaults.probe_timeout);
        assert_eq!(config.insert_timeout, defaults.insert_timeout);
        assert_eq!(config.network_poll, defaults.network_poll);
        assert_eq!(config.unit_price, defaults.unit_price);
        // An immediate post-write drain is allowed.
        assert_eq!(config.post_write_delay, Duration::ZERO);
    }

    #[test]
    fn test_save_then_load() {
        let queue = LocalQueueStore::open_in_memory().unwrap();
        let config = SyncConfig {
            auto_sync_enabled: false,
            post_write_delay: Duration::from_millis(250),
            ..SyncConfig::default()
        };
        config.save(&queue).unwrap();
        assert_eq!(SyncConfig::load(&queue).unwrap(), config);
        assert!(!config.coordinator_options().auto_sync_enabled);
    }

    #[test]
    fn test_reset_restores_defaults() {
        let queue = LocalQueueStore::open_in_memory().unwrap();
        SyncConfig {
            unit_price: 350.0,
            auto_sync_enabled: false,
            ..SyncConfig::default()
        }
        .save(&queue)
        .unwrap();

        SyncConfig::reset(&queue).unwrap();
        assert_eq!(SyncConfig::load(&queue).unwrap(), SyncConfig::default());
    }

    #[test]
    fn test_settings_need_open_store() {
        let queue = LocalQueueStore::new();
        assert!(matches!(SyncConfig::load(&queue), Err(SyncError::StorageUnavailable)));
    }

    #[test]
    #[serial]
    fn test_data_dir_env_override() {
        let dir = std::env::temp_dir().join("taquilla-data-test");
        std::env::set_var(ENV_DATA_DIR, &dir);
        assert_eq!(data_dir().unwrap(), dir);
        std::env::remove_var(ENV_DATA_DIR);
    }

    #[test]
    fn test_data_dir_platform_fallback() {
        let dir = resolve_data_dir(|name| match name {
            "HOME" => Some(PathBuf::from("/home/cajero")),
            "LOCALAPPDATA" => Some(PathBuf::from("C:\\Users\\cajero\\AppData\\Local")),
            _ => None,
        })
        .unwrap();
        assert!(dir.ends_with(APP_IDENTIFIER));
        assert!(resolve_data_dir(|_| None).is_err());
    }
}
