//! Ledger credentials in the OS credential store.
//!
//! On Windows this uses DPAPI (via the `keyring` crate), on macOS Keychain,
//! and on Linux the Secret Service API.

use keyring::Entry;
use serde_json::Value;
use tracing::{info, warn};

use crate::api;

const SERVICE_NAME: &str = "lagruta-taquilla";

// Credential keys
pub const KEY_SUPABASE_URL: &str = "supabase_url";
pub const KEY_SUPABASE_ANON_KEY: &str = "supabase_anon_key";
pub const KEY_TERMINAL_ID: &str = "terminal_id";

/// All credential keys managed by this module.
const ALL_KEYS: &[&str] = &[KEY_SUPABASE_URL, KEY_SUPABASE_ANON_KEY, KEY_TERMINAL_ID];

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Retrieve a single credential from the OS keyring. Returns `None` when the
/// entry does not exist (or the platform returns a "not found" error).
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

pub fn set_credential(key: &str, value: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    entry.set_password(value).map_err(|e| e.to_string())?;
    Ok(())
}

/// Delete a credential. Silently succeeds if the entry does not exist.
pub fn delete_credential(key: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    match entry.delete_credential() {
        Ok(()) => Ok(()),
        Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

pub fn has_credential(key: &str) -> bool {
    get_credential(key).is_some()
}

// ---------------------------------------------------------------------------
// High-level API
// ---------------------------------------------------------------------------

/// The terminal can reach the ledger once URL and anon key are stored.
pub fn is_configured() -> bool {
    has_credential(KEY_SUPABASE_URL) && has_credential(KEY_SUPABASE_ANON_KEY)
}

/// Stored credentials with the key masked, for status output.
pub fn get_full_config() -> Value {
    serde_json::json!({
        "supabase_url": get_credential(KEY_SUPABASE_URL),
        "supabase_anon_key": get_credential(KEY_SUPABASE_ANON_KEY).map(|k| mask_secret(&k)),
        "terminal_id": get_credential(KEY_TERMINAL_ID),
    })
}

fn mask_secret(secret: &str) -> String {
    let visible: String = secret.chars().take(4).collect();
    format!("{visible}***")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub supabase_url: String,
    pub anon_key: String,
    pub terminal_id: Option<String>,
}

fn field(payload: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| payload.get(*k).and_then(Value::as_str))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Read credentials from an onboarding payload.
///
/// Accepts camelCase or snake_case keys. A `connectionString` (or an anon key
/// that is itself a provisioning string) supplies any missing field:
/// ```json
/// { "supabaseUrl": "...", "supabaseAnonKey": "...", "terminalId": "..." }
/// { "connectionString": "eyJ1cmwiOi..." }
/// ```
pub fn parse_credentials(payload: &Value) -> Result<Credentials, String> {
    let mut url = field(payload, &["supabaseUrl", "supabase_url", "url"]);
    let mut anon_key = field(payload, &["supabaseAnonKey", "supabase_anon_key", "anonKey", "key"]);
    let mut terminal_id = field(payload, &["terminalId", "terminal_id"]);

    let provisioning = field(payload, &["connectionString", "connection_string"])
        .or_else(|| anon_key.clone());
    if let Some(raw) = provisioning {
        if let Some(decoded_key) = api::extract_key_from_connection_string(&raw) {
            anon_key = Some(decoded_key);
            url = url.or_else(|| api::extract_url_from_connection_string(&raw));
            terminal_id = terminal_id.or_else(|| api::extract_terminal_id_from_connection_string(&raw));
        }
    }

    let url = url.ok_or("Missing required field: supabaseUrl")?;
    let anon_key = anon_key.ok_or("Missing required field: supabaseAnonKey")?;

    Ok(Credentials {
        supabase_url: api::normalize_base_url(&url),
        anon_key,
        terminal_id,
    })
}

/// Store ledger credentials received during onboarding.
pub fn update_credentials(payload: &Value) -> Result<Value, String> {
    let credentials = parse_credentials(payload)?;

    set_credential(KEY_SUPABASE_URL, &credentials.supabase_url)?;
    set_credential(KEY_SUPABASE_ANON_KEY, &credentials.anon_key)?;
    if let Some(tid) = credentials.terminal_id.as_deref() {
        set_credential(KEY_TERMINAL_ID, tid)?;
    }

    info!(url = %credentials.supabase_url, "ledger credentials updated");
    Ok(serde_json::json!({ "success": true }))
}

/// Delete every stored credential (factory reset).
pub fn factory_reset() -> Result<Value, String> {
    info!("performing factory reset – deleting all credentials");
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    Ok(serde_json::json!({ "success": true }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;

    #[test]
    fn test_parse_explicit_fields() {
        let creds = parse_credentials(&serde_json::json!({
            "supabaseUrl": "abc.supabase.co/",
            "supabaseAnonKey": "anon",
            "terminal_id": "taquilla-2"
        }))
        .unwrap();
        assert_eq!(creds.supabase_url, "https://abc.supabase.co");
        assert_eq!(creds.anon_key, "anon");
        assert_eq!(creds.terminal_id.as_deref(), Some("taquilla-2"));
    }

    #[test]
    fn test_parse_connection_string() {
        let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(r#"{"url":"https://abc.supabase.co","key":"k-1","tid":"t-9"}"#);
        let creds = parse_credentials(&serde_json::json!({ "connectionString": raw })).unwrap();
        assert_eq!(creds.supabase_url, "https://abc.supabase.co");
        assert_eq!(creds.anon_key, "k-1");
        assert_eq!(creds.terminal_id.as_deref(), Some("t-9"));
    }

    #[test]
    fn test_explicit_url_wins_over_connection_string() {
        let raw = r#"{"url":"https://old.supabase.co","key":"k-1"}"#;
        let creds = parse_credentials(&serde_json::json!({
            "supabaseUrl": "https://new.supabase.co",
            "connectionString": raw
        }))
        .unwrap();
        assert_eq!(creds.supabase_url, "https://new.supabase.co");
    }

    #[test]
    fn test_missing_fields_are_reported() {
        let err = parse_credentials(&serde_json::json!({ "supabaseAnonKey": "k" })).unwrap_err();
        assert!(err.contains("supabaseUrl"));
        let err = parse_credentials(&serde_json::json!({ "supabaseUrl": "x.co" })).unwrap_err();
        assert!(err.contains("supabaseAnonKey"));
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret("eyJhbGciOi"), "eyJh***");
    }
}
