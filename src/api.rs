//! PostgREST API client for the remote sales backend.
//!
//! Provides URL normalisation, provisioning-string decoding and an
//! authenticated JSON client with per-request timeouts. Failures are mapped
//! to [`SyncError::Remote`] with a [`RemoteErrorKind`].

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{RemoteErrorKind, Result, SyncError};

/// Default timeout for API requests (30 seconds).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout used for the lightweight reachability probe.
pub const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the backend URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
/// - strip a trailing `/rest/v1` segment
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }

    if url.ends_with("/rest/v1") {
        url.truncate(url.len() - "/rest/v1".len());
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Provisioning strings
// ---------------------------------------------------------------------------

/// Decode a provisioning string: raw JSON, or base64/base64url JSON.
fn decode_connection_string_payload(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str::<Value>(trimmed).ok();
    }

    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.starts_with('{') {
        return serde_json::from_str::<Value>(&compact).ok();
    }
    if compact.len() < 20 {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64,
        "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

fn connection_string_field(raw: &str, keys: &[&str]) -> Option<String> {
    let payload = decode_connection_string_payload(raw)?;
    keys.iter()
        .find_map(|k| payload.get(*k).and_then(Value::as_str))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn extract_key_from_connection_string(raw: &str) -> Option<String> {
    connection_string_field(raw, &["key", "anonKey"])
}

pub fn extract_url_from_connection_string(raw: &str) -> Option<String> {
    connection_string_field(raw, &["url"]).map(|u| normalize_base_url(&u))
}

pub fn extract_terminal_id_from_connection_string(raw: &str) -> Option<String> {
    connection_string_field(raw, &["tid", "terminalId"])
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a classified remote error.
fn transport_error(url: &str, err: &reqwest::Error) -> SyncError {
    if err.is_timeout() {
        return SyncError::remote(RemoteErrorKind::Timeout, format!("Connection to {url} timed out"));
    }
    if err.is_connect() {
        return SyncError::remote(RemoteErrorKind::Network, format!("Cannot reach backend at {url}"));
    }
    if err.is_builder() {
        return SyncError::Config(format!("Invalid backend URL: {url}"));
    }
    if err.is_decode() {
        return SyncError::remote(RemoteErrorKind::Decode, format!("Invalid response from {url}: {err}"));
    }
    SyncError::remote(
        RemoteErrorKind::Network,
        format!("Network error communicating with {url}: {err}"),
    )
}

/// Convert an HTTP status code into a user-friendly message and kind.
fn status_error(status: StatusCode) -> (RemoteErrorKind, String) {
    match status.as_u16() {
        401 => (RemoteErrorKind::Rejected, "API key is invalid or expired".to_string()),
        403 => (RemoteErrorKind::Rejected, "Terminal not authorized".to_string()),
        404 => (RemoteErrorKind::Rejected, "Backend endpoint not found".to_string()),
        409 => (RemoteErrorKind::Rejected, "Conflicting record".to_string()),
        s if s >= 500 => (RemoteErrorKind::Server, format!("Backend server error (HTTP {s})")),
        s => (
            RemoteErrorKind::Rejected,
            format!("Unexpected response from backend (HTTP {s})"),
        ),
    }
}

/// Build the error for a non-success response, keeping PostgREST details.
fn response_error(status: StatusCode, body_text: &str) -> SyncError {
    let (kind, fallback) = status_error(status);
    let detail = if let Ok(json) = serde_json::from_str::<Value>(body_text) {
        let message = json
            .get("message")
            .or_else(|| json.get("error"))
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .unwrap_or(fallback);
        match json.get("details").and_then(Value::as_str) {
            Some(details) if !details.is_empty() => {
                format!("{message} (HTTP {}): {details}", status.as_u16())
            }
            _ => format!("{message} (HTTP {})", status.as_u16()),
        }
    } else if !body_text.trim().is_empty() {
        format!("{fallback} (HTTP {}): {}", status.as_u16(), body_text.trim())
    } else {
        format!("{fallback} (HTTP {})", status.as_u16())
    };
    SyncError::remote(kind, detail)
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Authenticated client for `<base>/rest/v1`.
#[derive(Clone)]
pub struct PostgrestClient {
    base_url: String,
    api_key: String,
    client: Client,
}

impl PostgrestClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        let base_url = normalize_base_url(base_url);
        let api_key = extract_key_from_connection_string(api_key)
            .unwrap_or_else(|| api_key.trim().to_string());
        if api_key.is_empty() {
            return Err(SyncError::Config("Missing backend API key".into()));
        }

        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| SyncError::Config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            base_url,
            api_key,
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/rest/v1{path}", self.base_url);
        self.client
            .request(method, url)
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
    }

    /// Send a request and decode the JSON body (`Null` for empty bodies).
    async fn send(&self, req: RequestBuilder, timeout: Duration) -> Result<Value> {
        let started = Instant::now();
        let resp = req
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;
        let status = resp.status();
        let body_text = resp
            .text()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;

        debug!(
            status = status.as_u16(),
            latency_ms = started.elapsed().as_millis() as u64,
            "backend response"
        );

        if !status.is_success() {
            return Err(response_error(status, &body_text));
        }
        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text).map_err(|e| {
            SyncError::remote(RemoteErrorKind::Decode, format!("Invalid JSON from backend: {e}"))
        })
    }

    /// `GET /rest/v1{path}` with PostgREST query parameters.
    pub async fn get(&self, path: &str, query: &[(&str, String)], timeout: Duration) -> Result<Value> {
        self.send(self.request(Method::GET, path).query(query), timeout)
            .await
    }

    /// `POST /rest/v1{path}` with a JSON body and optional `Prefer` header.
    pub async fn post(
        &self,
        path: &str,
        query: &[(&str, String)],
        body: &Value,
        prefer: Option<&str>,
        timeout: Duration,
    ) -> Result<Value> {
        let mut req = self.request(Method::POST, path).query(query).json(body);
        if let Some(prefer) = prefer {
            req = req.header("Prefer", prefer);
        }
        self.send(req, timeout).await
    }

    /// Call a database function: `POST /rest/v1/rpc/{name}`.
    pub async fn rpc(&self, name: &str, args: &Value, timeout: Duration) -> Result<Value> {
        self.post(&format!("/rpc/{name}"), &[], args, None, timeout)
            .await
    }
}
