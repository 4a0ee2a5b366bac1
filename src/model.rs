//! Sale records as they move between the ticket window, the local queue and
//! the remote ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Sale payload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentMethod {
    #[serde(rename = "efectivo")]
    Cash,
    #[serde(rename = "tarjeta")]
    Card,
    #[serde(rename = "transferencia")]
    Transfer,
}

impl PaymentMethod {
    /// Value stored in the remote `forma_pago` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cash => "efectivo",
            PaymentMethod::Card => "tarjeta",
            PaymentMethod::Transfer => "transferencia",
        }
    }
}

/// Business fields of one ticket sale. Opaque to the sync core: it is stored
/// and forwarded unchanged.
///
/// Keys on the wire are the ones the ticket window sends
/// (`entradas`, `cortesias`, `formaPago`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SalePayload {
    #[serde(rename = "entradas")]
    pub tickets: u32,
    #[serde(rename = "cortesias", default)]
    pub courtesies: u32,
    #[serde(rename = "entradasCobrar", default, skip_serializing_if = "Option::is_none")]
    pub charged_tickets: Option<u32>,
    #[serde(rename = "formaPago", default = "default_payment_method")]
    pub payment_method: PaymentMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal: Option<String>,
    pub total: f64,
    #[serde(rename = "efectivoRecibido", default, skip_serializing_if = "Option::is_none")]
    pub cash_received: Option<f64>,
    #[serde(rename = "cambio", default, skip_serializing_if = "Option::is_none")]
    pub change: Option<f64>,
}

fn default_payment_method() -> PaymentMethod {
    PaymentMethod::Cash
}

impl SalePayload {
    /// Tickets actually charged; courtesies are free.
    pub fn charged(&self) -> u32 {
        self.charged_tickets
            .unwrap_or_else(|| self.tickets.saturating_sub(self.courtesies))
    }
}

// ---------------------------------------------------------------------------
// Local queue records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordState {
    Pending,
    /// Only observable inside the removal transaction; synced records are
    /// deleted rather than retained.
    Synced,
}

impl RecordState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordState::Pending => "pending",
            RecordState::Synced => "synced",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(RecordState::Pending),
            "synced" => Some(RecordState::Synced),
            _ => None,
        }
    }
}

/// A sale captured while the remote ledger was unreachable or unconfirmed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSale {
    pub local_id: i64,
    pub idempotency_token: String,
    pub created_at: DateTime<Utc>,
    pub payload: SalePayload,
    pub sync_state: RecordState,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

// ---------------------------------------------------------------------------
// Remote records
// ---------------------------------------------------------------------------

/// System-of-record view of a sale after the remote ledger accepted it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmedSale {
    pub folio: i64,
    pub idempotency_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sold_at: Option<String>,
    /// True when the ledger already held this token and returned the
    /// previously assigned folio.
    pub deduplicated: bool,
    /// Raw row as returned by the ledger.
    pub record: Value,
}

// ---------------------------------------------------------------------------
// Idempotency tokens
// ---------------------------------------------------------------------------

const TOKEN_SUFFIX_LEN: usize = 9;

/// Generate a client idempotency token: `<unix-millis>-<9 alphanumerics>`.
pub fn new_idempotency_token() -> String {
    let millis = Utc::now().timestamp_millis();
    let suffix: String = Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(TOKEN_SUFFIX_LEN)
        .collect();
    format!("{millis}-{suffix}")
}
