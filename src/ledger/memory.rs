//! In-process ledger with the same idempotency contract as the real backend.
//!
//! Used by tests and offline demos. Faults can be injected: the whole ledger
//! can be made unreachable, individual tokens can be rejected, the next N
//! inserts can fail, and latency can be added before or after the commit.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, Utc};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

use super::{day_bounds, fixed_offset, local_today, RemoteLedger};
use crate::error::{RemoteErrorKind, Result, SyncError};
use crate::model::{ConfirmedSale, PaymentMethod, SalePayload};

#[derive(Debug, Clone)]
struct StoredSale {
    folio: i64,
    token: String,
    sold_at: DateTime<Utc>,
    payload: SalePayload,
}

impl StoredSale {
    fn to_row(&self, unit_price: f64) -> Value {
        json!({
            "folio": self.folio,
            "fecha_hora": self.sold_at.to_rfc3339(),
            "entradas_totales": self.payload.tickets,
            "cortesias": self.payload.courtesies,
            "entradas_cobradas": self.payload.charged(),
            "forma_pago": self.payload.payment_method.as_str(),
            "terminal": self.payload.terminal,
            "monto_total": self.payload.total,
            "efectivo_recibido": self.payload.cash_received,
            "cambio": self.payload.change,
            "precio_unitario": unit_price,
            "sincronizado": true,
            "client_id": self.token,
        })
    }

    fn confirmed(&self, unit_price: f64, deduplicated: bool) -> ConfirmedSale {
        ConfirmedSale {
            folio: self.folio,
            idempotency_token: self.token.clone(),
            sold_at: Some(self.sold_at.to_rfc3339()),
            deduplicated,
            record: self.to_row(unit_price),
        }
    }
}

#[derive(Debug)]
struct LedgerState {
    sales: Vec<StoredSale>,
    by_token: HashMap<String, usize>,
    next_folio: i64,
    reachable: bool,
    failing_tokens: HashSet<String>,
    fail_next_inserts: usize,
    insert_delay: Duration,
    response_delay: Duration,
    insert_calls: usize,
}

pub struct MemoryLedger {
    state: Mutex<LedgerState>,
    unit_price: f64,
    utc_offset_hours: i32,
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::with_next_folio(1)
    }

    /// Ledger whose next assigned folio is `folio`.
    pub fn with_next_folio(folio: i64) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                sales: Vec::new(),
                by_token: HashMap::new(),
                next_folio: folio.max(1),
                reachable: true,
                failing_tokens: HashSet::new(),
                fail_next_inserts: 0,
                insert_delay: Duration::ZERO,
                response_delay: Duration::ZERO,
                insert_calls: 0,
            }),
            unit_price: 300.0,
            utc_offset_hours: -6,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -----------------------------------------------------------------------
    // Fault injection
    // -----------------------------------------------------------------------

    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Reject every insert carrying `token` until cleared.
    pub fn fail_token(&self, token: &str) {
        self.lock().failing_tokens.insert(token.to_string());
    }

    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.failing_tokens.clear();
        state.fail_next_inserts = 0;
    }

    /// Fail the next `n` insert calls with a server error.
    pub fn fail_next_inserts(&self, n: usize) {
        self.lock().fail_next_inserts = n;
    }

    /// Latency added before the sale is committed.
    pub fn set_insert_delay(&self, delay: Duration) {
        self.lock().insert_delay = delay;
    }

    /// Latency added after the sale is committed, as when a response is slow
    /// to come back.
    pub fn set_response_delay(&self, delay: Duration) {
        self.lock().response_delay = delay;
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    /// Number of confirmed sales.
    pub fn confirmed_count(&self) -> usize {
        self.lock().sales.len()
    }

    pub fn insert_calls(&self) -> usize {
        self.lock().insert_calls
    }

    pub fn folio_for(&self, token: &str) -> Option<i64> {
        let state = self.lock();
        state.by_token.get(token).map(|&i| state.sales[i].folio)
    }

    fn commit(&self, token: &str, payload: &SalePayload, sold_at: Option<DateTime<Utc>>) -> Result<ConfirmedSale> {
        let mut state = self.lock();
        state.insert_calls += 1;

        if !state.reachable {
            return Err(SyncError::remote(RemoteErrorKind::Network, "ledger unreachable"));
        }
        if state.fail_next_inserts > 0 {
            state.fail_next_inserts -= 1;
            return Err(SyncError::remote(RemoteErrorKind::Server, "Backend server error (HTTP 503)"));
        }
        if state.failing_tokens.contains(token) {
            return Err(SyncError::remote(
                RemoteErrorKind::Rejected,
                format!("sale {token} rejected (HTTP 400)"),
            ));
        }

        if let Some(&index) = state.by_token.get(token) {
            debug!(token = %token, folio = state.sales[index].folio, "Duplicate token ignored");
            return Ok(state.sales[index].confirmed(self.unit_price, true));
        }

        let folio = state.next_folio;
        state.next_folio += 1;
        let sale = StoredSale {
            folio,
            token: token.to_string(),
            sold_at: sold_at.unwrap_or_else(Utc::now),
            payload: payload.clone(),
        };
        let confirmed = sale.confirmed(self.unit_price, false);
        let index = state.sales.len();
        state.sales.push(sale);
        state.by_token.insert(token.to_string(), index);
        Ok(confirmed)
    }

    fn sales_on(&self, date: NaiveDate) -> Vec<StoredSale> {
        let (start, end) = day_bounds(date, self.utc_offset_hours);
        self.lock()
            .sales
            .iter()
            .filter(|s| s.sold_at >= start && s.sold_at <= end)
            .cloned()
            .collect()
    }

    fn local_date(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&fixed_offset(self.utc_offset_hours))
            .date_naive()
    }

    fn grouped_reports<K, F>(&self, limit: usize, key_name: &str, key_of: F) -> Vec<Value>
    where
        K: Ord + ToString,
        F: Fn(NaiveDate) -> K,
    {
        let sales = self.lock().sales.clone();
        let mut groups: BTreeMap<K, Vec<StoredSale>> = BTreeMap::new();
        for sale in sales {
            groups
                .entry(key_of(self.local_date(sale.sold_at)))
                .or_default()
                .push(sale);
        }
        groups
            .into_iter()
            .rev()
            .take(limit)
            .map(|(key, sales)| {
                let mut row = aggregate(&sales);
                row[key_name] = Value::String(key.to_string());
                row
            })
            .collect()
    }
}

/// Totals in the column names of the backend report views.
fn aggregate(sales: &[StoredSale]) -> Value {
    let mut tickets = 0u64;
    let mut courtesies = 0u64;
    let mut amount = 0.0;
    let mut by_method: HashMap<&'static str, f64> = HashMap::new();
    for sale in sales {
        tickets += u64::from(sale.payload.tickets);
        courtesies += u64::from(sale.payload.courtesies);
        amount += sale.payload.total;
        *by_method.entry(sale.payload.payment_method.as_str()).or_default() += sale.payload.total;
    }
    json!({
        "total_ventas": sales.len(),
        "entradas_totales": tickets,
        "cortesias": courtesies,
        "monto_total": amount,
        "efectivo": by_method.get(PaymentMethod::Cash.as_str()).copied().unwrap_or(0.0),
        "tarjeta": by_method.get(PaymentMethod::Card.as_str()).copied().unwrap_or(0.0),
        "transferencia": by_method.get(PaymentMethod::Transfer.as_str()).copied().unwrap_or(0.0),
    })
}

#[async_trait]
impl RemoteLedger for MemoryLedger {
    async fn insert(
        &self,
        token: &str,
        payload: &SalePayload,
        sold_at: Option<DateTime<Utc>>,
    ) -> Result<ConfirmedSale> {
        let delay = self.lock().insert_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let confirmed = self.commit(token, payload, sold_at)?;

        let delay = self.lock().response_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(confirmed)
    }

    async fn probe(&self) -> bool {
        self.lock().reachable
    }

    async fn next_folio(&self) -> Result<i64> {
        let state = self.lock();
        if !state.reachable {
            return Err(SyncError::remote(RemoteErrorKind::Network, "ledger unreachable"));
        }
        Ok(state.next_folio)
    }

    async fn daily_report(&self, date: Option<NaiveDate>) -> Result<Option<Value>> {
        let date = date.unwrap_or_else(|| local_today(self.utc_offset_hours));
        let sales = self.sales_on(date);
        if sales.is_empty() {
            return Ok(None);
        }
        let mut row = aggregate(&sales);
        row["fecha"] = Value::String(date.to_string());
        Ok(Some(row))
    }

    async fn weekly_reports(&self, limit: usize) -> Result<Vec<Value>> {
        Ok(self.grouped_reports(limit, "semana_inicio", |d| {
            d - ChronoDuration::days(i64::from(d.weekday().num_days_from_monday()))
        }))
    }

    async fn monthly_reports(&self, limit: usize) -> Result<Vec<Value>> {
        Ok(self.grouped_reports(limit, "mes", |d| format!("{:04}-{:02}", d.year(), d.month())))
    }

    async fn sales_for_day(&self, date: NaiveDate) -> Result<Vec<ConfirmedSale>> {
        let mut sales = self.sales_on(date);
        sales.sort_by(|a, b| b.sold_at.cmp(&a.sold_at));
        Ok(sales
            .iter()
            .map(|s| s.confirmed(self.unit_price, false))
            .collect())
    }
}
