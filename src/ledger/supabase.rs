//! Ledger backed by the Supabase `ventas` table over PostgREST.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{day_bounds, RemoteLedger};
use crate::api::{PostgrestClient, CONNECTIVITY_TIMEOUT, DEFAULT_TIMEOUT};
use crate::error::{RemoteErrorKind, Result, SyncError};
use crate::model::{ConfirmedSale, SalePayload};

const SALES_TABLE: &str = "/ventas";
const DAILY_VIEW: &str = "/reporte_diario";
const WEEKLY_VIEW: &str = "/reporte_semanal";
const MONTHLY_VIEW: &str = "/reporte_mensual";
const NEXT_FOLIO_RPC: &str = "obtener_siguiente_folio";
const TODAY_REPORT_RPC: &str = "obtener_reporte_dia_actual";
const INSERT_PREFER: &str = "return=representation,resolution=ignore-duplicates";

#[derive(Debug, Clone)]
pub struct SupabaseLedgerConfig {
    pub url: String,
    pub anon_key: String,
    /// Stored in `precio_unitario`.
    pub unit_price: f64,
    /// Offset of the local business day.
    pub utc_offset_hours: i32,
    pub probe_timeout: Duration,
    pub request_timeout: Duration,
}

impl SupabaseLedgerConfig {
    pub fn new(url: impl Into<String>, anon_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            anon_key: anon_key.into(),
            unit_price: 300.0,
            utc_offset_hours: -6,
            probe_timeout: CONNECTIVITY_TIMEOUT,
            request_timeout: DEFAULT_TIMEOUT,
        }
    }
}

pub struct SupabaseLedger {
    client: PostgrestClient,
    config: SupabaseLedgerConfig,
}

impl SupabaseLedger {
    pub fn new(config: SupabaseLedgerConfig) -> Result<Self> {
        let client = PostgrestClient::new(&config.url, &config.anon_key)?;
        info!(url = %client.base_url(), "Remote ledger configured");
        Ok(Self { client, config })
    }

    pub fn base_url(&self) -> &str {
        self.client.base_url()
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<Value>> {
        let rows = self
            .client
            .get(
                SALES_TABLE,
                &[
                    ("select", "*".to_string()),
                    ("client_id", format!("eq.{token}")),
                    ("limit", "1".to_string()),
                ],
                self.config.request_timeout,
            )
            .await?;
        Ok(first_row(rows))
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn build_row(
    folio: i64,
    token: &str,
    payload: &SalePayload,
    sold_at: DateTime<Utc>,
    unit_price: f64,
) -> Value {
    json!({
        "folio": folio,
        "fecha_hora": sold_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        "entradas_totales": payload.tickets,
        "cortesias": payload.courtesies,
        "entradas_cobradas": payload.charged(),
        "forma_pago": payload.payment_method.as_str(),
        "terminal": payload.terminal,
        "monto_total": payload.total,
        "efectivo_recibido": payload.cash_received,
        "cambio": payload.change,
        "precio_unitario": unit_price,
        "sincronizado": true,
        "client_id": token,
    })
}

/// First row of a PostgREST response (array or single object).
fn first_row(value: Value) -> Option<Value> {
    match value {
        Value::Array(rows) => rows.into_iter().next(),
        Value::Object(_) => Some(value),
        _ => None,
    }
}

fn rows(value: Value) -> Vec<Value> {
    match value {
        Value::Array(rows) => rows,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

/// Folio values arrive as numbers or numeric strings depending on the column
/// type and the RPC.
fn as_folio(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

/// The folio RPC answers with a scalar, a one-column row or a set of rows.
fn folio_from_rpc(value: &Value) -> Option<i64> {
    match value {
        Value::Array(items) => items.first().and_then(folio_from_rpc),
        Value::Object(columns) => columns.values().find_map(as_folio),
        other => as_folio(other),
    }
}

fn confirmed_from_row(row: Value, token: Option<&str>, deduplicated: bool) -> Result<ConfirmedSale> {
    let folio = row.get("folio").and_then(as_folio).ok_or_else(|| {
        SyncError::remote(RemoteErrorKind::Decode, "sale row without folio")
    })?;
    let idempotency_token = token
        .map(str::to_string)
        .or_else(|| row.get("client_id").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_default();
    let sold_at = row
        .get("fecha_hora")
        .and_then(Value::as_str)
        .map(str::to_string);
    Ok(ConfirmedSale {
        folio,
        idempotency_token,
        sold_at,
        deduplicated,
        record: row,
    })
}

#[async_trait]
impl RemoteLedger for SupabaseLedger {
    async fn insert(
        &self,
        token: &str,
        payload: &SalePayload,
        sold_at: Option<DateTime<Utc>>,
    ) -> Result<ConfirmedSale> {
        if let Some(existing) = self.find_by_token(token).await? {
            debug!(token = %token, "Sale already recorded remotely");
            return confirmed_from_row(existing, Some(token), true);
        }

        let folio = self.next_folio().await?;
        let row = build_row(
            folio,
            token,
            payload,
            sold_at.unwrap_or_else(Utc::now),
            self.config.unit_price,
        );
        let inserted = self
            .client
            .post(
                SALES_TABLE,
                &[("on_conflict", "client_id".to_string())],
                &row,
                Some(INSERT_PREFER),
                self.config.request_timeout,
            )
            .await?;

        match first_row(inserted) {
            Some(row) => {
                let confirmed = confirmed_from_row(row, Some(token), false)?;
                info!(folio = confirmed.folio, token = %token, "Sale recorded remotely");
                Ok(confirmed)
            }
            None => {
                // Another writer committed the same token between lookup and insert.
                warn!(token = %token, "Insert ignored as duplicate, re-reading");
                let existing = self.find_by_token(token).await?.ok_or_else(|| {
                    SyncError::remote(
                        RemoteErrorKind::Decode,
                        format!("sale {token} neither inserted nor found"),
                    )
                })?;
                confirmed_from_row(existing, Some(token), true)
            }
        }
    }

    async fn probe(&self) -> bool {
        match self
            .client
            .get(
                SALES_TABLE,
                &[("select", "id".to_string()), ("limit", "1".to_string())],
                self.config.probe_timeout,
            )
            .await
        {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "Ledger probe failed");
                false
            }
        }
    }

    async fn next_folio(&self) -> Result<i64> {
        let value = self
            .client
            .rpc(NEXT_FOLIO_RPC, &json!({}), self.config.request_timeout)
            .await?;
        Ok(folio_from_rpc(&value).unwrap_or(1))
    }

    async fn daily_report(&self, date: Option<NaiveDate>) -> Result<Option<Value>> {
        let value = match date {
            None => {
                self.client
                    .rpc(TODAY_REPORT_RPC, &json!({}), self.config.request_timeout)
                    .await?
            }
            Some(date) => {
                self.client
                    .get(
                        DAILY_VIEW,
                        &[
                            ("select", "*".to_string()),
                            ("fecha", format!("eq.{date}")),
                        ],
                        self.config.request_timeout,
                    )
                    .await?
            }
        };
        Ok(first_row(value))
    }

    async fn weekly_reports(&self, limit: usize) -> Result<Vec<Value>> {
        let value = self
            .client
            .get(
                WEEKLY_VIEW,
                &[
                    ("select", "*".to_string()),
                    ("order", "semana_inicio.desc".to_string()),
                    ("limit", limit.to_string()),
                ],
                self.config.request_timeout,
            )
            .await?;
        Ok(rows(value))
    }

    async fn monthly_reports(&self, limit: usize) -> Result<Vec<Value>> {
        let value = self
            .client
            .get(
                MONTHLY_VIEW,
                &[
                    ("select", "*".to_string()),
                    ("order", "mes.desc".to_string()),
                    ("limit", limit.to_string()),
                ],
                self.config.request_timeout,
            )
            .await?;
        Ok(rows(value))
    }

    async fn sales_for_day(&self, date: NaiveDate) -> Result<Vec<ConfirmedSale>> {
        let (start, end) = day_bounds(date, self.config.utc_offset_hours);
        let value = self
            .client
            .get(
                SALES_TABLE,
                &[
                    ("select", "*".to_string()),
                    ("fecha_hora", format!("gte.{}", start.to_rfc3339())),
                    ("fecha_hora", format!("lte.{}", end.to_rfc3339())),
                    ("order", "fecha_hora.desc".to_string()),
                ],
                self.config.request_timeout,
            )
            .await?;
        rows(value)
            .into_iter()
            .map(|row| confirmed_from_row(row, None, false))
            .collect()
    }
}
