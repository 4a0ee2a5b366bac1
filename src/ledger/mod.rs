//! Remote system of record for confirmed sales.
//!
//! The sync core relies on one contract from every implementation: inserting
//! a sale whose idempotency token is already known is a successful no-op that
//! returns the folio assigned the first time.

mod memory;
mod supabase;

pub use memory::MemoryLedger;
pub use supabase::{SupabaseLedger, SupabaseLedgerConfig};

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeZone, Utc};
use serde_json::Value;

use crate::error::Result;
use crate::model::{ConfirmedSale, SalePayload};

pub const DEFAULT_WEEKLY_LIMIT: usize = 10;
pub const DEFAULT_MONTHLY_LIMIT: usize = 12;

#[async_trait]
pub trait RemoteLedger: Send + Sync {
    /// Record a sale. `sold_at` carries the client timestamp of sales that
    /// were queued offline; `None` lets the ledger stamp the current time.
    async fn insert(
        &self,
        token: &str,
        payload: &SalePayload,
        sold_at: Option<DateTime<Utc>>,
    ) -> Result<ConfirmedSale>;

    /// Minimal read proving the ledger is reachable right now.
    async fn probe(&self) -> bool;

    /// Folio the next sale would probably receive. Informational only.
    async fn next_folio(&self) -> Result<i64>;

    /// Aggregates for one day; `None` means the current day.
    async fn daily_report(&self, date: Option<NaiveDate>) -> Result<Option<Value>>;

    async fn weekly_reports(&self, limit: usize) -> Result<Vec<Value>>;

    async fn monthly_reports(&self, limit: usize) -> Result<Vec<Value>>;

    /// Confirmed sales of one local business day, newest first.
    async fn sales_for_day(&self, date: NaiveDate) -> Result<Vec<ConfirmedSale>>;
}

pub(crate) fn fixed_offset(utc_offset_hours: i32) -> FixedOffset {
    FixedOffset::east_opt(utc_offset_hours.clamp(-23, 23) * 3600).unwrap_or_else(|| Utc.fix())
}

/// Local business-day bounds `[start, end]` at a fixed UTC offset.
pub fn day_bounds(
    date: NaiveDate,
    utc_offset_hours: i32,
) -> (DateTime<FixedOffset>, DateTime<FixedOffset>) {
    let offset = fixed_offset(utc_offset_hours);
    let start = NaiveDateTime::new(date, NaiveTime::default());
    let end = NaiveDateTime::new(
        date,
        NaiveTime::from_hms_opt(23, 59, 59).unwrap_or_default(),
    );
    let localize = |naive: NaiveDateTime| {
        offset
            .from_local_datetime(&naive)
            .single()
            .unwrap_or_else(|| offset.from_utc_datetime(&naive))
    };
    (localize(start), localize(end))
}

/// Today's date at a fixed UTC offset.
pub fn local_today(utc_offset_hours: i32) -> NaiveDate {
    Utc::now()
        .with_timezone(&fixed_offset(utc_offset_hours))
        .date_naive()
}
