//! Shared types for the insider tracker.
//!
//! These types form the data model passed between the acquisition and
//! reconciliation stages and the storage layer. They carry no I/O.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Format used by the filings feed and the holdings ledger for filing times.
pub const FILING_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Normalise a raw ticker: trim, upper-case, and validate the charset.
///
/// Returns `None` for empty input or anything outside `A-Z0-9.-`.
pub fn normalize_ticker(raw: &str) -> Option<String> {
    let t = raw.trim().to_ascii_uppercase();
    if t.is_empty() || t.len() > 12 {
        return None;
    }
    if t.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-') {
        Some(t)
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Acquisition output
// ---------------------------------------------------------------------------

/// A price quote as returned by a data source, before it is stamped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quote {
    pub price: Decimal,
    /// Trading day the source reports the price for, when it says.
    pub trading_day: Option<NaiveDate>,
}

/// Snapshot of one identifier's market data at acquisition time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScrapedRecord {
    pub ticker: String,
    pub price: Decimal,
    pub trading_day: Option<NaiveDate>,
    pub fetched_at: DateTime<Utc>,
}

impl fmt::Display for ScrapedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {} ({})", self.ticker, self.price, self.fetched_at.format("%Y-%m-%d %H:%M:%S UTC"))
    }
}

/// All records acquired in one run, keyed and ordered by ticker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    records: BTreeMap<String, ScrapedRecord>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record, replacing any previous record for the same ticker.
    pub fn insert(&mut self, record: ScrapedRecord) {
        self.records.insert(record.ticker.clone(), record);
    }

    pub fn get(&self, ticker: &str) -> Option<&ScrapedRecord> {
        self.records.get(ticker)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in ticker order.
    pub fn records(&self) -> impl Iterator<Item = &ScrapedRecord> {
        self.records.values()
    }

    /// The identifier → price mapping carried by this snapshot.
    pub fn prices(&self) -> BTreeMap<String, Decimal> {
        self.records
            .iter()
            .map(|(t, r)| (t.clone(), r.price))
            .collect()
    }
}

impl FromIterator<ScrapedRecord> for Snapshot {
    fn from_iter<I: IntoIterator<Item = ScrapedRecord>>(iter: I) -> Self {
        let mut snapshot = Snapshot::new();
        for record in iter {
            snapshot.insert(record);
        }
        snapshot
    }
}

// ---------------------------------------------------------------------------
// Filings & holdings
// ---------------------------------------------------------------------------

/// One insider purchase parsed from the filings feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsiderFiling {
    pub filing_date: NaiveDateTime,
    pub ticker: String,
    pub company_name: String,
    pub insider_name: String,
    pub transaction_price: Decimal,
    /// Total purchase value in whole dollars.
    pub value: u64,
}

/// Identity of a holding in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct HoldingKey {
    pub filing_date: NaiveDateTime,
    pub ticker: String,
}

impl fmt::Display for HoldingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.ticker, self.filing_date.format(FILING_DATE_FORMAT))
    }
}

/// A tracked purchase with its bought price and derived status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HoldingRecord {
    pub filing_date: NaiveDateTime,
    pub ticker: String,
    pub company_name: String,
    pub insider_name: String,
    /// Price from the filing. Empty in older ledgers until refilled.
    pub transaction_price: Option<Decimal>,
    /// Market close nearest the filing time. Empty until backfilled.
    pub price_bought: Option<Decimal>,
    pub value: u64,
    pub current_price: Option<Decimal>,
    /// Percent change of `current_price` against `price_bought`.
    pub change_pct: Option<Decimal>,
    /// `fetched_at` of the snapshot record last applied.
    pub priced_at: Option<DateTime<Utc>>,
}

impl HoldingRecord {
    pub fn key(&self) -> HoldingKey {
        HoldingKey {
            filing_date: self.filing_date,
            ticker: self.ticker.clone(),
        }
    }

    /// Whether the bought price still has to be looked up.
    pub fn needs_backfill(&self) -> bool {
        self.price_bought.is_none()
    }

    /// Build a new, not yet priced holding from a filing.
    pub fn from_filing(filing: InsiderFiling) -> Self {
        Self {
            filing_date: filing.filing_date,
            ticker: filing.ticker,
            company_name: filing.company_name,
            insider_name: filing.insider_name,
            transaction_price: Some(filing.transaction_price),
            price_bought: None,
            value: filing.value,
            current_price: None,
            change_pct: None,
            priced_at: None,
        }
    }
}

impl fmt::Display for HoldingRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bought = self
            .price_bought
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        let current = self
            .current_price
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        let change = self
            .change_pct
            .map(|c| format!("{c:+}%"))
            .unwrap_or_else(|| "-".to_string());
        write!(
            f,
            "{} {:<6} {:<30} bought={bought} now={current} ({change})",
            self.filing_date.format(FILING_DATE_FORMAT),
            self.ticker,
            self.company_name,
        )
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Failures surfaced by the pipeline stages.
///
/// `SourceUnavailable`, `PersistenceFailure`, `CorruptDataset` and `Config`
/// abort a run. The other two are reported and contained within a stage.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Source unavailable ({provider}): {reason}")]
    SourceUnavailable { provider: String, reason: String },

    #[error("Fetch failed for {ticker}: {reason}")]
    RecordFetchFailed { ticker: String, reason: String },

    #[error("No fresh data for {ticker}")]
    ReconciliationGap { ticker: String },

    #[error("Failed to persist {path}: {source}")]
    PersistenceFailure {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt dataset {path}: {message}")]
    CorruptDataset { path: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// Whether this error must abort the run.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            PipelineError::RecordFetchFailed { .. } | PipelineError::ReconciliationGap { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
