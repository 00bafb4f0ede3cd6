//! CSV encoding of the two datasets.
//!
//! Rows go through string-typed structs so every cell is written exactly as
//! the domain value formats itself: decimals keep their scale, empty
//! optionals are empty cells, timestamps are RFC 3339 with whole seconds.
//! Re-encoding an untouched row yields the same bytes.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::str::FromStr;

use crate::types::{HoldingRecord, ScrapedRecord, Snapshot, FILING_DATE_FORMAT};

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct QuoteRow {
    #[serde(rename = "Ticker")]
    ticker: String,
    #[serde(rename = "Price")]
    price: String,
    #[serde(rename = "Trading Day", default)]
    trading_day: String,
    #[serde(rename = "Fetched At")]
    fetched_at: String,
}

/// First seven columns are the legacy `insider_buys.csv` layout; derived
/// columns follow and may be absent in older files.
#[derive(Debug, Serialize, Deserialize)]
struct HoldingRow {
    #[serde(rename = "Filing Date")]
    filing_date: String,
    #[serde(rename = "Ticker")]
    ticker: String,
    #[serde(rename = "Company Name")]
    company_name: String,
    #[serde(rename = "Insider Name", default)]
    insider_name: String,
    #[serde(rename = "Transaction Price", default)]
    transaction_price: String,
    #[serde(rename = "Price Bought", default)]
    price_bought: String,
    #[serde(rename = "Value")]
    value: String,
    #[serde(rename = "Current Price", default)]
    current_price: String,
    #[serde(rename = "Change %", default)]
    change_pct: String,
    #[serde(rename = "Priced At", default)]
    priced_at: String,
}

/// A row that could not be turned into a domain record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowError {
    /// 1-based line in the file, header included.
    pub line: usize,
    pub message: String,
}

impl fmt::Display for RowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

// ---------------------------------------------------------------------------
// Cell helpers
// ---------------------------------------------------------------------------

fn fmt_opt<T: ToString>(v: &Option<T>) -> String {
    v.as_ref().map(ToString::to_string).unwrap_or_default()
}

fn fmt_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_decimal(field: &str, raw: &str) -> Result<Decimal, String> {
    Decimal::from_str(raw.trim()).map_err(|e| format!("{field}: invalid decimal '{raw}': {e}"))
}

fn parse_opt_decimal(field: &str, raw: &str) -> Result<Option<Decimal>, String> {
    if raw.trim().is_empty() {
        Ok(None)
    } else {
        parse_decimal(field, raw).map(Some)
    }
}

fn parse_timestamp(field: &str, raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("{field}: invalid timestamp '{raw}': {e}"))
}

fn parse_opt_timestamp(field: &str, raw: &str) -> Result<Option<DateTime<Utc>>, String> {
    if raw.trim().is_empty() {
        Ok(None)
    } else {
        parse_timestamp(field, raw).map(Some)
    }
}

fn new_writer() -> csv::Writer<Vec<u8>> {
    csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new())
}

fn finish(writer: csv::Writer<Vec<u8>>) -> io::Result<Vec<u8>> {
    writer.into_inner().map_err(|e| e.into_error())
}

// ---------------------------------------------------------------------------
// Quotes
// ---------------------------------------------------------------------------

impl From<&ScrapedRecord> for QuoteRow {
    fn from(r: &ScrapedRecord) -> Self {
        Self {
            ticker: r.ticker.clone(),
            price: r.price.to_string(),
            trading_day: fmt_opt(&r.trading_day),
            fetched_at: fmt_timestamp(&r.fetched_at),
        }
    }
}

impl TryFrom<QuoteRow> for ScrapedRecord {
    type Error = String;

    fn try_from(row: QuoteRow) -> Result<Self, Self::Error> {
        let ticker = crate::types::normalize_ticker(&row.ticker)
            .ok_or_else(|| format!("Ticker: invalid identifier '{}'", row.ticker))?;
        let trading_day = if row.trading_day.trim().is_empty() {
            None
        } else {
            Some(
                NaiveDate::parse_from_str(row.trading_day.trim(), "%Y-%m-%d")
                    .map_err(|e| format!("Trading Day: '{}': {e}", row.trading_day))?,
            )
        };
        Ok(ScrapedRecord {
            ticker,
            price: parse_decimal("Price", &row.price)?,
            trading_day,
            fetched_at: parse_timestamp("Fetched At", &row.fetched_at)?,
        })
    }
}

/// Encode a snapshot, one row per ticker in ticker order.
pub fn encode_quotes(snapshot: &Snapshot) -> io::Result<Vec<u8>> {
    let mut writer = new_writer();
    for record in snapshot.records() {
        writer.serialize(QuoteRow::from(record))?;
    }
    if snapshot.is_empty() {
        writer.write_record(["Ticker", "Price", "Trading Day", "Fetched At"])?;
    }
    finish(writer)
}

/// Decode a snapshot. Bad rows are returned alongside the good ones.
pub fn decode_quotes(bytes: &[u8]) -> (Snapshot, Vec<RowError>) {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(bytes);

    let mut snapshot = Snapshot::new();
    let mut errors = Vec::new();

    for (idx, result) in reader.deserialize::<QuoteRow>().enumerate() {
        let line = idx + 2;
        match result
            .map_err(|e| format!("CSV parse error: {e}"))
            .and_then(ScrapedRecord::try_from)
        {
            Ok(record) => snapshot.insert(record),
            Err(message) => errors.push(RowError { line, message }),
        }
    }

    (snapshot, errors)
}

// ---------------------------------------------------------------------------
// Holdings
// ---------------------------------------------------------------------------

impl From<&HoldingRecord> for HoldingRow {
    fn from(h: &HoldingRecord) -> Self {
        Self {
            filing_date: h.filing_date.format(FILING_DATE_FORMAT).to_string(),
            ticker: h.ticker.clone(),
            company_name: h.company_name.clone(),
            insider_name: h.insider_name.clone(),
            transaction_price: fmt_opt(&h.transaction_price),
            price_bought: fmt_opt(&h.price_bought),
            value: h.value.to_string(),
            current_price: fmt_opt(&h.current_price),
            change_pct: fmt_opt(&h.change_pct),
            priced_at: h.priced_at.as_ref().map(fmt_timestamp).unwrap_or_default(),
        }
    }
}

impl TryFrom<HoldingRow> for HoldingRecord {
    type Error = String;

    fn try_from(row: HoldingRow) -> Result<Self, Self::Error> {
        let filing_date = NaiveDateTime::parse_from_str(row.filing_date.trim(), FILING_DATE_FORMAT)
            .map_err(|e| format!("Filing Date: '{}': {e}", row.filing_date))?;
        let ticker = crate::types::normalize_ticker(&row.ticker)
            .ok_or_else(|| format!("Ticker: invalid identifier '{}'", row.ticker))?;
        let value = row
            .value
            .trim()
            .parse::<u64>()
            .map_err(|e| format!("Value: '{}': {e}", row.value))?;

        Ok(HoldingRecord {
            filing_date,
            ticker,
            company_name: row.company_name,
            insider_name: row.insider_name,
            transaction_price: parse_opt_decimal("Transaction Price", &row.transaction_price)?,
            price_bought: parse_opt_decimal("Price Bought", &row.price_bought)?,
            value,
            current_price: parse_opt_decimal("Current Price", &row.current_price)?,
            change_pct: parse_opt_decimal("Change %", &row.change_pct)?,
            priced_at: parse_opt_timestamp("Priced At", &row.priced_at)?,
        })
    }
}

/// Encode the ledger in the order given.
pub fn encode_holdings(holdings: &[HoldingRecord]) -> io::Result<Vec<u8>> {
    let mut writer = new_writer();
    for h in holdings {
        writer.serialize(HoldingRow::from(h))?;
    }
    if holdings.is_empty() {
        writer.write_record([
            "Filing Date",
            "Ticker",
            "Company Name",
            "Insider Name",
            "Transaction Price",
            "Price Bought",
            "Value",
            "Current Price",
            "Change %",
            "Priced At",
        ])?;
    }
    finish(writer)
}

/// Decode the ledger. The first bad row fails the whole file: a ledger is
/// never rewritten from a partial read.
pub fn decode_holdings(bytes: &[u8]) -> Result<Vec<HoldingRecord>, RowError> {
    let mut reader = csv::ReaderBuilder::new().from_reader(bytes);
    let mut holdings = Vec::new();

    for (idx, result) in reader.deserialize::<HoldingRow>().enumerate() {
        let line = idx + 2;
        let record = result
            .map_err(|e| format!("CSV parse error: {e}"))
            .and_then(HoldingRecord::try_from)
            .map_err(|message| RowError { line, message })?;
        holdings.push(record);
    }

    Ok(holdings)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
