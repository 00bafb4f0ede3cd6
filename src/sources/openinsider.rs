//! openinsider.com insider-purchase feed.
//!
//! Page: `http://openinsider.com/insider-purchases`, server-rendered HTML:
//! latest purchases in `<table class="tinytable">`, no auth, no JSON API.
//!
//! Column layout (0-based `<td>` index):
//! 1 filing date-time, 3 ticker, 4 company, 5 insider, 8 price ("$12.34"),
//! 12 value ("+$1,234,567"). The rest (trade date, title, qty, owned,
//! ΔOwn) is not used.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use reqwest::Client;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::html;
use super::{FetchError, FilingFeed};
use crate::config::DiscoveryConfig;
use crate::types::{normalize_ticker, InsiderFiling, FILING_DATE_FORMAT};

const FEED_NAME: &str = "openinsider";
const TABLE_CLASS: &str = "tinytable";

const COL_FILING_DATE: usize = 1;
const COL_TICKER: usize = 3;
const COL_COMPANY: usize = 4;
const COL_INSIDER: usize = 5;
const COL_PRICE: usize = 8;
const COL_VALUE: usize = 12;

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse "$1,234.56" / "+$1,234,567" / "-$5" into a decimal.
pub fn parse_money(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, '$' | ',' | '+') && !c.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    Decimal::from_str(&cleaned).ok()
}

fn parse_row(cells: &[String]) -> Result<InsiderFiling, String> {
    if cells.len() <= COL_VALUE {
        return Err(format!("expected at least {} cells, got {}", COL_VALUE + 1, cells.len()));
    }

    let filing_date = NaiveDateTime::parse_from_str(&cells[COL_FILING_DATE], FILING_DATE_FORMAT)
        .map_err(|e| format!("filing date '{}': {e}", cells[COL_FILING_DATE]))?;
    let ticker = normalize_ticker(&cells[COL_TICKER])
        .ok_or_else(|| format!("ticker '{}'", cells[COL_TICKER]))?;
    let transaction_price = parse_money(&cells[COL_PRICE])
        .ok_or_else(|| format!("price '{}'", cells[COL_PRICE]))?;
    let value = parse_money(&cells[COL_VALUE])
        .and_then(|v| v.round().abs().to_u64())
        .ok_or_else(|| format!("value '{}'", cells[COL_VALUE]))?;

    Ok(InsiderFiling {
        filing_date,
        ticker,
        company_name: cells[COL_COMPANY].clone(),
        insider_name: cells[COL_INSIDER].clone(),
        transaction_price,
        value,
    })
}

/// Extract filings from a feed page. Rows that don't parse are logged and
/// skipped; a page without the filings table is an error.
pub fn parse_filings_page(page: &str) -> Result<Vec<InsiderFiling>, FetchError> {
    let table = html::table_by_class(page, TABLE_CLASS)
        .ok_or_else(|| FetchError::Malformed(format!("no table.{TABLE_CLASS} on page")))?;

    let mut filings = Vec::new();
    for (idx, cells) in html::data_rows(table).iter().enumerate() {
        match parse_row(cells) {
            Ok(f) => filings.push(f),
            Err(reason) => warn!(row = idx + 1, reason = %reason, "Skipping unparseable filing row"),
        }
    }
    Ok(filings)
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct OpenInsiderFeed {
    http: Client,
    url: String,
}

impl OpenInsiderFeed {
    pub fn new(cfg: &DiscoveryConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .user_agent(cfg.user_agent.clone())
            .build()
            .context("Failed to build HTTP client for openinsider")?;
        Ok(Self {
            http,
            url: cfg.feed_url.clone(),
        })
    }
}

#[async_trait]
impl FilingFeed for OpenInsiderFeed {
    fn name(&self) -> &'static str {
        FEED_NAME
    }

    async fn fetch_filings(&self) -> Result<Vec<InsiderFiling>, FetchError> {
        debug!(url = %self.url, "Fetching insider purchases");

        let resp = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(|e| FetchError::Unavailable(format!("request error: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(if status.as_u16() == 429 {
                FetchError::RateLimited(format!("HTTP {status}"))
            } else {
                FetchError::Unavailable(format!("HTTP {status}"))
            });
        }

        let page = resp
            .text()
            .await
            .map_err(|e| FetchError::Unavailable(format!("body read error: {e}")))?;

        let filings = parse_filings_page(&page)?;
        info!(count = filings.len(), "Insider purchases parsed");
        Ok(filings)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
