//! Filing discovery: turns the latest insider purchases into ledger rows.
//!
//! Screening drops future-dated and small filings. Merging keeps at most
//! one row per (filing day, company), the earliest, and never touches a
//! row already in the ledger, except to refill a missing transaction
//! price from a filing with the same ticker and filing time.

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::sources::FilingFeed;
use crate::types::{HoldingRecord, InsiderFiling, PipelineError};

/// Counts from one discovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryReport {
    pub listed: usize,
    pub below_threshold: usize,
    pub future_dated: usize,
    pub duplicates: usize,
    pub added: usize,
    /// Existing rows whose missing transaction price was filled in.
    pub refilled: usize,
}

/// Drop filings dated after `now` or worth less than `min_value`.
pub fn screen_filings(
    filings: Vec<InsiderFiling>,
    min_value: u64,
    now: NaiveDateTime,
    report: &mut DiscoveryReport,
) -> Vec<InsiderFiling> {
    report.listed += filings.len();
    filings
        .into_iter()
        .filter(|f| {
            if f.filing_date > now {
                warn!(ticker = %f.ticker, filing_date = %f.filing_date, "Future-dated filing, skipping");
                report.future_dated += 1;
                false
            } else if f.value < min_value {
                report.below_threshold += 1;
                false
            } else {
                true
            }
        })
        .collect()
}

fn day_company(filing_date: NaiveDateTime, company: &str) -> (NaiveDate, String) {
    (filing_date.date(), company.trim().to_string())
}

/// Order the ledger newest first, ticker ascending on equal times.
pub fn sort_ledger(ledger: &mut [HoldingRecord]) {
    ledger.sort_by(|a, b| {
        (Reverse(a.filing_date), &a.ticker).cmp(&(Reverse(b.filing_date), &b.ticker))
    });
}

/// Fill empty transaction prices from filings with the same ticker and
/// filing time. Returns how many rows were filled.
pub fn refill_transaction_prices(
    ledger: &mut [HoldingRecord],
    filings: &[InsiderFiling],
    report: &mut DiscoveryReport,
) -> usize {
    let prices: HashMap<(&str, NaiveDateTime), Decimal> = filings
        .iter()
        .filter(|f| f.transaction_price > Decimal::ZERO)
        .map(|f| ((f.ticker.as_str(), f.filing_date), f.transaction_price))
        .collect();

    let mut refilled = 0;
    for holding in ledger.iter_mut().filter(|h| h.transaction_price.is_none()) {
        if let Some(price) = prices.get(&(holding.ticker.as_str(), holding.filing_date)) {
            info!(holding = %holding.key(), price = %price, "Transaction price refilled");
            holding.transaction_price = Some(*price);
            refilled += 1;
        }
    }

    report.refilled += refilled;
    refilled
}

/// Add screened filings to the ledger. Returns how many rows were added.
pub fn merge_filings(
    ledger: &mut Vec<HoldingRecord>,
    mut filings: Vec<InsiderFiling>,
    report: &mut DiscoveryReport,
) -> usize {
    let mut seen: HashSet<(NaiveDate, String)> = ledger
        .iter()
        .map(|h| day_company(h.filing_date, &h.company_name))
        .collect();

    // Earliest filing of the day wins.
    filings.sort_by(|a, b| (a.filing_date, &a.ticker).cmp(&(b.filing_date, &b.ticker)));

    let mut added = 0;
    for filing in filings {
        if !seen.insert(day_company(filing.filing_date, &filing.company_name)) {
            debug!(ticker = %filing.ticker, company = %filing.company_name, "Already recorded for that day");
            report.duplicates += 1;
            continue;
        }
        ledger.push(HoldingRecord::from_filing(filing));
        added += 1;
    }

    sort_ledger(ledger);
    report.added += added;
    added
}

/// Fetch the feed, screen, and merge into `ledger`.
///
/// An unreachable feed, or a page without the filings table, fails the run.
pub async fn discover(
    feed: &dyn FilingFeed,
    ledger: &mut Vec<HoldingRecord>,
    min_value: u64,
    now: NaiveDateTime,
) -> Result<DiscoveryReport, PipelineError> {
    let filings = feed
        .fetch_filings()
        .await
        .map_err(|e| PipelineError::SourceUnavailable {
            provider: feed.name().to_string(),
            reason: e.to_string(),
        })?;

    let mut report = DiscoveryReport::default();
    refill_transaction_prices(ledger, &filings, &mut report);
    let eligible = screen_filings(filings, min_value, now, &mut report);
    merge_filings(ledger, eligible, &mut report);

    info!(
        feed = feed.name(),
        listed = report.listed,
        added = report.added,
        duplicates = report.duplicates,
        refilled = report.refilled,
        below_threshold = report.below_threshold,
        "Filing discovery complete"
    );
    Ok(report)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
