//! Acquisition stage: fetch a fresh quote for every tracked ticker.
//!
//! Fetches run concurrently up to the configured limit. Pacing, retries
//! and the circuit breaker live in the source client. One failed ticker
//! is recorded and the rest carry on; if every ticker fails the stage
//! reports the source as unavailable and leaves the snapshot file alone.

use chrono::{DateTime, SubsecRound, Utc};
use futures::stream::{self, StreamExt};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use crate::sources::{FetchError, PriceSource};
use crate::storage::Datasets;
use crate::types::{normalize_ticker, HoldingRecord, PipelineError, ScrapedRecord, Snapshot};

// ---------------------------------------------------------------------------
// Tracked set
// ---------------------------------------------------------------------------

/// Normalised, deduplicated, sorted tickers to fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackedSet {
    pub tickers: Vec<String>,
    /// Raw identifiers that failed validation.
    pub rejected: Vec<String>,
}

/// Configured tickers, plus every ledger ticker when `track_holdings` is set.
pub fn tracked_tickers(
    configured: &[String],
    holdings: &[HoldingRecord],
    track_holdings: bool,
) -> TrackedSet {
    let mut tickers = BTreeSet::new();
    let mut rejected = Vec::new();

    let ledger = holdings
        .iter()
        .filter(|_| track_holdings)
        .map(|h| h.ticker.as_str());

    for raw in configured.iter().map(String::as_str).chain(ledger) {
        match normalize_ticker(raw) {
            Some(t) => {
                tickers.insert(t);
            }
            None => {
                warn!(identifier = %raw, "Rejecting invalid identifier");
                rejected.push(raw.to_string());
            }
        }
    }

    TrackedSet {
        tickers: tickers.into_iter().collect(),
        rejected,
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// A ticker whose fetch failed this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordFailure {
    pub ticker: String,
    pub reason: String,
    /// The failure pointed at the source rather than the ticker.
    pub outage: bool,
}

impl RecordFailure {
    fn new(ticker: String, error: &FetchError) -> Self {
        Self {
            ticker,
            reason: error.to_string(),
            outage: error.is_outage(),
        }
    }

    pub fn to_error(&self) -> PipelineError {
        PipelineError::RecordFetchFailed {
            ticker: self.ticker.clone(),
            reason: self.reason.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AcquisitionReport {
    pub tracked: Vec<String>,
    pub rejected: Vec<String>,
    #[serde(skip)]
    pub snapshot: Snapshot,
    pub failures: Vec<RecordFailure>,
    /// Whether the snapshot file was replaced.
    pub persisted: bool,
}

impl AcquisitionReport {
    pub fn fetched(&self) -> usize {
        self.snapshot.len()
    }
}

// ---------------------------------------------------------------------------
// Fetching
// ---------------------------------------------------------------------------

/// Fetch every ticker and build this run's snapshot.
///
/// `fetched_at` is `now` at second precision, but never earlier than the
/// value the previous snapshot holds for the same ticker.
pub async fn fetch_snapshot(
    source: &dyn PriceSource,
    tickers: &[String],
    previous: &Snapshot,
    now: DateTime<Utc>,
    concurrency: usize,
) -> Result<(Snapshot, Vec<RecordFailure>), PipelineError> {
    let now = now.trunc_subsecs(0);

    let mut results: Vec<(String, Result<_, FetchError>)> = stream::iter(tickers.iter().cloned())
        .map(move |ticker| async move {
            let result = source.fetch_quote(&ticker).await;
            (ticker, result)
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;
    results.sort_by(|a, b| a.0.cmp(&b.0));

    let mut snapshot = Snapshot::new();
    let mut failures = Vec::new();

    for (ticker, result) in results {
        let quote = match result {
            Ok(q) if q.price > Decimal::ZERO => q,
            Ok(q) => {
                let e = FetchError::Malformed(format!("non-positive price {}", q.price));
                warn!(ticker = %ticker, error = %e, "Discarding quote");
                failures.push(RecordFailure::new(ticker, &e));
                continue;
            }
            Err(e) => {
                warn!(ticker = %ticker, error = %e, "Quote fetch failed");
                failures.push(RecordFailure::new(ticker, &e));
                continue;
            }
        };

        let fetched_at = match previous.get(&ticker) {
            Some(prev) if prev.fetched_at > now => {
                debug!(ticker = %ticker, previous = %prev.fetched_at, "Clock behind previous snapshot, clamping");
                prev.fetched_at
            }
            _ => now,
        };

        snapshot.insert(ScrapedRecord {
            ticker,
            price: quote.price,
            trading_day: quote.trading_day,
            fetched_at,
        });
    }

    if snapshot.is_empty() && !tickers.is_empty() {
        let last = failures
            .last()
            .map(|f| f.reason.clone())
            .unwrap_or_default();
        return Err(PipelineError::SourceUnavailable {
            provider: source.name().to_string(),
            reason: format!("all {} quote fetches failed, last: {last}", tickers.len()),
        });
    }

    Ok((snapshot, failures))
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

pub struct AcquisitionStage<'a> {
    source: &'a dyn PriceSource,
    datasets: &'a Datasets,
    concurrency: usize,
}

impl<'a> AcquisitionStage<'a> {
    pub fn new(source: &'a dyn PriceSource, datasets: &'a Datasets, concurrency: usize) -> Self {
        Self {
            source,
            datasets,
            concurrency,
        }
    }

    /// Fetch the tracked set and replace the snapshot file.
    ///
    /// An empty tracked set fetches nothing and leaves the file as it is.
    pub async fn run(
        &self,
        tracked: TrackedSet,
        now: DateTime<Utc>,
    ) -> Result<AcquisitionReport, PipelineError> {
        let mut report = AcquisitionReport {
            tracked: tracked.tickers,
            rejected: tracked.rejected,
            ..Default::default()
        };

        if report.tracked.is_empty() {
            warn!("No identifiers to track, skipping acquisition");
            return Ok(report);
        }

        let previous = self.datasets.load_snapshot()?;
        let (snapshot, failures) = fetch_snapshot(
            self.source,
            &report.tracked,
            &previous,
            now,
            self.concurrency,
        )
        .await?;

        self.datasets.save_snapshot(&snapshot)?;
        report.persisted = true;
        report.snapshot = snapshot;
        report.failures = failures;

        info!(
            source = self.source.name(),
            tracked = report.tracked.len(),
            fetched = report.fetched(),
            failed = report.failures.len(),
            "Acquisition complete"
        );
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
