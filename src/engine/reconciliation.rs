//! Reconciliation stage: merge the fresh snapshot into the holdings ledger.
//!
//! Two passes over the ledger. Backfill looks up missing bought prices
//! from historical data, capped per run. Apply writes current price,
//! change and pricing time from the snapshot. A holding with no fresh
//! record is left exactly as loaded.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use crate::sources::PriceSource;
use crate::storage::Datasets;
use crate::types::{HoldingKey, HoldingRecord, PipelineError, ScrapedRecord, Snapshot};

/// Percent change of `current` against `bought`, rounded to 2 dp.
///
/// `None` when the result does not fit a `Decimal`.
pub fn change_pct(bought: Decimal, current: Decimal) -> Option<Decimal> {
    current
        .checked_sub(bought)?
        .checked_div(bought)?
        .checked_mul(Decimal::ONE_HUNDRED)
        .map(|pct| pct.round_dp(2))
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedHolding {
    pub key: HoldingKey,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    pub updated: Vec<HoldingKey>,
    pub unchanged: usize,
    /// Tickers with no fresh record, each listed once.
    pub gaps: Vec<String>,
    pub skipped: Vec<SkippedHolding>,
    pub backfilled: Vec<HoldingKey>,
    pub backfill_failures: Vec<SkippedHolding>,
    /// Holdings still missing a bought price after this run.
    pub backfill_pending: usize,
    /// Whether the ledger file was replaced.
    pub persisted: bool,
}

impl ReconciliationReport {
    /// Whether any holding differs from what was loaded.
    pub fn changed(&self) -> bool {
        !self.updated.is_empty() || !self.backfilled.is_empty()
    }

    pub fn gap_errors(&self) -> Vec<PipelineError> {
        self.gaps
            .iter()
            .map(|t| PipelineError::ReconciliationGap { ticker: t.clone() })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Apply
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Updated,
    Unchanged,
    Gap,
    Skipped(String),
}

/// Apply one fresh record (if any) to one holding.
pub fn reconcile_holding(holding: &mut HoldingRecord, fresh: Option<&ScrapedRecord>) -> Outcome {
    let Some(fresh) = fresh else {
        return Outcome::Gap;
    };

    if fresh.price <= Decimal::ZERO {
        return Outcome::Skipped(format!("non-positive current price {}", fresh.price));
    }
    if holding.priced_at.is_some_and(|at| at > fresh.fetched_at) {
        return Outcome::Skipped(format!("snapshot from {} is older than applied data", fresh.fetched_at));
    }

    let change = match holding.price_bought {
        Some(bought) if bought > Decimal::ZERO => match change_pct(bought, fresh.price) {
            Some(pct) => Some(pct),
            None => return Outcome::Skipped("change overflow".to_string()),
        },
        Some(bought) => return Outcome::Skipped(format!("non-positive bought price {bought}")),
        None => None,
    };

    let next: (Option<Decimal>, Option<Decimal>, Option<DateTime<Utc>>) =
        (Some(fresh.price), change, Some(fresh.fetched_at));
    if (holding.current_price, holding.change_pct, holding.priced_at) == next {
        return Outcome::Unchanged;
    }

    holding.current_price = next.0;
    holding.change_pct = next.1;
    holding.priced_at = next.2;
    Outcome::Updated
}

/// Apply a snapshot to the whole ledger.
pub fn apply_snapshot(holdings: &mut [HoldingRecord], snapshot: &Snapshot, report: &mut ReconciliationReport) {
    let mut gaps = BTreeSet::new();

    for holding in holdings.iter_mut() {
        match reconcile_holding(holding, snapshot.get(&holding.ticker)) {
            Outcome::Updated => {
                debug!(holding = %holding.key(), price = ?holding.current_price, "Holding updated");
                report.updated.push(holding.key());
            }
            Outcome::Unchanged => report.unchanged += 1,
            Outcome::Gap => {
                gaps.insert(holding.ticker.clone());
            }
            Outcome::Skipped(reason) => {
                warn!(holding = %holding.key(), reason = %reason, "Skipping holding");
                report.skipped.push(SkippedHolding {
                    key: holding.key(),
                    reason,
                });
            }
        }
    }

    for ticker in &gaps {
        warn!(ticker = %ticker, "No fresh data, holdings left unchanged");
    }
    report.gaps = gaps.into_iter().collect();
}

// ---------------------------------------------------------------------------
// Backfill
// ---------------------------------------------------------------------------

/// Fill missing bought prices, at most `max_lookups` requests.
///
/// A failed lookup leaves the holding for a later run. Once the source
/// reports an outage the remaining lookups are deferred too.
pub async fn backfill(
    holdings: &mut [HoldingRecord],
    source: &dyn PriceSource,
    max_lookups: usize,
    report: &mut ReconciliationReport,
) {
    let mut lookups = 0;

    for holding in holdings.iter_mut().filter(|h| h.needs_backfill()) {
        if lookups >= max_lookups {
            break;
        }
        lookups += 1;

        match source.price_near(&holding.ticker, holding.filing_date).await {
            Ok(price) if price > Decimal::ZERO => {
                info!(holding = %holding.key(), price = %price, "Bought price backfilled");
                holding.price_bought = Some(price);
                report.backfilled.push(holding.key());
            }
            Ok(price) => {
                warn!(holding = %holding.key(), price = %price, "Ignoring non-positive historical price");
                report.backfill_failures.push(SkippedHolding {
                    key: holding.key(),
                    reason: format!("non-positive historical price {price}"),
                });
            }
            Err(e) => {
                warn!(holding = %holding.key(), error = %e, "Bought price lookup failed");
                let outage = e.is_outage();
                report.backfill_failures.push(SkippedHolding {
                    key: holding.key(),
                    reason: e.to_string(),
                });
                if outage {
                    break;
                }
            }
        }
    }

    report.backfill_pending = holdings.iter().filter(|h| h.needs_backfill()).count();
    if report.backfill_pending > 0 {
        debug!(pending = report.backfill_pending, "Holdings still without a bought price");
    }
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

pub struct ReconciliationStage<'a> {
    datasets: &'a Datasets,
    /// Historical source for backfill; `None` disables it.
    history: Option<&'a dyn PriceSource>,
    max_backfills: usize,
}

impl<'a> ReconciliationStage<'a> {
    pub fn new(datasets: &'a Datasets, history: Option<&'a dyn PriceSource>, max_backfills: usize) -> Self {
        Self {
            datasets,
            history,
            max_backfills,
        }
    }

    /// Reconcile `holdings` against `snapshot` and persist the ledger.
    ///
    /// The file is only replaced when something changed or `dirty` says
    /// the caller already modified the ledger (new filings).
    pub async fn run(
        &self,
        holdings: &mut Vec<HoldingRecord>,
        snapshot: &Snapshot,
        dirty: bool,
    ) -> Result<ReconciliationReport, PipelineError> {
        let mut report = ReconciliationReport::default();

        if let Some(source) = self.history {
            backfill(holdings, source, self.max_backfills, &mut report).await;
        }
        apply_snapshot(holdings, snapshot, &mut report);

        if dirty || report.changed() {
            self.datasets.save_holdings(holdings)?;
            report.persisted = true;
        }

        info!(
            holdings = holdings.len(),
            updated = report.updated.len(),
            unchanged = report.unchanged,
            gaps = report.gaps.len(),
            skipped = report.skipped.len(),
            backfilled = report.backfilled.len(),
            "Reconciliation complete"
        );
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{FetchError, MockPriceSource};
    use crate::storage::{codec, MemoryStore};
    use crate::types::InsiderFiling;
    use chrono::{NaiveDate, TimeZone};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn holding(ticker: &str, bought: Option<Decimal>) -> HoldingRecord {
        let mut h = HoldingRecord::from_filing(InsiderFiling {
            filing_date: NaiveDate::from_ymd_opt(2025, 3, 3)
                .unwrap()
                .and_hms_opt(10, 0, 0)
                .unwrap(),
            ticker: ticker.to_string(),
            company_name: format!("{ticker} Inc"),
            insider_name: "Doe John".to_string(),
            transaction_price: dec!(8),
            value: 600_000,
        });
        h.price_bought = bought;
        h
    }

    fn snapshot(records: &[(&str, Decimal)]) -> Snapshot {
        records
            .iter()
            .map(|(t, p)| ScrapedRecord {
                ticker: t.to_string(),
                price: *p,
                trading_day: None,
                fetched_at: Utc.with_ymd_and_hms(2025, 3, 3, 15, 0, 0).unwrap(),
            })
            .collect()
    }

    #[test]
    fn test_change_pct() {
        assert_eq!(change_pct(dec!(8), dec!(10)), Some(dec!(25.00)));
        assert_eq!(change_pct(dec!(3), dec!(2)), Some(dec!(-33.33)));
        assert_eq!(change_pct(dec!(10), dec!(10)), Some(dec!(0)));
        assert_eq!(change_pct(dec!(0.0000000000000000000001), dec!(1000000000)), None);
    }

    #[test]
    fn test_change_overflow_skips_holding() {
        let row = "Filing Date,Ticker,Company Name,Insider Name,Transaction Price,Price Bought,Value,Current Price,Change %,Priced At\n\
                   2025-03-03 10:00:00,AAA,AAA Inc,Doe John,8,0.0000000000000000000001,600000,,,\n";
        let mut holdings = codec::decode_holdings(row.as_bytes()).unwrap();
        let mut report = ReconciliationReport::default();

        apply_snapshot(
            &mut holdings,
            &snapshot(&[("AAA", dec!(1000000000)), ("BBB", dec!(5))]),
            &mut report,
        );

        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].reason, "change overflow");
        assert!(holdings[0].current_price.is_none());
        assert!(holdings[0].change_pct.is_none());
    }

    #[test]
    fn test_apply_updates_and_reports_gaps() {
        let mut holdings = vec![
            holding("AAA", Some(dec!(8))),
            holding("BBB", Some(dec!(4))),
            holding("BBB", None),
        ];
        let before_bbb = holdings[1].clone();
        let mut report = ReconciliationReport::default();

        apply_snapshot(&mut holdings, &snapshot(&[("AAA", dec!(10.00))]), &mut report);

        assert_eq!(holdings[0].current_price, Some(dec!(10.00)));
        assert_eq!(holdings[0].change_pct, Some(dec!(25.00)));
        assert_eq!(report.updated.len(), 1);
        assert_eq!(report.gaps, vec!["BBB"]);
        assert_eq!(holdings[1], before_bbb);
        assert_eq!(report.gap_errors().len(), 1);
    }

    #[test]
    fn test_apply_is_idempotent() {
        let mut holdings = vec![holding("AAA", Some(dec!(8))), holding("CCC", None)];
        let snap = snapshot(&[("AAA", dec!(10.00)), ("CCC", dec!(3))]);

        let mut first = ReconciliationReport::default();
        apply_snapshot(&mut holdings, &snap, &mut first);
        let after_first = holdings.clone();

        let mut second = ReconciliationReport::default();
        apply_snapshot(&mut holdings, &snap, &mut second);

        assert_eq!(first.updated.len(), 2);
        assert!(second.updated.is_empty());
        assert_eq!(second.unchanged, 2);
        assert_eq!(holdings, after_first);
    }

    #[test]
    fn test_malformed_prices_are_skipped() {
        let mut holdings = vec![holding("AAA", Some(dec!(0))), holding("BBB", Some(dec!(5)))];
        let mut report = ReconciliationReport::default();

        apply_snapshot(
            &mut holdings,
            &snapshot(&[("AAA", dec!(10)), ("BBB", dec!(-1))]),
            &mut report,
        );
        assert_eq!(report.skipped.len(), 2);
        assert!(holdings.iter().all(|h| h.current_price.is_none()));
    }

    #[test]
    fn test_older_snapshot_not_applied() {
        let mut h = holding("AAA", Some(dec!(8)));
        h.priced_at = Some(Utc.with_ymd_and_hms(2025, 3, 4, 15, 0, 0).unwrap());
        let snap = snapshot(&[("AAA", dec!(10))]);
        let outcome = reconcile_holding(&mut h, snap.get("AAA"));
        assert!(matches!(outcome, Outcome::Skipped(_)));
        assert!(h.current_price.is_none());
    }

    #[tokio::test]
    async fn test_backfill_respects_cap() {
        let mut source = MockPriceSource::new();
        source
            .expect_price_near()
            .times(2)
            .returning(|_, _| Ok(dec!(7.5)));

        let mut holdings = vec![holding("AAA", None), holding("BBB", None), holding("CCC", None)];
        let mut report = ReconciliationReport::default();
        backfill(&mut holdings, &source, 2, &mut report).await;

        assert_eq!(report.backfilled.len(), 2);
        assert_eq!(report.backfill_pending, 1);
        assert_eq!(holdings[0].price_bought, Some(dec!(7.5)));
        assert!(holdings[2].price_bought.is_none());
    }

    #[tokio::test]
    async fn test_backfill_failure_is_local() {
        let mut source = MockPriceSource::new();
        source.expect_price_near().returning(|ticker, _| {
            if ticker == "AAA" {
                Err(FetchError::NotFound {
                    ticker: ticker.to_string(),
                    reason: "no series".into(),
                })
            } else {
                Ok(dec!(4))
            }
        });

        let mut holdings = vec![holding("AAA", None), holding("BBB", None)];
        let mut report = ReconciliationReport::default();
        backfill(&mut holdings, &source, 10, &mut report).await;

        assert_eq!(report.backfill_failures.len(), 1);
        assert_eq!(holdings[1].price_bought, Some(dec!(4)));
    }

    #[tokio::test]
    async fn test_backfill_stops_on_outage() {
        let mut source = MockPriceSource::new();
        source
            .expect_price_near()
            .times(1)
            .returning(|_, _| Err(FetchError::RateLimited("5 calls per minute".into())));

        let mut holdings = vec![holding("AAA", None), holding("BBB", None)];
        let mut report = ReconciliationReport::default();
        backfill(&mut holdings, &source, 10, &mut report).await;

        assert_eq!(report.backfill_pending, 2);
    }

    #[tokio::test]
    async fn test_stage_skips_write_when_nothing_changed() {
        let store = MemoryStore::new();
        let datasets = Datasets::new(Arc::new(store.clone()), "quotes.csv", "holdings.csv");
        let stage = ReconciliationStage::new(&datasets, None, 0);

        let mut holdings = vec![holding("AAA", Some(dec!(8)))];
        let report = stage.run(&mut holdings, &Snapshot::new(), false).await.unwrap();
        assert!(!report.persisted);
        assert!(store.get("holdings.csv").is_none());

        let report = stage
            .run(&mut holdings, &snapshot(&[("AAA", dec!(9))]), false)
            .await
            .unwrap();
        assert!(report.persisted);
        let saved = codec::decode_holdings(&store.get("holdings.csv").unwrap()).unwrap();
        assert_eq!(saved, holdings);
    }
}
