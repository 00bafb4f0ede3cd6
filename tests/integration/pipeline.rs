//! Full passes against in-memory and on-disk stores.

use chrono::{NaiveDate, NaiveDateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

use insider_tracker::engine::{Pipeline, PipelineSettings};
use insider_tracker::sources::FetchError;
use insider_tracker::storage::{codec, Datasets, FileStore, MemoryStore};
use insider_tracker::types::{HoldingRecord, InsiderFiling, PipelineError};

use crate::mock_source::{MockFeed, MockSource};

const QUOTES: &str = "quotes.csv";
const LEDGER: &str = "insider_buys.csv";

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn filed(day: u32, hour: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 3, day)
        .unwrap()
        .and_hms_opt(hour, 0, 0)
        .unwrap()
}

fn filing(ticker: &str, company: &str, at: NaiveDateTime, value: u64) -> InsiderFiling {
    InsiderFiling {
        filing_date: at,
        ticker: ticker.to_string(),
        company_name: company.to_string(),
        insider_name: "Doe John".to_string(),
        transaction_price: dec!(9.00),
        value,
    }
}

fn holding(ticker: &str, bought: Option<Decimal>) -> HoldingRecord {
    let mut h = HoldingRecord::from_filing(filing(ticker, &format!("{ticker} Inc"), filed(3, 10), 750_000));
    h.price_bought = bought;
    h
}

fn settings(tickers: &[&str]) -> PipelineSettings {
    PipelineSettings {
        tickers: tickers.iter().map(|t| t.to_string()).collect(),
        ..PipelineSettings::default()
    }
}

fn pipeline(store: &MemoryStore, source: &MockSource, tickers: &[&str]) -> Pipeline {
    Pipeline::new(
        Datasets::new(Arc::new(store.clone()), QUOTES, LEDGER),
        Arc::new(source.clone()),
        settings(tickers),
    )
}

fn seed_ledger(store: &MemoryStore, holdings: &[HoldingRecord]) {
    store.put(LEDGER, codec::encode_holdings(holdings).unwrap());
}

fn ledger(store: &MemoryStore) -> Vec<HoldingRecord> {
    codec::decode_holdings(&store.get(LEDGER).unwrap()).unwrap()
}

fn row_for(bytes: &[u8], ticker: &str) -> String {
    let needle = format!(",{ticker},");
    String::from_utf8_lossy(bytes)
        .lines()
        .find(|line| line.contains(&needle))
        .map(str::to_string)
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_partial_failure_updates_only_fetched_holdings() {
    let store = MemoryStore::new();
    let mut stale = holding("BBB", Some(dec!(4)));
    stale.current_price = Some(dec!(3.50));
    stale.change_pct = Some(dec!(-12.50));
    stale.priced_at = Some(Utc.with_ymd_and_hms(2025, 3, 2, 20, 0, 0).unwrap());
    seed_ledger(&store, &[holding("AAA", Some(dec!(8))), stale]);
    let before = store.get(LEDGER).unwrap();

    let source = MockSource::with_quotes(&[("AAA", dec!(10.00))]);
    let report = assert_ok!(pipeline(&store, &source, &["AAA", "BBB"]).run().await);

    let acquisition = report.acquisition.as_ref().unwrap();
    assert_eq!(acquisition.fetched(), 1);
    assert_eq!(acquisition.failures.len(), 1);
    assert_eq!(acquisition.failures[0].ticker, "BBB");
    assert_eq!(report.gaps(), ["BBB".to_string()]);

    let after = store.get(LEDGER).unwrap();
    let holdings = ledger(&store);
    let aaa = holdings.iter().find(|h| h.ticker == "AAA").unwrap();
    assert_eq!(aaa.current_price, Some(dec!(10.00)));
    assert_eq!(aaa.change_pct, Some(dec!(25.00)));
    assert_eq!(row_for(&after, "BBB"), row_for(&before, "BBB"));
    assert!(!row_for(&after, "BBB").is_empty());
    assert_eq!(source.history_calls(), 0);
}

#[tokio::test]
async fn test_total_outage_modifies_nothing() {
    let store = MemoryStore::new();
    seed_ledger(&store, &[holding("AAA", Some(dec!(8)))]);
    let source = MockSource::with_quotes(&[("AAA", dec!(10.00))]);
    let p = pipeline(&store, &source, &["AAA", "BBB"]);
    assert_ok!(p.run().await);

    let quotes_before = store.get(QUOTES).unwrap();
    let ledger_before = store.get(LEDGER).unwrap();

    source.set_error(FetchError::Unavailable("connection refused".into()));
    let err = assert_err!(p.run().await);
    assert!(matches!(err, PipelineError::SourceUnavailable { .. }));
    assert!(err.is_fatal());
    assert_eq!(store.get(QUOTES).unwrap(), quotes_before);
    assert_eq!(store.get(LEDGER).unwrap(), ledger_before);

    // Next pass after recovery goes through.
    source.clear_error();
    assert_ok!(p.run().await);
}

#[tokio::test]
async fn test_reconciliation_is_idempotent() {
    let store = MemoryStore::new();
    seed_ledger(&store, &[holding("AAA", Some(dec!(8))), holding("CCC", Some(dec!(2)))]);
    let source = MockSource::with_quotes(&[("AAA", dec!(10.00)), ("CCC", dec!(2.5))]);
    let p = pipeline(&store, &source, &[]);

    assert_ok!(p.run().await);
    let ledger_after_run = store.get(LEDGER).unwrap();

    let report = assert_ok!(p.reconcile_only().await);
    let reconciliation = report.reconciliation.unwrap();
    assert!(reconciliation.updated.is_empty());
    assert_eq!(reconciliation.unchanged, 2);
    assert!(!reconciliation.persisted);
    assert_eq!(store.get(LEDGER).unwrap(), ledger_after_run);
}

#[tokio::test]
async fn test_one_record_per_ticker_with_monotonic_timestamps() {
    let store = MemoryStore::new();
    let source = MockSource::with_quotes(&[("AAA", dec!(10.00)), ("CCC", dec!(2.5))]);
    let p = pipeline(&store, &source, &["ccc", "AAA", "aaa", "BBB"]);

    assert_ok!(p.run().await);
    let (first, errors) = codec::decode_quotes(&store.get(QUOTES).unwrap());
    assert!(errors.is_empty());
    assert_eq!(first.len(), 2);

    assert_ok!(p.run().await);
    let (second, _) = codec::decode_quotes(&store.get(QUOTES).unwrap());
    for record in second.records() {
        let earlier = first.get(&record.ticker).unwrap();
        assert!(record.fetched_at >= earlier.fetched_at);
        assert_eq!(record.fetched_at.timestamp_subsec_nanos(), 0);
    }
}

#[tokio::test]
async fn test_persisted_snapshot_reparses_to_same_mapping() {
    let store = MemoryStore::new();
    let source = MockSource::with_quotes(&[("AAA", dec!(10.00)), ("CCC", dec!(2.5))]);
    let report = assert_ok!(pipeline(&store, &source, &["AAA", "CCC"]).run().await);

    let (persisted, errors) = codec::decode_quotes(&store.get(QUOTES).unwrap());
    assert!(errors.is_empty());

    let expected: BTreeMap<String, Decimal> =
        [("AAA".to_string(), dec!(10.00)), ("CCC".to_string(), dec!(2.5))].into();
    assert_eq!(persisted.prices(), expected);
    assert_eq!(persisted, report.acquisition.unwrap().snapshot);
    assert_eq!(persisted.get("AAA").unwrap().price.to_string(), "10.00");
}

#[tokio::test]
async fn test_discovery_and_backfill_end_to_end() {
    let store = MemoryStore::new();
    let feed = MockFeed::with_filings(vec![
        filing("AAA", "Acme Corp", filed(3, 16), 900_000),
        filing("AAA", "Acme Corp", filed(3, 17), 800_000),
        filing("BBB", "Bravo", filed(3, 12), 100_000),
    ]);
    let source = MockSource::with_quotes(&[("AAA", dec!(10.00))]);
    source.set_history("AAA", dec!(9.10));

    let report = assert_ok!(
        pipeline(&store, &source, &[])
            .with_filing_feed(Arc::new(feed))
            .run()
            .await
    );

    let discovery = report.discovery.unwrap();
    assert_eq!(discovery.added, 1);
    assert_eq!(discovery.duplicates, 1);
    assert_eq!(discovery.below_threshold, 1);

    let holdings = ledger(&store);
    assert_eq!(holdings.len(), 1);
    assert_eq!(holdings[0].filing_date, filed(3, 16));
    assert_eq!(holdings[0].price_bought, Some(dec!(9.10)));
    assert_eq!(holdings[0].current_price, Some(dec!(10.00)));
    assert_eq!(holdings[0].change_pct, Some(dec!(9.89)));
    assert_eq!(source.history_calls(), 1);
}

#[tokio::test]
async fn test_feed_outage_is_fatal() {
    let store = MemoryStore::new();
    let feed = MockFeed::default();
    feed.set_error(FetchError::Malformed("no table.tinytable on page".into()));
    let source = MockSource::with_quotes(&[("AAA", dec!(10.00))]);

    let err = assert_err!(
        pipeline(&store, &source, &["AAA"])
            .with_filing_feed(Arc::new(feed))
            .run()
            .await
    );
    assert!(matches!(err, PipelineError::SourceUnavailable { .. }));
    assert_eq!(source.quote_calls(), 0);
    assert!(store.get(QUOTES).is_none());
}

#[tokio::test]
async fn test_corrupt_ledger_aborts_before_fetching() {
    let store = MemoryStore::new();
    store.put(LEDGER, "Filing Date,Ticker\nyesterday,AAA\n");
    let source = MockSource::with_quotes(&[("AAA", dec!(10.00))]);

    let err = assert_err!(pipeline(&store, &source, &["AAA"]).run().await);
    assert!(matches!(err, PipelineError::CorruptDataset { .. }));
    assert_eq!(source.quote_calls(), 0);
    assert!(store.get(QUOTES).is_none());
}

#[tokio::test]
async fn test_missing_transaction_price_is_refilled() {
    let store = MemoryStore::new();
    let mut legacy = holding("AAA", Some(dec!(8)));
    legacy.transaction_price = None;
    seed_ledger(&store, &[legacy]);
    assert!(String::from_utf8_lossy(&store.get(LEDGER).unwrap()).contains(",AAA,AAA Inc,Doe John,,8,"));

    let feed = MockFeed::with_filings(vec![filing("AAA", "AAA Inc", filed(3, 10), 750_000)]);
    let source = MockSource::with_quotes(&[("AAA", dec!(10.00))]);
    let report = assert_ok!(
        pipeline(&store, &source, &[])
            .with_filing_feed(Arc::new(feed))
            .run()
            .await
    );

    let discovery = report.discovery.unwrap();
    assert_eq!(discovery.refilled, 1);
    assert_eq!(discovery.added, 0);
    let holdings = ledger(&store);
    assert_eq!(holdings.len(), 1);
    assert_eq!(holdings[0].transaction_price, Some(dec!(9.00)));
    assert_eq!(holdings[0].change_pct, Some(dec!(25.00)));
}

#[tokio::test]
async fn test_file_store_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let datasets = Datasets::new(Arc::new(FileStore::new(dir.path())), QUOTES, LEDGER);
    let feed = MockFeed::with_filings(vec![filing("AAA", "Acme Corp", filed(3, 16), 900_000)]);
    let source = MockSource::with_quotes(&[("AAA", dec!(10.00))]);
    source.set_history("AAA", dec!(8));

    let p = Pipeline::new(datasets.clone(), Arc::new(source), settings(&[]))
        .with_filing_feed(Arc::new(feed));
    assert_ok!(p.run().await);

    let mut names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    assert_eq!(names, vec![LEDGER.to_string(), QUOTES.to_string()]);

    let holdings = assert_ok!(datasets.load_holdings());
    assert_eq!(holdings[0].change_pct, Some(dec!(25.00)));
    let quotes = std::fs::read_to_string(dir.path().join(QUOTES)).unwrap();
    assert!(quotes.starts_with("Ticker,Price,Trading Day,Fetched At\nAAA,10.00,2025-03-03,"));
}
