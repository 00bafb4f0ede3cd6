//! In-memory price source and filing feed for integration testing.
//!
//! Quotes, historical prices and filings are set from test code. Any
//! ticker without a quote answers `NotFound`; `set_error` makes every
//! call fail with the given error.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use insider_tracker::sources::{FetchError, FilingFeed, PriceSource};
use insider_tracker::types::{InsiderFiling, Quote};

/// A deterministic `PriceSource`.
#[derive(Clone, Default)]
pub struct MockSource {
    quotes: Arc<Mutex<BTreeMap<String, Decimal>>>,
    history: Arc<Mutex<BTreeMap<String, Decimal>>>,
    force_error: Arc<Mutex<Option<FetchError>>>,
    quote_calls: Arc<AtomicUsize>,
    history_calls: Arc<AtomicUsize>,
}

impl MockSource {
    pub fn with_quotes(quotes: &[(&str, Decimal)]) -> Self {
        let source = Self::default();
        for (ticker, price) in quotes {
            source.set_quote(ticker, *price);
        }
        source
    }

    pub fn set_quote(&self, ticker: &str, price: Decimal) {
        self.quotes.lock().unwrap().insert(ticker.to_string(), price);
    }

    /// Price returned by `price_near` for `ticker`, whatever the time.
    pub fn set_history(&self, ticker: &str, price: Decimal) {
        self.history.lock().unwrap().insert(ticker.to_string(), price);
    }

    /// Force all subsequent calls to fail.
    pub fn set_error(&self, error: FetchError) {
        *self.force_error.lock().unwrap() = Some(error);
    }

    pub fn clear_error(&self) {
        *self.force_error.lock().unwrap() = None;
    }

    pub fn quote_calls(&self) -> usize {
        self.quote_calls.load(Ordering::SeqCst)
    }

    pub fn history_calls(&self) -> usize {
        self.history_calls.load(Ordering::SeqCst)
    }

    fn forced(&self) -> Option<FetchError> {
        self.force_error.lock().unwrap().clone()
    }
}

#[async_trait]
impl PriceSource for MockSource {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn fetch_quote(&self, ticker: &str) -> Result<Quote, FetchError> {
        self.quote_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.forced() {
            return Err(err);
        }
        match self.quotes.lock().unwrap().get(ticker) {
            Some(price) => Ok(Quote {
                price: *price,
                trading_day: NaiveDate::from_ymd_opt(2025, 3, 3),
            }),
            None => Err(FetchError::NotFound {
                ticker: ticker.to_string(),
                reason: "unknown symbol".to_string(),
            }),
        }
    }

    async fn price_near(&self, ticker: &str, _at: NaiveDateTime) -> Result<Decimal, FetchError> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.forced() {
            return Err(err);
        }
        self.history
            .lock()
            .unwrap()
            .get(ticker)
            .copied()
            .ok_or_else(|| FetchError::NotFound {
                ticker: ticker.to_string(),
                reason: "no series".to_string(),
            })
    }
}

/// A deterministic `FilingFeed`.
#[derive(Clone, Default)]
pub struct MockFeed {
    filings: Arc<Mutex<Vec<InsiderFiling>>>,
    force_error: Arc<Mutex<Option<FetchError>>>,
}

impl MockFeed {
    pub fn with_filings(filings: Vec<InsiderFiling>) -> Self {
        Self {
            filings: Arc::new(Mutex::new(filings)),
            force_error: Arc::default(),
        }
    }

    pub fn set_error(&self, error: FetchError) {
        *self.force_error.lock().unwrap() = Some(error);
    }
}

#[async_trait]
impl FilingFeed for MockFeed {
    fn name(&self) -> &'static str {
        "mock-feed"
    }

    async fn fetch_filings(&self) -> Result<Vec<InsiderFiling>, FetchError> {
        if let Some(err) = self.force_error.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(self.filings.lock().unwrap().clone())
    }
}
