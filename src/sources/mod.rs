//! External data sources.
//!
//! Defines the `PriceSource` trait (current quotes and historical prices)
//! and the `FilingFeed` trait (insider-purchase disclosures), plus the
//! production implementations:
//! - Alpha Vantage: quotes, intraday and daily series
//! - openinsider.com: latest insider purchases, scraped from HTML

pub mod alpha_vantage;
pub mod breaker;
pub mod html;
pub mod openinsider;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use rust_decimal::Decimal;

use crate::types::{InsiderFiling, Quote};

/// Why a single request to a source failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("no data for {ticker}: {reason}")]
    NotFound { ticker: String, reason: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl FetchError {
    /// Failures that say the source itself is down or refusing us, as
    /// opposed to something being wrong with one identifier.
    pub fn is_outage(&self) -> bool {
        matches!(self, FetchError::Unavailable(_) | FetchError::RateLimited(_))
    }
}

/// Abstraction over market-data providers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Provider name for logging and error reports.
    fn name(&self) -> &'static str;

    /// Latest price for a ticker.
    async fn fetch_quote(&self, ticker: &str) -> Result<Quote, FetchError>;

    /// Close price of the bar nearest to `at` (exchange-local time).
    async fn price_near(&self, ticker: &str, at: NaiveDateTime) -> Result<Decimal, FetchError>;
}

/// Abstraction over insider-filing disclosure feeds.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FilingFeed: Send + Sync {
    fn name(&self) -> &'static str;

    /// Every parseable filing currently listed by the feed.
    async fn fetch_filings(&self) -> Result<Vec<InsiderFiling>, FetchError>;
}
