//! Alpha Vantage market-data client.
//!
//! API: `https://www.alphavantage.co/query?function=...`
//! Auth: `apikey` query param. Free tier: 5 requests/min, 25/day.
//! Throttling is reported in-band: HTTP 200 with a `Note` or
//! `Information` field instead of data.
//!
//! Functions used:
//! - `GLOBAL_QUOTE`: latest price
//! - `TIME_SERIES_INTRADAY` (1min): bought-price lookup near a filing
//! - `TIME_SERIES_DAILY`: fallback when no intraday series is served

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use reqwest::Client;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::breaker::CircuitBreaker;
use super::{FetchError, PriceSource};
use crate::config::AlphaVantageConfig;
use crate::types::Quote;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

const PROVIDER_NAME: &str = "alpha_vantage";

const BASE_BACKOFF_MS: u64 = 2_000;

const BREAKER_COOLDOWN: Duration = Duration::from_secs(15 * 60);

const INTRADAY_KEY: &str = "Time Series (1min)";
const DAILY_KEY: &str = "Time Series (Daily)";

/// Nearest intraday bar further than this from the filing gets a warning.
const INTRADAY_WARN_SECS: i64 = 5 * 60;

/// Daily bars further than this from the filing are not trusted.
const DAILY_MAX_DISTANCE_DAYS: i64 = 4;

/// Daily bars are stamped at the US session close.
fn session_close() -> NaiveTime {
    NaiveTime::from_hms_opt(16, 0, 0).unwrap_or(NaiveTime::MIN)
}

// ---------------------------------------------------------------------------
// API response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GlobalQuoteResponse {
    #[serde(rename = "Global Quote", default)]
    quote: Option<GlobalQuote>,
}

#[derive(Debug, Deserialize)]
struct GlobalQuote {
    #[serde(rename = "05. price", default)]
    price: Option<String>,
    #[serde(rename = "07. latest trading day", default)]
    latest_trading_day: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Bar {
    #[serde(rename = "4. close")]
    close: String,
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

/// Map in-band provider notices to errors. `None` means the body is data.
fn provider_notice(ticker: &str, body: &Value) -> Option<FetchError> {
    if let Some(msg) = body.get("Note").and_then(Value::as_str) {
        return Some(FetchError::RateLimited(msg.to_string()));
    }
    if let Some(msg) = body.get("Information").and_then(Value::as_str) {
        return Some(FetchError::RateLimited(msg.to_string()));
    }
    if let Some(msg) = body.get("Error Message").and_then(Value::as_str) {
        return Some(FetchError::NotFound {
            ticker: ticker.to_string(),
            reason: msg.to_string(),
        });
    }
    None
}

fn parse_price(raw: &str) -> Result<Decimal, FetchError> {
    Decimal::from_str(raw.trim())
        .map_err(|e| FetchError::Malformed(format!("price '{raw}': {e}")))
}

/// Parse a `GLOBAL_QUOTE` body.
pub(crate) fn parse_global_quote(ticker: &str, body: &Value) -> Result<Quote, FetchError> {
    if let Some(err) = provider_notice(ticker, body) {
        return Err(err);
    }

    let resp: GlobalQuoteResponse = serde_json::from_value(body.clone())
        .map_err(|e| FetchError::Malformed(format!("global quote: {e}")))?;

    let quote = resp.quote.ok_or_else(|| FetchError::Malformed("missing 'Global Quote'".into()))?;

    let Some(raw_price) = quote.price.filter(|p| !p.trim().is_empty()) else {
        return Err(FetchError::NotFound {
            ticker: ticker.to_string(),
            reason: "empty quote".to_string(),
        });
    };

    let price = parse_price(&raw_price)?;
    if price <= Decimal::ZERO {
        return Err(FetchError::Malformed(format!("non-positive price {price}")));
    }

    let trading_day = quote
        .latest_trading_day
        .as_deref()
        .and_then(|d| NaiveDate::parse_from_str(d.trim(), "%Y-%m-%d").ok());

    Ok(Quote { price, trading_day })
}

/// Parse a time-series body into `(bar time, close)` points.
///
/// Returns `Ok(None)` when the series key is absent (the provider serves no
/// such series for this symbol). Unparseable bars are dropped.
pub(crate) fn parse_series(
    ticker: &str,
    body: &Value,
    key: &str,
) -> Result<Option<Vec<(NaiveDateTime, Decimal)>>, FetchError> {
    if let Some(err) = provider_notice(ticker, body) {
        return Err(err);
    }

    let Some(series) = body.get(key).and_then(Value::as_object) else {
        return Ok(None);
    };

    let mut points = Vec::with_capacity(series.len());
    for (stamp, bar) in series {
        let at = match NaiveDateTime::parse_from_str(stamp, "%Y-%m-%d %H:%M:%S") {
            Ok(at) => at,
            Err(_) => match NaiveDate::parse_from_str(stamp, "%Y-%m-%d") {
                Ok(day) => day.and_time(session_close()),
                Err(e) => {
                    debug!(ticker, stamp = %stamp, error = %e, "Skipping bar with bad timestamp");
                    continue;
                }
            },
        };
        let close = serde_json::from_value::<Bar>(bar.clone())
            .ok()
            .and_then(|b| Decimal::from_str(b.close.trim()).ok());
        match close {
            Some(c) => points.push((at, c)),
            None => debug!(ticker, stamp = %stamp, "Skipping bar without close"),
        }
    }

    Ok(Some(points))
}

/// The point with the smallest absolute distance to `at`. Ties go to the
/// earlier bar.
pub fn closest_close(
    points: &[(NaiveDateTime, Decimal)],
    at: NaiveDateTime,
) -> Option<(NaiveDateTime, Decimal)> {
    points
        .iter()
        .min_by_key(|(t, _)| ((*t - at).num_seconds().abs(), *t))
        .copied()
}

/// Nearest intraday bar on the filing's own calendar day. An intraday
/// series only reaches back about a month, so its nearest bar for an
/// older filing can be weeks later.
pub fn nearest_intraday(
    points: &[(NaiveDateTime, Decimal)],
    at: NaiveDateTime,
) -> Option<(NaiveDateTime, Decimal)> {
    let same_day: Vec<_> = points
        .iter()
        .filter(|(t, _)| t.date() == at.date())
        .copied()
        .collect();
    closest_close(&same_day, at)
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct AlphaVantageClient {
    http: Client,
    base_url: String,
    api_key: SecretString,
    min_interval: Duration,
    max_retries: u32,
    last_request: Mutex<Option<Instant>>,
    breaker: CircuitBreaker,
}

impl AlphaVantageClient {
    pub fn new(cfg: &AlphaVantageConfig, api_key: SecretString) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .user_agent(concat!("insider-tracker/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build Alpha Vantage HTTP client")?;

        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key,
            min_interval: Duration::from_millis(cfg.min_request_interval_ms),
            max_retries: cfg.max_retries,
            last_request: Mutex::new(None),
            breaker: CircuitBreaker::new(cfg.breaker_threshold, BREAKER_COOLDOWN),
        })
    }

    /// Hold the request slot until `min_interval` has passed since the
    /// previous request. Concurrent callers queue on the mutex.
    async fn throttle(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    fn url(&self, function: &str, ticker: &str, extra: &str) -> String {
        format!(
            "{}?function={function}&symbol={}{extra}&apikey={}",
            self.base_url,
            urlencoding::encode(ticker),
            urlencoding::encode(self.api_key.expose_secret()),
        )
    }

    /// GET a query and return its JSON body, retrying transient failures
    /// with exponential backoff.
    async fn get_json(&self, function: &str, ticker: &str, extra: &str) -> Result<Value, FetchError> {
        if !self.breaker.is_allowed() {
            return Err(FetchError::Unavailable("circuit breaker open".into()));
        }

        let url = self.url(function, ticker, extra);
        let mut last_error = FetchError::Unavailable("no attempt made".into());

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = BASE_BACKOFF_MS * 2u64.pow(attempt - 1);
                debug!(ticker, function, attempt, delay_ms = delay, "Retrying Alpha Vantage call");
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            self.throttle().await;

            let resp = match self.http.get(&url).send().await {
                Ok(r) => r,
                Err(e) => {
                    warn!(ticker, function, attempt, error = %e, "Alpha Vantage request failed");
                    last_error = FetchError::Unavailable(format!("request error: {e}"));
                    continue;
                }
            };

            let status = resp.status();
            if status.as_u16() == 429 || status.is_server_error() {
                warn!(ticker, function, status = %status, attempt, "Retryable Alpha Vantage error");
                last_error = if status.as_u16() == 429 {
                    FetchError::RateLimited(format!("HTTP {status}"))
                } else {
                    FetchError::Unavailable(format!("HTTP {status}"))
                };
                continue;
            }
            if !status.is_success() {
                last_error = FetchError::Unavailable(format!("HTTP {status}"));
                break;
            }

            match resp.json::<Value>().await {
                Ok(body) => {
                    if let Some(FetchError::RateLimited(msg)) = provider_notice(ticker, &body) {
                        // In-band throttle notices don't clear with a short backoff.
                        self.breaker.record_failure();
                        return Err(FetchError::RateLimited(msg));
                    }
                    self.breaker.record_success();
                    return Ok(body);
                }
                Err(e) => {
                    last_error = FetchError::Malformed(format!("invalid JSON: {e}"));
                    break;
                }
            }
        }

        if last_error.is_outage() {
            self.breaker.record_failure();
        }
        Err(last_error)
    }
}

#[async_trait]
impl PriceSource for AlphaVantageClient {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    async fn fetch_quote(&self, ticker: &str) -> Result<Quote, FetchError> {
        let body = self.get_json("GLOBAL_QUOTE", ticker, "").await?;
        let quote = parse_global_quote(ticker, &body)?;
        debug!(ticker, price = %quote.price, "Quote fetched");
        Ok(quote)
    }

    /// Intraday 1-minute bars from the filing day first, daily bars when no
    /// intraday series or no bar on that day is served. Outage errors are
    /// returned as-is without trying the fallback.
    async fn price_near(&self, ticker: &str, at: NaiveDateTime) -> Result<Decimal, FetchError> {
        let body = self
            .get_json("TIME_SERIES_INTRADAY", ticker, "&interval=1min&outputsize=full")
            .await?;

        match parse_series(ticker, &body, INTRADAY_KEY)? {
            Some(points) => match nearest_intraday(&points, at) {
                Some((bar_at, close)) => {
                    let distance = (bar_at - at).num_seconds().abs();
                    if distance > INTRADAY_WARN_SECS {
                        warn!(
                            ticker,
                            minutes = distance / 60,
                            "Nearest intraday price is far from filing time"
                        );
                    }
                    return Ok(close);
                }
                None => info!(ticker, day = %at.date(), "No intraday bars on filing day, trying daily data"),
            },
            None => info!(ticker, "No intraday series, trying daily data"),
        }

        let body = self.get_json("TIME_SERIES_DAILY", ticker, "").await?;
        let points = parse_series(ticker, &body, DAILY_KEY)?.unwrap_or_default();

        match closest_close(&points, at) {
            Some((bar_at, close)) if (bar_at - at).num_days().abs() <= DAILY_MAX_DISTANCE_DAYS => {
                Ok(close)
            }
            Some((bar_at, _)) => Err(FetchError::NotFound {
                ticker: ticker.to_string(),
                reason: format!("nearest daily bar {bar_at} too far from {at}"),
            }),
            None => Err(FetchError::NotFound {
                ticker: ticker.to_string(),
                reason: "no price series".to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
