//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Every section has defaults so a minimal file (or none at all) works.
//! Secrets (API keys) are referenced by env-var name in the config and
//! resolved at runtime via `std::env::var`.

use anyhow::{Context, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub acquisition: AcquisitionConfig,
    pub discovery: DiscoveryConfig,
    pub reconciliation: ReconciliationConfig,
    pub alpha_vantage: AlphaVantageConfig,
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub quotes_file: String,
    pub holdings_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            quotes_file: "quotes.csv".to_string(),
            holdings_file: "insider_buys.csv".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Identifiers tracked regardless of the holdings ledger.
    pub tickers: Vec<String>,
    /// Also track every ticker present in the holdings ledger.
    pub track_holdings: bool,
    /// Maximum in-flight quote requests.
    pub concurrency: usize,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            tickers: Vec::new(),
            track_holdings: true,
            concurrency: 4,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    pub feed_url: String,
    /// Filings below this purchase value (dollars) are ignored.
    pub min_value: u64,
    pub user_agent: String,
    pub timeout_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            feed_url: "http://openinsider.com/insider-purchases".to_string(),
            min_value: 500_000,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36"
                .to_string(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ReconciliationConfig {
    /// Look up missing bought prices from historical data.
    pub backfill: bool,
    /// Cap on historical lookups per run (provider quota).
    pub max_backfills: usize,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            backfill: true,
            max_backfills: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AlphaVantageConfig {
    pub base_url: String,
    pub api_key_env: String,
    pub timeout_secs: u64,
    /// Minimum spacing between two requests, in milliseconds.
    pub min_request_interval_ms: u64,
    pub max_retries: u32,
    /// Consecutive outage-type failures before the client stops calling out.
    pub breaker_threshold: u32,
}

impl Default for AlphaVantageConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.alphavantage.co/query".to_string(),
            api_key_env: "ALPHA_VANTAGE_API_KEY".to_string(),
            timeout_secs: 30,
            min_request_interval_ms: 12_000,
            max_retries: 2,
            breaker_threshold: 3,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ScheduleConfig {
    pub interval_secs: u64,
    /// First UTC hour (inclusive) in which `watch` runs a pass.
    pub start_hour: u32,
    /// Last UTC hour (exclusive).
    pub end_hour: u32,
    pub weekdays_only: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            start_hour: 13,
            end_hour: 22,
            weekdays_only: true,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: AppConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load the file if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Reject settings that would make a run meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.acquisition.concurrency == 0 {
            anyhow::bail!("acquisition.concurrency must be at least 1");
        }
        if self.schedule.interval_secs == 0 {
            anyhow::bail!("schedule.interval_secs must be positive");
        }
        if self.schedule.start_hour > 24 || self.schedule.end_hour > 24 {
            anyhow::bail!("schedule hours must be within 0..=24");
        }
        if self.storage.quotes_file == self.storage.holdings_file {
            anyhow::bail!("storage.quotes_file and storage.holdings_file must differ");
        }
        Ok(())
    }

    /// Resolve an environment variable name to its value.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }

    /// The Alpha Vantage API key, kept out of `Debug` output.
    pub fn alpha_vantage_key(&self) -> Result<SecretString> {
        let key = Self::resolve_env(&self.alpha_vantage.api_key_env)?;
        if key.trim().is_empty() {
            anyhow::bail!("{} is empty", self.alpha_vantage.api_key_env);
        }
        Ok(SecretString::new(key))
    }
}
