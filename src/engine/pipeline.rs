//! Pipeline: one discovery → acquisition → reconciliation pass.
//!
//! Each pass loads the ledger, merges new filings, fetches quotes and
//! reconciles. Fatal errors surface before the affected file is written;
//! recoverable ones (a failed ticker, a gap) land in the `RunReport`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::engine::acquisition::{tracked_tickers, AcquisitionReport, AcquisitionStage};
use crate::engine::discovery::{self, DiscoveryReport};
use crate::engine::reconciliation::{ReconciliationReport, ReconciliationStage};
use crate::sources::alpha_vantage::AlphaVantageClient;
use crate::sources::openinsider::OpenInsiderFeed;
use crate::sources::{FilingFeed, PriceSource};
use crate::storage::Datasets;
use crate::types::PipelineError;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// The knobs a pass needs, lifted out of `AppConfig`.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub tickers: Vec<String>,
    pub track_holdings: bool,
    pub concurrency: usize,
    pub min_value: u64,
    pub backfill: bool,
    pub max_backfills: usize,
}

impl PipelineSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            tickers: cfg.acquisition.tickers.clone(),
            track_holdings: cfg.acquisition.track_holdings,
            concurrency: cfg.acquisition.concurrency,
            min_value: cfg.discovery.min_value,
            backfill: cfg.reconciliation.backfill,
            max_backfills: cfg.reconciliation.max_backfills,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Run report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Full,
    AcquireOnly,
    ReconcileOnly,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunMode::Full => "full",
            RunMode::AcquireOnly => "acquire",
            RunMode::ReconcileOnly => "reconcile",
        })
    }
}

/// What one pass did.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub discovery: Option<DiscoveryReport>,
    pub acquisition: Option<AcquisitionReport>,
    pub reconciliation: Option<ReconciliationReport>,
    /// Ledger replaced outside reconciliation (acquire-only with new filings).
    pub ledger_persisted: bool,
}

impl RunReport {
    /// Tickers left without fresh data.
    pub fn gaps(&self) -> &[String] {
        self.reconciliation
            .as_ref()
            .map(|r| r.gaps.as_slice())
            .unwrap_or(&[])
    }

    /// Recoverable errors raised during the pass.
    pub fn warnings(&self) -> Vec<PipelineError> {
        let mut out: Vec<PipelineError> = self
            .acquisition
            .iter()
            .flat_map(|a| a.failures.iter().map(|f| f.to_error()))
            .collect();
        if let Some(r) = &self.reconciliation {
            out.extend(r.gap_errors());
        }
        out
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0;
        writeln!(f, "Run {} ({}) finished in {secs:.1}s", self.run_id, self.mode)?;
        if let Some(d) = &self.discovery {
            writeln!(
                f,
                "  discovery:      {} new filings ({} listed, {} duplicates, {} below threshold, {} refilled)",
                d.added, d.listed, d.duplicates, d.below_threshold, d.refilled
            )?;
        }
        if let Some(a) = &self.acquisition {
            writeln!(
                f,
                "  acquisition:    {}/{} fetched, {} failed",
                a.fetched(),
                a.tracked.len(),
                a.failures.len()
            )?;
            for failure in &a.failures {
                writeln!(f, "    ! {}: {}", failure.ticker, failure.reason)?;
            }
        }
        if let Some(r) = &self.reconciliation {
            writeln!(
                f,
                "  reconciliation: {} updated, {} unchanged, {} skipped, {} backfilled",
                r.updated.len(),
                r.unchanged,
                r.skipped.len(),
                r.backfilled.len()
            )?;
            if !r.gaps.is_empty() {
                writeln!(f, "    gaps: {}", r.gaps.join(", "))?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct Pipeline {
    datasets: Datasets,
    prices: Arc<dyn PriceSource>,
    filings: Option<Arc<dyn FilingFeed>>,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(datasets: Datasets, prices: Arc<dyn PriceSource>, settings: PipelineSettings) -> Self {
        Self {
            datasets,
            prices,
            filings: None,
            settings,
        }
    }

    /// Merge filings from `feed` into the ledger at the start of each pass.
    pub fn with_filing_feed(mut self, feed: Arc<dyn FilingFeed>) -> Self {
        self.filings = Some(feed);
        self
    }

    /// Production wiring: file store, Alpha Vantage, openinsider.
    pub fn from_config(cfg: &AppConfig) -> Result<Self, PipelineError> {
        let config_err = |e: anyhow::Error| PipelineError::Config(format!("{e:#}"));

        let key = cfg.alpha_vantage_key().map_err(config_err)?;
        let prices = AlphaVantageClient::new(&cfg.alpha_vantage, key).map_err(config_err)?;
        let mut pipeline = Self::new(
            Datasets::from_config(&cfg.storage),
            Arc::new(prices),
            PipelineSettings::from_config(cfg),
        );

        if cfg.discovery.enabled {
            let feed = OpenInsiderFeed::new(&cfg.discovery).map_err(config_err)?;
            pipeline = pipeline.with_filing_feed(Arc::new(feed));
        }
        Ok(pipeline)
    }

    /// Discovery, acquisition and reconciliation.
    pub async fn run(&self) -> Result<RunReport, PipelineError> {
        self.execute(RunMode::Full).await
    }

    /// Discovery and acquisition only.
    pub async fn acquire_only(&self) -> Result<RunReport, PipelineError> {
        self.execute(RunMode::AcquireOnly).await
    }

    /// Reconcile against the last persisted snapshot.
    pub async fn reconcile_only(&self) -> Result<RunReport, PipelineError> {
        self.execute(RunMode::ReconcileOnly).await
    }

    async fn execute(&self, mode: RunMode) -> Result<RunReport, PipelineError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(run_id = %run_id, mode = %mode, "Run started");

        let mut holdings = self.datasets.load_holdings()?;
        let mut report = RunReport {
            run_id,
            mode,
            started_at,
            finished_at: started_at,
            discovery: None,
            acquisition: None,
            reconciliation: None,
            ledger_persisted: false,
        };

        let mut dirty = false;
        if mode != RunMode::ReconcileOnly {
            if let Some(feed) = &self.filings {
                let found = discovery::discover(
                    feed.as_ref(),
                    &mut holdings,
                    self.settings.min_value,
                    started_at.naive_utc(),
                )
                .await?;
                dirty = found.added > 0 || found.refilled > 0;
                report.discovery = Some(found);
            }
        }

        let snapshot = if mode == RunMode::ReconcileOnly {
            self.datasets.load_snapshot()?
        } else {
            let tracked = tracked_tickers(&self.settings.tickers, &holdings, self.settings.track_holdings);
            let stage = AcquisitionStage::new(self.prices.as_ref(), &self.datasets, self.settings.concurrency);
            let acquired = stage.run(tracked, Utc::now()).await?;
            let snapshot = acquired.snapshot.clone();
            report.acquisition = Some(acquired);
            snapshot
        };

        if mode == RunMode::AcquireOnly {
            if dirty {
                self.datasets.save_holdings(&holdings)?;
                report.ledger_persisted = true;
            }
        } else {
            let history = self.settings.backfill.then(|| self.prices.as_ref());
            let stage = ReconciliationStage::new(&self.datasets, history, self.settings.max_backfills);
            report.reconciliation = Some(stage.run(&mut holdings, &snapshot, dirty).await?);
        }

        report.finished_at = Utc::now();
        info!(
            run_id = %run_id,
            mode = %mode,
            fetched = report.acquisition.as_ref().map(|a| a.fetched()).unwrap_or(0),
            gaps = report.gaps().len(),
            warnings = report.warnings().len(),
            "Run finished"
        );
        Ok(report)
    }
}

/// Build the production pipeline from `cfg` and run one full pass.
pub async fn run(cfg: &AppConfig) -> Result<RunReport, PipelineError> {
    Pipeline::from_config(cfg)?.run().await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
