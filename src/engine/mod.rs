//! Pipeline stages and the pass that chains them.
//!
//! - `discovery`: new insider filings into the holdings ledger
//! - `acquisition`: fresh quotes for every tracked ticker
//! - `reconciliation`: bought-price backfill and current-price update
//! - `pipeline`: one pass over the stages, with its report
//! - `schedule`: active-window gating for `watch`

pub mod acquisition;
pub mod discovery;
pub mod pipeline;
pub mod reconciliation;
pub mod schedule;

pub use pipeline::{Pipeline, PipelineSettings, RunMode, RunReport};
