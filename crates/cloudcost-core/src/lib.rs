//! Cloudcost Core Library
//!
//! This crate provides the core functionality for cloudcost, including:
//! - Collectors (AWS Cost Explorer, GCP BigQuery billing export, Azure)
//! - Date range resolution (lookback, backfill, explicit)
//! - Service name normalization
//! - Aggregation runs with per-provider failure isolation
//! - Storage (SQLite with idempotent upserts and report views)

pub mod aggregator;
pub mod collectors;
pub mod config;
pub mod cost;
pub mod error;
pub mod storage;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::aggregator::{CostAggregator, RunStatus, RunSummary};
    pub use crate::collectors::{CollectorRegistry, CostCollector};
    pub use crate::config::Config;
    pub use crate::cost::{CostRecord, DateRange, DateRangeResolver, Provider, RangeMode, RawCostLine};
    pub use crate::error::{CollectorError, CollectorErrorKind, Error, Result};
    pub use crate::storage::{CostWriter, Database, SqliteCostStore};
}
