//! Collection run orchestration
//!
//! A run fans out one task per requested provider, waits for every task to
//! finish, then normalizes and merges the surviving lines and hands them to the
//! writer in a single batch. Provider failures are recorded in the
//! [`RunSummary`]; they never abort sibling providers.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::collectors::{join_failure, timeout_error, CollectorRegistry, CollectorResult, CostCollector};
use crate::cost::{CostKey, CostRecord, DateRange, Normalizer, Provider, RawCostLine};
use crate::error::{CollectorError, Result};
use crate::storage::CostWriter;

/// Default per-provider collection timeout
pub const DEFAULT_COLLECTOR_TIMEOUT: Duration = Duration::from_secs(300);

/// Overall outcome of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    PartialSuccess,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Success => "success",
            Self::PartialSuccess => "partial success",
            Self::Failed => "failed",
        })
    }
}

/// Per-provider totals for the records a run produced
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProviderStats {
    pub records: usize,
    pub total_cost: Decimal,
}

/// Result of one collection run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub requested_range: DateRange,
    pub providers_requested: BTreeSet<Provider>,
    pub succeeded: BTreeSet<Provider>,
    pub failed: BTreeMap<Provider, CollectorError>,
    pub records_written: u64,
    pub stats: BTreeMap<Provider, ProviderStats>,
    pub write_error: Option<String>,
}

impl RunSummary {
    /// Failed when nothing succeeded or the write failed; partial when some provider failed
    pub fn status(&self) -> RunStatus {
        if self.succeeded.is_empty() || self.write_error.is_some() {
            RunStatus::Failed
        } else if !self.failed.is_empty() {
            RunStatus::PartialSuccess
        } else {
            RunStatus::Success
        }
    }

    pub fn total_cost(&self) -> Decimal {
        self.stats.values().map(|s| s.total_cost).sum()
    }
}

/// Drives collectors, the normalizer and the writer for one run at a time
pub struct CostAggregator {
    registry: CollectorRegistry,
    writer: Arc<dyn CostWriter>,
    normalizer: Normalizer,
    default_timeout: Duration,
    timeouts: BTreeMap<Provider, Duration>,
}

impl std::fmt::Debug for CostAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CostAggregator")
            .field("registry", &self.registry)
            .field("default_timeout", &self.default_timeout)
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

impl CostAggregator {
    pub fn new(registry: CollectorRegistry, writer: Arc<dyn CostWriter>) -> Self {
        Self {
            registry,
            writer,
            normalizer: Normalizer::default(),
            default_timeout: DEFAULT_COLLECTOR_TIMEOUT,
            timeouts: BTreeMap::new(),
        }
    }

    /// Timeout applied to every provider without an override
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_provider_timeout(mut self, provider: Provider, timeout: Duration) -> Self {
        self.timeouts.insert(provider, timeout);
        self
    }

    pub fn with_normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    pub fn timeout_for(&self, provider: Provider) -> Duration {
        self.timeouts
            .get(&provider)
            .copied()
            .unwrap_or(self.default_timeout)
    }

    /// Collect, normalize and persist costs for `range`
    pub async fn run(&self, providers: &BTreeSet<Provider>, range: DateRange) -> Result<RunSummary> {
        self.run_with_cancel(providers, range, CancellationToken::new())
            .await
    }

    /// Like [`run`](Self::run); cancelling `cancel` stops every in-flight collector
    pub async fn run_with_cancel(
        &self,
        providers: &BTreeSet<Provider>,
        range: DateRange,
        cancel: CancellationToken,
    ) -> Result<RunSummary> {
        let collectors = self.registry.select(providers)?;
        let run_id = Uuid::new_v4();
        let span = info_span!("collect", run_id = %run_id);

        async move {
            info!(range = %range, providers = ?providers, "Starting cost collection run");

            let outcomes = self.collect_all(collectors, range, &cancel).await;

            let mut succeeded = BTreeSet::new();
            let mut failed = BTreeMap::new();
            let mut lines = Vec::new();
            for (provider, outcome) in outcomes {
                match outcome {
                    Ok(provider_lines) => {
                        info!(provider = %provider, lines = provider_lines.len(), "Provider collection succeeded");
                        succeeded.insert(provider);
                        lines.extend(provider_lines);
                    }
                    Err(err) => {
                        warn!(provider = %provider, kind = err.kind.label(), error = %err.kind, "Provider collection failed");
                        failed.insert(provider, err);
                    }
                }
            }

            let records = self.normalize_and_merge(lines);
            let stats = provider_stats(&records);

            let (records_written, write_error) = match self.writer.write(&records).await {
                Ok(count) => (count, None),
                Err(err) => {
                    error!(error = %err, records = records.len(), "Cost write failed, batch discarded");
                    (0, Some(err.to_string()))
                }
            };

            let summary = RunSummary {
                run_id,
                requested_range: range,
                providers_requested: providers.clone(),
                succeeded,
                failed,
                records_written,
                stats,
                write_error,
            };

            info!(
                status = %summary.status(),
                succeeded = summary.succeeded.len(),
                failed = summary.failed.len(),
                records_written,
                "Cost collection run finished"
            );
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    async fn collect_all(
        &self,
        collectors: Vec<(Provider, Arc<dyn CostCollector>)>,
        range: DateRange,
        cancel: &CancellationToken,
    ) -> Vec<(Provider, CollectorResult<Vec<RawCostLine>>)> {
        let tasks = collectors.into_iter().map(|(provider, collector)| {
            let token = cancel.child_token();
            let limit = self.timeout_for(provider);
            let task = collect_one(provider, collector, range, token, limit)
                .instrument(info_span!("collector", provider = %provider));
            let handle = tokio::spawn(task);

            async move {
                let result = handle
                    .await
                    .unwrap_or_else(|e| Err(join_failure(provider, e)));
                (provider, result)
            }
        });

        join_all(tasks).await
    }

    /// Normalize lines, drop non-positive amounts and sum lines sharing a key
    fn normalize_and_merge(&self, lines: Vec<RawCostLine>) -> Vec<CostRecord> {
        let mut merged: BTreeMap<CostKey, CostRecord> = BTreeMap::new();
        let mut dropped = 0usize;

        for line in &lines {
            let record = self.normalizer.normalize(line);
            if record.cost <= Decimal::ZERO {
                dropped += 1;
                continue;
            }
            merged
                .entry(record.key())
                .and_modify(|existing| existing.cost += record.cost)
                .or_insert(record);
        }

        debug!(
            lines = lines.len(),
            records = merged.len(),
            dropped,
            "Normalized collected lines"
        );
        merged.into_values().collect()
    }
}

async fn collect_one(
    provider: Provider,
    collector: Arc<dyn CostCollector>,
    range: DateRange,
    cancel: CancellationToken,
    limit: Duration,
) -> CollectorResult<Vec<RawCostLine>> {
    let started = Instant::now();
    let result = match tokio::time::timeout(limit, collector.fetch_daily_costs(&range, &cancel)).await {
        Ok(result) => result,
        Err(_) => {
            cancel.cancel();
            Err(timeout_error(provider, limit))
        }
    };
    debug!(elapsed_ms = started.elapsed().as_millis() as u64, ok = result.is_ok(), "Collector finished");
    result
}

fn provider_stats(records: &[CostRecord]) -> BTreeMap<Provider, ProviderStats> {
    let mut stats: BTreeMap<Provider, ProviderStats> = BTreeMap::new();
    for record in records {
        let entry = stats.entry(record.provider).or_default();
        entry.records += 1;
        entry.total_cost += record.cost;
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CollectorErrorKind, Error};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use rust_decimal::dec;
    use std::sync::Mutex;

    enum Behavior {
        Lines(Vec<RawCostLine>),
        Fail(CollectorErrorKind),
        Hang,
        Panic,
    }

    struct StubCollector {
        provider: Provider,
        behavior: Behavior,
    }

    impl StubCollector {
        fn arc(provider: Provider, behavior: Behavior) -> Arc<dyn CostCollector> {
            Arc::new(Self { provider, behavior })
        }
    }

    #[async_trait]
    impl CostCollector for StubCollector {
        fn provider(&self) -> Provider {
            self.provider
        }

        async fn fetch_daily_costs(
            &self,
            _range: &DateRange,
            cancel: &CancellationToken,
        ) -> CollectorResult<Vec<RawCostLine>> {
            match &self.behavior {
                Behavior::Lines(lines) => Ok(lines.clone()),
                Behavior::Fail(kind) => Err(CollectorError::new(self.provider, kind.clone())),
                Behavior::Hang => {
                    cancel.cancelled().await;
                    Err(CollectorError::cancelled(self.provider))
                }
                Behavior::Panic => panic!("collector exploded"),
            }
        }

        async fn test_connection(&self) -> CollectorResult<()> {
            match &self.behavior {
                Behavior::Fail(kind) => Err(CollectorError::new(self.provider, kind.clone())),
                Behavior::Hang => std::future::pending().await,
                _ => Ok(()),
            }
        }
    }

    #[derive(Default)]
    struct MemoryWriter {
        batches: Mutex<Vec<Vec<CostRecord>>>,
        fail: bool,
    }

    #[async_trait]
    impl CostWriter for MemoryWriter {
        async fn write(&self, records: &[CostRecord]) -> Result<u64> {
            if self.fail {
                return Err(Error::WriteError("disk full".to_string()));
            }
            self.batches.lock().unwrap().push(records.to_vec());
            Ok(records.len() as u64)
        }
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    }

    fn providers(list: &[Provider]) -> BTreeSet<Provider> {
        list.iter().copied().collect()
    }

    fn aggregator(collectors: Vec<Arc<dyn CostCollector>>, writer: Arc<MemoryWriter>) -> CostAggregator {
        let registry = collectors
            .into_iter()
            .fold(CollectorRegistry::new(), |r, c| r.with(c));
        CostAggregator::new(registry, writer)
    }

    #[tokio::test]
    async fn test_run_writes_one_batch() {
        let writer = Arc::new(MemoryWriter::default());
        let agg = aggregator(
            vec![
                StubCollector::arc(
                    Provider::Aws,
                    Behavior::Lines(vec![RawCostLine::usd(Provider::Aws, "Amazon EC2", day(), dec!(12.50))]),
                ),
                StubCollector::arc(
                    Provider::Gcp,
                    Behavior::Lines(vec![RawCostLine::usd(Provider::Gcp, "BigQuery", day(), dec!(3.00))]),
                ),
            ],
            writer.clone(),
        );

        let summary = agg
            .run(&providers(&[Provider::Aws, Provider::Gcp]), DateRange::single(day()))
            .await
            .unwrap();

        assert_eq!(summary.status(), RunStatus::Success);
        assert_eq!(summary.records_written, 2);
        assert_eq!(summary.total_cost(), dec!(15.50));
        assert_eq!(writer.batches.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_provider_is_isolated() {
        let writer = Arc::new(MemoryWriter::default());
        let agg = aggregator(
            vec![
                StubCollector::arc(Provider::Aws, Behavior::Fail(CollectorErrorKind::Auth("bad key".into()))),
                StubCollector::arc(
                    Provider::Gcp,
                    Behavior::Lines(vec![RawCostLine::usd(Provider::Gcp, "BigQuery", day(), dec!(3))]),
                ),
            ],
            writer.clone(),
        );

        let summary = agg
            .run(&providers(&[Provider::Aws, Provider::Gcp]), DateRange::single(day()))
            .await
            .unwrap();

        assert_eq!(summary.status(), RunStatus::PartialSuccess);
        assert_eq!(summary.succeeded, providers(&[Provider::Gcp]));
        assert_eq!(summary.failed[&Provider::Aws].kind.label(), "auth");
        let batches = writer.batches.lock().unwrap();
        assert!(batches[0].iter().all(|r| r.provider == Provider::Gcp));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_and_panic_do_not_block_siblings() {
        let writer = Arc::new(MemoryWriter::default());
        let agg = aggregator(
            vec![
                StubCollector::arc(Provider::Aws, Behavior::Hang),
                StubCollector::arc(Provider::Gcp, Behavior::Panic),
                StubCollector::arc(
                    Provider::Azure,
                    Behavior::Lines(vec![RawCostLine::usd(Provider::Azure, "Storage", day(), dec!(1))]),
                ),
            ],
            writer.clone(),
        )
        .with_timeout(Duration::from_secs(30));

        let summary = agg
            .run(&providers(&Provider::ALL), DateRange::single(day()))
            .await
            .unwrap();

        assert_eq!(summary.succeeded, providers(&[Provider::Azure]));
        assert_eq!(
            summary.failed[&Provider::Aws].kind,
            CollectorErrorKind::Timeout { secs: 30 }
        );
        assert_eq!(
            summary.failed[&Provider::Gcp].kind,
            CollectorErrorKind::Panicked("collector exploded".to_string())
        );
        assert_eq!(summary.records_written, 1);
    }

    #[tokio::test]
    async fn test_all_failed_still_returns_summary() {
        let writer = Arc::new(MemoryWriter::default());
        let agg = aggregator(
            vec![StubCollector::arc(
                Provider::Azure,
                Behavior::Fail(CollectorErrorKind::SessionExpired("login page".into())),
            )],
            writer,
        );

        let summary = agg
            .run(&providers(&[Provider::Azure]), DateRange::single(day()))
            .await
            .unwrap();
        assert_eq!(summary.status(), RunStatus::Failed);
        assert_eq!(summary.records_written, 0);
    }

    #[tokio::test]
    async fn test_write_failure_fails_run() {
        let writer = Arc::new(MemoryWriter {
            fail: true,
            ..Default::default()
        });
        let agg = aggregator(
            vec![StubCollector::arc(
                Provider::Aws,
                Behavior::Lines(vec![RawCostLine::usd(Provider::Aws, "Amazon S3", day(), dec!(2))]),
            )],
            writer,
        );

        let summary = agg
            .run(&providers(&[Provider::Aws]), DateRange::single(day()))
            .await
            .unwrap();
        assert_eq!(summary.status(), RunStatus::Failed);
        assert_eq!(summary.records_written, 0);
        assert!(summary.write_error.unwrap().contains("disk full"));
        assert!(summary.succeeded.contains(&Provider::Aws));
    }

    #[tokio::test]
    async fn test_collapsed_azure_lines_are_summed() {
        let writer = Arc::new(MemoryWriter::default());
        let agg = aggregator(
            vec![StubCollector::arc(
                Provider::Azure,
                Behavior::Lines(vec![
                    RawCostLine::usd(Provider::Azure, "Cognitive Services", day(), dec!(2.00))
                        .with_resource("gpt-4o Input Tokens"),
                    RawCostLine::usd(Provider::Azure, "Cognitive Services", day(), dec!(0.50))
                        .with_resource("text-embedding-3-small"),
                    RawCostLine::usd(Provider::Azure, "Storage", day(), dec!(0)),
                    RawCostLine::usd(Provider::Azure, "Bandwidth", day(), dec!(-1)),
                ]),
            )],
            writer.clone(),
        );

        let summary = agg
            .run(&providers(&[Provider::Azure]), DateRange::single(day()))
            .await
            .unwrap();

        let batches = writer.batches.lock().unwrap();
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0][0].service, "Azure OpenAI");
        assert_eq!(batches[0][0].cost, dec!(2.50));
        assert_eq!(summary.stats[&Provider::Azure].records, 1);
    }

    #[tokio::test]
    async fn test_invalid_provider_selection() {
        let agg = aggregator(vec![], Arc::new(MemoryWriter::default()));

        let err = agg
            .run(&BTreeSet::new(), DateRange::single(day()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));

        let err = agg
            .run(&providers(&[Provider::Gcp]), DateRange::single(day()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProviderNotConfigured(Provider::Gcp)));
    }

    #[tokio::test]
    async fn test_external_cancel_stops_collectors() {
        let agg = aggregator(
            vec![StubCollector::arc(Provider::Aws, Behavior::Hang)],
            Arc::new(MemoryWriter::default()),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = agg
            .run_with_cancel(&providers(&[Provider::Aws]), DateRange::single(day()), cancel)
            .await
            .unwrap();
        assert_eq!(summary.failed[&Provider::Aws].kind, CollectorErrorKind::Cancelled);
    }
}
