//! Provider collectors
//!
//! Each billing source implements [`CostCollector`]. Collectors only fetch and
//! map provider responses into [`RawCostLine`]s; normalization, merging and
//! persistence happen in the aggregator.

pub mod aws;
pub mod azure;
pub mod gcp;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Config;
use crate::cost::{DateRange, Provider, RawCostLine};
use crate::error::{CollectorError, CollectorErrorKind, Error, Result};

pub use aws::AwsCollector;
pub use azure::AzureCollector;
pub use gcp::GcpCollector;

/// Result type for collector operations
pub type CollectorResult<T> = std::result::Result<T, CollectorError>;

/// HTTP timeout for a single provider request
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// A billing source that can report daily per-service costs
#[async_trait]
pub trait CostCollector: Send + Sync {
    fn provider(&self) -> Provider;

    /// Daily cost lines for every day in `range` (inclusive).
    ///
    /// Implementations should return [`CollectorErrorKind::Cancelled`](crate::error::CollectorErrorKind::Cancelled)
    /// promptly once `cancel` fires.
    async fn fetch_daily_costs(
        &self,
        range: &DateRange,
        cancel: &CancellationToken,
    ) -> CollectorResult<Vec<RawCostLine>>;

    /// Cheap authenticated call proving the credentials work
    async fn test_connection(&self) -> CollectorResult<()>;
}

/// Collectors available for a run, keyed by provider
#[derive(Default, Clone)]
pub struct CollectorRegistry {
    collectors: BTreeMap<Provider, Arc<dyn CostCollector>>,
}

impl std::fmt::Debug for CollectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorRegistry")
            .field("providers", &self.providers())
            .finish()
    }
}

impl CollectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a collector, replacing any existing one for the same provider
    pub fn register(&mut self, collector: Arc<dyn CostCollector>) {
        let provider = collector.provider();
        debug!(provider = %provider, "Registered collector");
        self.collectors.insert(provider, collector);
    }

    pub fn with(mut self, collector: Arc<dyn CostCollector>) -> Self {
        self.register(collector);
        self
    }

    pub fn get(&self, provider: Provider) -> Option<Arc<dyn CostCollector>> {
        self.collectors.get(&provider).cloned()
    }

    pub fn contains(&self, provider: Provider) -> bool {
        self.collectors.contains_key(&provider)
    }

    pub fn providers(&self) -> Vec<Provider> {
        self.collectors.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }

    /// Collectors for `providers`; fails before any I/O if the set is empty or
    /// a provider has no registered collector
    pub fn select(
        &self,
        providers: &BTreeSet<Provider>,
    ) -> Result<Vec<(Provider, Arc<dyn CostCollector>)>> {
        if providers.is_empty() {
            return Err(Error::ConfigError("no providers selected".to_string()));
        }

        providers
            .iter()
            .map(|&provider| {
                self.get(provider)
                    .map(|collector| (provider, collector))
                    .ok_or(Error::ProviderNotConfigured(provider))
            })
            .collect()
    }

    /// Run each selected collector's connection check concurrently, bounded by `limit`
    pub async fn test_connections(
        &self,
        providers: &BTreeSet<Provider>,
        limit: Duration,
    ) -> Result<BTreeMap<Provider, CollectorResult<()>>> {
        let checks = self.select(providers)?.into_iter().map(|(provider, collector)| {
            let handle = tokio::spawn(async move {
                match tokio::time::timeout(limit, collector.test_connection()).await {
                    Ok(result) => result,
                    Err(_) => Err(timeout_error(provider, limit)),
                }
            });
            async move {
                let result = handle
                    .await
                    .unwrap_or_else(|e| Err(join_failure(provider, e)));
                (provider, result)
            }
        });

        Ok(join_all(checks).await.into_iter().collect())
    }

    /// Build collectors for every provider whose credentials are configured
    pub async fn from_config(config: &Config) -> Result<Self> {
        let http = http_client()?;
        let mut registry = Self::new();

        if config.aws.is_configured() {
            registry.register(Arc::new(AwsCollector::from_config(&config.aws).await?));
        }
        if config.gcp.is_configured() {
            registry.register(Arc::new(GcpCollector::from_config(&config.gcp, http.clone())?));
        }
        if let Some(collector) = AzureCollector::from_config(&config.azure, http) {
            registry.register(Arc::new(collector));
        }

        info!(providers = ?registry.providers(), "Collector registry built");
        Ok(registry)
    }
}

pub(crate) fn timeout_error(provider: Provider, limit: Duration) -> CollectorError {
    CollectorError::new(
        provider,
        CollectorErrorKind::Timeout {
            secs: limit.as_secs(),
        },
    )
}

/// Map a failed collector task onto the provider's error
pub(crate) fn join_failure(provider: Provider, err: JoinError) -> CollectorError {
    if err.is_cancelled() {
        return CollectorError::cancelled(provider);
    }

    let payload = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    CollectorError::new(provider, CollectorErrorKind::Panicked(message))
}

/// Shared HTTP client for the REST based collectors
pub fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(Error::NetworkError)
}
