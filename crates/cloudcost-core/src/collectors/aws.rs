//! AWS Cost Explorer collector
//!
//! One `GetCostAndUsage` query per run, daily granularity, grouped by the
//! `SERVICE` dimension. Credits and refunds are filtered out server side.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_costexplorer::config::Credentials;
use aws_sdk_costexplorer::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_costexplorer::types::{
    DateInterval, Dimension, DimensionValues, Expression, Granularity, GroupDefinition,
    GroupDefinitionType,
};
use aws_sdk_costexplorer::Client;
use chrono::{Days, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{CollectorResult, CostCollector};
use crate::config::AwsConfig;
use crate::cost::{DateRange, Provider, RawCostLine};
use crate::error::{CollectorError, CollectorErrorKind, Error, Result};

const BLENDED: &str = "BlendedCost";
const UNBLENDED: &str = "UnblendedCost";

/// Days covered by the connection test query
const CONNECTION_TEST_DAYS: u64 = 7;

/// One `(day, service)` group from a Cost Explorer response
#[derive(Debug, Clone, PartialEq)]
pub struct CostGroup {
    /// Period start, `YYYY-MM-DD`
    pub start: String,
    pub service: String,
    pub blended: Option<String>,
    pub unblended: Option<String>,
    pub unit: Option<String>,
}

pub struct AwsCollector {
    client: Client,
}

impl AwsCollector {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a Cost Explorer client from explicit static credentials
    pub async fn from_config(config: &AwsConfig) -> Result<Self> {
        let (Some(key_id), Some(secret)) = (&config.access_key_id, &config.secret_access_key)
        else {
            return Err(Error::ConfigError(
                "AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY are required".to_string(),
            ));
        };

        let credentials = Credentials::new(key_id, secret, None, None, "cloudcost-config");
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .load()
            .await;

        Ok(Self::new(Client::new(&sdk_config)))
    }

    /// Query `[start, end_exclusive)` and flatten every page into groups
    async fn query(
        &self,
        start: NaiveDate,
        end_exclusive: NaiveDate,
        cancel: &CancellationToken,
    ) -> CollectorResult<Vec<CostGroup>> {
        let interval = DateInterval::builder()
            .start(start.to_string())
            .end(end_exclusive.to_string())
            .build()
            .map_err(|e| CollectorError::request(Provider::Aws, e.to_string()))?;

        let mut groups = Vec::new();
        let mut next_page: Option<String> = None;

        loop {
            let request = self
                .client
                .get_cost_and_usage()
                .time_period(interval.clone())
                .granularity(Granularity::Daily)
                .metrics(BLENDED)
                .metrics(UNBLENDED)
                .group_by(
                    GroupDefinition::builder()
                        .r#type(GroupDefinitionType::Dimension)
                        .key("SERVICE")
                        .build(),
                )
                .filter(exclude_credits_and_refunds())
                .set_next_page_token(next_page.take());

            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(CollectorError::cancelled(Provider::Aws)),
                response = request.send() => response.map_err(sdk_error)?,
            };

            for result in response.results_by_time() {
                let day = result
                    .time_period()
                    .map(|tp| tp.start().to_string())
                    .unwrap_or_default();

                for group in result.groups() {
                    let metric = |name: &str| group.metrics().and_then(|m| m.get(name));
                    groups.push(CostGroup {
                        start: day.clone(),
                        service: group.keys().first().cloned().unwrap_or_default(),
                        blended: metric(BLENDED).and_then(|m| m.amount()).map(str::to_string),
                        unblended: metric(UNBLENDED).and_then(|m| m.amount()).map(str::to_string),
                        unit: metric(UNBLENDED)
                            .or_else(|| metric(BLENDED))
                            .and_then(|m| m.unit())
                            .map(str::to_string),
                    });
                }
            }

            match response.next_page_token() {
                Some(token) if !token.is_empty() => {
                    debug!(groups = groups.len(), "Fetching next Cost Explorer page");
                    next_page = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(groups)
    }
}

#[async_trait]
impl CostCollector for AwsCollector {
    fn provider(&self) -> Provider {
        Provider::Aws
    }

    async fn fetch_daily_costs(
        &self,
        range: &DateRange,
        cancel: &CancellationToken,
    ) -> CollectorResult<Vec<RawCostLine>> {
        // Cost Explorer treats the end date as exclusive
        let end_exclusive = range
            .end()
            .checked_add_days(Days::new(1))
            .ok_or_else(|| CollectorError::request(Provider::Aws, "end date out of range"))?;

        info!(range = %range, "Collecting AWS costs");
        let groups = self.query(range.start(), end_exclusive, cancel).await?;
        let lines = map_groups(&groups)?;
        info!(groups = groups.len(), lines = lines.len(), "AWS collection complete");
        Ok(lines)
    }

    async fn test_connection(&self) -> CollectorResult<()> {
        let today = Utc::now().date_naive();
        let start = today
            .checked_sub_days(Days::new(CONNECTION_TEST_DAYS))
            .ok_or_else(|| CollectorError::request(Provider::Aws, "date out of range"))?;
        self.query(start, today, &CancellationToken::new()).await?;
        info!("AWS Cost Explorer connection test successful");
        Ok(())
    }
}

/// `NOT RECORD_TYPE IN (Credit, Refund)`
fn exclude_credits_and_refunds() -> Expression {
    Expression::builder()
        .not(
            Expression::builder()
                .dimensions(
                    DimensionValues::builder()
                        .key(Dimension::RecordType)
                        .values("Credit")
                        .values("Refund")
                        .build(),
                )
                .build(),
        )
        .build()
}

/// Map response groups to cost lines.
///
/// A group's cost is the larger of its blended and unblended amounts; groups
/// with zero cost are dropped.
pub fn map_groups(groups: &[CostGroup]) -> CollectorResult<Vec<RawCostLine>> {
    let mut lines = Vec::with_capacity(groups.len());

    for group in groups {
        let date = NaiveDate::parse_from_str(&group.start, "%Y-%m-%d").map_err(|e| {
            CollectorError::response(
                Provider::Aws,
                format!("invalid period start '{}': {e}", group.start),
            )
        })?;

        let blended = parse_amount(group.blended.as_deref())?;
        let unblended = parse_amount(group.unblended.as_deref())?;
        let amount = blended.max(unblended);
        if amount.is_zero() {
            continue;
        }

        lines.push(RawCostLine {
            provider: Provider::Aws,
            service: group.service.clone(),
            resource: None,
            date,
            amount,
            currency: group.unit.clone().unwrap_or_else(|| "USD".to_string()),
        });
    }

    Ok(lines)
}

fn parse_amount(value: Option<&str>) -> CollectorResult<Decimal> {
    match value {
        None => Ok(Decimal::ZERO),
        Some(s) => Decimal::from_str(s)
            .or_else(|_| Decimal::from_scientific(s))
            .map_err(|e| {
                CollectorError::response(Provider::Aws, format!("invalid amount '{s}': {e}"))
            }),
    }
}

fn sdk_error<E, R>(err: SdkError<E, R>) -> CollectorError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = DisplayErrorContext(&err).to_string();
    let kind = match err.as_service_error() {
        Some(service_err) => classify(service_err.code(), message),
        None => CollectorErrorKind::Request(message),
    };
    CollectorError::new(Provider::Aws, kind)
}

/// Map a Cost Explorer error code to a failure category
fn classify(code: Option<&str>, message: String) -> CollectorErrorKind {
    match code {
        Some(
            "UnrecognizedClientException"
            | "InvalidClientTokenId"
            | "ExpiredTokenException"
            | "AccessDeniedException"
            | "SignatureDoesNotMatch",
        ) => CollectorErrorKind::Auth(message),
        Some("LimitExceededException" | "ThrottlingException" | "RequestLimitExceeded") => {
            CollectorErrorKind::RateLimited(message)
        }
        _ => CollectorErrorKind::Response(message),
    }
}
