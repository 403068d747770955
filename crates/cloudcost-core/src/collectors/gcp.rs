//! GCP collector over the BigQuery billing export
//!
//! Runs one standard-SQL query through the BigQuery REST `jobs.query` endpoint,
//! grouping export rows by usage day and service with credits folded in.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use google_cloud_token::{TokenSource, TokenSourceProvider};
use reqwest::{Client as HttpClient, RequestBuilder};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{CollectorResult, CostCollector};
use crate::config::GcpConfig;
use crate::cost::{DateRange, Provider, RawCostLine};
use crate::error::{CollectorError, CollectorErrorKind, Error, Result};

const BIGQUERY_BASE_URL: &str = "https://bigquery.googleapis.com/bigquery/v2";
const BIGQUERY_SCOPES: &[&str] = &["https://www.googleapis.com/auth/bigquery"];

/// Server-side wait per `jobs.query` / `getQueryResults` call
const QUERY_TIMEOUT_MS: u64 = 60_000;

/// Error text BigQuery uses when a wildcard table matches nothing
const NO_EXPORT_TABLE: &str = "does not match any table";

/// GCP BigQuery billing export collector
pub struct GcpCollector {
    http: HttpClient,
    base_url: String,
    project_id: String,
    dataset: String,
    table: String,
    static_token: Option<String>,
    credentials_path: Option<PathBuf>,
    token_source: OnceCell<Arc<dyn TokenSource>>,
}

impl std::fmt::Debug for GcpCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcpCollector")
            .field("project_id", &self.project_id)
            .field("dataset", &self.dataset)
            .field("table", &self.table)
            .field("static_token", &self.static_token.is_some())
            .finish()
    }
}

impl GcpCollector {
    pub fn from_config(config: &GcpConfig, http: HttpClient) -> Result<Self> {
        let project_id = config
            .project_id
            .clone()
            .ok_or_else(|| Error::ConfigError("GCP_PROJECT_ID is required".to_string()))?;

        Ok(Self {
            http,
            base_url: BIGQUERY_BASE_URL.to_string(),
            project_id,
            dataset: config.bigquery_dataset.clone(),
            table: export_table(config.billing_account_id.as_deref()),
            static_token: config.access_token.clone(),
            credentials_path: config.credentials_path.clone(),
            token_source: OnceCell::new(),
        })
    }

    /// Point the collector at a different BigQuery endpoint
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Fully qualified export table, e.g. `proj.billing_export.gcp_billing_export_v1_*`
    pub fn table_path(&self) -> String {
        format!("{}.{}.{}", self.project_id, self.dataset, self.table)
    }

    fn daily_cost_sql(&self) -> String {
        format!(
            r#"
            SELECT
                CAST(DATE(usage_start_time) AS STRING) AS usage_date,
                service.description AS service_name,
                currency,
                SUM(cost) + SUM(IFNULL((SELECT SUM(c.amount) FROM UNNEST(credits) c), 0)) AS total_cost
            FROM `{table}`
            WHERE DATE(usage_start_time) >= @start_date
              AND DATE(usage_start_time) <= @end_date
              AND cost > 0
            GROUP BY usage_date, service_name, currency
            HAVING total_cost > 0
            ORDER BY usage_date, total_cost DESC
            "#,
            table = self.table_path()
        )
    }

    async fn access_token(&self) -> CollectorResult<String> {
        if let Some(token) = &self.static_token {
            return Ok(token.clone());
        }

        let source = self
            .token_source
            .get_or_try_init(|| build_token_source(self.credentials_path.as_deref()))
            .await?;

        let token = source
            .token()
            .await
            .map_err(|e| CollectorError::auth(Provider::Gcp, format!("failed to get token: {e}")))?;

        Ok(token
            .strip_prefix("Bearer ")
            .map(str::to_string)
            .unwrap_or(token))
    }

    /// Send an authenticated request and decode the JSON body
    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        cancel: &CancellationToken,
    ) -> CollectorResult<T> {
        let token = self.access_token().await?;
        let request = request.bearer_auth(token);

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(CollectorError::cancelled(Provider::Gcp)),
            response = request.send() => {
                response.map_err(|e| CollectorError::from_reqwest(Provider::Gcp, &e))?
            }
        };

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| CollectorError::from_reqwest(Provider::Gcp, &e))?;

        if !status.is_success() {
            return Err(CollectorError::from_status(
                Provider::Gcp,
                status,
                &api_error_message(&body),
            ));
        }

        serde_json::from_str(&body).map_err(|e| {
            CollectorError::response(Provider::Gcp, format!("invalid BigQuery response: {e}"))
        })
    }

    async fn run_query(
        &self,
        range: &DateRange,
        cancel: &CancellationToken,
    ) -> CollectorResult<Vec<TableRow>> {
        let sql = self.daily_cost_sql();
        debug!(sql = %sql, "Executing BigQuery query");

        let body = json!({
            "query": sql,
            "useLegacySql": false,
            "timeoutMs": QUERY_TIMEOUT_MS,
            "parameterMode": "NAMED",
            "queryParameters": [
                date_parameter("start_date", range.start()),
                date_parameter("end_date", range.end()),
            ],
        });

        let url = format!("{}/projects/{}/queries", self.base_url, self.project_id);
        let mut page: QueryResponse = self.send(self.http.post(&url).json(&body), cancel).await?;
        let mut rows = Vec::new();

        loop {
            let complete = page.job_complete.unwrap_or(true);
            if complete {
                rows.append(&mut page.rows);
            }

            let page_token = page.page_token.take();
            if complete && page_token.is_none() {
                break;
            }

            let job = page.job_reference.take().ok_or_else(|| {
                CollectorError::response(Provider::Gcp, "incomplete query without a job reference")
            })?;
            debug!(job_id = %job.job_id, complete, "Polling BigQuery query results");
            page = self.get_results(&job, page_token.as_deref(), cancel).await?;
            if page.job_reference.is_none() {
                page.job_reference = Some(job);
            }
        }

        Ok(rows)
    }

    async fn get_results(
        &self,
        job: &JobReference,
        page_token: Option<&str>,
        cancel: &CancellationToken,
    ) -> CollectorResult<QueryResponse> {
        let url = format!(
            "{}/projects/{}/queries/{}",
            self.base_url, job.project_id, job.job_id
        );
        let mut query: Vec<(&str, String)> = vec![("timeoutMs", QUERY_TIMEOUT_MS.to_string())];
        if let Some(location) = &job.location {
            query.push(("location", location.clone()));
        }
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }
        self.send(self.http.get(&url).query(&query), cancel).await
    }
}

#[async_trait]
impl CostCollector for GcpCollector {
    fn provider(&self) -> Provider {
        Provider::Gcp
    }

    async fn fetch_daily_costs(
        &self,
        range: &DateRange,
        cancel: &CancellationToken,
    ) -> CollectorResult<Vec<RawCostLine>> {
        info!(range = %range, table = %self.table_path(), "Collecting GCP costs");

        let rows = match self.run_query(range, cancel).await {
            Ok(rows) => rows,
            Err(err) if is_missing_export_table(&err) => {
                warn!(
                    table = %self.table_path(),
                    "GCP billing export tables not found; data can take up to 24 hours to appear after enabling export"
                );
                return Ok(Vec::new());
            }
            Err(err) => return Err(err),
        };

        let lines = map_rows(&rows)?;
        info!(lines = lines.len(), "GCP collection complete");
        Ok(lines)
    }

    async fn test_connection(&self) -> CollectorResult<()> {
        let url = format!(
            "{}/projects/{}/datasets/{}",
            self.base_url, self.project_id, self.dataset
        );
        let _: serde_json::Value = self
            .send(self.http.get(&url), &CancellationToken::new())
            .await?;
        info!(dataset = %self.dataset, "GCP BigQuery connection test successful");
        Ok(())
    }
}

async fn build_token_source(credentials_path: Option<&Path>) -> CollectorResult<Arc<dyn TokenSource>> {
    let config = google_cloud_auth::project::Config::default().with_scopes(BIGQUERY_SCOPES);

    let provider = match credentials_path {
        Some(path) => {
            let key_json = tokio::fs::read_to_string(path).await.map_err(|e| {
                CollectorError::auth(
                    Provider::Gcp,
                    format!("failed to read credentials file '{}': {e}", path.display()),
                )
            })?;
            let creds: google_cloud_auth::credentials::CredentialsFile =
                serde_json::from_str(&key_json).map_err(|e| {
                    CollectorError::auth(
                        Provider::Gcp,
                        format!("failed to parse credentials file '{}': {e}", path.display()),
                    )
                })?;
            google_cloud_auth::token::DefaultTokenSourceProvider::new_with_credentials(
                config,
                Box::new(creds),
            )
            .await
        }
        None => google_cloud_auth::token::DefaultTokenSourceProvider::new(config).await,
    }
    .map_err(|e| {
        CollectorError::auth(Provider::Gcp, format!("failed to create token source: {e}"))
    })?;

    Ok(provider.token_source())
}

/// Export table name; the billing account narrows the wildcard to one table
fn export_table(billing_account_id: Option<&str>) -> String {
    match billing_account_id {
        Some(id) => format!("gcp_billing_export_v1_{}", id.replace('-', "_")),
        None => "gcp_billing_export_v1_*".to_string(),
    }
}

fn date_parameter(name: &str, value: NaiveDate) -> serde_json::Value {
    json!({
        "name": name,
        "parameterType": { "type": "DATE" },
        "parameterValue": { "value": value.to_string() },
    })
}

fn is_missing_export_table(err: &CollectorError) -> bool {
    match &err.kind {
        CollectorErrorKind::Response(msg) => msg.contains(NO_EXPORT_TABLE),
        _ => false,
    }
}

/// Pull `error.message` out of a Google API error body, falling back to the raw body
fn api_error_message(body: &str) -> String {
    serde_json::from_str::<ApiErrorBody>(body)
        .map(|b| b.error.message)
        .unwrap_or_else(|_| body.to_string())
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    job_complete: Option<bool>,
    job_reference: Option<JobReference>,
    #[serde(default)]
    rows: Vec<TableRow>,
    page_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    project_id: String,
    job_id: String,
    location: Option<String>,
}

/// A BigQuery result row: `{"f": [{"v": ...}, ...]}`
#[derive(Debug, Clone, Deserialize)]
pub struct TableRow {
    pub f: Vec<TableCell>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableCell {
    pub v: Option<serde_json::Value>,
}

impl TableRow {
    fn text(&self, index: usize) -> Option<&str> {
        self.f.get(index)?.v.as_ref()?.as_str()
    }
}

/// Map `(usage_date, service_name, currency, total_cost)` rows to cost lines.
///
/// A null service description becomes an empty identifier, which the
/// normalizer reports as `Unknown`.
pub fn map_rows(rows: &[TableRow]) -> CollectorResult<Vec<RawCostLine>> {
    rows.iter()
        .map(|row| {
            let date_text = row.text(0).unwrap_or_default();
            let date = NaiveDate::parse_from_str(date_text, "%Y-%m-%d").map_err(|e| {
                CollectorError::response(
                    Provider::Gcp,
                    format!("invalid usage_date '{date_text}': {e}"),
                )
            })?;

            let cost_text = row.text(3).unwrap_or("0");
            let amount = Decimal::from_str(cost_text)
                .or_else(|_| Decimal::from_scientific(cost_text))
                .map_err(|e| {
                    CollectorError::response(
                        Provider::Gcp,
                        format!("invalid total_cost '{cost_text}': {e}"),
                    )
                })?;

            Ok(RawCostLine {
                provider: Provider::Gcp,
                service: row.text(1).unwrap_or_default().to_string(),
                resource: None,
                date,
                amount,
                currency: row.text(2).unwrap_or("USD").to_string(),
            })
        })
        .collect()
}
