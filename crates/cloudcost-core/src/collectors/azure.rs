//! Azure collector
//!
//! Two backends share the same per-day loop:
//!
//! - Cost Management query API, authenticated with a service principal
//!   (client credentials grant against Entra ID)
//! - the Azure Sponsorship portal usage endpoint, authenticated with a
//!   browser session cookie
//!
//! Both are queried one day at a time so every line carries an exact usage
//! date. Cancellation is checked between days.

use std::str::FromStr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{Days, NaiveDate, Utc};
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client as HttpClient, RequestBuilder, Response};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{CollectorResult, CostCollector};
use crate::config::{AzureAuth, AzureConfig};
use crate::cost::{DateRange, Provider, RawCostLine};
use crate::error::{CollectorError, CollectorErrorKind};

const LOGIN_URL: &str = "https://login.microsoftonline.com";
const MANAGEMENT_URL: &str = "https://management.azure.com";
const SPONSORSHIP_URL: &str = "https://www.microsoftazuresponsorships.com";

const MANAGEMENT_SCOPE: &str = "https://management.azure.com/.default";
const COST_MANAGEMENT_API_VERSION: &str = "2023-03-01";

/// Refresh tokens this long before they expire
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Clone)]
struct Endpoints {
    login: String,
    management: String,
    sponsorship: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            login: LOGIN_URL.to_string(),
            management: MANAGEMENT_URL.to_string(),
            sponsorship: SPONSORSHIP_URL.to_string(),
        }
    }
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

pub struct AzureCollector {
    http: HttpClient,
    subscription_id: String,
    auth: AzureAuth,
    endpoints: Endpoints,
    token: Mutex<Option<CachedToken>>,
}

impl std::fmt::Debug for AzureCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureCollector")
            .field("subscription_id", &self.subscription_id)
            .field("backend", &self.backend_name())
            .finish()
    }
}

impl AzureCollector {
    pub fn new(http: HttpClient, subscription_id: impl Into<String>, auth: AzureAuth) -> Self {
        Self {
            http,
            subscription_id: subscription_id.into(),
            auth,
            endpoints: Endpoints::default(),
            token: Mutex::new(None),
        }
    }

    /// `None` unless a subscription and one complete credential set are configured
    pub fn from_config(config: &AzureConfig, http: HttpClient) -> Option<Self> {
        let auth = config.auth()?;
        let subscription_id = config.subscription_id.clone()?;
        Some(Self::new(http, subscription_id, auth))
    }

    /// Send every request to one base URL (login, management and portal paths do not overlap)
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        let url = url.into();
        self.endpoints = Endpoints {
            login: url.clone(),
            management: url.clone(),
            sponsorship: url,
        };
        self
    }

    pub fn backend_name(&self) -> &'static str {
        match self.auth {
            AzureAuth::ServicePrincipal { .. } => "cost_management",
            AzureAuth::SponsorshipCookies(_) => "sponsorship",
        }
    }

    async fn fetch_day(&self, day: NaiveDate, cancel: &CancellationToken) -> CollectorResult<Vec<RawCostLine>> {
        match &self.auth {
            AzureAuth::ServicePrincipal {
                tenant_id,
                client_id,
                client_secret,
            } => {
                let token = self.access_token(tenant_id, client_id, client_secret, cancel).await?;
                self.query_cost_management(day, &token, cancel).await
            }
            AzureAuth::SponsorshipCookies(cookies) => {
                self.query_sponsorship(day, cookies, cancel).await
            }
        }
    }

    async fn access_token(
        &self,
        tenant_id: &str,
        client_id: &str,
        client_secret: &str,
        cancel: &CancellationToken,
    ) -> CollectorResult<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.value.clone());
            }
        }

        let url = format!("{}/{}/oauth2/v2.0/token", self.endpoints.login, tenant_id);
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("scope", MANAGEMENT_SCOPE),
        ];
        let response = send(self.http.post(&url).form(&form), cancel).await?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| CollectorError::from_reqwest(Provider::Azure, &e))?;

        if !status.is_success() {
            return Err(CollectorError::auth(
                Provider::Azure,
                format!("token request failed with HTTP {status}: {}", snippet(&body)),
            ));
        }

        let token: TokenResponse = serde_json::from_str(&body).map_err(|e| {
            CollectorError::auth(Provider::Azure, format!("invalid token response: {e}"))
        })?;

        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(3600));
        debug!(expires_in = lifetime.as_secs(), "Acquired Azure management token");
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at: Instant::now() + lifetime.saturating_sub(TOKEN_EXPIRY_MARGIN),
        });

        Ok(token.access_token)
    }

    async fn query_cost_management(
        &self,
        day: NaiveDate,
        token: &str,
        cancel: &CancellationToken,
    ) -> CollectorResult<Vec<RawCostLine>> {
        let body = cost_management_body(day);
        let mut url = format!(
            "{}/subscriptions/{}/providers/Microsoft.CostManagement/query?api-version={}",
            self.endpoints.management, self.subscription_id, COST_MANAGEMENT_API_VERSION
        );
        let mut lines = Vec::new();

        loop {
            let request = self.http.post(&url).bearer_auth(token).json(&body);
            let response = send(request, cancel).await?;
            let status = response.status();
            let text = response
                .text()
                .await
                .map_err(|e| CollectorError::from_reqwest(Provider::Azure, &e))?;

            if !status.is_success() {
                return Err(CollectorError::from_status(Provider::Azure, status, &text));
            }

            let page: QueryResult = serde_json::from_str(&text).map_err(|e| {
                CollectorError::response(Provider::Azure, format!("invalid Cost Management response: {e}"))
            })?;
            lines.extend(map_query_rows(&page.properties, day));

            match page.properties.next_link {
                Some(next) if !next.is_empty() => url = next,
                _ => break,
            }
        }

        Ok(lines)
    }

    async fn query_sponsorship(
        &self,
        day: NaiveDate,
        cookies: &str,
        cancel: &CancellationToken,
    ) -> CollectorResult<Vec<RawCostLine>> {
        let url = format!("{}/Usage/GetSubscriptionData", self.endpoints.sponsorship);
        let day_param = day.format("%Y-%m-%d").to_string();
        let request = self
            .http
            .get(&url)
            .headers(sponsorship_headers(cookies, &self.endpoints.sponsorship)?)
            .query(&[
                ("startDate", day_param.as_str()),
                ("endDate", day_param.as_str()),
                ("subscriptionGuid", self.subscription_id.as_str()),
            ]);

        let response = send(request, cancel).await?;
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let body = response
            .text()
            .await
            .map_err(|e| CollectorError::from_reqwest(Provider::Azure, &e))?;

        if !status.is_success() {
            return Err(CollectorError::from_status(Provider::Azure, status, &body));
        }

        if content_type.contains("text/html") || looks_like_html(&body) {
            return Err(session_expired());
        }

        let data: SponsorshipUsage = serde_json::from_str(&body).map_err(|e| {
            CollectorError::response(Provider::Azure, format!("invalid sponsorship response: {e}"))
        })?;

        Ok(map_sponsorship_rows(&data.table_rows, day))
    }
}

#[async_trait]
impl CostCollector for AzureCollector {
    fn provider(&self) -> Provider {
        Provider::Azure
    }

    async fn fetch_daily_costs(
        &self,
        range: &DateRange,
        cancel: &CancellationToken,
    ) -> CollectorResult<Vec<RawCostLine>> {
        let total = range.len_days();
        info!(range = %range, backend = self.backend_name(), days = total, "Collecting Azure costs");

        let mut lines = Vec::new();
        for (i, day) in range.days().enumerate() {
            if cancel.is_cancelled() {
                return Err(CollectorError::cancelled(Provider::Azure));
            }
            let day_lines = self.fetch_day(day, cancel).await?;
            debug!(day = %day, lines = day_lines.len(), "[{}/{}] Azure day collected", i + 1, total);
            lines.extend(day_lines);
        }

        info!(lines = lines.len(), "Azure collection complete");
        Ok(lines)
    }

    async fn test_connection(&self) -> CollectorResult<()> {
        let yesterday = Utc::now()
            .date_naive()
            .checked_sub_days(Days::new(1))
            .ok_or_else(|| CollectorError::request(Provider::Azure, "date out of range"))?;
        self.fetch_day(yesterday, &CancellationToken::new()).await?;
        info!(backend = self.backend_name(), "Azure connection test successful");
        Ok(())
    }
}

async fn send(request: RequestBuilder, cancel: &CancellationToken) -> CollectorResult<Response> {
    tokio::select! {
        _ = cancel.cancelled() => Err(CollectorError::cancelled(Provider::Azure)),
        response = request.send() => {
            response.map_err(|e| CollectorError::from_reqwest(Provider::Azure, &e))
        }
    }
}

fn session_expired() -> CollectorError {
    CollectorError::new(
        Provider::Azure,
        CollectorErrorKind::SessionExpired(
            "sponsorship portal returned a login page; refresh AZURE_SPONSORSHIP_COOKIES".to_string(),
        ),
    )
}

fn looks_like_html(body: &str) -> bool {
    let head: String = body.trim_start().chars().take(256).collect::<String>().to_ascii_lowercase();
    head.starts_with("<!doctype html") || head.starts_with("<html") || head.contains("login.microsoftonline.com")
}

fn snippet(body: &str) -> String {
    body.chars().take(300).collect()
}

/// Headers the portal expects from its own XHR calls
fn sponsorship_headers(cookies: &str, base: &str) -> CollectorResult<HeaderMap> {
    let value = |v: &str| {
        HeaderValue::from_str(v).map_err(|e| {
            CollectorError::request(Provider::Azure, format!("invalid header value: {e}"))
        })
    };

    let mut headers = HeaderMap::new();
    headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
    headers.insert(header::ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
    headers.insert(header::COOKIE, value(cookies)?);
    headers.insert(header::DNT, HeaderValue::from_static("1"));
    headers.insert(header::REFERER, value(&format!("{base}/Usage"))?);
    headers.insert("sec-fetch-dest", HeaderValue::from_static("empty"));
    headers.insert("sec-fetch-mode", HeaderValue::from_static("cors"));
    headers.insert("sec-fetch-site", HeaderValue::from_static("same-origin"));
    headers.insert(header::USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
    headers.insert("x-requested-with", HeaderValue::from_static("XMLHttpRequest"));
    Ok(headers)
}

fn cost_management_body(day: NaiveDate) -> Value {
    json!({
        "type": "Usage",
        "timeframe": "Custom",
        "timePeriod": {
            "from": format!("{day}T00:00:00+00:00"),
            "to": format!("{day}T23:59:59+00:00"),
        },
        "dataset": {
            "granularity": "Daily",
            "aggregation": {
                "totalCost": { "name": "PreTaxCost", "function": "Sum" }
            },
            "grouping": [
                { "type": "Dimension", "name": "ServiceName" }
            ],
        },
    })
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SponsorshipUsage {
    #[serde(rename = "TableRows", default)]
    table_rows: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct QueryResult {
    properties: QueryProperties,
}

/// `properties` of a Cost Management query result
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryProperties {
    #[serde(default)]
    pub columns: Vec<QueryColumn>,
    #[serde(default)]
    pub rows: Vec<Vec<Value>>,
    pub next_link: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryColumn {
    pub name: String,
}

/// Column positions in a query result, located by name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ColumnLayout {
    cost: usize,
    date: usize,
    service: usize,
    currency: usize,
}

impl ColumnLayout {
    /// Default order is `[cost, date, service, currency]`
    fn from_columns(columns: &[QueryColumn]) -> Self {
        let find = |names: &[&str], fallback: usize| {
            columns
                .iter()
                .position(|c| names.iter().any(|n| c.name.eq_ignore_ascii_case(n)))
                .unwrap_or(fallback)
        };
        Self {
            cost: find(&["totalCost", "PreTaxCost", "Cost"], 0),
            date: find(&["UsageDate"], 1),
            service: find(&["ServiceName"], 2),
            currency: find(&["Currency"], 3),
        }
    }
}

/// Map Cost Management rows; rows without a usable date fall back to `day`
pub fn map_query_rows(properties: &QueryProperties, day: NaiveDate) -> Vec<RawCostLine> {
    let layout = ColumnLayout::from_columns(&properties.columns);
    let mut lines = Vec::with_capacity(properties.rows.len());

    for row in &properties.rows {
        let Some(amount) = row.get(layout.cost).and_then(decimal_value) else {
            warn!(row = ?row, "Skipping Azure cost row without a numeric cost");
            continue;
        };

        lines.push(RawCostLine {
            provider: Provider::Azure,
            service: row
                .get(layout.service)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            resource: None,
            date: row.get(layout.date).and_then(usage_date).unwrap_or(day),
            amount,
            currency: row
                .get(layout.currency)
                .and_then(Value::as_str)
                .unwrap_or("USD")
                .to_string(),
        });
    }

    lines
}

/// Map sponsorship `TableRows` of `[service, resource, "$1,234.56", ...]`
pub fn map_sponsorship_rows(rows: &[Vec<Value>], day: NaiveDate) -> Vec<RawCostLine> {
    let mut lines = Vec::with_capacity(rows.len());

    for row in rows {
        if row.len() < 3 {
            warn!(row = ?row, "Skipping malformed sponsorship row");
            continue;
        }

        let service = row[0].as_str().unwrap_or_default();
        let resource = row[1].as_str().unwrap_or_default();
        let Some(amount) = parse_spend(&row[2]) else {
            warn!(service, spend = %row[2], "Skipping sponsorship row with unparseable spend");
            continue;
        };

        let mut line = RawCostLine::usd(Provider::Azure, service, day, amount);
        if !resource.trim().is_empty() {
            line = line.with_resource(resource);
        }
        lines.push(line);
    }

    lines
}

/// `"$2,354.00"` -> `2354.00`
fn parse_spend(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(s) => {
            let cleaned: String = s.chars().filter(|c| !matches!(c, '$' | ',')).collect();
            Decimal::from_str(cleaned.trim()).ok()
        }
        Value::Number(_) => decimal_value(value),
        _ => None,
    }
}

fn decimal_value(value: &Value) -> Option<Decimal> {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        _ => return None,
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}

/// `20240301`, `"20240301"` or `"2024-03-01T00:00:00"`
fn usage_date(value: &Value) -> Option<NaiveDate> {
    let text = match value {
        Value::Number(n) => n.as_u64()?.to_string(),
        Value::String(s) => s.clone(),
        _ => return None,
    };
    NaiveDate::parse_from_str(&text, "%Y%m%d")
        .ok()
        .or_else(|| NaiveDate::parse_from_str(text.get(..10)?, "%Y-%m-%d").ok())
}
