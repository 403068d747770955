//! Persistent storage for canonical cost records
//!
//! Rows are keyed by `(provider, service_name, usage_date)`. Writes are batched
//! into one transaction and upserted, so re-running a day replaces its costs
//! instead of duplicating them.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

use super::database::Database;
use crate::cost::normalizer::COST_SCALE;
use crate::cost::{CostRecord, DateRange, Provider};
use crate::error::{Error, Result};

const UPSERT_COST_SQL: &str = r#"
    INSERT INTO cloud_costs (
        provider, service_name, usage_date, cost_usd_units, currency, created_at, updated_at
    ) VALUES (
        ?, ?, ?, ?, ?,
        CAST((julianday('now') - 2440587.5) * 86400000000.0 AS INTEGER),
        CAST((julianday('now') - 2440587.5) * 86400000000.0 AS INTEGER)
    )
    ON CONFLICT(provider, service_name, usage_date) DO UPDATE SET
        cost_usd_units = excluded.cost_usd_units,
        currency = excluded.currency,
        updated_at = MAX(excluded.updated_at, cloud_costs.updated_at + 1)
"#;

/// Sink for a run's canonical records
#[async_trait]
pub trait CostWriter: Send + Sync {
    /// Upsert every record in one transaction; returns the number of rows written.
    ///
    /// Either all records are persisted or none are.
    async fn write(&self, records: &[CostRecord]) -> Result<u64>;
}

/// A stored cost row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredCost {
    pub provider: Provider,
    pub service: String,
    pub date: NaiveDate,
    pub cost: Decimal,
    pub currency: String,
    /// Microseconds since the Unix epoch
    pub created_at: i64,
    pub updated_at: i64,
}

/// Row of the `daily_provider_costs` view
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyProviderCost {
    pub date: NaiveDate,
    pub provider: Provider,
    pub total_cost: Decimal,
    pub service_count: i64,
}

/// Row of the `service_costs` view
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceCost {
    pub provider: Provider,
    pub service: String,
    pub total_cost: Decimal,
    pub day_count: i64,
    pub first_date: NaiveDate,
    pub last_date: NaiveDate,
}

/// SQLite-backed cost store
#[derive(Debug, Clone)]
pub struct SqliteCostStore {
    pool: SqlitePool,
}

impl SqliteCostStore {
    /// Create a new store from an existing connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn from_database(db: &Database) -> Self {
        Self::new(db.pool().clone())
    }

    /// Look up a single row by key
    pub async fn get(
        &self,
        provider: Provider,
        service: &str,
        date: NaiveDate,
    ) -> Result<Option<StoredCost>> {
        let row = sqlx::query(
            r#"
            SELECT provider, service_name, usage_date, cost_usd_units, currency, created_at, updated_at
            FROM cloud_costs
            WHERE provider = ? AND service_name = ? AND usage_date = ?
            "#,
        )
        .bind(provider.as_str())
        .bind(service)
        .bind(date.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        row.map(|r| stored_cost_from_row(&r)).transpose()
    }

    /// All rows whose usage date lies in `range`, ordered by date, provider, service
    pub async fn list(&self, range: &DateRange) -> Result<Vec<StoredCost>> {
        let rows = sqlx::query(
            r#"
            SELECT provider, service_name, usage_date, cost_usd_units, currency, created_at, updated_at
            FROM cloud_costs
            WHERE usage_date >= ? AND usage_date <= ?
            ORDER BY usage_date, provider, service_name
            "#,
        )
        .bind(range.start().to_string())
        .bind(range.end().to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        let costs = rows
            .iter()
            .map(stored_cost_from_row)
            .collect::<Result<Vec<_>>>()?;

        debug!(range = %range, count = costs.len(), "Loaded cost rows");
        Ok(costs)
    }

    /// Total number of stored rows
    pub async fn count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM cloud_costs")
            .fetch_one(&self.pool)
            .await
            .map_err(Error::DatabaseError)?;
        Ok(count)
    }

    /// Per-day, per-provider totals from the `daily_provider_costs` view
    pub async fn daily_totals(&self, range: Option<&DateRange>) -> Result<Vec<DailyProviderCost>> {
        let (start, end) = bounds(range);
        let rows = sqlx::query(
            r#"
            SELECT usage_date, provider, total_cost_units, service_count
            FROM daily_provider_costs
            WHERE usage_date >= ? AND usage_date <= ?
            ORDER BY usage_date, provider
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::DatabaseError)?;

        rows.iter()
            .map(|row| {
                Ok(DailyProviderCost {
                    date: date_column(row.get("usage_date"))?,
                    provider: provider_column(row.get("provider"))?,
                    total_cost: from_units(row.get("total_cost_units")),
                    service_count: row.get("service_count"),
                })
            })
            .collect()
    }

    /// Per-service totals. Without a range this reads the `service_costs` view;
    /// with one, the same aggregation is restricted to the range.
    pub async fn service_totals(&self, range: Option<&DateRange>) -> Result<Vec<ServiceCost>> {
        let rows = match range {
            None => sqlx::query(
                r#"
                SELECT provider, service_name, total_cost_units, day_count, first_date, last_date
                FROM service_costs
                ORDER BY total_cost_units DESC, provider, service_name
                "#,
            )
            .fetch_all(&self.pool)
            .await
            .map_err(Error::DatabaseError)?,
            Some(range) => sqlx::query(
                r#"
                SELECT
                    provider,
                    service_name,
                    SUM(cost_usd_units) AS total_cost_units,
                    COUNT(*) AS day_count,
                    MIN(usage_date) AS first_date,
                    MAX(usage_date) AS last_date
                FROM cloud_costs
                WHERE usage_date >= ? AND usage_date <= ?
                GROUP BY provider, service_name
                ORDER BY total_cost_units DESC, provider, service_name
                "#,
            )
            .bind(range.start().to_string())
            .bind(range.end().to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(Error::DatabaseError)?,
        };

        rows.iter()
            .map(|row| {
                Ok(ServiceCost {
                    provider: provider_column(row.get("provider"))?,
                    service: row.get("service_name"),
                    total_cost: from_units(row.get("total_cost_units")),
                    day_count: row.get("day_count"),
                    first_date: date_column(row.get("first_date"))?,
                    last_date: date_column(row.get("last_date"))?,
                })
            })
            .collect()
    }

    async fn upsert_all(&self, records: &[CostRecord]) -> std::result::Result<u64, String> {
        let mut tx = self.pool.begin().await.map_err(|e| e.to_string())?;

        for record in records {
            let units = to_units(record.cost)?;
            sqlx::query(UPSERT_COST_SQL)
                .bind(record.provider.as_str())
                .bind(&record.service)
                .bind(record.date.to_string())
                .bind(units)
                .bind(&record.currency)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    format!(
                        "{} / {} / {}: {}",
                        record.provider, record.service, record.date, e
                    )
                })?;
        }

        tx.commit().await.map_err(|e| e.to_string())?;
        Ok(records.len() as u64)
    }
}

#[async_trait]
impl CostWriter for SqliteCostStore {
    async fn write(&self, records: &[CostRecord]) -> Result<u64> {
        if records.is_empty() {
            debug!("No cost records to write");
            return Ok(0);
        }

        // Dropping the transaction on an early return rolls it back
        match self.upsert_all(records).await {
            Ok(count) => {
                info!(count = count, "Upserted cost records");
                Ok(count)
            }
            Err(e) => {
                warn!(error = %e, batch = records.len(), "Cost write rolled back");
                Err(Error::WriteError(e))
            }
        }
    }
}

/// Decimal USD to integer ten-thousandths
fn to_units(cost: Decimal) -> std::result::Result<i64, String> {
    let mut scaled = cost;
    scaled.rescale(COST_SCALE);
    i64::try_from(scaled.mantissa()).map_err(|_| format!("cost {cost} is out of range"))
}

fn from_units(units: i64) -> Decimal {
    Decimal::new(units, COST_SCALE)
}

fn bounds(range: Option<&DateRange>) -> (String, String) {
    match range {
        Some(r) => (r.start().to_string(), r.end().to_string()),
        None => ("0000-01-01".to_string(), "9999-12-31".to_string()),
    }
}

fn provider_column(value: String) -> Result<Provider> {
    Provider::from_str(&value)
}

fn date_column(value: String) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(&value, "%Y-%m-%d")
        .map_err(|e| Error::Other(format!("Invalid usage_date '{value}' in store: {e}")))
}

fn stored_cost_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<StoredCost> {
    Ok(StoredCost {
        provider: provider_column(row.get("provider"))?,
        service: row.get("service_name"),
        date: date_column(row.get("usage_date"))?,
        cost: from_units(row.get("cost_usd_units")),
        currency: row.get("currency"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
