//! Database migrations
//!
//! Versioned schema for the cost store. Migrations are applied in order on
//! connection and recorded in `_migrations`.

use sqlx::SqlitePool;

/// Current schema version
pub const CURRENT_VERSION: i32 = 2;

/// SQL for creating the migrations tracking table
const CREATE_MIGRATIONS_TABLE: &str = r#"
    CREATE TABLE IF NOT EXISTS _migrations (
        version INTEGER PRIMARY KEY NOT NULL,
        applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
"#;

/// Migration 1: cost table
///
/// Costs are stored as integer ten-thousandths of a USD. Timestamps are
/// microseconds since the Unix epoch, assigned by the database.
const MIGRATION_V1: &str = r#"
    CREATE TABLE IF NOT EXISTS cloud_costs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        provider TEXT NOT NULL CHECK (provider IN ('aws', 'gcp', 'azure')),
        service_name TEXT NOT NULL,
        usage_date TEXT NOT NULL,
        cost_usd_units INTEGER NOT NULL CHECK (cost_usd_units >= 0),
        currency TEXT NOT NULL DEFAULT 'USD',
        created_at INTEGER NOT NULL
            DEFAULT (CAST((julianday('now') - 2440587.5) * 86400000000.0 AS INTEGER)),
        updated_at INTEGER NOT NULL
            DEFAULT (CAST((julianday('now') - 2440587.5) * 86400000000.0 AS INTEGER)),
        UNIQUE (provider, service_name, usage_date)
    );

    CREATE INDEX IF NOT EXISTS idx_cloud_costs_usage_date ON cloud_costs(usage_date);
    CREATE INDEX IF NOT EXISTS idx_cloud_costs_provider ON cloud_costs(provider);

    -- Any update that leaves updated_at untouched still moves it forward
    CREATE TRIGGER IF NOT EXISTS trg_cloud_costs_touch
    AFTER UPDATE ON cloud_costs
    FOR EACH ROW
    WHEN NEW.updated_at = OLD.updated_at
    BEGIN
        UPDATE cloud_costs
        SET updated_at = MAX(
            CAST((julianday('now') - 2440587.5) * 86400000000.0 AS INTEGER),
            OLD.updated_at + 1
        )
        WHERE id = NEW.id;
    END;
"#;

/// Migration 2: reporting views
const MIGRATION_V2: &str = r#"
    CREATE VIEW IF NOT EXISTS daily_provider_costs AS
    SELECT
        usage_date,
        provider,
        SUM(cost_usd_units) AS total_cost_units,
        COUNT(*) AS service_count
    FROM cloud_costs
    GROUP BY usage_date, provider;

    CREATE VIEW IF NOT EXISTS service_costs AS
    SELECT
        provider,
        service_name,
        SUM(cost_usd_units) AS total_cost_units,
        COUNT(*) AS day_count,
        MIN(usage_date) AS first_date,
        MAX(usage_date) AS last_date
    FROM cloud_costs
    GROUP BY provider, service_name;
"#;

/// Get the current schema version from the database
async fn get_current_version(pool: &SqlitePool) -> anyhow::Result<i32> {
    sqlx::raw_sql(CREATE_MIGRATIONS_TABLE).execute(pool).await?;

    let row: Option<(Option<i32>,)> = sqlx::query_as("SELECT MAX(version) FROM _migrations")
        .fetch_optional(pool)
        .await?;

    Ok(row.and_then(|(v,)| v).unwrap_or(0))
}

/// Record that a migration has been applied
async fn record_migration(pool: &SqlitePool, version: i32) -> anyhow::Result<()> {
    sqlx::query("INSERT INTO _migrations (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;
    Ok(())
}

/// Run all pending migrations
pub async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    let current_version = get_current_version(pool).await?;

    tracing::info!(
        current_version = current_version,
        target_version = CURRENT_VERSION,
        "Checking database migrations"
    );

    if current_version >= CURRENT_VERSION {
        tracing::debug!("Database is up to date");
        return Ok(());
    }

    if current_version < 1 {
        tracing::info!("Applying migration v1: cloud_costs table");
        sqlx::raw_sql(MIGRATION_V1).execute(pool).await?;
        record_migration(pool, 1).await?;
    }

    if current_version < 2 {
        tracing::info!("Applying migration v2: reporting views");
        sqlx::raw_sql(MIGRATION_V2).execute(pool).await?;
        record_migration(pool, 2).await?;
    }

    tracing::info!("Database migrations completed");
    Ok(())
}

/// Get migration status information
pub async fn migration_status(pool: &SqlitePool) -> anyhow::Result<MigrationStatus> {
    let current_version = get_current_version(pool).await?;
    Ok(MigrationStatus {
        current_version,
        target_version: CURRENT_VERSION,
        needs_migration: current_version < CURRENT_VERSION,
    })
}

/// Migration status information
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    /// Current schema version in the database
    pub current_version: i32,
    /// Target schema version (latest)
    pub target_version: i32,
    /// Whether migrations need to be run
    pub needs_migration: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn create_test_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create test pool")
    }

    #[tokio::test]
    async fn test_run_migrations() {
        let pool = create_test_pool().await;

        let status = migration_status(&pool).await.unwrap();
        assert_eq!(status.current_version, 0);
        assert!(status.needs_migration);

        run_migrations(&pool).await.unwrap();

        let status = migration_status(&pool).await.unwrap();
        assert_eq!(status.current_version, CURRENT_VERSION);
        assert!(!status.needs_migration);
    }

    #[tokio::test]
    async fn test_migrations_idempotent() {
        let pool = create_test_pool().await;

        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let status = migration_status(&pool).await.unwrap();
        assert_eq!(status.current_version, CURRENT_VERSION);
    }

    #[tokio::test]
    async fn test_schema_objects_created() {
        let pool = create_test_pool().await;
        run_migrations(&pool).await.unwrap();

        for relation in ["cloud_costs", "daily_provider_costs", "service_costs"] {
            let result: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {}", relation))
                .fetch_one(&pool)
                .await
                .unwrap_or_else(|_| panic!("{} should exist", relation));
            assert_eq!(result.0, 0, "{} should be empty", relation);
        }
    }

    #[tokio::test]
    async fn test_unique_key_and_provider_check() {
        let pool = create_test_pool().await;
        run_migrations(&pool).await.unwrap();

        let insert = "INSERT INTO cloud_costs (provider, service_name, usage_date, cost_usd_units) \
                      VALUES (?, ?, ?, ?)";

        sqlx::query(insert)
            .bind("aws")
            .bind("Amazon EC2")
            .bind("2024-03-01")
            .bind(125_000_i64)
            .execute(&pool)
            .await
            .unwrap();

        let duplicate = sqlx::query(insert)
            .bind("aws")
            .bind("Amazon EC2")
            .bind("2024-03-01")
            .bind(1_i64)
            .execute(&pool)
            .await;
        assert!(duplicate.is_err(), "duplicate key must be rejected");

        let bad_provider = sqlx::query(insert)
            .bind("oracle")
            .bind("Compute")
            .bind("2024-03-01")
            .bind(1_i64)
            .execute(&pool)
            .await;
        assert!(bad_provider.is_err(), "unknown provider must be rejected");
    }

    #[tokio::test]
    async fn test_trigger_moves_updated_at_forward() {
        let pool = create_test_pool().await;
        run_migrations(&pool).await.unwrap();

        sqlx::query(
            "INSERT INTO cloud_costs (provider, service_name, usage_date, cost_usd_units) \
             VALUES ('gcp', 'BigQuery', '2024-03-01', 30000)",
        )
        .execute(&pool)
        .await
        .unwrap();

        let (created, before): (i64, i64) =
            sqlx::query_as("SELECT created_at, updated_at FROM cloud_costs")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(created, before);

        sqlx::query("UPDATE cloud_costs SET cost_usd_units = 40000")
            .execute(&pool)
            .await
            .unwrap();

        let (after,): (i64,) = sqlx::query_as("SELECT updated_at FROM cloud_costs")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert!(after > before);
    }
}
