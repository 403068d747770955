//! Storage layer - SQLite cost store
//!
//! # Architecture
//!
//! - `database`: Connection pool management and initialization
//! - `migrations`: Schema versioning and automatic migration
//! - `costs`: Batched upsert writer and report queries over `cloud_costs`
//!
//! # Usage
//!
//! ```ignore
//! use cloudcost_core::storage::{CostWriter, Database, SqliteCostStore};
//!
//! let db = Database::in_memory().await?;
//! let store = SqliteCostStore::from_database(&db);
//! store.write(&records).await?;
//! ```

pub mod costs;
pub mod database;
pub mod migrations;

pub use costs::{CostWriter, DailyProviderCost, ServiceCost, SqliteCostStore, StoredCost};
pub use database::{Database, DatabaseConfig};
pub use migrations::{migration_status, run_migrations, MigrationStatus, CURRENT_VERSION};
