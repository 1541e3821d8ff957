//! Warehouse abstraction.
//!
//! The analytic warehouse is an external collaborator reached through
//! the [`Warehouse`] trait: two execution verbs (`dry_run`, `execute`)
//! and two metadata verbs (`list_tables`, `describe_table`). The
//! reference implementation targets the BigQuery REST API; tests use
//! [`MockWarehouse`].

mod bigquery;
mod mock;

pub use bigquery::BigQueryWarehouse;
pub use mock::MockWarehouse;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CoreResult;

/// Outcome of a warehouse dry-run.
///
/// A dry-run validates the SQL and prices it without side effects.
/// `valid == false` carries the warehouse error text; the pipeline
/// treats it as a retryable validation error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DryRun {
    pub valid: bool,
    pub total_bytes_processed: u64,
    pub estimated_cost_usd: Option<f64>,
    pub error: Option<String>,
}

impl DryRun {
    /// A passing dry-run priced from processed bytes (on-demand rate,
    /// $6.25 per TiB).
    pub fn priced(total_bytes_processed: u64) -> Self {
        let tib = total_bytes_processed as f64 / (1u64 << 40) as f64;
        Self {
            valid: true,
            total_bytes_processed,
            estimated_cost_usd: Some(tib * 6.25),
            error: None,
        }
    }

    /// A failed dry-run with the warehouse error text.
    pub fn invalid(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            total_bytes_processed: 0,
            estimated_cost_usd: None,
            error: Some(error.into()),
        }
    }
}

/// A column-oriented result set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

impl ResultSet {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// Column metadata for a warehouse table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    #[serde(default)]
    pub description: Option<String>,
}

/// Table metadata as reported by the warehouse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    pub table: String,
    pub columns: Vec<ColumnInfo>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub row_count: Option<u64>,
}

/// SQL execution and metadata contract for the analytic warehouse.
///
/// Implementations must be safe for concurrent use; the pipeline shares
/// one handle across requests.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Validate SQL and estimate bytes/cost without executing it.
    ///
    /// Warehouse-side rejection is reported through `DryRun::invalid`,
    /// not as an `Err`; errors are reserved for transport failures.
    async fn dry_run(&self, sql: &str) -> CoreResult<DryRun>;

    /// Execute SQL and return rows.
    async fn execute(&self, sql: &str) -> CoreResult<ResultSet>;

    /// List table names in a dataset.
    async fn list_tables(&self, dataset: &str) -> CoreResult<Vec<String>>;

    /// Fetch column metadata for a table.
    async fn describe_table(&self, dataset: &str, table: &str) -> CoreResult<TableSchema>;
}
