//! In-memory warehouse for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{ColumnInfo, DryRun, ResultSet, TableSchema, Warehouse};
use crate::error::{CoreError, CoreResult};

/// Scripted warehouse used by unit and integration tests.
///
/// Tables and schemas are registered up front; dry-run failures can be
/// queued to exercise the repair-retry loop. Call counters let tests
/// assert how often the warehouse was touched.
#[derive(Default)]
pub struct MockWarehouse {
    tables: Mutex<HashMap<String, TableSchema>>,
    queued_dry_run_errors: Mutex<Vec<String>>,
    result: Mutex<Option<ResultSet>>,
    execute_error: Mutex<Option<String>>,
    pub dry_run_calls: AtomicUsize,
    pub execute_calls: AtomicUsize,
}

impl MockWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table with typed columns: `(name, type, nullable)`.
    pub fn add_table(&self, table: &str, columns: &[(&str, &str, bool)]) {
        let schema = TableSchema {
            table: table.to_string(),
            columns: columns
                .iter()
                .map(|(name, ty, nullable)| ColumnInfo {
                    name: name.to_string(),
                    data_type: ty.to_string(),
                    nullable: *nullable,
                    description: None,
                })
                .collect(),
            description: None,
            row_count: Some(1_000),
        };
        self.tables
            .lock()
            .unwrap()
            .insert(table.to_string(), schema);
    }

    /// Queue a dry-run rejection; consumed in FIFO order before
    /// dry-runs start succeeding.
    pub fn queue_dry_run_error(&self, message: &str) {
        self.queued_dry_run_errors
            .lock()
            .unwrap()
            .push(message.to_string());
    }

    /// Set the result returned by `execute`.
    pub fn set_result(&self, columns: &[&str], rows: Vec<Vec<serde_json::Value>>) {
        *self.result.lock().unwrap() = Some(ResultSet {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
        });
    }

    /// Make `execute` fail with an execution error.
    pub fn set_execute_error(&self, message: &str) {
        *self.execute_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn dry_runs(&self) -> usize {
        self.dry_run_calls.load(Ordering::SeqCst)
    }

    pub fn executions(&self) -> usize {
        self.execute_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Warehouse for MockWarehouse {
    async fn dry_run(&self, _sql: &str) -> CoreResult<DryRun> {
        self.dry_run_calls.fetch_add(1, Ordering::SeqCst);
        let mut queued = self.queued_dry_run_errors.lock().unwrap();
        if queued.is_empty() {
            Ok(DryRun::priced(512 * 1024 * 1024))
        } else {
            Ok(DryRun::invalid(queued.remove(0)))
        }
    }

    async fn execute(&self, _sql: &str) -> CoreResult<ResultSet> {
        self.execute_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.execute_error.lock().unwrap().clone() {
            return Err(CoreError::Execution(message));
        }
        Ok(self.result.lock().unwrap().clone().unwrap_or_default())
    }

    async fn list_tables(&self, _dataset: &str) -> CoreResult<Vec<String>> {
        let mut names: Vec<String> = self.tables.lock().unwrap().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn describe_table(&self, _dataset: &str, table: &str) -> CoreResult<TableSchema> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .cloned()
            .ok_or_else(|| CoreError::Execution(format!("table not found: {}", table)))
    }
}
