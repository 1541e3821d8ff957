//! SQL validation against the warehouse.
//!
//! Two layers: a local statement-kind guard using `sqlparser`, then a
//! warehouse dry run for schema and syntax errors the local parse can't
//! see. Dry-run verdicts are cached by SQL hash so the retry loop never
//! re-validates an unchanged statement.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlparser::ast::Statement;
use sqlparser::dialect::BigQueryDialect;
use sqlparser::parser::Parser;
use tracing::{debug, warn};

use crate::cache::{CacheKey, QueryCache};
use crate::config::Settings;
use crate::error::CoreResult;
use crate::warehouse::{DryRun, Warehouse};

/// Observed date span of the canonical fact table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DateRange {
    /// Earliest date, `YYYY-MM-DD`.
    pub min: String,
    /// Latest date, `YYYY-MM-DD`.
    pub max: String,
}

impl DateRange {
    /// Year of the latest row, when the max date parses.
    pub fn latest_year(&self) -> Option<i32> {
        self.max.get(0..4)?.parse().ok()
    }
}

/// Validates generated SQL before execution.
pub struct Validator {
    warehouse: Arc<dyn Warehouse>,
    cache: Arc<QueryCache>,
    settings: Arc<Settings>,
}

impl Validator {
    pub fn new(
        warehouse: Arc<dyn Warehouse>,
        cache: Arc<QueryCache>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            warehouse,
            cache,
            settings,
        }
    }

    /// Validate a statement with a cached warehouse dry run.
    ///
    /// Returns `Ok(DryRun)` whether or not the statement is valid; the
    /// verdict lives in `DryRun::valid`. `Err` is reserved for transport
    /// failures reaching the warehouse.
    pub async fn dry_run(&self, sql: &str) -> CoreResult<DryRun> {
        // Non-SELECT statements never reach the warehouse.
        if let Some(reason) = Self::reject_statement_kind(sql) {
            return Ok(DryRun::invalid(&reason));
        }

        let key = CacheKey::dryrun(sql);
        if self.settings.cache.enabled {
            match self.cache.get::<DryRun>(&key) {
                Ok(Some(cached)) => {
                    debug!(key = %key, "dry-run cache hit");
                    return Ok(cached);
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "dry-run cache read failed"),
            }
        }

        let verdict = self.warehouse.dry_run(sql).await?;
        if self.settings.cache.enabled {
            if let Err(e) = self
                .cache
                .set(&key, &verdict, self.settings.cache.ttl_dryrun_secs)
            {
                warn!(error = %e, "dry-run cache write failed");
            }
        }
        Ok(verdict)
    }

    /// Probe the canonical table for its date span, cached per dataset.
    ///
    /// Returns `None` when the probe fails; callers fall back to
    /// relative date expressions.
    pub async fn date_range(&self) -> Option<DateRange> {
        let dataset = &self.settings.dataset;
        let key = CacheKey::daterange(dataset);
        if self.settings.cache.enabled {
            if let Ok(Some(cached)) = self.cache.get::<DateRange>(&key) {
                return Some(cached);
            }
        }

        let table = &self.settings.canonical_table;
        let column = &self.settings.canonical_date_column;
        let sql = format!(
            "SELECT CAST(MIN({col}) AS STRING) AS min_date, CAST(MAX({col}) AS STRING) AS max_date FROM `{}.{}.{}`",
            self.settings.project,
            dataset,
            table,
            col = column,
        );

        let result = match self.warehouse.execute(&sql).await {
            Ok(rs) => rs,
            Err(e) => {
                warn!(error = %e, table = %table, "date-range probe failed");
                return None;
            }
        };

        let row = result.rows.first()?;
        let min = row.first()?.as_str()?.to_string();
        let max = row.get(1)?.as_str()?.to_string();
        let range = DateRange { min, max };

        if self.settings.cache.enabled {
            if let Err(e) = self
                .cache
                .set(&key, &range, self.settings.cache.ttl_daterange_secs)
            {
                warn!(error = %e, "date-range cache write failed");
            }
        }
        Some(range)
    }

    /// Local guard: reject statements that are parseable but not a
    /// query. A statement that fails to parse locally falls through to
    /// the warehouse, whose errors are more precise.
    fn reject_statement_kind(sql: &str) -> Option<String> {
        let statements = Parser::parse_sql(&BigQueryDialect {}, sql).ok()?;
        if statements.len() != 1 {
            return Some("expected exactly one SQL statement".to_string());
        }
        match &statements[0] {
            Statement::Query(_) => None,
            other => Some(format!(
                "only SELECT statements are allowed, got {}",
                statement_kind(other)
            )),
        }
    }
}

fn statement_kind(statement: &Statement) -> &'static str {
    match statement {
        Statement::Insert { .. } => "INSERT",
        Statement::Update { .. } => "UPDATE",
        Statement::Delete { .. } => "DELETE",
        Statement::Drop { .. } => "DROP",
        Statement::Truncate { .. } => "TRUNCATE",
        Statement::CreateTable { .. } => "CREATE TABLE",
        Statement::Merge { .. } => "MERGE",
        _ => "a non-SELECT statement",
    }
}
