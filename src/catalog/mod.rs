//! Schema catalog.
//!
//! Caching view over the warehouse metadata verbs: allow-list filtered
//! table listing, per-table schemas with a 24-hour TTL, keyword routing
//! from question to tables, and column-relevance scoring that keeps
//! prompts small.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::cache::{CacheKey, QueryCache};
use crate::config::Settings;
use crate::error::CoreResult;
use crate::warehouse::{ColumnInfo, TableSchema, Warehouse};

/// Column-name groups that score +5 when a question token belongs to the
/// same group as the column. Mirrors how analysts phrase questions:
/// "sales" should pull in `Gross_Revenue` even without a direct match.
const SEMANTIC_GROUPS: &[&[&str]] = &[
    &["sales", "revenue", "amount", "billing"],
    &["margin", "profit", "cost", "cogs", "expense"],
    &["customer", "party", "client", "distributor"],
    &["product", "material", "item", "sku"],
    &["date", "period", "month", "year", "quarter"],
];

/// Column names useful in almost any query; scored +2.
const ALWAYS_USEFUL: &[&str] = &["id", "name", "date", "number", "key"];

/// Caching schema catalog over a warehouse handle.
pub struct SchemaCatalog {
    warehouse: Arc<dyn Warehouse>,
    cache: Arc<QueryCache>,
    settings: Settings,
}

impl SchemaCatalog {
    pub fn new(warehouse: Arc<dyn Warehouse>, cache: Arc<QueryCache>, settings: Settings) -> Self {
        Self {
            warehouse,
            cache,
            settings,
        }
    }

    /// Tables in the active dataset, filtered by the allow-list. An
    /// empty allow-list means every warehouse table is permitted.
    pub async fn list_tables(&self, dataset: &str) -> CoreResult<Vec<String>> {
        let mut tables = self.warehouse.list_tables(dataset).await?;
        if !self.settings.allowed_tables.is_empty() {
            let allowed: HashSet<&String> = self.settings.allowed_tables.iter().collect();
            tables.retain(|t| allowed.contains(t));
        }
        Ok(tables)
    }

    /// Effective allow-list: the configured one, or everything the
    /// warehouse reports when none is configured.
    pub async fn allow_list(&self, dataset: &str) -> CoreResult<Vec<String>> {
        if self.settings.allowed_tables.is_empty() {
            self.warehouse.list_tables(dataset).await
        } else {
            Ok(self.settings.allowed_tables.clone())
        }
    }

    /// Table schema, cached per `(dataset, table)`.
    pub async fn schema(&self, dataset: &str, table: &str) -> CoreResult<TableSchema> {
        let key = CacheKey::schema(dataset, table);
        if self.settings.cache.enabled {
            match self.cache.get::<TableSchema>(&key) {
                Ok(Some(schema)) => {
                    debug!(table, "schema cache hit");
                    return Ok(schema);
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "schema cache read failed"),
            }
        }

        let schema = self.warehouse.describe_table(dataset, table).await?;

        if self.settings.cache.enabled {
            if let Err(e) = self
                .cache
                .set(&key, &schema, self.settings.cache.ttl_schema_secs)
            {
                warn!(error = %e, "schema cache write failed");
            }
        }
        Ok(schema)
    }

    /// Tables likely relevant to a question.
    ///
    /// Keyword rules are checked in configured order; with no match the
    /// default table is returned. Results never leave the allow-list and
    /// are capped at `max_relevant_tables`.
    pub async fn relevant_tables(&self, dataset: &str, question: &str) -> CoreResult<Vec<String>> {
        let question = question.to_lowercase();
        let allowed = self.allow_list(dataset).await?;
        let mut selected: Vec<String> = Vec::new();

        for rule in &self.settings.catalog.table_keywords {
            if rule.keywords.iter().any(|kw| question.contains(kw.as_str()))
                && allowed.contains(&rule.table)
                && !selected.contains(&rule.table)
            {
                selected.push(rule.table.clone());
            }
        }

        if selected.is_empty() && allowed.contains(&self.settings.default_table) {
            selected.push(self.settings.default_table.clone());
        }
        if selected.is_empty() {
            // Even the default table is outside the allow-list; fall back
            // to whatever is permitted.
            selected.extend(allowed.iter().take(1).cloned());
        }

        selected.truncate(self.settings.catalog.max_relevant_tables);
        debug!(?selected, "relevant tables");
        Ok(selected)
    }

    /// Columns of a table worth showing in the prompt for a question.
    ///
    /// Additive scores: +10 direct substring match against a question
    /// token, +5 same semantic group, +2 always-useful names. The top
    /// `max_columns_per_table` scored columns are kept; when nothing
    /// scores, every column is returned.
    pub fn score_columns<'a>(
        &self,
        schema: &'a TableSchema,
        question: &str,
    ) -> Vec<&'a ColumnInfo> {
        let tokens: Vec<String> = question
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() > 2)
            .map(|t| t.to_string())
            .collect();

        let mut scored: Vec<(i32, &ColumnInfo)> = schema
            .columns
            .iter()
            .map(|col| (score_column(&col.name, &tokens), col))
            .collect();

        if scored.iter().all(|(score, _)| *score == 0) {
            return schema.columns.iter().collect();
        }

        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored
            .into_iter()
            .filter(|(score, _)| *score > 0)
            .take(self.settings.catalog.max_columns_per_table)
            .map(|(_, col)| col)
            .collect()
    }
}

fn score_column(name: &str, tokens: &[String]) -> i32 {
    let lower = name.to_lowercase();
    let mut score = 0;

    for token in tokens {
        if lower.contains(token.as_str()) {
            score += 10;
        }
    }

    for group in SEMANTIC_GROUPS {
        let column_in_group = group.iter().any(|g| lower.contains(g));
        let token_in_group = tokens
            .iter()
            .any(|t| group.iter().any(|g| t.contains(g) || g.contains(t.as_str())));
        if column_in_group && token_in_group {
            score += 5;
        }
    }

    if ALWAYS_USEFUL.iter().any(|u| lower.contains(u)) {
        score += 2;
    }

    score
}
