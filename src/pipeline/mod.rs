//! Question-to-result orchestration.
//!
//! The engine wires the resolver, catalog, prompt builder, LLM client,
//! repair passes and validator into one request path:
//!
//! ```text
//! question -> cache? -> resolve -> schemas -> prompt -> LLM -> repair
//!          -> dry-run (retry on validation error) -> execute -> format
//! ```
//!
//! Every request is independent; the engine is shared behind `Arc` and
//! all mutable state lives in the cache and the active-dataset lock.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, QueryCache};
use crate::catalog::SchemaCatalog;
use crate::config::Settings;
use crate::embedding::Embedder;
use crate::error::CoreResult;
use crate::format::format_results;
use crate::knowledge::KnowledgeBase;
use crate::llm::{parse_response, LlmClient, LlmOutput};
use crate::prompt::{ConversationTurn, PromptBuilder};
use crate::repair::{repair, RepairContext};
use crate::resolver::{KnowledgeResolver, QueryType, ResolveOptions, ResolvedContext};
use crate::validate::Validator;
use crate::vector::VectorStore;
use crate::warehouse::{ColumnInfo, TableSchema, Warehouse};

/// Shared service handles the engine is assembled from.
pub struct Services {
    pub settings: Arc<Settings>,
    pub cache: Arc<QueryCache>,
    pub warehouse: Arc<dyn Warehouse>,
    pub llm: Arc<dyn LlmClient>,
    pub embedder: Arc<dyn Embedder>,
    pub vectors: Arc<VectorStore>,
    pub knowledge: Arc<KnowledgeBase>,
}

/// The generated statement plus everything needed to explain and
/// format it. This is what the SQL cache stores.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SqlArtifact {
    pub question: String,
    /// `None` when the question was judged unanswerable.
    pub sql: Option<String>,
    pub tables_used: Vec<String>,
    pub project: String,
    pub dataset: String,
    pub explanation: Option<String>,
    pub error: Option<String>,
    /// Metric code to display hint, applied by the formatter.
    pub formatting_hints: HashMap<String, String>,
    pub dynamic_examples_used: usize,
    pub confidence: f64,
    pub query_type: Option<QueryType>,
    pub total_bytes_processed: Option<u64>,
    pub estimated_cost_usd: Option<f64>,
    #[serde(skip)]
    pub from_cache: bool,
}

impl SqlArtifact {
    pub fn is_answerable(&self) -> bool {
        self.sql.is_some() && self.error.is_none()
    }
}

/// Outcome of executing an artifact, with formatted rows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub row_count: usize,
    pub total_bytes_processed: u64,
    pub estimated_cost_usd: f64,
    pub error: Option<String>,
    pub error_type: Option<String>,
}

/// The question-answering engine.
pub struct Engine {
    services: Services,
    resolver: KnowledgeResolver,
    active_dataset: RwLock<String>,
}

impl Engine {
    pub fn new(services: Services) -> Self {
        let resolver = KnowledgeResolver::new(
            services.knowledge.clone(),
            services.vectors.clone(),
            services.embedder.clone(),
            services.settings.knowledge.clone(),
        );
        let active_dataset = RwLock::new(services.settings.dataset.clone());
        Self {
            services,
            resolver,
            active_dataset,
        }
    }

    pub async fn active_dataset(&self) -> String {
        self.active_dataset.read().await.clone()
    }

    /// Switch the active dataset, invalidating everything cached for
    /// the previous one.
    pub async fn switch_dataset(&self, dataset: &str) -> CoreResult<()> {
        let mut active = self.active_dataset.write().await;
        if *active == dataset {
            return Ok(());
        }
        let previous = active.clone();
        *active = dataset.to_string();
        drop(active);

        for prefix in CacheKey::dataset_prefixes(&previous) {
            if let Err(e) = self.services.cache.delete_prefix(&prefix) {
                warn!(prefix = %prefix, error = %e, "cache invalidation failed");
            }
        }
        info!(from = %previous, to = dataset, "active dataset switched");
        Ok(())
    }

    /// Settings with the active dataset substituted in.
    async fn effective_settings(&self) -> Settings {
        let mut settings = (*self.services.settings).clone();
        settings.dataset = self.active_dataset.read().await.clone();
        settings
    }

    /// Generate SQL for a question without executing it.
    pub async fn generate_sql(
        &self,
        question: &str,
        conversation: &[ConversationTurn],
    ) -> CoreResult<SqlArtifact> {
        let settings = self.effective_settings().await;
        let cache_key = CacheKey::sql(&settings.dataset, question);

        if settings.cache.enabled {
            if let Some(artifact) = self.cached_artifact(&cache_key, &settings) {
                return Ok(artifact);
            }
        }

        let artifact = self
            .generate_uncached(question, conversation, &settings)
            .await?;

        if settings.cache.enabled && artifact.is_answerable() {
            if let Err(e) = self
                .services
                .cache
                .set(&cache_key, &artifact, settings.cache.ttl_sql_secs)
            {
                warn!(error = %e, "artifact cache write failed");
            }
        }
        Ok(artifact)
    }

    /// Generate SQL and, when it validates, execute and format it.
    pub async fn generate_and_execute(
        &self,
        question: &str,
        conversation: &[ConversationTurn],
    ) -> CoreResult<(SqlArtifact, Option<ExecutionResult>)> {
        let artifact = self.generate_sql(question, conversation).await?;
        if !artifact.is_answerable() {
            return Ok((artifact, None));
        }

        let result = self.execute_artifact(&artifact).await;
        Ok((artifact, Some(result)))
    }

    async fn execute_artifact(&self, artifact: &SqlArtifact) -> ExecutionResult {
        let settings = self.services.settings.clone();
        let sql = artifact.sql.as_deref().unwrap_or_default();

        let result_key = CacheKey::result(sql);
        let use_result_cache = settings.cache.enabled && settings.cache.result_cache_enabled;
        if use_result_cache {
            if let Ok(Some(cached)) = self.services.cache.get::<ExecutionResult>(&result_key) {
                debug!("result cache hit");
                return cached;
            }
        }

        let raw = match self.services.warehouse.execute(sql).await {
            Ok(rs) => rs,
            Err(e) => {
                return ExecutionResult {
                    success: false,
                    error: Some(e.to_string()),
                    error_type: Some(e.error_type().to_string()),
                    ..Default::default()
                };
            }
        };

        let formatted = format_results(&raw, &artifact.formatting_hints);
        let result = ExecutionResult {
            success: true,
            row_count: formatted.rows.len(),
            columns: formatted.columns,
            rows: formatted.rows,
            total_bytes_processed: artifact.total_bytes_processed.unwrap_or(0),
            estimated_cost_usd: artifact.estimated_cost_usd.unwrap_or(0.0),
            error: None,
            error_type: None,
        };

        if use_result_cache {
            if let Err(e) = self
                .services
                .cache
                .set(&result_key, &result, settings.cache.ttl_result_secs)
            {
                warn!(error = %e, "result cache write failed");
            }
        }
        result
    }

    fn cached_artifact(&self, key: &str, settings: &Settings) -> Option<SqlArtifact> {
        let mut artifact = match self.services.cache.get::<SqlArtifact>(key) {
            Ok(Some(a)) => a,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "artifact cache read failed");
                return None;
            }
        };
        artifact.from_cache = true;

        // A question seen often enough is promoted to the hot TTL.
        match self.services.cache.record_hit(key) {
            Ok(hits) if hits >= settings.cache.hot_threshold => {
                if let Err(e) = self
                    .services
                    .cache
                    .extend_ttl(key, settings.cache.ttl_sql_hot_secs)
                {
                    warn!(error = %e, "hot promotion failed");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "hit recording failed"),
        }

        debug!(key = %key, "sql cache hit");
        Some(artifact)
    }

    async fn generate_uncached(
        &self,
        question: &str,
        conversation: &[ConversationTurn],
        settings: &Settings,
    ) -> CoreResult<SqlArtifact> {
        let request_id = uuid::Uuid::new_v4();
        debug!(%request_id, question, "generating sql");

        let settings_arc = Arc::new(settings.clone());
        let catalog = SchemaCatalog::new(
            self.services.warehouse.clone(),
            self.services.cache.clone(),
            settings.clone(),
        );
        let validator = Validator::new(
            self.services.warehouse.clone(),
            self.services.cache.clone(),
            settings_arc,
        );

        let options = ResolveOptions {
            project: Some(settings.project.clone()),
            dataset: Some(settings.dataset.clone()),
            dialect: settings.dialect.clone(),
        };
        let context = self.resolver.resolve(question, &options).await;

        let tables = catalog.relevant_tables(&settings.dataset, question).await?;
        let fetched = futures::future::join_all(
            tables.iter().map(|t| catalog.schema(&settings.dataset, t)),
        )
        .await;
        let mut schemas: Vec<(String, TableSchema, Vec<ColumnInfo>)> = Vec::new();
        for (table, fetch) in tables.iter().zip(fetched) {
            match fetch {
                Ok(schema) => {
                    let columns: Vec<ColumnInfo> = catalog
                        .score_columns(&schema, question)
                        .into_iter()
                        .cloned()
                        .collect();
                    schemas.push((table.clone(), schema, columns));
                }
                Err(e) => warn!(table = %table, error = %e, "schema fetch failed"),
            }
        }

        let date_range = validator.date_range().await;
        let repair_ctx = RepairContext {
            project: settings.project.clone(),
            dataset: settings.dataset.clone(),
            allow_list: catalog.allow_list(&settings.dataset).await?,
            default_table: settings.default_table.clone(),
            identifier_columns: settings.identifier_columns.clone(),
            canonical_date_column: settings.canonical_date_column.clone(),
            date_range: date_range.clone(),
            result_limit: settings.result_limit_default,
        };

        let build_prompt = |previous: Option<(&str, &str)>| {
            let mut builder = PromptBuilder::new(settings, question, &context)
                .with_conversation(conversation)
                .with_date_range(date_range.as_ref());
            for (table, schema, columns) in &schemas {
                builder = builder.with_schema(table, schema.clone(), columns.clone());
            }
            if let Some((sql, error)) = previous {
                builder = builder.with_repair(sql, error);
            }
            builder.build()
        };

        let prompt = build_prompt(None);
        let raw = self.services.llm.complete(&prompt.system, &prompt.user).await?;
        let mut output = parse_response(&raw);
        let mut outcome = repair(
            output.sql.as_deref(),
            output.explanation.as_deref().unwrap_or(""),
            &repair_ctx,
        );

        let mut artifact = self.base_artifact(question, settings, &context);

        // Dry-run with LLM-assisted retries on validation errors only.
        let mut attempts = 0u32;
        let verdict = loop {
            let Some(sql) = outcome.sql.clone() else {
                let reason = outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| "data not available".to_string());
                artifact.error = Some(format!(
                    "{}. Available tables: {}",
                    reason,
                    repair_ctx.allow_list.join(", ")
                ));
                artifact.explanation = output.explanation.clone();
                return Ok(artifact);
            };

            let verdict = validator.dry_run(&sql).await?;
            if verdict.valid {
                artifact.sql = Some(sql);
                break verdict;
            }
            let error = verdict.error.clone().unwrap_or_default();
            if attempts >= settings.max_retries {
                warn!(attempts, error = %error, "validation retries exhausted");
                artifact.sql = Some(sql);
                artifact.error = Some(error);
                return Ok(artifact);
            }
            attempts += 1;
            debug!(attempt = attempts, error = %error, "re-prompting after validation failure");

            let retry_prompt = build_prompt(Some((&sql, &error)));
            let raw = self
                .services
                .llm
                .complete(&retry_prompt.system, &retry_prompt.user)
                .await?;
            output = parse_response(&raw);
            outcome = repair(
                output.sql.as_deref(),
                output.explanation.as_deref().unwrap_or(""),
                &repair_ctx,
            );
        };

        artifact.tables_used = resolve_tables_used(&output, artifact.sql.as_deref());
        artifact.explanation = output.explanation.clone();
        artifact.total_bytes_processed = Some(verdict.total_bytes_processed);
        artifact.estimated_cost_usd = verdict.estimated_cost_usd;
        info!(
            %request_id,
            question,
            attempts,
            cost_usd = verdict.estimated_cost_usd.unwrap_or(0.0),
            "sql generated"
        );
        Ok(artifact)
    }

    fn base_artifact(
        &self,
        question: &str,
        settings: &Settings,
        context: &ResolvedContext,
    ) -> SqlArtifact {
        SqlArtifact {
            question: question.to_string(),
            project: settings.project.clone(),
            dataset: settings.dataset.clone(),
            formatting_hints: context.formatting_hints.clone(),
            dynamic_examples_used: context.similar_examples.len(),
            confidence: context.confidence(),
            query_type: context.query_type,
            ..Default::default()
        }
    }
}

/// Tables the statement touches: the model's (normalised) claim when
/// present, otherwise the backticked references in the SQL itself.
fn resolve_tables_used(output: &LlmOutput, sql: Option<&str>) -> Vec<String> {
    let claimed = output.normalized_tables();
    if !claimed.is_empty() {
        return claimed;
    }
    let Some(sql) = sql else { return Vec::new() };

    static REF: once_cell::sync::Lazy<regex::Regex> = once_cell::sync::Lazy::new(|| {
        regex::Regex::new(r"`[\w-]+\.[\w-]+\.([\w-]+)`").unwrap()
    });
    let mut tables = Vec::new();
    for caps in REF.captures_iter(sql) {
        let name = caps[1].to_string();
        if !tables.contains(&name) {
            tables.push(name);
        }
    }
    tables
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tables_extracted_from_sql_when_model_is_silent() {
        let output = LlmOutput::default();
        let tables = resolve_tables_used(
            &output,
            Some("SELECT * FROM `p.d.orders` JOIN `p.d.orders` USING (id)"),
        );
        assert_eq!(tables, vec!["orders".to_string()]);
    }

    #[test]
    fn test_artifact_answerable() {
        let mut artifact = SqlArtifact::default();
        assert!(!artifact.is_answerable());
        artifact.sql = Some("SELECT 1".to_string());
        assert!(artifact.is_answerable());
        artifact.error = Some("boom".to_string());
        assert!(!artifact.is_answerable());
    }
}
