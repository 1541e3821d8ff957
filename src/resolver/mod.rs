//! Knowledge resolver.
//!
//! Given a question, returns grounded metric definitions, applied
//! synonyms, column formatting hints and the k most similar historical
//! exemplars. Each step composes independently and a transient failure
//! in the embedding or vector layer degrades the context instead of
//! failing the request.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::KnowledgeSettings;
use crate::embedding::Embedder;
use crate::error::{CoreError, CoreResult};
use crate::knowledge::rdf::{vocab, Bindings, Pattern, Term, TriplePattern};
use crate::knowledge::{KnowledgeBase, Metric, SqlExample};
use crate::vector::{VectorStore, COLLECTION_EXAMPLES, COLLECTION_METRICS};

/// Coarse question shape, used by the confidence score and as a prompt
/// hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    Aggregation,
    Comparison,
    Trend,
    Ranking,
    Lookup,
    Unknown,
}

/// Grounding context for one question.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolvedContext {
    pub metrics: Vec<Metric>,
    /// `code -> formula_sql` for each grounded metric that has one.
    pub formulas: HashMap<String, String>,
    /// `code -> percentage | currency | number`.
    pub formatting_hints: HashMap<String, String>,
    /// `term -> canonical_term` for every synonym found in the question.
    pub synonyms_applied: HashMap<String, String>,
    pub similar_examples: Vec<SqlExample>,
    /// Question after synonym substitution.
    pub normalized_question: String,
    pub query_type: Option<QueryType>,
    /// Calculation rules from the graph, ordered by priority.
    pub business_rules: Vec<String>,
    /// Whether retrieval degraded because of a transient failure.
    pub degraded: bool,
}

impl ResolvedContext {
    /// Confidence that the context grounds the question:
    /// `0.3·I(query_type≠unknown) + 0.4·I(metrics) + 0.2·I(gl_accounts)
    /// + 0.1·I(all metrics have formula_sql)`, clipped to `[0, 1]`.
    pub fn confidence(&self) -> f64 {
        let mut score = 0.0f64;
        if matches!(self.query_type, Some(qt) if qt != QueryType::Unknown) {
            score += 0.3;
        }
        if !self.metrics.is_empty() {
            score += 0.4;
            if self.metrics.iter().any(|m| !m.gl_accounts.is_empty()) {
                score += 0.2;
            }
            if self.metrics.iter().all(|m| !m.formula_sql.is_empty()) {
                score += 0.1;
            }
        }
        score.clamp(0.0, 1.0)
    }
}

/// Placeholder substitution context for retrieved exemplars.
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    pub project: Option<String>,
    pub dataset: Option<String>,
    pub dialect: String,
}

/// Knowledge resolver over the corpus, vector store and embedder.
pub struct KnowledgeResolver {
    kb: Arc<KnowledgeBase>,
    vectors: Arc<VectorStore>,
    embedder: Arc<dyn Embedder>,
    settings: KnowledgeSettings,
}

impl KnowledgeResolver {
    pub fn new(
        kb: Arc<KnowledgeBase>,
        vectors: Arc<VectorStore>,
        embedder: Arc<dyn Embedder>,
        settings: KnowledgeSettings,
    ) -> Self {
        Self {
            kb,
            vectors,
            embedder,
            settings,
        }
    }

    /// Resolve a question into a grounding context.
    ///
    /// Never fails for retrieval reasons: a transient embedding or
    /// vector-store error yields a degraded context with the synonym
    /// rewrite still applied.
    pub async fn resolve(&self, question: &str, options: &ResolveOptions) -> ResolvedContext {
        let mut ctx = ResolvedContext::default();

        // Step 1: synonym substitution by case-insensitive substring.
        let (normalized, applied) = self.apply_synonyms(question);
        ctx.normalized_question = normalized.clone();
        ctx.synonyms_applied = applied;
        ctx.query_type = Some(classify(&normalized));

        // Steps 2-4 depend on embeddings; degrade on transient failure.
        match self.retrieve(&normalized, options).await {
            Ok((metrics, examples)) => {
                for metric in &metrics {
                    if !metric.formula_sql.is_empty() {
                        ctx.formulas
                            .insert(metric.code.clone(), metric.formula_sql.clone());
                    }
                    ctx.formatting_hints
                        .insert(metric.code.clone(), metric.formatting_hint().to_string());
                }
                ctx.metrics = metrics;
                ctx.similar_examples = examples;
            }
            Err(CoreError::Transient(e)) => {
                warn!(error = %e, "resolver degraded: retrieval unavailable");
                ctx.degraded = true;
            }
            Err(e) => {
                warn!(error = %e, "resolver degraded");
                ctx.degraded = true;
            }
        }

        // Step 5: calculation-graph expansion for grounded metrics.
        for metric in &ctx.metrics {
            ctx.business_rules
                .extend(self.calculation_rules(&metric.code));
        }

        debug!(
            metrics = ctx.metrics.len(),
            examples = ctx.similar_examples.len(),
            synonyms = ctx.synonyms_applied.len(),
            confidence = ctx.confidence(),
            degraded = ctx.degraded,
            "question resolved"
        );
        ctx
    }

    fn apply_synonyms(&self, question: &str) -> (String, HashMap<String, String>) {
        let mut normalized = question.to_string();
        let mut applied = HashMap::new();

        for term in &self.kb.terms {
            // ASCII-only fold: Unicode lowercasing can change byte
            // lengths and misalign offsets against the original text.
            let needle = term.term.to_ascii_lowercase();
            if needle.is_empty() || term.term.eq_ignore_ascii_case(&term.canonical_term) {
                continue;
            }
            let mut from = 0usize;
            let mut replaced = false;
            while let Some(pos) = normalized[from..].to_ascii_lowercase().find(&needle) {
                let start = from + pos;
                normalized.replace_range(start..start + needle.len(), &term.canonical_term);
                from = start + term.canonical_term.len();
                replaced = true;
            }
            if replaced {
                applied.insert(term.term.clone(), term.canonical_term.clone());
            }
        }

        (normalized, applied)
    }

    async fn retrieve(
        &self,
        normalized_question: &str,
        options: &ResolveOptions,
    ) -> CoreResult<(Vec<Metric>, Vec<SqlExample>)> {
        let vector = self.embedder.embed(normalized_question).await?;
        let question_lower = normalized_question.to_lowercase();

        // Top-m metrics, retained when the name or a synonym appears in
        // the question or the distance clears the threshold.
        let hits = self.vectors.nearest(
            COLLECTION_METRICS,
            &vector,
            self.settings.metric_top_m,
            None,
        )?;
        let mut metrics = Vec::new();
        for hit in hits {
            let metric: Metric = serde_json::from_value(hit.record.payload.clone())?;
            let name_match = question_lower.contains(&metric.name.to_lowercase())
                || metric
                    .synonyms
                    .iter()
                    .any(|s| question_lower.contains(&s.to_lowercase()));
            if name_match || hit.distance < self.settings.metric_distance_threshold {
                metrics.push(metric);
            }
        }

        // Top-k dialect-filtered exemplars with placeholders substituted.
        let dialect = options.dialect.clone();
        let filter = move |payload: &serde_json::Value| {
            dialect.is_empty()
                || payload.get("dialect").and_then(|d| d.as_str()) == Some(dialect.as_str())
        };
        let hits = self.vectors.nearest(
            COLLECTION_EXAMPLES,
            &vector,
            self.settings.example_top_k,
            Some(&filter),
        )?;
        let mut examples = Vec::new();
        for hit in hits {
            let mut example: SqlExample = serde_json::from_value(hit.record.payload.clone())?;
            if let (Some(project), Some(dataset)) = (&options.project, &options.dataset) {
                example.sql_text = example.substituted_sql(project, dataset);
            }
            examples.push(example);
        }

        Ok((metrics, examples))
    }

    /// Business rules attached to a metric's calculation graph, ordered
    /// by declared priority.
    fn calculation_rules(&self, metric_code: &str) -> Vec<String> {
        let metric_nodes = self
            .kb
            .graph
            .subjects(&vocab::kb("code"), &Term::literal(metric_code));
        let Some(metric_node) = metric_nodes.into_iter().next() else {
            return Vec::new();
        };

        let mut bindings = Bindings::new();
        bindings.insert("metric".to_string(), metric_node);
        let patterns = vec![
            TriplePattern::new(
                Pattern::var("rule"),
                Pattern::iri(&vocab::kb("appliesTo")),
                Pattern::var("metric"),
            ),
            TriplePattern::new(
                Pattern::var("rule"),
                Pattern::iri(&vocab::kb("ruleText")),
                Pattern::var("text"),
            ),
        ];

        let mut rules: Vec<(i64, String)> = self
            .kb
            .graph
            .select(&patterns, &bindings)
            .into_iter()
            .filter_map(|row| {
                let text = row.get("text")?.as_text().to_string();
                let priority = row
                    .get("rule")
                    .and_then(|rule| self.kb.graph.literal(rule, &vocab::kb("priority")))
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(i64::MAX);
                Some((priority, text))
            })
            .collect();

        rules.sort();
        rules.into_iter().map(|(_, text)| text).collect()
    }
}

/// Keyword classification of the question shape.
pub fn classify(question: &str) -> QueryType {
    let q = question.to_lowercase();
    if ["top ", "best ", "worst ", "highest", "lowest", "rank"]
        .iter()
        .any(|kw| q.contains(kw))
    {
        QueryType::Ranking
    } else if ["compare", " vs ", "versus", "year over year", "yoy", "than last"]
        .iter()
        .any(|kw| q.contains(kw))
    {
        QueryType::Comparison
    } else if ["trend", "over time", "by month", "monthly", "by quarter", "growth"]
        .iter()
        .any(|kw| q.contains(kw))
    {
        QueryType::Trend
    } else if ["total", "sum", "average", "how much", "how many", "what is", "ytd"]
        .iter()
        .any(|kw| q.contains(kw))
    {
        QueryType::Aggregation
    } else if ["show", "list", "which", "details"].iter().any(|kw| q.contains(kw)) {
        QueryType::Lookup
    } else {
        QueryType::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(classify("What is revenue YTD?"), QueryType::Aggregation);
        assert_eq!(
            classify("Show top 5 distributors by gross margin"),
            QueryType::Ranking
        );
        assert_eq!(
            classify("Compare this year vs last year revenue"),
            QueryType::Comparison
        );
        assert_eq!(classify("Revenue by month"), QueryType::Trend);
        assert_eq!(classify("blargh"), QueryType::Unknown);
    }

    #[test]
    fn test_confidence_score() {
        let mut ctx = ResolvedContext {
            query_type: Some(QueryType::Aggregation),
            ..Default::default()
        };
        assert!((ctx.confidence() - 0.3).abs() < 1e-9);

        ctx.metrics.push(Metric {
            code: "GM".to_string(),
            name: "Gross Margin".to_string(),
            description: String::new(),
            formula_text: String::new(),
            formula_sql: "SUM(revenue) - SUM(cogs)".to_string(),
            components: vec![],
            gl_accounts: vec!["400100".to_string()],
            synonyms: vec![],
            is_percentage: false,
            is_currency: true,
            category: Default::default(),
        });
        assert!((ctx.confidence() - 1.0).abs() < 1e-9);

        ctx.metrics[0].formula_sql.clear();
        assert!((ctx.confidence() - 0.9).abs() < 1e-9);
    }
}
