//! Knowledge loader.
//!
//! Projects the parsed TTL corpus into typed records, verifies the graph
//! invariants, and (re)builds the vector-store collections. Loading is a
//! startup job; nothing here runs per request.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use super::rdf::{vocab, Term, TripleStore};
use super::{
    BusinessTerm, ColumnTypeRule, Complexity, DisplayType, Metric, MetricCategory, SqlExample,
    TermCategory,
};
use crate::embedding::Embedder;
use crate::error::{CoreError, CoreResult};
use crate::vector::{
    VectorStore, COLLECTION_COLUMN_TYPES, COLLECTION_EXAMPLES, COLLECTION_METRICS,
    COLLECTION_TERMS,
};

/// The loaded knowledge corpus: typed records plus the triple graph the
/// resolver walks for calculation expansion.
pub struct KnowledgeBase {
    pub metrics: Vec<Metric>,
    pub terms: Vec<BusinessTerm>,
    pub column_rules: Vec<ColumnTypeRule>,
    pub examples: Vec<SqlExample>,
    pub graph: TripleStore,
}

impl KnowledgeBase {
    /// Parse a TTL directory and project it into records. Invariant
    /// violations and parse failures are fatal.
    pub fn from_dir<P: AsRef<Path>>(dir: P) -> CoreResult<Self> {
        let graph = TripleStore::load_dir(dir)?;
        Self::from_graph(graph)
    }

    /// Build from an already-parsed graph (fixtures, tests).
    pub fn from_graph(graph: TripleStore) -> CoreResult<Self> {
        check_invariants(&graph)?;

        let metrics = project_metrics(&graph);
        let terms = project_terms(&graph);
        let column_rules = project_column_rules(&graph);
        let examples = project_examples(&graph);

        info!(
            metrics = metrics.len(),
            terms = terms.len(),
            column_rules = column_rules.len(),
            examples = examples.len(),
            "knowledge corpus projected"
        );

        Ok(Self {
            metrics,
            terms,
            column_rules,
            examples,
            graph,
        })
    }

    pub fn metric_by_code(&self, code: &str) -> Option<&Metric> {
        self.metrics.iter().find(|m| m.code == code)
    }
}

/// Graph invariants checked at load:
/// - every `L2Bucket` has exactly one `contains` parent `L1Metric`
/// - every `GLAccount` with a parent bucket has exactly one `partOf`
/// - every `synonymOf` target carries a `code` or `name`
fn check_invariants(graph: &TripleStore) -> CoreResult<()> {
    for bucket in graph.subjects_of_type(&vocab::kb("L2Bucket")) {
        let parents = graph.subjects(&vocab::kb("contains"), &bucket);
        if parents.len() != 1 {
            return Err(CoreError::Config(format!(
                "L2 bucket {} has {} containing metrics, expected exactly 1",
                bucket.as_text(),
                parents.len()
            )));
        }
    }

    for account in graph.subjects_of_type(&vocab::kb("GLAccount")) {
        let buckets = graph.objects(&account, &vocab::kb("partOf"));
        if buckets.len() > 1 {
            return Err(CoreError::Config(format!(
                "GL account {} is part of {} buckets, expected at most 1",
                account.as_text(),
                buckets.len()
            )));
        }
    }

    for synonym in graph.subjects_of_type(&vocab::kb("Synonym")) {
        for target in graph.objects(&synonym, &vocab::kb("synonymOf")) {
            let has_identity = graph.literal(&target, &vocab::kb("code")).is_some()
                || graph.literal(&target, &vocab::kb("name")).is_some();
            if !has_identity {
                return Err(CoreError::Config(format!(
                    "synonym {} targets {} which has neither code nor name",
                    synonym.as_text(),
                    target.as_text()
                )));
            }
        }
    }

    Ok(())
}

fn texts(graph: &TripleStore, subject: &Term, predicate: &str) -> Vec<String> {
    let mut values: Vec<String> = graph
        .objects(subject, &vocab::kb(predicate))
        .into_iter()
        .map(|t| t.as_text().to_string())
        .collect();
    values.sort();
    values
}

fn flag(graph: &TripleStore, subject: &Term, predicate: &str) -> bool {
    graph
        .literal(subject, &vocab::kb(predicate))
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

fn project_metrics(graph: &TripleStore) -> Vec<Metric> {
    let mut nodes = graph.subjects_of_type(&vocab::kb("L1Metric"));
    nodes.sort_by(|a, b| a.as_text().cmp(b.as_text()));

    nodes
        .iter()
        .filter_map(|node| {
            let code = graph.literal(node, &vocab::kb("code"))?;
            let category = match graph
                .literal(node, &vocab::kb("category"))
                .unwrap_or_default()
                .as_str()
            {
                "operational" => MetricCategory::Operational,
                "efficiency" => MetricCategory::Efficiency,
                _ => MetricCategory::Financial,
            };

            // GL accounts are reachable directly or through buckets.
            let mut gl_accounts = texts(graph, node, "glAccount");
            for bucket in graph.objects(node, &vocab::kb("contains")) {
                for account in graph.subjects(&vocab::kb("partOf"), &bucket) {
                    if let Some(number) = graph.literal(&account, &vocab::kb("accountNumber")) {
                        gl_accounts.push(number);
                    }
                }
            }
            gl_accounts.sort();
            gl_accounts.dedup();

            // Synonyms are literal aliases plus Synonym nodes pointing here.
            let mut synonyms = texts(graph, node, "synonym");
            for synonym_node in graph.subjects(&vocab::kb("synonymOf"), node) {
                if let Some(label) = graph.literal(&synonym_node, &vocab::kb("label")) {
                    synonyms.push(label);
                }
            }
            synonyms.sort();
            synonyms.dedup();

            Some(Metric {
                code,
                name: graph.literal(node, &vocab::kb("name")).unwrap_or_default(),
                description: graph
                    .literal(node, &vocab::kb("description"))
                    .unwrap_or_default(),
                formula_text: graph
                    .literal(node, &vocab::kb("formulaText"))
                    .unwrap_or_default(),
                formula_sql: graph
                    .literal(node, &vocab::kb("formulaSql"))
                    .unwrap_or_default(),
                components: texts(graph, node, "component"),
                gl_accounts,
                synonyms,
                is_percentage: flag(graph, node, "isPercentage"),
                is_currency: flag(graph, node, "isCurrency"),
                category,
            })
        })
        .collect()
}

fn project_terms(graph: &TripleStore) -> Vec<BusinessTerm> {
    let mut nodes = graph.subjects_of_type(&vocab::kb("BusinessTerm"));
    nodes.sort_by(|a, b| a.as_text().cmp(b.as_text()));

    nodes
        .iter()
        .filter_map(|node| {
            let term = graph.literal(node, &vocab::kb("term"))?;
            let canonical_term = graph.literal(node, &vocab::kb("canonicalTerm"))?;
            let category = match graph
                .literal(node, &vocab::kb("category"))
                .unwrap_or_default()
                .as_str()
            {
                "dimension" => TermCategory::Dimension,
                "time_period" => TermCategory::TimePeriod,
                "column_type" => TermCategory::ColumnType,
                _ => TermCategory::Metric,
            };
            Some(BusinessTerm {
                term,
                canonical_term,
                category,
                related_metrics: texts(graph, node, "relatedMetric"),
                description: graph
                    .literal(node, &vocab::kb("description"))
                    .unwrap_or_default(),
            })
        })
        .collect()
}

fn project_column_rules(graph: &TripleStore) -> Vec<ColumnTypeRule> {
    let mut nodes = graph.subjects_of_type(&vocab::kb("ColumnTypeRule"));
    nodes.sort_by(|a, b| a.as_text().cmp(b.as_text()));

    nodes
        .iter()
        .filter_map(|node| {
            let pattern = graph.literal(node, &vocab::kb("pattern"))?;
            let display_type = match graph
                .literal(node, &vocab::kb("displayType"))?
                .as_str()
            {
                "currency" => DisplayType::Currency,
                "percentage" => DisplayType::Percentage,
                "integer" => DisplayType::Integer,
                "date" => DisplayType::Date,
                _ => DisplayType::Text,
            };
            Some(ColumnTypeRule {
                pattern,
                display_type,
                format_template: graph
                    .literal(node, &vocab::kb("formatTemplate"))
                    .unwrap_or_default(),
            })
        })
        .collect()
}

fn project_examples(graph: &TripleStore) -> Vec<SqlExample> {
    let mut nodes = graph.subjects_of_type(&vocab::kb("Example"));
    nodes.sort_by(|a, b| a.as_text().cmp(b.as_text()));

    nodes
        .iter()
        .filter_map(|node| {
            let question_text = graph.literal(node, &vocab::kb("questionText"))?;
            let sql_text = graph.literal(node, &vocab::kb("sqlText"))?;
            let complexity = match graph
                .literal(node, &vocab::kb("complexity"))
                .unwrap_or_default()
                .as_str()
            {
                "low" => Complexity::Low,
                "high" => Complexity::High,
                _ => Complexity::Medium,
            };
            Some(SqlExample {
                id: node.as_text().to_string(),
                question_text,
                sql_text,
                explanation: graph
                    .literal(node, &vocab::kb("explanation"))
                    .unwrap_or_default(),
                category: graph
                    .literal(node, &vocab::kb("category"))
                    .unwrap_or_default(),
                tables_used: texts(graph, node, "tableUsed"),
                complexity,
                dialect: graph
                    .literal(node, &vocab::kb("dialect"))
                    .unwrap_or_else(|| "bigquery".to_string()),
                tags: texts(graph, node, "tag"),
            })
        })
        .collect()
}

/// Load the corpus and rebuild every vector collection.
///
/// Collections are dropped and recreated, then each record is embedded
/// from its deterministic `combined_text` and upserted. A missing or
/// unparseable corpus is fatal; an embedding failure mid-load is too,
/// since a half-filled collection would skew retrieval.
pub async fn load_knowledge(
    ttl_dir: &str,
    embedder: &Arc<dyn Embedder>,
    vectors: &VectorStore,
) -> CoreResult<KnowledgeBase> {
    let kb = KnowledgeBase::from_dir(ttl_dir)?;
    index_knowledge(&kb, embedder, vectors).await?;
    Ok(kb)
}

/// Rebuild the vector collections from an already-loaded corpus.
pub async fn index_knowledge(
    kb: &KnowledgeBase,
    embedder: &Arc<dyn Embedder>,
    vectors: &VectorStore,
) -> CoreResult<()> {
    let dim = embedder.dim();
    vectors.create_collection(COLLECTION_METRICS, dim);
    vectors.create_collection(COLLECTION_TERMS, dim);
    vectors.create_collection(COLLECTION_COLUMN_TYPES, dim);
    vectors.create_collection(COLLECTION_EXAMPLES, dim);

    for metric in &kb.metrics {
        let vector = embedder.embed(&metric.combined_text()).await?;
        vectors.upsert(
            COLLECTION_METRICS,
            &metric.code,
            serde_json::to_value(metric)?,
            vector,
        )?;
    }

    for term in &kb.terms {
        let vector = embedder.embed(&term.combined_text()).await?;
        vectors.upsert(
            COLLECTION_TERMS,
            &term.term,
            serde_json::to_value(term)?,
            vector,
        )?;
    }

    for rule in &kb.column_rules {
        let vector = embedder.embed(&rule.combined_text()).await?;
        vectors.upsert(
            COLLECTION_COLUMN_TYPES,
            &rule.pattern,
            serde_json::to_value(rule)?,
            vector,
        )?;
    }

    for example in &kb.examples {
        let vector = embedder.embed(&example.combined_text()).await?;
        vectors.upsert(
            COLLECTION_EXAMPLES,
            &example.id,
            serde_json::to_value(example)?,
            vector,
        )?;
    }

    if vectors.is_empty(COLLECTION_METRICS) {
        warn!("no metrics loaded; resolver will run degraded");
    }

    info!(
        metrics = vectors.len(COLLECTION_METRICS),
        terms = vectors.len(COLLECTION_TERMS),
        examples = vectors.len(COLLECTION_EXAMPLES),
        "vector collections rebuilt"
    );
    Ok(())
}
