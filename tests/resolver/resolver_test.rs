//! Knowledge-resolver tests over an indexed fixture corpus.

use std::sync::Arc;

use askql::config::KnowledgeSettings;
use askql::embedding::{Embedder, HashEmbedder};
use askql::knowledge::loader::index_knowledge;
use askql::knowledge::rdf::TripleStore;
use askql::knowledge::KnowledgeBase;
use askql::resolver::{KnowledgeResolver, QueryType, ResolveOptions};
use askql::vector::VectorStore;

const FIXTURE: &str = r#"
@prefix kb: <http://askql.io/kb#> .
@prefix rdf: <http://www.w3.org/1999/02/22-rdf-syntax-ns#> .

kb:REV rdf:type kb:L1Metric ;
    kb:code "REV" ;
    kb:name "Revenue" ;
    kb:description "Total invoiced revenue" ;
    kb:formulaSql "SUM(Gross_Revenue)" ;
    kb:isCurrency "true" ;
    kb:glAccount "400000" .

kb:GM rdf:type kb:L1Metric ;
    kb:code "GM" ;
    kb:name "Gross Margin" ;
    kb:description "Revenue less cost of goods sold" ;
    kb:formulaSql "SUM(Gross_Revenue) - SUM(Cost_of_Goods)" ;
    kb:isCurrency "true" ;
    kb:synonym "gross profit" ;
    kb:glAccount "400100" .

kb:TermTopline rdf:type kb:BusinessTerm ;
    kb:term "topline" ;
    kb:canonicalTerm "revenue" ;
    kb:category "metric" .

kb:RuleFx rdf:type kb:CalculationRule ;
    kb:appliesTo kb:GM ;
    kb:ruleText "Convert foreign postings at the monthly average FX rate" ;
    kb:priority "2" .

kb:RuleInterco rdf:type kb:CalculationRule ;
    kb:appliesTo kb:GM ;
    kb:ruleText "Exclude intercompany postings" ;
    kb:priority "1" .

kb:Ex1 rdf:type kb:Example ;
    kb:questionText "What is revenue YTD?" ;
    kb:sqlText "SELECT SUM(Gross_Revenue) FROM `{project}.{dataset}.dataset_25m_table` WHERE EXTRACT(YEAR FROM Posting_Date) = 2025" ;
    kb:dialect "bigquery" ;
    kb:complexity "low" .

kb:Ex2 rdf:type kb:Example ;
    kb:questionText "What is revenue year to date?" ;
    kb:sqlText "SELECT SUM(gross_revenue) FROM dataset_25m_table" ;
    kb:dialect "postgres" ;
    kb:complexity "low" .
"#;

fn fixture_kb() -> Arc<KnowledgeBase> {
    let mut graph = TripleStore::new();
    graph.load_str(FIXTURE).unwrap();
    Arc::new(KnowledgeBase::from_graph(graph).unwrap())
}

async fn resolver() -> KnowledgeResolver {
    let kb = fixture_kb();
    let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(128));
    let vectors = Arc::new(VectorStore::new());
    index_knowledge(&kb, &embedder, &vectors).await.unwrap();
    KnowledgeResolver::new(kb, vectors, embedder, KnowledgeSettings::default())
}

fn options() -> ResolveOptions {
    ResolveOptions {
        project: Some("acme-analytics".to_string()),
        dataset: Some("sales_mart".to_string()),
        dialect: "bigquery".to_string(),
    }
}

#[tokio::test]
async fn test_synonym_rewrite_feeds_retrieval() {
    let resolver = resolver().await;
    let ctx = resolver.resolve("What is topline YTD?", &options()).await;

    assert_eq!(ctx.normalized_question, "What is revenue YTD?");
    assert_eq!(ctx.synonyms_applied.get("topline").map(String::as_str), Some("revenue"));
    assert_eq!(ctx.query_type, Some(QueryType::Aggregation));
    assert!(ctx.metrics.iter().any(|m| m.code == "REV"));
    assert!(!ctx.degraded);
}

#[tokio::test]
async fn test_synonym_rewrite_preserves_non_ascii_text() {
    let resolver = resolver().await;
    let ctx = resolver
        .resolve("İstanbul region topline YTD?", &options())
        .await;

    assert_eq!(ctx.normalized_question, "İstanbul region revenue YTD?");
    assert_eq!(
        ctx.synonyms_applied.get("topline").map(String::as_str),
        Some("revenue")
    );
}

#[tokio::test]
async fn test_synonym_rewrite_replaces_every_occurrence() {
    let resolver = resolver().await;
    let ctx = resolver
        .resolve("topline this year vs topline last year", &options())
        .await;

    assert_eq!(
        ctx.normalized_question,
        "revenue this year vs revenue last year"
    );
    assert_eq!(ctx.query_type, Some(QueryType::Comparison));
}

#[tokio::test]
async fn test_grounded_metric_carries_formula_and_hint() {
    let resolver = resolver().await;
    let ctx = resolver.resolve("What is revenue YTD?", &options()).await;

    assert_eq!(
        ctx.formulas.get("REV").map(String::as_str),
        Some("SUM(Gross_Revenue)")
    );
    assert_eq!(
        ctx.formatting_hints.get("REV").map(String::as_str),
        Some("currency")
    );
    assert!(ctx.confidence() > 0.5);
}

#[tokio::test]
async fn test_exemplars_substituted_and_dialect_filtered() {
    let resolver = resolver().await;
    let ctx = resolver.resolve("What is revenue YTD?", &options()).await;

    assert!(!ctx.similar_examples.is_empty());
    assert!(ctx.similar_examples.iter().all(|e| e.dialect == "bigquery"));
    assert!(ctx.similar_examples[0]
        .sql_text
        .contains("`acme-analytics.sales_mart.dataset_25m_table`"));
}

#[tokio::test]
async fn test_business_rules_ordered_by_priority() {
    let resolver = resolver().await;
    let ctx = resolver.resolve("What is gross margin YTD?", &options()).await;

    assert!(ctx.metrics.iter().any(|m| m.code == "GM"));
    let interco = ctx
        .business_rules
        .iter()
        .position(|r| r.contains("intercompany"))
        .expect("priority-1 rule present");
    let fx = ctx
        .business_rules
        .iter()
        .position(|r| r.contains("FX rate"))
        .expect("priority-2 rule present");
    assert!(interco < fx);
}

#[tokio::test]
async fn test_retrieval_failure_degrades_instead_of_failing() {
    let kb = fixture_kb();
    let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(128));
    // No collections created: every nearest-neighbor query errors.
    let vectors = Arc::new(VectorStore::new());
    let resolver = KnowledgeResolver::new(kb, vectors, embedder, KnowledgeSettings::default());

    let ctx = resolver.resolve("What is topline YTD?", &options()).await;
    assert!(ctx.degraded);
    assert!(ctx.metrics.is_empty());
    // Synonyms and classification do not depend on retrieval.
    assert_eq!(ctx.normalized_question, "What is revenue YTD?");
    assert_eq!(ctx.query_type, Some(QueryType::Aggregation));
}
