//! End-to-end engine tests over scripted warehouse, LLM and embedding
//! services.

use std::sync::Arc;

use serde_json::json;

use askql::cache::QueryCache;
use askql::config::Settings;
use askql::embedding::{Embedder, HashEmbedder};
use askql::knowledge::loader::index_knowledge;
use askql::knowledge::rdf::TripleStore;
use askql::knowledge::KnowledgeBase;
use askql::llm::MockLlm;
use askql::resolver::QueryType;
use askql::vector::VectorStore;
use askql::warehouse::MockWarehouse;
use askql::{Engine, Services};

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
    kb:formulaSql "SUM(Gross_Revenue) - SUM(Cost_of_Goods)" ;
    kb:isCurrency "true" ;
    kb:synonym "gross profit" .

kb:TermTopline rdf:type kb:BusinessTerm ;
    kb:term "topline" ;
    kb:canonicalTerm "revenue" ;
    kb:category "metric" .

kb:Ex1 rdf:type kb:Example ;
    kb:questionText "What is revenue YTD?" ;
    kb:sqlText "SELECT SUM(Gross_Revenue) FROM `{project}.{dataset}.dataset_25m_table` WHERE EXTRACT(YEAR FROM Posting_Date) = 2025" ;
    kb:dialect "bigquery" ;
    kb:complexity "low" .
"#;

const YTD_RESPONSE: &str = r#"{"sql": "SELECT SUM(Gross_Revenue) AS total_revenue FROM dataset_25m_table WHERE EXTRACT(YEAR FROM Posting_Date) = EXTRACT(YEAR FROM CURRENT_DATE())", "tables_used": ["dataset_25m_table"], "explanation": "Sums gross revenue for the latest year."}"#;

const COMPARE_RESPONSE: &str = r#"{"sql": "WITH revenue AS (SELECT SUM(Gross_Revenue) AS revenue FROM dataset_25m_table WHERE EXTRACT(YEAR FROM Posting_Date) = EXTRACT(YEAR FROM CURRENT_DATE())), prior_year AS (SELECT SUM(Gross_Revenue) AS prior_total FROM dataset_25m_table WHERE EXTRACT(YEAR FROM Posting_Date) = 2024) SELECT revenue.revenue, prior_year.prior_total FROM revenue, prior_year", "tables_used": ["dataset_25m_table"], "explanation": "Compares this year's revenue to last year's."}"#;

const TOP5_RESPONSE: &str = r#"{"sql": "SELECT Distributor, SUM(Gross_Revenue) AS revenue FROM `acme-analytics.sales_mart.dataset_25m_table` GROUP BY Distributor ORDER BY revenue DESC LIMIT 5", "tables_used": "<item>dataset_25m_table</item>", "explanation": "Ranks distributors by revenue."}"#;

struct Harness {
    engine: Engine,
    warehouse: Arc<MockWarehouse>,
    llm: Arc<MockLlm>,
    embedder: Arc<HashEmbedder>,
}

async fn harness(responses: Vec<&str>) -> Harness {
    let settings = Arc::new(Settings {
        project: "acme-analytics".to_string(),
        dataset: "sales_mart".to_string(),
        identifier_columns: vec!["Distributor".to_string(), "Material_Number".to_string()],
        ..Default::default()
    });
    let cache = Arc::new(QueryCache::open_in_memory().unwrap());

    let warehouse = Arc::new(MockWarehouse::new());
    warehouse.add_table(
        "dataset_25m_table",
        &[
            ("Posting_Date", "DATE", false),
            ("Gross_Revenue", "FLOAT64", true),
            ("Cost_of_Goods", "FLOAT64", true),
            ("Distributor", "STRING", true),
            ("Material_Number", "STRING", true),
        ],
    );
    warehouse.add_table(
        "sales_order_cockpit_export",
        &[("Order_Number", "STRING", false), ("Order_Date", "DATE", false)],
    );

    let llm = Arc::new(MockLlm::new(
        responses.into_iter().map(String::from).collect(),
    ));
    let embedder = Arc::new(HashEmbedder::new(128));
    let embedder_dyn: Arc<dyn Embedder> = embedder.clone();
    let vectors = Arc::new(VectorStore::new());

    let mut graph = TripleStore::new();
    graph.load_str(FIXTURE).unwrap();
    let knowledge = Arc::new(KnowledgeBase::from_graph(graph).unwrap());
    index_knowledge(&knowledge, &embedder_dyn, &vectors)
        .await
        .unwrap();

    let engine = Engine::new(Services {
        settings,
        cache,
        warehouse: warehouse.clone(),
        llm: llm.clone(),
        embedder: embedder_dyn,
        vectors,
        knowledge,
    });

    Harness {
        engine,
        warehouse,
        llm,
        embedder,
    }
}

#[tokio::test]
async fn test_ytd_question_anchored_to_data_year() {
    let h = harness(vec![YTD_RESPONSE]).await;
    // Date-range probe result from the canonical table.
    h.warehouse
        .set_result(&["min_date", "max_date"], vec![vec![json!("2019-01-03"), json!("2025-06-30")]]);

    let artifact = h.engine.generate_sql("What is revenue YTD?", &[]).await.unwrap();

    let sql = artifact.sql.as_deref().expect("answerable question");
    assert!(sql.contains("`acme-analytics.sales_mart.dataset_25m_table`"));
    assert!(sql.contains("EXTRACT(YEAR FROM Posting_Date) = 2025"));
    assert!(!sql.to_uppercase().contains("CURRENT_DATE"));
    assert!(sql.ends_with("LIMIT 1000"));

    assert!(artifact.error.is_none());
    assert!(!artifact.from_cache);
    assert_eq!(artifact.tables_used, vec!["dataset_25m_table".to_string()]);
    assert_eq!(artifact.query_type, Some(QueryType::Aggregation));
    assert_eq!(artifact.total_bytes_processed, Some(512 * 1024 * 1024));
    assert!(artifact.confidence > 0.5);
}

#[tokio::test]
async fn test_grouped_identifier_filtered_and_tables_normalized() {
    let h = harness(vec![TOP5_RESPONSE]).await;

    let artifact = h
        .engine
        .generate_sql("Top 5 distributors by revenue", &[])
        .await
        .unwrap();

    let sql = artifact.sql.as_deref().unwrap();
    assert!(sql.contains("Distributor IS NOT NULL"));
    assert!(sql.contains("LIMIT 5"));
    assert!(!sql.contains("LIMIT 1000"));

    // The XML-ish tables_used claim is normalised to plain names.
    assert_eq!(artifact.tables_used, vec!["dataset_25m_table".to_string()]);
    assert_eq!(artifact.query_type, Some(QueryType::Ranking));
}

#[tokio::test]
async fn test_comparison_ctes_anchored_and_conflict_renamed() {
    let h = harness(vec![COMPARE_RESPONSE]).await;
    h.warehouse
        .set_result(&["min_date", "max_date"], vec![vec![json!("2019-01-03"), json!("2025-06-30")]]);

    let artifact = h
        .engine
        .generate_sql("Compare revenue this year vs last year", &[])
        .await
        .unwrap();

    let sql = artifact.sql.as_deref().expect("answerable question");
    assert!(sql.contains("EXTRACT(YEAR FROM Posting_Date) = 2025"));
    assert!(sql.contains("EXTRACT(YEAR FROM Posting_Date) = 2024"));
    assert!(!sql.to_uppercase().contains("CURRENT_DATE"));
    assert!(sql.contains("`acme-analytics.sales_mart.dataset_25m_table`"));
    assert!(sql.ends_with("LIMIT 1000"));

    // The CTE named after its own output column is disambiguated while
    // the CTE itself keeps its name.
    assert!(sql.contains("AS revenue_amount"));
    assert!(sql.contains("revenue.revenue_amount"));
    assert!(sql.contains("FROM revenue, prior_year"));

    assert_eq!(artifact.query_type, Some(QueryType::Comparison));
    assert!(artifact.error.is_none());
}

#[tokio::test]
async fn test_unanswerable_question_names_available_tables() {
    let h = harness(vec![
        r#"{"sql": null, "tables_used": [], "explanation": "Return on invested capital cannot be answered from this dataset; balance sheet data would be needed."}"#,
    ])
    .await;

    let artifact = h.engine.generate_sql("What is our ROIC?", &[]).await.unwrap();
    assert!(artifact.sql.is_none());
    assert!(!artifact.is_answerable());

    let error = artifact.error.as_deref().unwrap();
    assert!(error.contains("data not available"));
    assert!(error.contains("Available tables"));
    assert!(error.contains("dataset_25m_table"));

    // Unanswerable artifacts are never cached.
    let again = h.engine.generate_sql("What is our ROIC?", &[]).await.unwrap();
    assert!(!again.from_cache);
    assert_eq!(h.llm.call_count(), 2);
}

#[tokio::test]
async fn test_repeated_question_served_from_cache() {
    let h = harness(vec![YTD_RESPONSE]).await;

    let first = h.engine.generate_sql("What is revenue YTD?", &[]).await.unwrap();
    assert!(!first.from_cache);
    let embeds_after_first = h.embedder.call_count();

    let second = h.engine.generate_sql("What is revenue YTD?", &[]).await.unwrap();
    assert!(second.from_cache);
    assert_eq!(second.sql, first.sql);

    // Cache keys ignore question casing.
    let third = h.engine.generate_sql("what is revenue ytd?", &[]).await.unwrap();
    assert!(third.from_cache);

    assert_eq!(h.llm.call_count(), 1);
    assert_eq!(h.embedder.call_count(), embeds_after_first);
}

#[tokio::test]
async fn test_validation_failure_retried_through_llm() {
    let h = harness(vec![
        r#"{"sql": "SELECT SUM(Revenu) AS total FROM dataset_25m_table", "explanation": "Sums revenue."}"#,
        r#"{"sql": "SELECT SUM(Gross_Revenue) AS total FROM dataset_25m_table", "explanation": "Sums revenue."}"#,
    ])
    .await;
    h.warehouse.queue_dry_run_error("Unrecognized name: Revenu");

    let artifact = h.engine.generate_sql("Total revenue", &[]).await.unwrap();

    assert!(artifact.error.is_none());
    assert!(artifact.sql.as_deref().unwrap().contains("Gross_Revenue"));
    assert_eq!(h.llm.call_count(), 2);
    assert_eq!(h.warehouse.dry_runs(), 2);
}

#[tokio::test]
async fn test_retries_exhausted_reports_validation_error() {
    let h = harness(vec![
        r#"{"sql": "SELECT SUM(Revenu) AS total FROM dataset_25m_table", "explanation": "Sums revenue."}"#,
    ])
    .await;
    h.warehouse.queue_dry_run_error("Unrecognized name: Revenu");

    let artifact = h.engine.generate_sql("Total revenue", &[]).await.unwrap();

    assert!(artifact.sql.is_some());
    assert!(artifact.error.as_deref().unwrap().contains("Unrecognized"));
    assert!(!artifact.is_answerable());
    // Default settings allow two retries: three completions in total.
    assert_eq!(h.llm.call_count(), 3);
    // The identical statement re-validates from the dry-run cache.
    assert_eq!(h.warehouse.dry_runs(), 1);
}

#[tokio::test]
async fn test_execution_formats_rows() {
    let h = harness(vec![TOP5_RESPONSE]).await;
    h.warehouse.set_result(
        &["Distributor", "revenue"],
        vec![
            vec![json!("Acme Dist"), json!(1234.5)],
            vec![json!("Globex"), json!(987.0)],
        ],
    );

    let (artifact, result) = h
        .engine
        .generate_and_execute("Top 5 distributors by revenue", &[])
        .await
        .unwrap();
    assert!(artifact.is_answerable());

    let result = result.expect("execution result for answerable question");
    assert!(result.success);
    assert_eq!(result.row_count, 2);
    assert_eq!(result.rows[0], vec!["Acme Dist".to_string(), "$1,234.50".to_string()]);
    assert_eq!(result.rows[1], vec!["Globex".to_string(), "$987.00".to_string()]);
    assert_eq!(result.total_bytes_processed, 512 * 1024 * 1024);
    let expected_cost = 6.25 * (512.0 * 1024.0 * 1024.0) / 1_099_511_627_776.0;
    assert!((result.estimated_cost_usd - expected_cost).abs() < 1e-9);
}

#[tokio::test]
async fn test_execution_error_reported_with_type() {
    let h = harness(vec![TOP5_RESPONSE]).await;
    h.warehouse.set_execute_error("quotaExceeded: too many bytes billed");

    let (_, result) = h
        .engine
        .generate_and_execute("Top 5 distributors by revenue", &[])
        .await
        .unwrap();

    let result = result.unwrap();
    assert!(!result.success);
    assert!(result.error.as_deref().unwrap().contains("quotaExceeded"));
    assert_eq!(result.error_type.as_deref(), Some("execution_error"));
    assert!(result.rows.is_empty());
}

#[tokio::test]
async fn test_dataset_switch_invalidates_cached_sql() {
    let h = harness(vec![YTD_RESPONSE]).await;

    let first = h.engine.generate_sql("What is revenue YTD?", &[]).await.unwrap();
    assert_eq!(first.dataset, "sales_mart");
    assert_eq!(h.llm.call_count(), 1);

    h.engine.switch_dataset("emea_mart").await.unwrap();
    let switched = h.engine.generate_sql("What is revenue YTD?", &[]).await.unwrap();
    assert_eq!(switched.dataset, "emea_mart");
    assert!(switched
        .sql
        .as_deref()
        .unwrap()
        .contains("`acme-analytics.emea_mart.dataset_25m_table`"));
    assert_eq!(h.llm.call_count(), 2);

    // Switching away purged the original dataset's entries.
    h.engine.switch_dataset("sales_mart").await.unwrap();
    let back = h.engine.generate_sql("What is revenue YTD?", &[]).await.unwrap();
    assert!(!back.from_cache);
    assert_eq!(h.llm.call_count(), 3);
}
