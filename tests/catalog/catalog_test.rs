//! Schema-catalog tests: keyword routing, allow-list filtering and the
//! schema cache.

use std::sync::Arc;

use askql::cache::QueryCache;
use askql::catalog::SchemaCatalog;
use askql::config::Settings;
use askql::warehouse::MockWarehouse;

fn settings() -> Settings {
    Settings {
        project: "acme-analytics".to_string(),
        dataset: "sales_mart".to_string(),
        ..Default::default()
    }
}

fn warehouse() -> Arc<MockWarehouse> {
    let wh = Arc::new(MockWarehouse::new());
    wh.add_table(
        "dataset_25m_table",
        &[
            ("Posting_Date", "DATE", false),
            ("Gross_Revenue", "FLOAT64", true),
            ("Distributor", "STRING", true),
            ("Flag_Cancelled", "BOOL", true),
        ],
    );
    wh.add_table(
        "sales_order_cockpit_export",
        &[("Order_Number", "STRING", false), ("Order_Date", "DATE", false)],
    );
    wh
}

fn catalog_with(settings: Settings) -> SchemaCatalog {
    let cache = Arc::new(QueryCache::open_in_memory().unwrap());
    SchemaCatalog::new(warehouse(), cache, settings)
}

#[tokio::test]
async fn test_keyword_routing() {
    let catalog = catalog_with(settings());

    let tables = catalog
        .relevant_tables("sales_mart", "Revenue by month for 2025")
        .await
        .unwrap();
    assert_eq!(tables, vec!["dataset_25m_table".to_string()]);

    let tables = catalog
        .relevant_tables("sales_mart", "Open orders this week")
        .await
        .unwrap();
    assert_eq!(tables, vec!["sales_order_cockpit_export".to_string()]);
}

#[tokio::test]
async fn test_unmatched_question_falls_back_to_default_table() {
    let catalog = catalog_with(settings());
    let tables = catalog
        .relevant_tables("sales_mart", "blargh")
        .await
        .unwrap();
    assert_eq!(tables, vec!["dataset_25m_table".to_string()]);
}

#[tokio::test]
async fn test_allow_list_filters_routing_and_listing() {
    let mut settings = settings();
    settings.allowed_tables = vec!["dataset_25m_table".to_string()];
    let catalog = catalog_with(settings);

    let listed = catalog.list_tables("sales_mart").await.unwrap();
    assert_eq!(listed, vec!["dataset_25m_table".to_string()]);

    // The order keyword routes to a table outside the allow-list; the
    // default wins instead.
    let tables = catalog
        .relevant_tables("sales_mart", "Open orders this week")
        .await
        .unwrap();
    assert_eq!(tables, vec!["dataset_25m_table".to_string()]);
}

#[tokio::test]
async fn test_relevant_tables_capped() {
    let mut settings = settings();
    settings.catalog.max_relevant_tables = 1;
    let catalog = catalog_with(settings);

    let tables = catalog
        .relevant_tables("sales_mart", "orders and revenue by distributor")
        .await
        .unwrap();
    assert_eq!(tables.len(), 1);
}

#[tokio::test]
async fn test_schema_served_from_cache() {
    let wh = warehouse();
    let cache = Arc::new(QueryCache::open_in_memory().unwrap());
    let catalog = SchemaCatalog::new(wh.clone(), cache.clone(), settings());

    let first = catalog.schema("sales_mart", "dataset_25m_table").await.unwrap();
    assert_eq!(first.columns.len(), 4);

    // The warehouse changes; the cached schema keeps being served.
    wh.add_table("dataset_25m_table", &[("Posting_Date", "DATE", false)]);
    let second = catalog.schema("sales_mart", "dataset_25m_table").await.unwrap();
    assert_eq!(second.columns.len(), 4);

    // With caching off the fresh definition is fetched.
    let mut uncached_settings = settings();
    uncached_settings.cache.enabled = false;
    let uncached = SchemaCatalog::new(wh, cache, uncached_settings);
    let third = uncached.schema("sales_mart", "dataset_25m_table").await.unwrap();
    assert_eq!(third.columns.len(), 1);
}

#[tokio::test]
async fn test_column_scoring_prefers_question_terms() {
    let catalog = catalog_with(settings());
    let schema = catalog.schema("sales_mart", "dataset_25m_table").await.unwrap();

    let columns = catalog.score_columns(&schema, "revenue by distributor last month");
    let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
    assert!(names.contains(&"Gross_Revenue"));
    assert!(names.contains(&"Distributor"));
    assert!(!names.contains(&"Flag_Cancelled"));
}
