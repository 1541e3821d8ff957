//! End-to-end tests for the repair pipeline: a model statement goes in,
//! a safe, fully qualified BigQuery statement (or a discard) comes out.

use askql::repair::{repair, RepairContext};
use askql::validate::DateRange;

fn ctx() -> RepairContext {
    RepairContext {
        project: "acme-analytics".to_string(),
        dataset: "sales_mart".to_string(),
        allow_list: vec![
            "dataset_25m_table".to_string(),
            "sales_order_cockpit_export".to_string(),
        ],
        default_table: "dataset_25m_table".to_string(),
        identifier_columns: vec!["Distributor".to_string(), "Material_Number".to_string()],
        canonical_date_column: "Posting_Date".to_string(),
        date_range: Some(DateRange {
            min: "2019-01-03".to_string(),
            max: "2025-06-30".to_string(),
        }),
        result_limit: 1000,
    }
}

#[test]
fn test_statement_qualified_anchored_and_limited() {
    let sql = "SELECT SUM(Gross_Revenue) AS total FROM dataset_25m_table \
               WHERE EXTRACT(YEAR FROM Posting_Date) = EXTRACT(YEAR FROM CURRENT_DATE())";
    let out = repair(Some(sql), "Sums gross revenue for the current year.", &ctx());

    let repaired = out.sql.expect("statement should survive repair");
    assert!(repaired.contains("`acme-analytics.sales_mart.dataset_25m_table`"));
    assert!(!repaired.to_uppercase().contains("CURRENT_DATE"));
    assert!(repaired.contains("EXTRACT(YEAR FROM Posting_Date) = 2025"));
    assert!(repaired.ends_with("LIMIT 1000"));
    assert!(out.error.is_none());
    assert!(out.applied.contains(&"strip_today_predicates"));
    assert!(out.applied.contains(&"balance_and_limit"));
}

#[test]
fn test_repair_is_idempotent() {
    let sql = "SELECT SUM(Gross_Revenue) AS total FROM dataset_25m_table \
               WHERE EXTRACT(YEAR FROM Posting_Date) = EXTRACT(YEAR FROM CURRENT_DATE())";
    let first = repair(Some(sql), "", &ctx());
    let first_sql = first.sql.expect("first repair should succeed");

    let second = repair(Some(&first_sql), "", &ctx());
    assert_eq!(second.sql.as_deref(), Some(first_sql.as_str()));
    assert!(second.applied.is_empty(), "applied: {:?}", second.applied);
}

#[test]
fn test_postgres_constructs_normalized() {
    let sql = "SELECT revenue::FLOAT64, to_char(SUM(amount), 'FM999,999') \
               FROM dataset_25m_table WHERE d > now() - INTERVAL '7 days'";
    let out = repair(Some(sql), "", &ctx()).sql.unwrap();

    assert!(out.contains("CAST(revenue AS FLOAT64)"));
    assert!(out.contains("CAST(ROUND(SUM(amount), 2) AS STRING)"));
    assert!(out.contains("DATE_SUB(CURRENT_TIMESTAMP(), INTERVAL 7 DAY)"));
    assert!(!out.contains("::"));
    assert!(!out.to_lowercase().contains("now()"));
    assert!(!out.to_lowercase().contains("to_char"));
}

#[test]
fn test_null_filter_injected_for_grouped_identifier() {
    let sql = "SELECT Distributor, SUM(Gross_Revenue) AS revenue \
               FROM `acme-analytics.sales_mart.dataset_25m_table` \
               GROUP BY Distributor ORDER BY revenue DESC LIMIT 5";
    let out = repair(Some(sql), "", &ctx()).sql.unwrap();

    assert!(out.contains("Distributor IS NOT NULL"));
    // The filter lands before the GROUP BY, not bolted onto the end.
    let filter_pos = out.find("IS NOT NULL").unwrap();
    let group_pos = out.find("GROUP BY").unwrap();
    assert!(filter_pos < group_pos);
    // An existing filter is not doubled.
    let again = repair(Some(&out), "", &ctx()).sql.unwrap();
    assert_eq!(again.matches("IS NOT NULL").count(), 1);
}

#[test]
fn test_lower_stripped_from_select_list_only() {
    let sql = "SELECT LOWER(Region) AS region, SUM(Gross_Revenue) AS revenue \
               FROM dataset_25m_table WHERE LOWER(Channel) = 'retail' GROUP BY Region";
    let out = repair(Some(sql), "", &ctx()).sql.unwrap();

    assert!(!out.contains("LOWER(Region)"));
    assert!(out.contains("Region AS region"));
    assert!(out.contains("LOWER(Channel) = 'retail'"));
}

#[test]
fn test_unknown_table_replaced_with_default() {
    let sql = "SELECT x FROM `acme-analytics.sales_mart.customers`";
    let out = repair(Some(sql), "", &ctx()).sql.unwrap();
    assert!(out.contains("`acme-analytics.sales_mart.dataset_25m_table`"));
    assert!(!out.contains("customers"));
}

#[test]
fn test_wrong_dataset_rewritten() {
    let sql = "SELECT x FROM `acme-analytics.other_mart.dataset_25m_table`";
    let out = repair(Some(sql), "", &ctx()).sql.unwrap();
    assert!(out.contains("`acme-analytics.sales_mart.dataset_25m_table`"));
    assert!(!out.contains("other_mart"));
}

#[test]
fn test_cte_named_after_its_own_column() {
    let sql = "WITH revenue AS (SELECT Region, SUM(Gross_Revenue) AS revenue \
               FROM dataset_25m_table GROUP BY Region) \
               SELECT Region, revenue FROM revenue";
    let out = repair(Some(sql), "", &ctx()).sql.unwrap();

    assert!(out.contains("AS revenue_amount"));
    assert!(out.contains("FROM revenue"));
    assert!(!out.contains("AS revenue FROM"));
}

#[test]
fn test_explained_unavailability_discards_sql() {
    let out = repair(
        Some("SELECT 1"),
        "This question cannot be answered from the sales data; balance sheet \
         accounts would be needed.",
        &ctx(),
    );
    assert!(out.sql.is_none());
    assert_eq!(out.error.as_deref(), Some("data not available"));
}

#[test]
fn test_hallucinated_ledger_table_discarded() {
    let sql = "SELECT total_assets FROM balance_sheet WHERE year = 2025";
    let out = repair(Some(sql), "", &ctx());
    assert!(out.sql.is_none());
    assert!(out.applied.contains(&"enforce_allow_list"));
}

#[test]
fn test_placeholder_project_discarded() {
    let sql = "SELECT x FROM `my-project.mydataset.dataset_25m_table`";
    let out = repair(Some(sql), "", &ctx());
    assert!(out.sql.is_none());
}

#[test]
fn test_missing_sql_without_explanation_is_unanswerable() {
    let out = repair(None, "", &ctx());
    assert!(out.sql.is_none());
    assert_eq!(out.error.as_deref(), Some("data not available"));
}

#[test]
fn test_today_predicates_survive_without_date_range() {
    let mut c = ctx();
    c.date_range = None;
    let sql = "SELECT SUM(x) FROM dataset_25m_table \
               WHERE Posting_Date >= DATE_SUB(CURRENT_DATE(), INTERVAL 30 DAY)";
    let out = repair(Some(sql), "", &c).sql.unwrap();
    // With no observed range, relative dates are the best available anchor.
    assert!(out.contains("CURRENT_DATE()"));
}

#[test]
fn test_unbalanced_parens_closed_before_limit() {
    let sql = "SELECT SUM(Gross_Revenue FROM dataset_25m_table LIMIT 10";
    let out = repair(Some(sql), "", &ctx()).sql.unwrap();
    assert!(out.contains(") LIMIT 10"));
    assert_eq!(out.matches('(').count(), out.matches(')').count());
}

#[test]
fn test_non_ascii_string_literal_survives_repair() {
    let sql = "SELECT Region FROM dataset_25m_table \
               WHERE note = 'ﬁ caféand' AND Posting_Date >= CURRENT_DATE()";
    let out = repair(Some(sql), "", &ctx());

    let repaired = out.sql.expect("statement should survive repair");
    assert!(repaired.contains("'ﬁ caféand'"));
    assert!(!repaired.to_uppercase().contains("CURRENT_DATE"));
    assert!(repaired.contains("`acme-analytics.sales_mart.dataset_25m_table`"));
    assert!(repaired.ends_with("LIMIT 1000"));
}
