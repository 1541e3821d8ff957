//! Tests for result formatting over whole result sets.

use std::collections::HashMap;

use serde_json::{json, Value};

use askql::format::format_results;
use askql::warehouse::ResultSet;

#[test]
fn test_mixed_row_formatting() {
    let result = ResultSet {
        columns: vec![
            "month".to_string(),
            "total_revenue".to_string(),
            "order_count".to_string(),
            "gm_ratio".to_string(),
            "Distributor".to_string(),
        ],
        rows: vec![vec![
            json!("2025-01"),
            json!(1234567.891),
            json!(42),
            json!(0.415),
            Value::Null,
        ]],
    };

    let formatted = format_results(&result, &HashMap::new());
    assert_eq!(formatted.columns, result.columns);
    assert_eq!(
        formatted.rows[0],
        vec![
            "2025-01".to_string(),
            "$1,234,567.89".to_string(),
            "42".to_string(),
            "41.50%".to_string(),
            String::new(),
        ]
    );
}

#[test]
fn test_shape_preserved() {
    let result = ResultSet {
        columns: vec!["a".to_string(), "b".to_string()],
        rows: vec![
            vec![json!(1), json!("x")],
            vec![json!(2), json!("y")],
            vec![json!(3), json!("z")],
        ],
    };

    let formatted = format_results(&result, &HashMap::new());
    assert_eq!(formatted.rows.len(), 3);
    assert!(formatted.rows.iter().all(|r| r.len() == 2));
    // Non-numeric strings come through untouched.
    assert_eq!(formatted.rows[0][1], "x");
}

#[test]
fn test_metric_hint_beats_column_pattern() {
    let result = ResultSet {
        columns: vec!["GM".to_string()],
        rows: vec![vec![json!(12.5)]],
    };

    // Bare alias, no keyword match: the fallback would print "12.50".
    let plain = format_results(&result, &HashMap::new());
    assert_eq!(plain.rows[0][0], "12.50");

    // The resolver's hint for the GM metric turns it into a percentage.
    let mut hints = HashMap::new();
    hints.insert("GM".to_string(), "percentage".to_string());
    let hinted = format_results(&result, &hints);
    assert_eq!(hinted.rows[0][0], "12.50%");

    // Hints match aliases case-insensitively.
    let lower = ResultSet {
        columns: vec!["gm".to_string()],
        rows: vec![vec![json!(12.5)]],
    };
    assert_eq!(format_results(&lower, &hints).rows[0][0], "12.50%");
}

#[test]
fn test_negative_currency_and_comma_coercion() {
    let result = ResultSet {
        columns: vec!["net_cost".to_string(), "total_sales".to_string()],
        rows: vec![vec![json!(-500.5), json!("1,234.5")]],
    };

    let formatted = format_results(&result, &HashMap::new());
    assert_eq!(formatted.rows[0], vec!["-$500.50".to_string(), "$1,234.50".to_string()]);
}

#[test]
fn test_identifiers_never_reformatted() {
    let result = ResultSet {
        columns: vec![
            "customer_id".to_string(),
            "posting_date".to_string(),
            "fiscal_year".to_string(),
        ],
        rows: vec![vec![json!("000123"), json!("2025-06-30"), json!(2025)]],
    };

    let formatted = format_results(&result, &HashMap::new());
    assert_eq!(
        formatted.rows[0],
        vec!["000123".to_string(), "2025-06-30".to_string(), "2025".to_string()]
    );
}

#[test]
fn test_preformatted_values_pass_through() {
    let result = ResultSet {
        columns: vec!["revenue".to_string(), "margin_pct".to_string()],
        rows: vec![vec![json!("$9,999.00"), json!("12.5%")]],
    };

    let formatted = format_results(&result, &HashMap::new());
    assert_eq!(formatted.rows[0], vec!["$9,999.00".to_string(), "12.5%".to_string()]);
}

#[test]
fn test_empty_result_set() {
    let result = ResultSet {
        columns: vec!["revenue".to_string()],
        rows: vec![],
    };
    let formatted = format_results(&result, &HashMap::new());
    assert_eq!(formatted.columns, vec!["revenue".to_string()]);
    assert!(formatted.rows.is_empty());
}
