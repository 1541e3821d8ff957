//! Result formatting.
//!
//! Turns raw warehouse values into display strings using column-name
//! keywords, with metric hints taking precedence when a column alias is
//! a known metric code. Formatting never happens in SQL; this is the
//! only place numbers become `$1,234.56` or `12.34%`.

use std::collections::HashMap;

use serde_json::Value;

use crate::warehouse::ResultSet;

/// Columns passed through as-is: identifiers, codes and anything
/// calendar-shaped.
const IDENTIFIER_KEYWORDS: &[&str] = &[
    "id", "code", "date", "month", "year", "period", "quarter", "week", "name", "description",
    "number", "key",
];

const PERCENTAGE_KEYWORDS: &[&str] = &[
    "percent", "pct", "ratio", "rate", "margin_pct", "yoy", "mom", "growth", "share",
];

const QUANTITY_KEYWORDS: &[&str] = &["count", "quantity", "qty", "units", "volume", "orders"];

const CURRENCY_KEYWORDS: &[&str] = &[
    "revenue", "sales", "cost", "margin", "amount", "price", "value", "total", "profit", "spend",
];

/// A result set with every value rendered for display.
#[derive(Debug, Clone, PartialEq)]
pub struct FormattedResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// Format every cell of a result set.
///
/// `metric_hints` maps a metric code (compared case-insensitively
/// against column aliases) to `percentage`, `currency` or `number`.
pub fn format_results(result: &ResultSet, metric_hints: &HashMap<String, String>) -> FormattedResult {
    let hints: HashMap<String, &str> = metric_hints
        .iter()
        .map(|(k, v)| (k.to_lowercase(), v.as_str()))
        .collect();

    let rows = result
        .rows
        .iter()
        .map(|row| {
            result
                .columns
                .iter()
                .zip(row.iter())
                .map(|(col, value)| {
                    let hint = hints.get(&col.to_lowercase()).copied();
                    format_value(col, value, hint)
                })
                .collect()
        })
        .collect();

    FormattedResult {
        columns: result.columns.clone(),
        rows,
    }
}

/// Format a single cell.
pub fn format_value(column: &str, value: &Value, metric_hint: Option<&str>) -> String {
    let raw = match value {
        Value::Null => return String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => return b.to_string(),
        other => return other.to_string(),
    };

    // Already formatted upstream.
    if raw.starts_with('$') || raw.ends_with('%') {
        return raw;
    }

    let col = column.to_lowercase();

    // A metric hint wins over the keyword patterns.
    if let Some(hint) = metric_hint {
        if let Some(number) = parse_number(&raw) {
            return match hint {
                "percentage" => format_percentage(&col, number),
                "currency" => format_currency(number),
                _ => format_fallback(number),
            };
        }
    }

    if matches_any(&col, IDENTIFIER_KEYWORDS) {
        return raw;
    }

    let Some(number) = parse_number(&raw) else {
        return raw;
    };

    if matches_any(&col, PERCENTAGE_KEYWORDS) {
        format_percentage(&col, number)
    } else if matches_any(&col, QUANTITY_KEYWORDS) {
        format_quantity(number)
    } else if matches_any(&col, CURRENCY_KEYWORDS) {
        format_currency(number)
    } else {
        format_fallback(number)
    }
}

fn matches_any(column: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|kw| column.contains(kw))
}

fn parse_number(raw: &str) -> Option<f64> {
    raw.replace(',', "").trim().parse().ok()
}

fn format_percentage(column: &str, value: f64) -> String {
    // Ratios come back in [0, 1]; scale them.
    let value = if column.contains("ratio") && value.abs() <= 1.0 {
        value * 100.0
    } else {
        value
    };
    format!("{}%", group_thousands(value, 2))
}

fn format_quantity(value: f64) -> String {
    if value.fract() == 0.0 {
        group_thousands(value, 0)
    } else {
        group_thousands(value, 2)
    }
}

fn format_currency(value: f64) -> String {
    if value < 0.0 {
        format!("-${}", group_thousands(-value, 2))
    } else {
        format!("${}", group_thousands(value, 2))
    }
}

fn format_fallback(value: f64) -> String {
    if value.abs() >= 1000.0 {
        group_thousands(value, 2)
    } else if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{:.2}", value)
    }
}

/// Render with `decimals` fraction digits and comma-separated thousands.
fn group_thousands(value: f64, decimals: usize) -> String {
    let formatted = format!("{:.*}", decimals, value.abs());
    let (int_part, frac_part) = match formatted.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (formatted.as_str(), None),
    };

    let mut grouped = String::new();
    let digits: Vec<char> = int_part.chars().collect();
    for (i, c) in digits.iter().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(*c);
    }

    let sign = if value < 0.0 { "-" } else { "" };
    match frac_part {
        Some(f) => format!("{}{}.{}", sign, grouped, f),
        None => format!("{}{}", sign, grouped),
    }
}
