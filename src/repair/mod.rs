//! Deterministic SQL repair.
//!
//! An ordered sequence of idempotent text passes applied to every
//! generated statement before validation. Each pass is total: input it
//! does not understand passes through unchanged. The pass order is
//! fixed; `RepairOutcome::applied` records which passes changed the
//! statement.

mod text;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::{debug, warn};

use crate::validate::DateRange;
use self::text::{
    find_matching_paren, qualify_bare_tables, rewrite_select_lists, split_where_clauses,
    word_replace,
};

/// Everything the passes need to know about the target dataset.
#[derive(Debug, Clone, Default)]
pub struct RepairContext {
    pub project: String,
    pub dataset: String,
    pub allow_list: Vec<String>,
    pub default_table: String,
    pub identifier_columns: Vec<String>,
    pub canonical_date_column: String,
    pub date_range: Option<DateRange>,
    pub result_limit: u64,
}

impl RepairContext {
    fn qualified(&self, table: &str) -> String {
        format!("`{}.{}.{}`", self.project, self.dataset, table)
    }
}

/// Result of running the repair pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct RepairOutcome {
    /// `None` means the statement was discarded as unanswerable.
    pub sql: Option<String>,
    pub error: Option<String>,
    /// Names of the passes that changed the statement.
    pub applied: Vec<&'static str>,
}

impl RepairOutcome {
    fn discarded(reason: &str, applied: Vec<&'static str>) -> Self {
        Self {
            sql: None,
            error: Some(reason.to_string()),
            applied,
        }
    }
}

/// Run every repair pass in order.
///
/// `explanation` is the model's prose; it participates in the
/// "data not available" detection even when SQL is present.
pub fn repair(sql: Option<&str>, explanation: &str, ctx: &RepairContext) -> RepairOutcome {
    let mut applied = Vec::new();

    if detect_not_available(sql, explanation) {
        debug!("statement discarded: model reported data not available");
        return RepairOutcome::discarded("data not available", vec!["detect_not_available"]);
    }
    let Some(sql) = sql else {
        return RepairOutcome::discarded("data not available", applied);
    };

    let mut current = sql.trim().trim_end_matches(';').to_string();

    let passes: &[(&'static str, fn(&str, &RepairContext) -> String)] = &[
        ("normalize_dialect", normalize_dialect),
        ("strip_today_predicates", strip_today_predicates),
        ("fix_cte_conflicts", fix_cte_conflicts),
        ("fix_malformed_identifiers", fix_malformed_identifiers),
    ];
    for (name, pass) in passes {
        let next = pass(&current, ctx);
        if next != current {
            debug!(pass = name, "repair pass changed statement");
            applied.push(*name);
            current = next;
        }
    }

    match enforce_allow_list(&current, ctx) {
        AllowListVerdict::Discard(reason) => {
            warn!(reason = %reason, "statement discarded by allow-list enforcement");
            applied.push("enforce_allow_list");
            return RepairOutcome::discarded("data not available", applied);
        }
        AllowListVerdict::Rewritten(next) => {
            if next != current {
                applied.push("enforce_allow_list");
                current = next;
            }
        }
    }

    let tail: &[(&'static str, fn(&str, &RepairContext) -> String)] = &[
        ("apply_safety_filters", apply_safety_filters),
        ("balance_and_limit", balance_and_limit),
    ];
    for (name, pass) in tail {
        let next = pass(&current, ctx);
        if next != current {
            debug!(pass = name, "repair pass changed statement");
            applied.push(*name);
            current = next;
        }
    }

    RepairOutcome {
        sql: Some(current),
        error: None,
        applied,
    }
}

// ---------------------------------------------------------------------
// Pass 1: dialect normalisation
// ---------------------------------------------------------------------

static PG_CAST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([A-Za-z_][A-Za-z0-9_.]*)\s*::\s*([A-Za-z][A-Za-z0-9]*)").unwrap());
static NOW_FN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bNOW\s*\(\s*\)").unwrap());
static BARE_CURRENT_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bCURRENT_DATE\b(\s*\()?").unwrap());
static QUOTED_DATE_TRUNC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bDATE_TRUNC\s*\(\s*'(\w+)'\s*,\s*([^()]+)\)").unwrap());
static INTERVAL_ARITHMETIC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)([A-Za-z_][A-Za-z0-9_.]*(?:\s*\(\s*\))?)\s*([+-])\s*INTERVAL\s*'(\d+)\s*([A-Za-z]+)'")
        .unwrap()
});
static TO_CHAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bto_char\s*\(").unwrap());

fn normalize_dialect(sql: &str, _ctx: &RepairContext) -> String {
    let mut out = rewrite_to_char(sql);

    out = PG_CAST
        .replace_all(&out, "CAST($1 AS $2)")
        .into_owned();
    out = NOW_FN.replace_all(&out, "CURRENT_TIMESTAMP()").into_owned();
    out = BARE_CURRENT_DATE
        .replace_all(&out, |caps: &Captures| {
            // Already a call: leave untouched.
            if caps.get(1).is_some() {
                caps[0].to_string()
            } else {
                "CURRENT_DATE()".to_string()
            }
        })
        .into_owned();
    out = QUOTED_DATE_TRUNC
        .replace_all(&out, |caps: &Captures| {
            format!("DATE_TRUNC({}, {})", caps[2].trim(), caps[1].to_uppercase())
        })
        .into_owned();
    out = INTERVAL_ARITHMETIC
        .replace_all(&out, |caps: &Captures| {
            let func = if &caps[2] == "-" { "DATE_SUB" } else { "DATE_ADD" };
            let unit = caps[4].trim_end_matches(['s', 'S']).to_uppercase();
            format!("{}({}, INTERVAL {} {})", func, caps[1].trim(), &caps[3], unit)
        })
        .into_owned();
    out
}

/// `to_char(x, fmt)` carries an arbitrary expression; regex alone cannot
/// balance the parens, so the call is located by regex and rebuilt by a
/// paren scan.
fn rewrite_to_char(sql: &str) -> String {
    let mut out = sql.to_string();
    loop {
        let Some(m) = TO_CHAR.find(&out) else {
            return out;
        };
        let open = m.end() - 1;
        let Some(close) = find_matching_paren(&out, open) else {
            return out;
        };
        let args = &out[open + 1..close];
        let expr = match text::split_top_level(args, ',').into_iter().next() {
            Some(first) => first.trim().to_string(),
            None => args.trim().to_string(),
        };
        let replacement = format!("CAST(ROUND({}, 2) AS STRING)", expr);
        out.replace_range(m.start()..=close, &replacement);
    }
}

// ---------------------------------------------------------------------
// Pass 2: today-relative predicate stripping
// ---------------------------------------------------------------------

static EXTRACT_YEAR_TODAY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)EXTRACT\s*\(\s*YEAR\s+FROM\s+CURRENT_DATE\s*\(\s*\)\s*\)").unwrap()
});

/// Columns the model substitutes for the canonical date column.
const DATE_COLUMN_ALIASES: &[&str] = &["Header_Creation_Date", "date_column", "Order_Date"];

fn strip_today_predicates(sql: &str, ctx: &RepairContext) -> String {
    let Some(range) = &ctx.date_range else {
        return sql.to_string();
    };

    let mut out = sql.to_string();
    if let Some(year) = range.latest_year() {
        out = EXTRACT_YEAR_TODAY
            .replace_all(&out, year.to_string().as_str())
            .into_owned();
    }
    for alias in DATE_COLUMN_ALIASES {
        out = word_replace(&out, alias, &ctx.canonical_date_column);
    }

    // Any remaining clause anchored to today is meaningless against a
    // fixed date range; drop it.
    split_where_clauses(&out, |conjunct| {
        let upper = conjunct.to_uppercase();
        !upper.contains("CURRENT_DATE") && !upper.contains("REFERENCESDDOCUMENT")
    })
}

// ---------------------------------------------------------------------
// Pass 3: CTE-column conflict repair
// ---------------------------------------------------------------------

static CTE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(?:\bWITH\s+|,\s*)([A-Za-z_]\w*)\s+AS\s*\(").unwrap());

fn fix_cte_conflicts(sql: &str, _ctx: &RepairContext) -> String {
    if !sql.to_uppercase().contains("WITH ") {
        return sql.to_string();
    }

    let cte_names: Vec<String> = CTE_NAME
        .captures_iter(sql)
        .map(|c| c[1].to_string())
        .collect();

    let mut out = sql.to_string();
    for name in cte_names {
        let alias = Regex::new(&format!(r"(?i)\bAS\s+{}\b", regex::escape(&name))).unwrap();
        let conflicts = alias
            .find_iter(&out)
            .any(|m| !out[m.end()..].trim_start().starts_with('('));
        if conflicts {
            let renamed = format!("{}_amount", name);
            out = text::rename_column_references(&out, &name, &renamed);
        }
    }
    out
}

// ---------------------------------------------------------------------
// Pass 4: malformed-identifier repair
// ---------------------------------------------------------------------

static BACKTICKED_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"`([\w-]+)\.([\w-]+)\.([\w-]+)`").unwrap());

fn fix_malformed_identifiers(sql: &str, ctx: &RepairContext) -> String {
    BACKTICKED_REF
        .replace_all(sql, |caps: &Captures| {
            let (middle, last) = (&caps[2], &caps[3]);
            // A valid table split across an underscore boundary.
            let collapsed = format!("{}_{}", middle, last);
            if ctx.allow_list.iter().any(|t| t == &collapsed) {
                return ctx.qualified(&collapsed);
            }
            // Right table, wrong dataset.
            if middle != ctx.dataset && ctx.allow_list.iter().any(|t| t == last) {
                return ctx.qualified(last);
            }
            caps[0].to_string()
        })
        .into_owned()
}

// ---------------------------------------------------------------------
// Pass 5: allow-list enforcement
// ---------------------------------------------------------------------

const PLACEHOLDER_MARKERS: &[&str] = &["my-project", "mydataset", "my_dataset", "your-project"];

/// Ledger-shaped tables the model hallucinates for balance-sheet style
/// questions. Their presence means the question is unanswerable here.
const LEDGER_TABLES: &[&str] = &[
    "income_statements",
    "income_statement",
    "balance_sheet",
    "balance_sheets",
    "cash_flow",
    "general_ledger",
    "trial_balance",
];

enum AllowListVerdict {
    Rewritten(String),
    Discard(String),
}

fn enforce_allow_list(sql: &str, ctx: &RepairContext) -> AllowListVerdict {
    let lower = sql.to_lowercase();
    for marker in PLACEHOLDER_MARKERS {
        if lower.contains(marker) {
            return AllowListVerdict::Discard(format!("placeholder reference '{}'", marker));
        }
    }
    for table in LEDGER_TABLES {
        if word_match(&lower, table) {
            return AllowListVerdict::Discard(format!("unknown ledger table '{}'", table));
        }
    }

    if ctx.allow_list.is_empty() {
        return AllowListVerdict::Rewritten(sql.to_string());
    }

    let mut out = BACKTICKED_REF
        .replace_all(sql, |caps: &Captures| {
            let last = &caps[3];
            if ctx.allow_list.iter().any(|t| t == last) {
                ctx.qualified(last)
            } else {
                warn!(table = last, "unknown table replaced by default table");
                ctx.qualified(&ctx.default_table)
            }
        })
        .into_owned();

    out = qualify_bare_tables(&out, &ctx.allow_list, &|t| ctx.qualified(t));
    AllowListVerdict::Rewritten(out)
}

fn word_match(haystack: &str, word: &str) -> bool {
    haystack.match_indices(word).any(|(i, _)| {
        let before_ok = i == 0
            || !haystack.as_bytes()[i - 1].is_ascii_alphanumeric()
                && haystack.as_bytes()[i - 1] != b'_';
        let end = i + word.len();
        let after_ok = end >= haystack.len()
            || !haystack.as_bytes()[end].is_ascii_alphanumeric() && haystack.as_bytes()[end] != b'_';
        before_ok && after_ok
    })
}

// ---------------------------------------------------------------------
// Pass 6: safety filters
// ---------------------------------------------------------------------

static LOWER_CALL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bLOWER\s*\(([^()]+)\)").unwrap());

fn apply_safety_filters(sql: &str, ctx: &RepairContext) -> String {
    // LOWER() stays meaningful in WHERE; it only breaks display in the
    // SELECT list.
    let mut out = rewrite_select_lists(sql, |select_list| {
        LOWER_CALL.replace_all(select_list, "$1").into_owned()
    });

    for column in &ctx.identifier_columns {
        if needs_null_filter(&out, column) {
            out = text::inject_null_filter(&out, column);
        }
    }
    out
}

fn needs_null_filter(sql: &str, column: &str) -> bool {
    let upper = sql.to_uppercase();
    let col_upper = column.to_uppercase();
    if !word_match(&upper, &col_upper) {
        return false;
    }

    let grouped = Regex::new(&format!(
        r"(?i)\bGROUP\s+BY\b[^()]*\b{}\b",
        regex::escape(column)
    ))
    .unwrap()
    .is_match(sql);
    let distinct = Regex::new(&format!(
        r"(?i)\bSELECT\s+DISTINCT\b[^()]*\b{}\b",
        regex::escape(column)
    ))
    .unwrap()
    .is_match(sql);
    if !grouped && !distinct {
        return false;
    }

    let already = Regex::new(&format!(
        r"(?i)\b{}\b\s+IS\s+NOT\s+NULL",
        regex::escape(column)
    ))
    .unwrap()
    .is_match(sql);
    !already
}

// ---------------------------------------------------------------------
// Pass 7: paren balance and LIMIT
// ---------------------------------------------------------------------

static HAS_LIMIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bLIMIT\s+\d+").unwrap());

fn balance_and_limit(sql: &str, ctx: &RepairContext) -> String {
    let mut out = text::close_unbalanced_parens(sql);

    let upper = out.trim_start().to_uppercase();
    let is_select = upper.starts_with("SELECT") || upper.starts_with("WITH");
    if is_select && !HAS_LIMIT.is_match(&out) {
        out = format!("{} LIMIT {}", out.trim_end(), ctx.result_limit);
    }
    out
}

// ---------------------------------------------------------------------
// Pass 8: "data not available" detection
// ---------------------------------------------------------------------

static NOT_AVAILABLE_SQL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*SELECT\s+'not\s+available'").unwrap());

const NOT_AVAILABLE_PHRASES: &[&str] = &[
    "not available",
    "would be needed",
    "cannot be answered",
    "no such table",
    "does not contain",
];

fn detect_not_available(sql: Option<&str>, explanation: &str) -> bool {
    let explained = {
        let lower = explanation.to_lowercase();
        NOT_AVAILABLE_PHRASES.iter().any(|p| lower.contains(p))
    };
    let literal = sql.map(|s| NOT_AVAILABLE_SQL.is_match(s)).unwrap_or(false);
    explained || literal
}
