//! Knowledge corpus: metric definitions, business synonyms, column-type
//! rules and NL→SQL exemplars.
//!
//! The corpus is authored as Turtle files, parsed once at startup into a
//! triple arena ([`rdf::TripleStore`]), and projected into the typed
//! records below. The loader embeds each record's `combined_text` and
//! upserts it into the vector store; the resolver retrieves from both
//! representations.

pub mod loader;
pub mod rdf;

pub use loader::{load_knowledge, KnowledgeBase};

use serde::{Deserialize, Serialize};

/// Metric grouping used for prompt hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricCategory {
    Financial,
    Operational,
    Efficiency,
}

impl Default for MetricCategory {
    fn default() -> Self {
        MetricCategory::Financial
    }
}

/// A named financial quantity with a textual formula and a SQL template.
///
/// Identity is `code`; immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub formula_text: String,
    #[serde(default)]
    pub formula_sql: String,
    /// Codes of component metrics (e.g. gross margin = revenue - cogs).
    #[serde(default)]
    pub components: Vec<String>,
    /// GL account numbers that feed this metric.
    #[serde(default)]
    pub gl_accounts: Vec<String>,
    #[serde(default)]
    pub synonyms: Vec<String>,
    #[serde(default)]
    pub is_percentage: bool,
    #[serde(default)]
    pub is_currency: bool,
    #[serde(default)]
    pub category: MetricCategory,
}

impl Metric {
    /// Deterministic summary embedded for retrieval.
    pub fn combined_text(&self) -> String {
        let mut text = format!("{}: {}", self.name, self.description);
        if !self.synonyms.is_empty() {
            text.push_str(&format!(" Also known as: {}.", self.synonyms.join(", ")));
        }
        if !self.formula_text.is_empty() {
            text.push_str(&format!(" Formula: {}.", self.formula_text));
        }
        text
    }

    /// Display hint derived from the metric flags. Percentage wins over
    /// currency when both are set.
    pub fn formatting_hint(&self) -> &'static str {
        if self.is_percentage {
            "percentage"
        } else if self.is_currency {
            "currency"
        } else {
            "number"
        }
    }
}

/// Category of a business term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TermCategory {
    Metric,
    Dimension,
    TimePeriod,
    ColumnType,
}

impl Default for TermCategory {
    fn default() -> Self {
        TermCategory::Metric
    }
}

/// A business synonym rewriting a question term to its canonical form.
///
/// Identity is `term`. Applied by case-insensitive substring
/// substitution in a copy of the question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessTerm {
    pub term: String,
    pub canonical_term: String,
    #[serde(default)]
    pub category: TermCategory,
    #[serde(default)]
    pub related_metrics: Vec<String>,
    #[serde(default)]
    pub description: String,
}

impl BusinessTerm {
    pub fn combined_text(&self) -> String {
        format!(
            "{} means {}. {}",
            self.term, self.canonical_term, self.description
        )
    }
}

/// Display type driven by column-name patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayType {
    Currency,
    Percentage,
    Integer,
    Date,
    Text,
}

/// A column-name pattern mapped to a display type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnTypeRule {
    /// Alternation of keywords, e.g. `revenue|sales|amount`.
    pub pattern: String,
    pub display_type: DisplayType,
    #[serde(default)]
    pub format_template: String,
}

impl ColumnTypeRule {
    pub fn combined_text(&self) -> String {
        format!("columns matching {} display as {:?}", self.pattern, self.display_type)
    }
}

/// Exemplar complexity, used for prompt ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

impl Default for Complexity {
    fn default() -> Self {
        Complexity::Medium
    }
}

/// A historical NL→SQL exemplar, retrieved k-nearest by question
/// embedding. `sql_text` carries `{project}` / `{dataset}` placeholders
/// substituted at resolve time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlExample {
    pub id: String,
    pub question_text: String,
    pub sql_text: String,
    #[serde(default)]
    pub explanation: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub tables_used: Vec<String>,
    #[serde(default)]
    pub complexity: Complexity,
    #[serde(default = "default_dialect")]
    pub dialect: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_dialect() -> String {
    "bigquery".to_string()
}

impl SqlExample {
    pub fn combined_text(&self) -> String {
        self.question_text.clone()
    }

    /// SQL with `{project}` / `{dataset}` placeholders substituted.
    pub fn substituted_sql(&self, project: &str, dataset: &str) -> String {
        self.sql_text
            .replace("{project}", project)
            .replace("{dataset}", dataset)
    }
}
