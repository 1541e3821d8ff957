//! LLM prompt assembly.
//!
//! The prompt has a fixed section order: question, conversation context,
//! metric definitions, schema excerpts, the data date range, then the
//! dialect rules. Lower-priority sections are dropped to fit the
//! character budget; the question itself is always kept verbatim.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::config::Settings;
use crate::resolver::ResolvedContext;
use crate::validate::DateRange;
use crate::warehouse::{ColumnInfo, TableSchema};

/// Total character budget for the user prompt. Sections are dropped
/// back-to-front (examples first, then older conversation turns) until
/// the prompt fits.
const PROMPT_CHAR_BUDGET: usize = 24_000;

/// Conversation turns carried into follow-up questions.
const MAX_CONVERSATION_TURNS: usize = 3;

/// One prior exchange, used for follow-up questions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub question: String,
    /// SQL or textual answer produced for that question.
    pub answer: String,
}

/// A fully assembled prompt pair.
#[derive(Debug, Clone)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

/// Assembles the system and user messages for SQL generation.
pub struct PromptBuilder<'a> {
    settings: &'a Settings,
    question: &'a str,
    context: &'a ResolvedContext,
    /// `(table, schema, filtered columns)` per relevant table.
    schemas: Vec<(String, TableSchema, Vec<ColumnInfo>)>,
    conversation: &'a [ConversationTurn],
    date_range: Option<&'a DateRange>,
    /// Dry-run error from the previous attempt, present on retries.
    previous_error: Option<&'a str>,
    previous_sql: Option<&'a str>,
}

impl<'a> PromptBuilder<'a> {
    pub fn new(settings: &'a Settings, question: &'a str, context: &'a ResolvedContext) -> Self {
        Self {
            settings,
            question,
            context,
            schemas: Vec::new(),
            conversation: &[],
            date_range: None,
            previous_error: None,
            previous_sql: None,
        }
    }

    pub fn with_schema(mut self, table: &str, schema: TableSchema, columns: Vec<ColumnInfo>) -> Self {
        self.schemas.push((table.to_string(), schema, columns));
        self
    }

    pub fn with_conversation(mut self, turns: &'a [ConversationTurn]) -> Self {
        self.conversation = turns;
        self
    }

    pub fn with_date_range(mut self, range: Option<&'a DateRange>) -> Self {
        self.date_range = range;
        self
    }

    /// Mark this as a repair attempt: the failed SQL and the dry-run
    /// error are appended so the model can fix its own output.
    pub fn with_repair(mut self, sql: &'a str, error: &'a str) -> Self {
        self.previous_sql = Some(sql);
        self.previous_error = Some(error);
        self
    }

    pub fn build(&self) -> Prompt {
        Prompt {
            system: self.system_message(),
            user: self.user_message(),
        }
    }

    fn system_message(&self) -> String {
        let tables: Vec<String> = self
            .schemas
            .iter()
            .map(|(t, _, _)| self.settings.qualified_table(t))
            .collect();

        let mut s = String::new();
        s.push_str(
            "You are a BigQuery SQL expert. Answer the user's question by writing a single \
             Standard SQL SELECT statement.\n\n\
             Respond with JSON only, no prose around it:\n\
             {\"sql\": \"...\", \"tables_used\": [\"...\"], \"explanation\": \"...\"}\n\
             If the question cannot be answered from the listed tables, set \"sql\" to null \
             and explain why in \"explanation\".\n\n",
        );

        s.push_str("FORBIDDEN:\n");
        s.push_str("- PostgreSQL casts (expr::type); use CAST(expr AS type)\n");
        s.push_str("- to_char(); format in the application, never in SQL\n");
        s.push_str("- expr - INTERVAL 'n unit'; use DATE_SUB(expr, INTERVAL n UNIT)\n");
        s.push_str("- || for string concatenation; use CONCAT()\n");
        s.push_str("- LOWER() on columns in the SELECT list\n");
        s.push_str("- CURRENT_DATE or other today-relative predicates\n\n");

        s.push_str("REQUIRED:\n");
        let _ = writeln!(
            s,
            "- Fully qualified table names in backticks, e.g. {}",
            self.settings.qualified_table(&self.settings.default_table)
        );
        s.push_str("- SAFE_DIVIDE(a, b) for every ratio\n");
        s.push_str("- DATE_TRUNC(column, UNIT) with an unquoted unit keyword\n");
        if !self.settings.identifier_columns.is_empty() {
            let _ = writeln!(
                s,
                "- IS NOT NULL filters when grouping or selecting these columns: {}",
                self.settings.identifier_columns.join(", ")
            );
        }
        s.push('\n');

        s.push_str("HARD RULES:\n");
        if !tables.is_empty() {
            let _ = writeln!(s, "- Use only these tables: {}", tables.join(", "));
        }
        s.push_str("- Never invent tables or columns\n");
        s.push_str("- Never format currency symbols or thousands separators in SQL\n");
        s
    }

    fn user_message(&self) -> String {
        let mut sections: Vec<(Section, String)> = Vec::new();

        sections.push((Section::Question, format!("Question: {}\n", self.question)));

        if let Some((sql, error)) = self.previous_sql.zip(self.previous_error) {
            sections.push((
                Section::Repair,
                format!(
                    "Your previous attempt failed validation.\n\
                     Previous SQL:\n{}\n\nValidation error: {}\n\
                     Fix the SQL so it validates.\n",
                    sql, error
                ),
            ));
        }

        if !self.conversation.is_empty() {
            let recent = self
                .conversation
                .iter()
                .rev()
                .take(MAX_CONVERSATION_TURNS)
                .rev();
            let mut block = String::from("Conversation so far:\n");
            for turn in recent {
                let _ = writeln!(block, "Q: {}\nA: {}", turn.question, turn.answer);
            }
            sections.push((Section::Conversation, block));
        }

        if !self.context.metrics.is_empty() {
            let mut block = String::from("Metric definitions:\n");
            for metric in &self.context.metrics {
                let _ = write!(block, "- {} ({}): {}", metric.name, metric.code, metric.description);
                if !metric.formula_sql.is_empty() {
                    let _ = write!(block, " SQL template: {}", metric.formula_sql);
                }
                let _ = writeln!(block, " Format as {}.", metric.formatting_hint());
            }
            sections.push((Section::Metrics, block));
        }

        if !self.context.business_rules.is_empty() {
            let mut block = String::from("Business rules:\n");
            for rule in &self.context.business_rules {
                let _ = writeln!(block, "- {}", rule);
            }
            sections.push((Section::Rules, block));
        }

        if !self.schemas.is_empty() {
            let mut block = String::from("Available tables:\n");
            for (table, schema, columns) in &self.schemas {
                let _ = writeln!(block, "\nTable {}:", self.settings.qualified_table(table));
                if let Some(desc) = &schema.description {
                    let _ = writeln!(block, "  {}", desc);
                }
                for col in columns {
                    let nullable = if col.nullable { "NULLABLE" } else { "REQUIRED" };
                    let _ = writeln!(block, "  - {} {} {}", col.name, col.data_type, nullable);
                }
            }
            sections.push((Section::Schema, block));
        }

        if let Some(range) = self.date_range {
            let mut line = format!(
                "The data covers {} through {}. There is no data after {}.",
                range.min, range.max, range.max
            );
            if let Some(year) = range.latest_year() {
                let _ = write!(line, " The most recent year with data is {}.", year);
            }
            sections.push((Section::DateRange, format!("{}\n", line)));
        }

        if !self.context.similar_examples.is_empty() {
            let mut block = String::from("Similar past questions:\n");
            for example in &self.context.similar_examples {
                let _ = writeln!(block, "Q: {}\nSQL: {}", example.question_text, example.sql_text);
            }
            sections.push((Section::Examples, block));
        }

        fit_to_budget(sections, PROMPT_CHAR_BUDGET)
    }
}

/// Section identity, ordered by drop priority (highest value dropped
/// first when over budget).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Section {
    Question,
    Repair,
    DateRange,
    Metrics,
    Rules,
    Schema,
    Conversation,
    Examples,
}

fn fit_to_budget(mut sections: Vec<(Section, String)>, budget: usize) -> String {
    let total = |s: &[(Section, String)]| s.iter().map(|(_, t)| t.len() + 1).sum::<usize>();

    while total(&sections) > budget && sections.len() > 1 {
        // Drop the lowest-priority section still present; the question
        // is never dropped.
        let drop_idx = sections
            .iter()
            .enumerate()
            .filter(|(_, (kind, _))| *kind != Section::Question)
            .max_by_key(|(_, (kind, _))| *kind)
            .map(|(i, _)| i);
        match drop_idx {
            Some(i) => {
                sections.remove(i);
            }
            None => break,
        }
    }

    let mut out = String::new();
    // Question first, then the remaining sections in insertion order.
    for (_, text) in &sections {
        out.push_str(text);
        out.push('\n');
    }
    out
}
