//! TOML-based configuration.
//!
//! Supports a config file (askql.toml) with environment variable expansion.
//!
//! Example configuration:
//! ```toml
//! project = "acme-analytics"
//! dataset = "finance_mart"
//! dialect = "bigquery"
//! allowed_tables = ["dataset_25m_table", "sales_order_cockpit_export"]
//! default_table = "dataset_25m_table"
//! identifier_columns = ["Distributor", "Customer_Name", "Material_Number"]
//!
//! [llm]
//! model = "gpt-4o"
//! temperature = 0.0
//! api_key = "${LLM_API_KEY}"
//!
//! [embedding]
//! model = "text-embedding-3-small"
//! dim = 1536
//!
//! [cache]
//! enabled = true
//! ttl_sql_secs = 86400
//! ```

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Cloud project holding the warehouse datasets.
    pub project: String,

    /// Active dataset. Fully qualified table references are
    /// `` `<project>.<dataset>.<table>` ``.
    pub dataset: String,

    /// Target SQL dialect. BigQuery is the reference dialect; the repair
    /// rules assume it.
    pub dialect: String,

    /// Permitted tables for the active dataset. Empty means all tables
    /// returned by the warehouse are allowed.
    pub allowed_tables: Vec<String>,

    /// Fallback table when a question matches no keyword and when an
    /// unknown table reference has to be replaced.
    pub default_table: String,

    /// Canonical fact table probed for the data date range.
    pub canonical_table: String,

    /// Date column on the canonical fact table.
    pub canonical_date_column: String,

    /// Identifier columns that receive injected `IS NOT NULL` filters
    /// when grouped or selected distinct.
    pub identifier_columns: Vec<String>,

    /// Maximum LLM-assisted repair attempts after a failed dry-run.
    pub max_retries: u32,

    /// `LIMIT` appended to unbounded SELECT statements.
    pub result_limit_default: u64,

    /// LLM configuration.
    pub llm: LlmSettings,

    /// Embedding service configuration.
    pub embedding: EmbeddingSettings,

    /// Cache TTL policy.
    pub cache: CacheSettings,

    /// Schema catalog configuration.
    pub catalog: CatalogSettings,

    /// Knowledge corpus configuration.
    pub knowledge: KnowledgeSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            project: String::new(),
            dataset: String::new(),
            dialect: "bigquery".to_string(),
            allowed_tables: Vec::new(),
            default_table: "dataset_25m_table".to_string(),
            canonical_table: "dataset_25m_table".to_string(),
            canonical_date_column: "Posting_Date".to_string(),
            identifier_columns: Vec::new(),
            max_retries: 2,
            result_limit_default: 1000,
            llm: LlmSettings::default(),
            embedding: EmbeddingSettings::default(),
            cache: CacheSettings::default(),
            catalog: CatalogSettings::default(),
            knowledge: KnowledgeSettings::default(),
        }
    }
}

/// LLM configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LlmSettings {
    /// Model identifier passed to the completion endpoint.
    pub model: String,

    /// Sampling temperature. Kept at or below 0.1 so identical prompts
    /// converge to identical SQL.
    pub temperature: f64,

    /// API key (supports ${ENV_VAR} expansion).
    pub api_key: String,

    /// Base URL of an OpenAI-compatible chat completions endpoint.
    pub base_url: String,

    /// Maximum completion tokens.
    pub max_tokens: u32,

    /// Per-request deadline in seconds.
    pub timeout_secs: u64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            temperature: 0.0,
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            max_tokens: 2048,
            timeout_secs: 60,
        }
    }
}

impl LlmSettings {
    /// API key with environment variables expanded.
    pub fn resolved_api_key(&self) -> Result<String, SettingsError> {
        expand_env_vars(&self.api_key)
    }
}

/// Embedding service configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    /// Embedding model identifier.
    pub model: String,

    /// Fixed vector width produced by the model.
    pub dim: usize,

    /// API key (supports ${ENV_VAR} expansion).
    pub api_key: String,

    /// Base URL of an OpenAI-compatible embeddings endpoint.
    pub base_url: String,

    /// Per-request deadline in seconds.
    pub timeout_secs: u64,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            model: "text-embedding-3-small".to_string(),
            dim: 1536,
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            timeout_secs: 30,
        }
    }
}

impl EmbeddingSettings {
    /// API key with environment variables expanded.
    pub fn resolved_api_key(&self) -> Result<String, SettingsError> {
        expand_env_vars(&self.api_key)
    }
}

/// Cache TTL policy. All TTLs are in seconds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Master switch. Disabled caches satisfy no lookups and swallow all
    /// writes; a request never fails because the cache is off.
    pub enabled: bool,

    /// TTL for generated SQL artifacts.
    pub ttl_sql_secs: u64,

    /// TTL for SQL artifacts of questions seen at least `hot_threshold`
    /// times.
    pub ttl_sql_hot_secs: u64,

    /// Hit count at which a question is promoted to the hot TTL.
    pub hot_threshold: u32,

    /// TTL for table schemas.
    pub ttl_schema_secs: u64,

    /// TTL for embedding vectors.
    pub ttl_embed_secs: u64,

    /// TTL for dry-run validations.
    pub ttl_dryrun_secs: u64,

    /// TTL for execution results.
    pub ttl_result_secs: u64,

    /// Result-row caching is off by default; rows can be large and the
    /// dry-run cache already absorbs the expensive part.
    pub result_cache_enabled: bool,

    /// TTL for the per-dataset date-range probe.
    pub ttl_daterange_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_sql_secs: 86_400,
            ttl_sql_hot_secs: 604_800,
            hot_threshold: 3,
            ttl_schema_secs: 86_400,
            ttl_embed_secs: 2_592_000,
            ttl_dryrun_secs: 3_600,
            ttl_result_secs: 300,
            result_cache_enabled: false,
            ttl_daterange_secs: 3_600,
        }
    }
}

/// Schema catalog configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CatalogSettings {
    /// Keyword-to-table routing rules, checked in order.
    pub table_keywords: Vec<TableKeywordRule>,

    /// Maximum number of tables offered to the prompt.
    pub max_relevant_tables: usize,

    /// Maximum scored columns kept per table.
    pub max_columns_per_table: usize,
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            table_keywords: vec![
                TableKeywordRule {
                    keywords: vec![
                        "order".to_string(),
                        "cockpit".to_string(),
                        "delivery".to_string(),
                        "shipment".to_string(),
                    ],
                    table: "sales_order_cockpit_export".to_string(),
                },
                TableKeywordRule {
                    keywords: vec![
                        "revenue".to_string(),
                        "sales".to_string(),
                        "margin".to_string(),
                        "cost".to_string(),
                        "profit".to_string(),
                        "gl".to_string(),
                        "posting".to_string(),
                    ],
                    table: "dataset_25m_table".to_string(),
                },
            ],
            max_relevant_tables: 5,
            max_columns_per_table: 25,
        }
    }
}

/// A keyword-to-table routing rule.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TableKeywordRule {
    /// Keywords matched as lower-case substrings of the question.
    pub keywords: Vec<String>,

    /// Table selected when any keyword matches.
    pub table: String,
}

/// Knowledge corpus configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KnowledgeSettings {
    /// Directory containing TTL files loaded at startup.
    pub ttl_dir: String,

    /// Metrics retrieved per question.
    pub metric_top_m: usize,

    /// Exemplars retrieved per question.
    pub example_top_k: usize,

    /// Cosine-distance threshold below which a retrieved metric is kept
    /// even without a name or synonym match.
    pub metric_distance_threshold: f32,
}

impl Default for KnowledgeSettings {
    fn default() -> Self {
        Self {
            ttl_dir: "knowledge".to_string(),
            metric_top_m: 3,
            example_top_k: 3,
            metric_distance_threshold: 0.25,
        }
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SettingsError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from the default config file locations.
    ///
    /// Searches in order:
    /// 1. Environment variable `ASKQL_CONFIG`
    /// 2. `./askql.toml`
    /// 3. `~/.config/askql/config.toml`
    pub fn load() -> Result<Self, SettingsError> {
        if let Ok(path) = env::var("ASKQL_CONFIG") {
            return Self::from_file(&path);
        }

        let local_config = PathBuf::from("askql.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("askql").join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        Ok(Settings::default())
    }

    /// Check invariants that make the rest of the pipeline unsound when
    /// violated. Called once at startup; failures are fatal.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.project.is_empty() {
            return Err(SettingsError::InvalidConfig(
                "project must be set".to_string(),
            ));
        }
        if self.dataset.is_empty() {
            return Err(SettingsError::InvalidConfig(
                "dataset must be set".to_string(),
            ));
        }
        if self.llm.temperature > 0.1 {
            return Err(SettingsError::InvalidConfig(format!(
                "llm.temperature must be <= 0.1, got {}",
                self.llm.temperature
            )));
        }
        if !self.allowed_tables.is_empty() && !self.allowed_tables.contains(&self.default_table) {
            return Err(SettingsError::InvalidConfig(format!(
                "default_table '{}' is not in allowed_tables",
                self.default_table
            )));
        }
        Ok(())
    }

    /// Fully qualified, backtick-quoted reference for a table in the
    /// active dataset.
    pub fn qualified_table(&self, table: &str) -> String {
        format!("`{}.{}.{}`", self.project, self.dataset, table)
    }
}

/// Expand environment variables in a string.
///
/// Supports `${VAR}` and `$VAR` syntax.
pub fn expand_env_vars(s: &str) -> Result<String, SettingsError> {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' {
            if chars.peek() == Some(&'{') {
                chars.next(); // consume '{'
                let mut var_name = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch == '}' {
                        chars.next(); // consume '}'
                        break;
                    }
                    var_name.push(chars.next().unwrap());
                }
                let value = env::var(&var_name)
                    .map_err(|_| SettingsError::MissingEnvVar(var_name.clone()))?;
                result.push_str(&value);
            } else {
                // $VAR (ends at non-alphanumeric/underscore)
                let mut var_name = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_alphanumeric() || ch == '_' {
                        var_name.push(chars.next().unwrap());
                    } else {
                        break;
                    }
                }
                if var_name.is_empty() {
                    result.push('$');
                } else {
                    let value = env::var(&var_name)
                        .map_err(|_| SettingsError::MissingEnvVar(var_name.clone()))?;
                    result.push_str(&value);
                }
            }
        } else {
            result.push(c);
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars_braces() {
        env::set_var("ASKQL_TEST_VAR", "hello");
        assert_eq!(expand_env_vars("${ASKQL_TEST_VAR}").unwrap(), "hello");
        assert_eq!(
            expand_env_vars("key_${ASKQL_TEST_VAR}_suffix").unwrap(),
            "key_hello_suffix"
        );
        env::remove_var("ASKQL_TEST_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        assert!(expand_env_vars("${NONEXISTENT_VAR_12345}").is_err());
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
project = "acme-analytics"
dataset = "finance_mart"
allowed_tables = ["dataset_25m_table", "sales_order_cockpit_export"]
identifier_columns = ["Distributor"]

[llm]
model = "gpt-4o"
temperature = 0.1

[cache]
ttl_sql_secs = 7200
hot_threshold = 5
"#;

        let settings: Settings = toml::from_str(toml).unwrap();
        settings.validate().unwrap();

        assert_eq!(settings.project, "acme-analytics");
        assert_eq!(settings.dataset, "finance_mart");
        assert_eq!(settings.allowed_tables.len(), 2);
        assert_eq!(settings.llm.model, "gpt-4o");
        assert_eq!(settings.cache.ttl_sql_secs, 7200);
        assert_eq!(settings.cache.hot_threshold, 5);
        assert_eq!(settings.dialect, "bigquery");
        assert_eq!(settings.max_retries, 2);
    }

    #[test]
    fn test_validate_rejects_missing_dataset() {
        let settings = Settings {
            project: "p".to_string(),
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_hot_temperature() {
        let mut settings = Settings {
            project: "p".to_string(),
            dataset: "d".to_string(),
            ..Settings::default()
        };
        settings.llm.temperature = 0.7;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_qualified_table() {
        let settings = Settings {
            project: "acme".to_string(),
            dataset: "mart".to_string(),
            ..Settings::default()
        };
        assert_eq!(
            settings.qualified_table("dataset_25m_table"),
            "`acme.mart.dataset_25m_table`"
        );
    }
}
