//! LLM client.
//!
//! The model is asked for a JSON object `{sql, tables_used,
//! explanation}` but routinely returns something looser: fenced SQL,
//! `tables_used` as a comma string or XML-ish list, or prose around
//! the JSON. Everything here is a total function over that mess —
//! malformed output degrades, it never panics.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::config::LlmSettings;
use crate::error::{CoreError, CoreResult};

/// Chat completion contract. Temperature is capped at 0.1 by settings
/// validation so identical prompts converge to identical SQL.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> CoreResult<String>;
}

/// `tables_used` as the model actually returns it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TablesUsed {
    List(Vec<String>),
    One(String),
}

/// Parsed model output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmOutput {
    #[serde(default)]
    pub sql: Option<String>,
    #[serde(default)]
    pub tables_used: Option<TablesUsed>,
    #[serde(default)]
    pub explanation: Option<String>,
}

impl LlmOutput {
    /// Normalised table list: strings are split on commas, XML-ish
    /// wrappers (`<item>…</item>`) and backticks are stripped, entries
    /// are trimmed and de-duplicated.
    pub fn normalized_tables(&self) -> Vec<String> {
        static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"</?[A-Za-z][^>]*>").unwrap());

        let raw: Vec<String> = match &self.tables_used {
            None => Vec::new(),
            Some(TablesUsed::List(items)) => items.clone(),
            Some(TablesUsed::One(s)) => vec![s.clone()],
        };

        let mut tables = Vec::new();
        for item in raw {
            let stripped = TAG.replace_all(&item, ",");
            for part in stripped.split(',') {
                let name = part.trim().trim_matches('`').trim();
                // Keep only the final segment of qualified references.
                let name = name.rsplit('.').next().unwrap_or(name).trim();
                if !name.is_empty() && !tables.iter().any(|t: &String| t == name) {
                    tables.push(name.to_string());
                }
            }
        }
        tables
    }
}

/// Parse a raw completion into [`LlmOutput`].
///
/// Tries, in order: the whole text as JSON, a fenced ```json block,
/// a fenced ```sql block, and finally the raw text as SQL when it
/// starts with a query keyword.
pub fn parse_response(text: &str) -> LlmOutput {
    static JSON_FENCE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?s)```json\s*(\{.*?\})\s*```").unwrap());
    static SQL_FENCE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?s)```sql\s*(.*?)\s*```").unwrap());

    let trimmed = text.trim();

    if let Ok(output) = serde_json::from_str::<LlmOutput>(trimmed) {
        if output.sql.is_some() || output.explanation.is_some() {
            return output;
        }
    }

    if let Some(caps) = JSON_FENCE.captures(trimmed) {
        if let Ok(output) = serde_json::from_str::<LlmOutput>(&caps[1]) {
            return output;
        }
    }

    if let Some(caps) = SQL_FENCE.captures(trimmed) {
        return LlmOutput {
            sql: Some(caps[1].trim().to_string()),
            tables_used: None,
            explanation: None,
        };
    }

    let upper = trimmed.to_uppercase();
    if upper.starts_with("SELECT") || upper.starts_with("WITH") {
        return LlmOutput {
            sql: Some(trimmed.to_string()),
            tables_used: None,
            explanation: None,
        };
    }

    // No SQL found; keep the text as explanation so the "data not
    // available" detector can inspect it.
    LlmOutput {
        sql: None,
        tables_used: None,
        explanation: Some(trimmed.to_string()),
    }
}

/// OpenAI-style chat completions client.
pub struct HttpLlmClient {
    client: reqwest::Client,
    settings: LlmSettings,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

impl HttpLlmClient {
    pub fn new(settings: &LlmSettings) -> CoreResult<Self> {
        let api_key = settings
            .resolved_api_key()
            .map_err(|e| CoreError::Config(e.to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            settings: settings.clone(),
            api_key,
        })
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, system: &str, user: &str) -> CoreResult<String> {
        let body = json!({
            "model": self.settings.model,
            "temperature": self.settings.temperature,
            "max_tokens": self.settings.max_tokens,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        });

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.settings.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let parsed: ChatResponse = resp.json().await?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| CoreError::Transient("empty completion".to_string()))?;

        debug!(chars = content.len(), "completion received");
        Ok(content)
    }
}

/// Scripted LLM for tests: returns queued responses in order, repeating
/// the last one, and counts calls.
pub struct MockLlm {
    responses: Mutex<Vec<String>>,
    pub calls: AtomicUsize,
}

impl MockLlm {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses: Mutex::new(responses),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn always(response: &str) -> Self {
        Self::new(vec![response.to_string()])
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn complete(&self, _system: &str, _user: &str) -> CoreResult<String> {
        let idx = self.calls.fetch_add(1, Ordering::SeqCst);
        let responses = self.responses.lock().unwrap();
        responses
            .get(idx.min(responses.len().saturating_sub(1)))
            .cloned()
            .ok_or_else(|| CoreError::Transient("mock has no responses".to_string()))
    }
}
