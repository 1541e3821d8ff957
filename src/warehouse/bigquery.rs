//! BigQuery REST implementation of the [`Warehouse`] trait.
//!
//! Uses the v2 REST surface: `jobs` with `dryRun` for validation,
//! `queries` for execution, and the `datasets.tables` / `tables` routes
//! for metadata. Authentication is a bearer token supplied by the
//! deployment (service-account tokens are minted outside this crate).

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{ColumnInfo, DryRun, ResultSet, TableSchema, Warehouse};
use crate::error::{CoreError, CoreResult};

const BASE_URL: &str = "https://bigquery.googleapis.com/bigquery/v2";

/// Default timeout for warehouse requests (60 seconds).
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// BigQuery REST client.
pub struct BigQueryWarehouse {
    client: reqwest::Client,
    project: String,
    token: String,
    base_url: String,
}

impl BigQueryWarehouse {
    pub fn new(project: &str, token: &str) -> CoreResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            project: project.to_string(),
            token: token.to_string(),
            base_url: BASE_URL.to_string(),
        })
    }

    /// Point the client at a different endpoint (emulators, proxies).
    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/projects/{}/{}", self.base_url, self.project, path)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobResponse {
    #[serde(default)]
    statistics: Option<JobStatistics>,
    #[serde(default)]
    status: Option<JobStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatistics {
    #[serde(default)]
    total_bytes_processed: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    #[serde(default)]
    error_result: Option<BqError>,
}

#[derive(Debug, Deserialize)]
struct BqError {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    schema: Option<BqSchema>,
    #[serde(default)]
    rows: Vec<BqRow>,
    #[serde(default)]
    total_bytes_processed: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BqSchema {
    #[serde(default)]
    fields: Vec<BqField>,
}

#[derive(Debug, Deserialize)]
struct BqField {
    name: String,
    #[serde(rename = "type", default)]
    field_type: String,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BqRow {
    #[serde(rename = "f", default)]
    fields: Vec<BqCell>,
}

#[derive(Debug, Deserialize)]
struct BqCell {
    #[serde(rename = "v", default)]
    value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct TableListResponse {
    #[serde(default)]
    tables: Vec<TableListEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableListEntry {
    table_reference: TableReference,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableReference {
    table_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableGetResponse {
    #[serde(default)]
    schema: Option<BqSchema>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    num_rows: Option<String>,
}

#[async_trait]
impl Warehouse for BigQueryWarehouse {
    async fn dry_run(&self, sql: &str) -> CoreResult<DryRun> {
        let body = json!({
            "configuration": {
                "dryRun": true,
                "query": { "query": sql, "useLegacySql": false }
            }
        });

        let resp = self
            .client
            .post(self.url("jobs"))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;

        // Dry-run rejections come back as HTTP 400 with an error body;
        // surface them as an invalid dry-run rather than a transport error.
        if resp.status() == reqwest::StatusCode::BAD_REQUEST {
            let body: serde_json::Value = resp.json().await?;
            let message = body
                .pointer("/error/message")
                .and_then(|v| v.as_str())
                .unwrap_or("query rejected")
                .to_string();
            debug!(error = %message, "dry-run rejected");
            return Ok(DryRun::invalid(message));
        }

        let job: JobResponse = resp.error_for_status()?.json().await?;

        if let Some(err) = job.status.and_then(|s| s.error_result) {
            return Ok(DryRun::invalid(err.message));
        }

        let bytes = job
            .statistics
            .and_then(|s| s.total_bytes_processed)
            .and_then(|b| b.parse::<u64>().ok())
            .unwrap_or(0);

        Ok(DryRun::priced(bytes))
    }

    async fn execute(&self, sql: &str) -> CoreResult<ResultSet> {
        let body = json!({
            "query": sql,
            "useLegacySql": false,
        });

        let resp = self
            .client
            .post(self.url("queries"))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body: serde_json::Value = resp.json().await.unwrap_or_default();
            let message = body
                .pointer("/error/message")
                .and_then(|v| v.as_str())
                .unwrap_or("query failed")
                .to_string();
            return Err(if status.is_server_error() {
                CoreError::Transient(message)
            } else {
                CoreError::Execution(message)
            });
        }

        let query: QueryResponse = resp.json().await?;

        let columns: Vec<String> = query
            .schema
            .as_ref()
            .map(|s| s.fields.iter().map(|f| f.name.clone()).collect())
            .unwrap_or_default();

        let rows = query
            .rows
            .into_iter()
            .map(|r| r.fields.into_iter().map(|c| c.value).collect())
            .collect();

        debug!(
            bytes = ?query.total_bytes_processed,
            columns = columns.len(),
            "query executed"
        );

        Ok(ResultSet { columns, rows })
    }

    async fn list_tables(&self, dataset: &str) -> CoreResult<Vec<String>> {
        let resp = self
            .client
            .get(self.url(&format!("datasets/{}/tables", dataset)))
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?;

        let list: TableListResponse = resp.json().await?;
        Ok(list
            .tables
            .into_iter()
            .map(|t| t.table_reference.table_id)
            .collect())
    }

    async fn describe_table(&self, dataset: &str, table: &str) -> CoreResult<TableSchema> {
        let resp = self
            .client
            .get(self.url(&format!("datasets/{}/tables/{}", dataset, table)))
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?;

        let meta: TableGetResponse = resp.json().await?;

        let columns = meta
            .schema
            .map(|s| {
                s.fields
                    .into_iter()
                    .map(|f| ColumnInfo {
                        name: f.name,
                        data_type: f.field_type,
                        nullable: f.mode.as_deref() != Some("REQUIRED"),
                        description: f.description,
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(TableSchema {
            table: table.to_string(),
            columns,
            description: meta.description,
            row_count: meta.num_rows.and_then(|n| n.parse().ok()),
        })
    }
}
