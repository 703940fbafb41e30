//! BigQuery v2 REST store. Streaming inserts carry the row key as `insertId`,
//! which BigQuery uses for best-effort deduplication.

use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio::sync::Mutex;
use wxraw_core::TableId;

use crate::{ColumnSpec, ColumnType, InsertReport, InsertRow, RowInsertError, StoreError, TableStore};

pub const DEFAULT_API_BASE_URL: &str = "https://bigquery.googleapis.com/bigquery/v2";

#[derive(Clone)]
pub struct BigQueryConfig {
    pub api_base_url: String,
    /// Project the client acts in when none is configured for the table.
    pub ambient_project: Option<String>,
    /// Static OAuth bearer token. Takes precedence over the metadata server.
    pub access_token: Option<String>,
    /// Instance metadata server to mint short-lived access tokens from.
    pub metadata_url: Option<String>,
    pub timeout: Duration,
}

impl Default for BigQueryConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            ambient_project: None,
            access_token: None,
            metadata_url: None,
            timeout: Duration::from_secs(30),
        }
    }
}

impl fmt::Debug for BigQueryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BigQueryConfig")
            .field("api_base_url", &self.api_base_url)
            .field("ambient_project", &self.ambient_project)
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("metadata_url", &self.metadata_url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

pub struct BigQueryStore {
    client: reqwest::Client,
    config: BigQueryConfig,
    cached_token: Mutex<Option<CachedToken>>,
}

impl fmt::Debug for BigQueryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BigQueryStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InsertAllResponse {
    #[serde(default)]
    insert_errors: Vec<InsertErrorEntry>,
}

#[derive(Debug, Deserialize)]
struct InsertErrorEntry {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl BigQueryStore {
    pub fn new(config: BigQueryConfig) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            config,
            cached_token: Mutex::new(None),
        })
    }

    fn base(&self) -> &str {
        self.config.api_base_url.trim_end_matches('/')
    }

    async fn authorized(&self, builder: RequestBuilder) -> Result<RequestBuilder, StoreError> {
        Ok(match self.bearer_token().await? {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        })
    }

    async fn bearer_token(&self) -> Result<Option<String>, StoreError> {
        if let Some(token) = &self.config.access_token {
            return Ok(Some(token.clone()));
        }
        let Some(metadata_url) = &self.config.metadata_url else {
            return Ok(None);
        };

        let mut cached = self.cached_token.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| t.refresh_at > Instant::now()) {
            return Ok(Some(token.value.clone()));
        }

        let url = format!(
            "{}/instance/service-accounts/default/token",
            metadata_url.trim_end_matches('/')
        );
        let resp = self
            .client
            .get(url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(status_error("metadata.token", status, resp).await);
        }
        let token: MetadataToken = resp.json().await?;

        // Refresh a minute before the server-side expiry.
        let lifetime = Duration::from_secs(token.expires_in.saturating_sub(60));
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(Some(token.access_token))
    }

    async fn exists(&self, operation: &'static str, url: String) -> Result<bool, StoreError> {
        let resp = self.authorized(self.client.get(url)).await?.send().await?;
        match resp.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(status_error(operation, status, resp).await),
        }
    }

    async fn create(&self, operation: &'static str, url: String, body: JsonValue) -> Result<(), StoreError> {
        let resp = self
            .authorized(self.client.post(url))
            .await?
            .json(&body)
            .send()
            .await?;
        match resp.status() {
            status if status.is_success() => Ok(()),
            // Someone else created it first.
            StatusCode::CONFLICT => Ok(()),
            status => Err(status_error(operation, status, resp).await),
        }
    }
}

async fn status_error(operation: &'static str, status: StatusCode, resp: reqwest::Response) -> StoreError {
    StoreError::HttpStatus {
        operation,
        status: status.as_u16(),
        body: resp.text().await.unwrap_or_default(),
    }
}

pub fn schema_fields(schema: &[ColumnSpec]) -> JsonValue {
    JsonValue::Array(
        schema
            .iter()
            .map(|column| {
                let field_type = match column.column_type {
                    ColumnType::String => "STRING",
                    ColumnType::Timestamp => "TIMESTAMP",
                };
                let mode = if column.required { "REQUIRED" } else { "NULLABLE" };
                json!({"name": column.name, "type": field_type, "mode": mode})
            })
            .collect(),
    )
}

pub fn insert_all_body(rows: &[InsertRow]) -> JsonValue {
    let rows = rows
        .iter()
        .map(|row| {
            json!({
                "insertId": row.row_key.as_str(),
                "json": {
                    "raw_json": row.record.raw_json,
                    "source_url": row.record.provenance.as_column(),
                    "fetched_at": row.record.fetched_at_string(),
                },
            })
        })
        .collect::<Vec<_>>();
    json!({ "rows": rows })
}

#[async_trait]
impl TableStore for BigQueryStore {
    fn backend(&self) -> &'static str {
        "bigquery"
    }

    async fn ambient_project(&self) -> Result<String, StoreError> {
        self.config.ambient_project.clone().ok_or_else(|| {
            StoreError::Message(
                "no ambient project: set BQ_PROJECT or GOOGLE_CLOUD_PROJECT".to_string(),
            )
        })
    }

    async fn dataset_exists(&self, project: &str, dataset: &str) -> Result<bool, StoreError> {
        let url = format!("{}/projects/{project}/datasets/{dataset}", self.base());
        self.exists("datasets.get", url).await
    }

    async fn create_dataset_if_absent(&self, project: &str, dataset: &str) -> Result<(), StoreError> {
        let url = format!("{}/projects/{project}/datasets", self.base());
        let body = json!({
            "datasetReference": {"projectId": project, "datasetId": dataset},
        });
        self.create("datasets.insert", url, body).await
    }

    async fn table_exists(&self, table: &TableId) -> Result<bool, StoreError> {
        let url = format!(
            "{}/projects/{}/datasets/{}/tables/{}",
            self.base(),
            table.project,
            table.dataset,
            table.table
        );
        self.exists("tables.get", url).await
    }

    async fn create_table_if_absent(
        &self,
        table: &TableId,
        schema: &[ColumnSpec],
    ) -> Result<(), StoreError> {
        let url = format!(
            "{}/projects/{}/datasets/{}/tables",
            self.base(),
            table.project,
            table.dataset
        );
        let body = json!({
            "tableReference": {
                "projectId": table.project,
                "datasetId": table.dataset,
                "tableId": table.table,
            },
            "schema": {"fields": schema_fields(schema)},
        });
        self.create("tables.insert", url, body).await
    }

    async fn insert_rows(&self, table: &TableId, rows: &[InsertRow]) -> Result<InsertReport, StoreError> {
        let url = format!(
            "{}/projects/{}/datasets/{}/tables/{}/insertAll",
            self.base(),
            table.project,
            table.dataset,
            table.table
        );
        let resp = self
            .authorized(self.client.post(url))
            .await?
            .json(&insert_all_body(rows))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(status_error("tabledata.insertAll", status, resp).await);
        }

        let parsed: InsertAllResponse = resp.json().await?;
        let errors = parsed
            .insert_errors
            .into_iter()
            .map(|entry| RowInsertError {
                index: entry.index,
                reason: entry
                    .errors
                    .iter()
                    .map(|e| {
                        format!(
                            "{}: {}",
                            e.reason.as_deref().unwrap_or("error"),
                            e.message.as_deref().unwrap_or("")
                        )
                    })
                    .collect::<Vec<_>>()
                    .join(", "),
            })
            .collect();

        // insertId deduplication happens server-side and is not reported back.
        Ok(InsertReport {
            errors,
            deduplicated: 0,
        })
    }
}
