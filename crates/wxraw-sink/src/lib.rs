//! Append-only raw table sink: schema bootstrapping, idempotent row writes and store backends.

use std::fmt;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, Instrument};
use wxraw_core::{IngestError, IngestOutcome, IngestRecord, Provenance, RowKey, TableId, WeatherPayload};

pub mod bigquery;
pub mod memory;
pub mod postgres;

pub use bigquery::{BigQueryConfig, BigQueryStore};
pub use memory::{MemoryStore, StoreCallCounts, StoredRow};
pub use postgres::PostgresStore;

pub const CRATE_NAME: &str = "wxraw-sink";

pub const DEFAULT_DATASET: &str = "raw_data";
pub const DEFAULT_TABLE: &str = "weather_raw";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    String,
    Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub column_type: ColumnType,
    pub required: bool,
}

/// `raw_json`, `source_url`, `fetched_at`. `source_url` is nullable for unknown provenance.
pub const RAW_TABLE_SCHEMA: [ColumnSpec; 3] = [
    ColumnSpec {
        name: "raw_json",
        column_type: ColumnType::String,
        required: true,
    },
    ColumnSpec {
        name: "source_url",
        column_type: ColumnType::String,
        required: false,
    },
    ColumnSpec {
        name: "fetched_at",
        column_type: ColumnType::Timestamp,
        required: true,
    },
];

#[derive(Debug, Clone)]
pub struct InsertRow {
    pub row_key: RowKey,
    pub record: IngestRecord,
}

impl InsertRow {
    pub fn new(record: IngestRecord) -> Self {
        Self {
            row_key: record.row_key(),
            record,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowInsertError {
    pub index: usize,
    pub reason: String,
}

impl fmt::Display for RowInsertError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "row {}: {}", self.index, self.reason)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InsertReport {
    pub errors: Vec<RowInsertError>,
    /// Rows whose key the store already held. Zero when the backend cannot tell.
    pub deduplicated: usize,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0}")]
    Message(String),
    #[error("http status {status} from {operation}: {body}")]
    HttpStatus {
        operation: &'static str,
        status: u16,
        body: String,
    },
    #[error(transparent)]
    Request(#[from] reqwest::Error),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Store handle for an append-only table store addressed as `{project}.{dataset}.{table}`.
///
/// `create_*_if_absent` must tolerate a concurrent creator.
#[async_trait]
pub trait TableStore: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn ambient_project(&self) -> Result<String, StoreError>;

    async fn dataset_exists(&self, project: &str, dataset: &str) -> Result<bool, StoreError>;

    async fn create_dataset_if_absent(&self, project: &str, dataset: &str) -> Result<(), StoreError>;

    async fn table_exists(&self, table: &TableId) -> Result<bool, StoreError>;

    async fn create_table_if_absent(
        &self,
        table: &TableId,
        schema: &[ColumnSpec],
    ) -> Result<(), StoreError>;

    /// A repeated row key must be a silent no-op.
    async fn insert_rows(&self, table: &TableId, rows: &[InsertRow]) -> Result<InsertReport, StoreError>;
}

/// Which table to target; `project` falls back to the store's ambient project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableTarget {
    pub project: Option<String>,
    pub dataset: String,
    pub table: String,
}

impl Default for TableTarget {
    fn default() -> Self {
        Self {
            project: None,
            dataset: DEFAULT_DATASET.to_string(),
            table: DEFAULT_TABLE.to_string(),
        }
    }
}

/// Lazily verifies or creates the dataset and table, once per manager.
///
/// Readiness is memoized under a lock so concurrent callers share a single
/// verify/create pass. A failed pass leaves the manager not ready.
pub struct SchemaManager {
    store: Arc<dyn TableStore>,
    target: TableTarget,
    ready: Mutex<Option<TableId>>,
}

impl SchemaManager {
    pub fn new(store: Arc<dyn TableStore>, target: TableTarget) -> Self {
        Self {
            store,
            target,
            ready: Mutex::new(None),
        }
    }

    pub async fn is_ready(&self) -> bool {
        self.ready.lock().await.is_some()
    }

    pub async fn ensure_table(&self) -> Result<TableId, IngestError> {
        let mut ready = self.ready.lock().await;
        if let Some(table_id) = ready.as_ref() {
            return Ok(table_id.clone());
        }

        let table_id = self.verify_or_create().await.map_err(|err| {
            IngestError::SinkUnavailable(format!(
                "ensuring {}.{}: {err}",
                self.target.dataset, self.target.table
            ))
        })?;
        *ready = Some(table_id.clone());
        Ok(table_id)
    }

    async fn verify_or_create(&self) -> Result<TableId, StoreError> {
        let project = match &self.target.project {
            Some(project) => project.clone(),
            None => self.store.ambient_project().await?,
        };
        let table_id = TableId::new(project, &self.target.dataset, &self.target.table);

        if !self
            .store
            .dataset_exists(&table_id.project, &table_id.dataset)
            .await?
        {
            info!(project = %table_id.project, dataset = %table_id.dataset, "creating dataset");
            self.store
                .create_dataset_if_absent(&table_id.project, &table_id.dataset)
                .await?;
        }

        if !self.store.table_exists(&table_id).await? {
            info!(table = %table_id, "creating raw table");
            self.store
                .create_table_if_absent(&table_id, &RAW_TABLE_SCHEMA)
                .await?;
        }

        debug!(table = %table_id, backend = self.store.backend(), "raw table ready");
        Ok(table_id)
    }
}

/// Writes one raw payload per call, keyed for idempotence.
pub struct IngestWriter {
    schema: SchemaManager,
    store: Arc<dyn TableStore>,
}

impl IngestWriter {
    pub fn new(store: Arc<dyn TableStore>, target: TableTarget) -> Self {
        Self {
            schema: SchemaManager::new(Arc::clone(&store), target),
            store,
        }
    }

    pub fn schema(&self) -> &SchemaManager {
        &self.schema
    }

    pub async fn write_raw(
        &self,
        payload: &WeatherPayload,
        provenance: Provenance,
        fetched_at: DateTime<Utc>,
    ) -> Result<IngestOutcome, IngestError> {
        let table = self.schema.ensure_table().await?;
        let row = InsertRow::new(IngestRecord::from_payload(payload, provenance, fetched_at)?);

        let span = info_span!("raw_write", table = %table, row_key = %row.row_key);
        async {
            info!(bytes = row.record.raw_json.len(), "writing raw row");
            let report = self
                .store
                .insert_rows(&table, std::slice::from_ref(&row))
                .await
                .map_err(|err| IngestError::SinkUnavailable(format!("inserting into {table}: {err}")))?;

            if !report.errors.is_empty() {
                let detail = report
                    .errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; ");
                return Err(IngestError::SinkRejected(format!(
                    "insert errors for {table}: {detail}"
                )));
            }

            let deduplicated = report.deduplicated > 0;
            if deduplicated {
                info!("row key already present; insert was a no-op");
            }
            Ok(IngestOutcome {
                table: table.clone(),
                inserted: 1,
                deduplicated,
            })
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkBackend {
    BigQuery,
    Postgres,
    Memory,
}

impl SinkBackend {
    pub fn parse(value: &str) -> anyhow::Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "bigquery" | "bq" => Ok(Self::BigQuery),
            "postgres" | "postgresql" | "pg" => Ok(Self::Postgres),
            "memory" | "mem" => Ok(Self::Memory),
            other => Err(anyhow::anyhow!(
                "unknown sink backend {other:?}; expected bigquery, postgres or memory"
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BigQuery => "bigquery",
            Self::Postgres => "postgres",
            Self::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub backend: SinkBackend,
    pub target: TableTarget,
    pub database_url: Option<String>,
    pub bigquery: BigQueryConfig,
    pub memory_project: String,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            backend: SinkBackend::BigQuery,
            target: TableTarget::default(),
            database_url: None,
            bigquery: BigQueryConfig::default(),
            memory_project: "local".to_string(),
        }
    }
}

/// Builds the configured store handle. Connection-level setup errors surface here.
pub async fn connect_store(config: &SinkConfig) -> anyhow::Result<Arc<dyn TableStore>> {
    let store: Arc<dyn TableStore> = match config.backend {
        SinkBackend::Memory => Arc::new(MemoryStore::new(config.memory_project.clone())),
        SinkBackend::BigQuery => Arc::new(
            BigQueryStore::new(config.bigquery.clone()).context("building BigQuery client")?,
        ),
        SinkBackend::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is required for the postgres sink")?;
            Arc::new(PostgresStore::connect_lazy(url).context("configuring postgres pool")?)
        }
    };
    Ok(store)
}
