//! In-process table store. Deduplicates by row key and counts every call.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use wxraw_core::TableId;

use crate::{ColumnSpec, InsertReport, InsertRow, RowInsertError, StoreError, TableStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    pub row_key: String,
    pub raw_json: String,
    pub source_url: Option<String>,
    pub fetched_at: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCallCounts {
    pub ambient_project_calls: usize,
    pub dataset_checks: usize,
    pub dataset_creates: usize,
    pub table_checks: usize,
    pub table_creates: usize,
    pub insert_calls: usize,
}

#[derive(Debug, Default)]
struct Counters {
    ambient_project_calls: AtomicUsize,
    dataset_checks: AtomicUsize,
    dataset_creates: AtomicUsize,
    table_checks: AtomicUsize,
    table_creates: AtomicUsize,
    insert_calls: AtomicUsize,
}

#[derive(Debug, Default)]
struct MemoryState {
    datasets: BTreeSet<(String, String)>,
    tables: HashMap<String, TableRows>,
}

#[derive(Debug, Default)]
struct TableRows {
    keys: HashSet<String>,
    rows: Vec<StoredRow>,
}

#[derive(Debug)]
pub struct MemoryStore {
    project: String,
    state: Mutex<MemoryState>,
    counters: Counters,
    fail_table_creates: AtomicBool,
    insert_rejection: std::sync::RwLock<Option<String>>,
}

impl MemoryStore {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            state: Mutex::new(MemoryState::default()),
            counters: Counters::default(),
            fail_table_creates: AtomicBool::new(false),
            insert_rejection: std::sync::RwLock::new(None),
        }
    }

    pub fn call_counts(&self) -> StoreCallCounts {
        let c = &self.counters;
        StoreCallCounts {
            ambient_project_calls: c.ambient_project_calls.load(Ordering::SeqCst),
            dataset_checks: c.dataset_checks.load(Ordering::SeqCst),
            dataset_creates: c.dataset_creates.load(Ordering::SeqCst),
            table_checks: c.table_checks.load(Ordering::SeqCst),
            table_creates: c.table_creates.load(Ordering::SeqCst),
            insert_calls: c.insert_calls.load(Ordering::SeqCst),
        }
    }

    /// Simulates a permission failure on table creation.
    pub fn fail_table_creates(&self, fail: bool) {
        self.fail_table_creates.store(fail, Ordering::SeqCst);
    }

    /// Makes every inserted row come back with this per-row error.
    pub fn reject_inserts(&self, reason: Option<&str>) {
        if let Ok(mut slot) = self.insert_rejection.write() {
            *slot = reason.map(str::to_string);
        }
    }

    pub async fn rows(&self, table: &TableId) -> Vec<StoredRow> {
        self.state
            .lock()
            .await
            .tables
            .get(&table.to_string())
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    fn insert_rejection(&self) -> Option<String> {
        self.insert_rejection.read().ok().and_then(|slot| slot.clone())
    }
}

#[async_trait]
impl TableStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn ambient_project(&self) -> Result<String, StoreError> {
        self.counters.ambient_project_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.project.clone())
    }

    async fn dataset_exists(&self, project: &str, dataset: &str) -> Result<bool, StoreError> {
        self.counters.dataset_checks.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().await;
        Ok(state
            .datasets
            .contains(&(project.to_string(), dataset.to_string())))
    }

    async fn create_dataset_if_absent(&self, project: &str, dataset: &str) -> Result<(), StoreError> {
        self.counters.dataset_creates.fetch_add(1, Ordering::SeqCst);
        self.state
            .lock()
            .await
            .datasets
            .insert((project.to_string(), dataset.to_string()));
        Ok(())
    }

    async fn table_exists(&self, table: &TableId) -> Result<bool, StoreError> {
        self.counters.table_checks.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.lock().await.tables.contains_key(&table.to_string()))
    }

    async fn create_table_if_absent(
        &self,
        table: &TableId,
        _schema: &[ColumnSpec],
    ) -> Result<(), StoreError> {
        self.counters.table_creates.fetch_add(1, Ordering::SeqCst);
        if self.fail_table_creates.load(Ordering::SeqCst) {
            return Err(StoreError::Message(format!(
                "permission denied creating {table}"
            )));
        }
        let mut state = self.state.lock().await;
        if !state
            .datasets
            .contains(&(table.project.clone(), table.dataset.clone()))
        {
            return Err(StoreError::Message(format!(
                "dataset {}.{} not found",
                table.project, table.dataset
            )));
        }
        state.tables.entry(table.to_string()).or_default();
        Ok(())
    }

    async fn insert_rows(&self, table: &TableId, rows: &[InsertRow]) -> Result<InsertReport, StoreError> {
        self.counters.insert_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(reason) = self.insert_rejection() {
            return Ok(InsertReport {
                errors: (0..rows.len())
                    .map(|index| RowInsertError {
                        index,
                        reason: reason.clone(),
                    })
                    .collect(),
                deduplicated: 0,
            });
        }

        let mut state = self.state.lock().await;
        let target = state
            .tables
            .get_mut(&table.to_string())
            .ok_or_else(|| StoreError::Message(format!("table {table} not found")))?;

        let mut report = InsertReport::default();
        for row in rows {
            if !target.keys.insert(row.row_key.as_str().to_string()) {
                report.deduplicated += 1;
                continue;
            }
            target.rows.push(StoredRow {
                row_key: row.row_key.as_str().to_string(),
                raw_json: row.record.raw_json.clone(),
                source_url: row.record.provenance.as_column().map(str::to_string),
                fetched_at: row.record.fetched_at_string(),
            });
        }
        Ok(report)
    }
}
