//! PostgreSQL store: project = database, dataset = schema.
//!
//! Duplicate suppression relies on a unique index over the two columns the
//! row key is built from, so `ON CONFLICT DO NOTHING` turns a repeated key
//! into a no-op.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use wxraw_core::TableId;

use crate::{ColumnSpec, ColumnType, InsertReport, InsertRow, RowInsertError, StoreError, TableStore};

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Defers connecting until the first query, like the other backends.
    pub fn connect_lazy(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)?;
        Ok(Self { pool })
    }
}

pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn qualified(table: &TableId) -> String {
    format!("{}.{}", quote_ident(&table.dataset), quote_ident(&table.table))
}

fn column_sql(column: &ColumnSpec) -> String {
    let ty = match column.column_type {
        ColumnType::String => "TEXT",
        ColumnType::Timestamp => "TIMESTAMPTZ",
    };
    let null = if column.required { " NOT NULL" } else { "" };
    format!("{} {ty}{null}", quote_ident(column.name))
}

/// DDL for the raw table and its row-key index, in execution order.
pub fn create_table_statements(table: &TableId, schema: &[ColumnSpec]) -> Vec<String> {
    let columns = schema.iter().map(column_sql).collect::<Vec<_>>().join(", ");
    vec![
        format!("CREATE TABLE IF NOT EXISTS {} ({columns})", qualified(table)),
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} ((COALESCE(source_url, '')), fetched_at)",
            quote_ident(&format!("{}_row_key", table.table)),
            qualified(table)
        ),
    ]
}

pub fn insert_statement(table: &TableId) -> String {
    format!(
        "INSERT INTO {} (raw_json, source_url, fetched_at) VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
        qualified(table)
    )
}

#[async_trait]
impl TableStore for PostgresStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn ambient_project(&self) -> Result<String, StoreError> {
        let row = sqlx::query("SELECT current_database() AS name")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("name")?)
    }

    async fn dataset_exists(&self, _project: &str, dataset: &str) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM information_schema.schemata WHERE schema_name = $1
            ) AS present
            "#,
        )
        .bind(dataset)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("present")?)
    }

    async fn create_dataset_if_absent(&self, _project: &str, dataset: &str) -> Result<(), StoreError> {
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(dataset)))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn table_exists(&self, table: &TableId) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1
                  FROM information_schema.tables
                 WHERE table_schema = $1
                   AND table_name = $2
            ) AS present
            "#,
        )
        .bind(&table.dataset)
        .bind(&table.table)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("present")?)
    }

    async fn create_table_if_absent(
        &self,
        table: &TableId,
        schema: &[ColumnSpec],
    ) -> Result<(), StoreError> {
        for statement in create_table_statements(table, schema) {
            sqlx::query(&statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn insert_rows(&self, table: &TableId, rows: &[InsertRow]) -> Result<InsertReport, StoreError> {
        let sql = insert_statement(table);
        let mut report = InsertReport::default();

        for (index, row) in rows.iter().enumerate() {
            let result = sqlx::query(&sql)
                .bind(&row.record.raw_json)
                .bind(row.record.provenance.as_column())
                .bind(row.record.fetched_at)
                .execute(&self.pool)
                .await;

            match result {
                Ok(done) if done.rows_affected() == 0 => report.deduplicated += 1,
                Ok(_) => {}
                // Constraint and type errors belong to the row; anything else is the connection.
                Err(sqlx::Error::Database(db_err)) => report.errors.push(RowInsertError {
                    index,
                    reason: db_err.message().to_string(),
                }),
                Err(err) => return Err(err.into()),
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RAW_TABLE_SCHEMA;
    use chrono::{TimeZone, Utc};
    use wxraw_core::{IngestRecord, Provenance};

    #[test]
    fn identifiers_are_quoted_and_escaped() {
        assert_eq!(quote_ident("raw_data"), "\"raw_data\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn ddl_matches_three_column_schema() {
        let table = TableId::new("wx", "raw_data", "weather_raw");
        let statements = create_table_statements(&table, &RAW_TABLE_SCHEMA);
        assert_eq!(
            statements[0],
            "CREATE TABLE IF NOT EXISTS \"raw_data\".\"weather_raw\" (\"raw_json\" TEXT NOT NULL, \"source_url\" TEXT, \"fetched_at\" TIMESTAMPTZ NOT NULL)"
        );
        assert!(statements[1].starts_with("CREATE UNIQUE INDEX IF NOT EXISTS \"weather_raw_row_key\""));
        assert!(statements[1].contains("COALESCE(source_url, '')"));
    }

    #[test]
    fn inserts_ignore_conflicts() {
        let sql = insert_statement(&TableId::new("wx", "raw_data", "weather_raw"));
        assert!(sql.ends_with("ON CONFLICT DO NOTHING"));
        assert!(sql.contains("\"raw_data\".\"weather_raw\""));
    }
    /// Runs against a live server only when `DATABASE_URL` is set.
    #[tokio::test]
    async fn repeated_row_key_is_deduplicated_by_the_unique_index() {
        let Ok(database_url) = std::env::var("DATABASE_URL") else {
            return;
        };
        let store = PostgresStore::connect_lazy(&database_url).unwrap();
        let schema = format!("wxraw_test_{}", Utc::now().timestamp_micros());
        let table = TableId::new("ignored", schema.clone(), "weather_raw");

        store.create_dataset_if_absent("ignored", &schema).await.unwrap();
        store.create_table_if_absent(&table, &RAW_TABLE_SCHEMA).await.unwrap();
        assert!(store.table_exists(&table).await.unwrap());

        let fetched_at = Utc.with_ymd_and_hms(2024, 1, 16, 3, 0, 0).single().unwrap();
        let payload = serde_json::json!({"ok": true});
        let row = |provenance: Provenance| {
            InsertRow::new(IngestRecord::from_payload(&payload, provenance, fetched_at).unwrap())
        };
        let url = Provenance::Url("https://api.example/history.json?q=x&dt=2024-01-15".into());

        let first = store.insert_rows(&table, &[row(url.clone())]).await.unwrap();
        let second = store.insert_rows(&table, &[row(url)]).await.unwrap();
        let unknown_first = store.insert_rows(&table, &[row(Provenance::Unknown)]).await.unwrap();
        let unknown_second = store.insert_rows(&table, &[row(Provenance::Unknown)]).await.unwrap();

        sqlx::query(&format!("DROP SCHEMA {} CASCADE", quote_ident(&schema)))
            .execute(&store.pool)
            .await
            .unwrap();

        assert!(first.errors.is_empty() && second.errors.is_empty());
        assert_eq!(first.deduplicated, 0);
        assert_eq!(second.deduplicated, 1);
        assert_eq!(unknown_first.deduplicated, 0);
        assert_eq!(unknown_second.deduplicated, 1);
    }
}
