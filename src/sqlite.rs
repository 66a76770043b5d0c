//! Embedded SQLite backend, the reference storage engine.

use crate::engine::{ConnectionParams, Dialect, EngineProvider, Row, RowSet, StorageEngine};
use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row as _};
use std::str::FromStr;
use tracing::debug;

pub struct SqliteEngine {
    pool: SqlitePool,
}

impl SqliteEngine {
    /// Opens a SQLite database. The mandatory `path` parameter names the
    /// database file; `:memory:` opens an in-memory database.
    ///
    /// The pool is pinned to a single connection: a storage engine value is
    /// one logical connection, and BEGIN/COMMIT issued as plain statements
    /// must land on the same session.
    pub async fn create_connection(params: &ConnectionParams) -> Result<Self> {
        let path = params.require("path")?;
        let url = if path == ":memory:" {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}", path)
        };

        let options = SqliteConnectOptions::from_str(&url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// In-memory database, used by the test suite.
    pub async fn memory() -> Result<Self> {
        Self::create_connection(&ConnectionParams::new().set("path", ":memory:")).await
    }

    fn convert_row(row: &SqliteRow) -> Row {
        let mut out = Row::new();
        for column in row.columns() {
            let name = column.name();
            if let Ok(Some(value)) = row.try_get::<Option<String>, _>(name) {
                out.insert(name.to_string(), Value::String(value));
            } else if let Ok(Some(value)) = row.try_get::<Option<i64>, _>(name) {
                out.insert(name.to_string(), Value::Number(value.into()));
            } else if let Ok(Some(value)) = row.try_get::<Option<f64>, _>(name) {
                if let Some(num) = serde_json::Number::from_f64(value) {
                    out.insert(name.to_string(), Value::Number(num));
                }
            } else if let Ok(Some(value)) = row.try_get::<Option<bool>, _>(name) {
                out.insert(name.to_string(), Value::Bool(value));
            } else {
                out.insert(name.to_string(), Value::Null);
            }
        }
        out
    }
}

#[async_trait]
impl StorageEngine for SqliteEngine {
    async fn execute(&mut self, sql: &str) -> Result<u64> {
        debug!(target: "relmap::sqlite", sql, "execute");
        let result = sqlx::query(sql).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn fetch(&mut self, sql: &str) -> Result<RowSet> {
        debug!(target: "relmap::sqlite", sql, "fetch");
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(Self::convert_row).collect())
    }

    async fn table_exists(&mut self, table: &str) -> Result<bool> {
        let row =
            sqlx::query("SELECT COUNT(*) AS n FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(table)
                .fetch_one(&self.pool)
                .await?;
        Ok(row.get::<i64, _>("n") > 0)
    }

    async fn table_columns(&mut self, table: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(&format!("PRAGMA table_info({})", table))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| row.get::<String, _>("name"))
            .collect())
    }

    async fn add_column(&mut self, table: &str, column_ddl: &str) -> Result<u64> {
        self.execute(&format!("ALTER TABLE {} ADD COLUMN {}", table, column_ddl))
            .await
    }

    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

/// Factory registered under the `sqlite` engine name.
pub struct SqliteProvider;

#[async_trait]
impl EngineProvider for SqliteProvider {
    async fn create_connection(&self, params: &ConnectionParams) -> Result<Box<dyn StorageEngine>> {
        Ok(Box::new(SqliteEngine::create_connection(params).await?))
    }
}
