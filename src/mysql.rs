//! MySQL network backend.

use crate::engine::{ConnectionParams, Dialect, EngineProvider, Row, RowSet, StorageEngine};
use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::{Column, Row as _};
use tracing::debug;

pub struct MySqlEngine {
    pool: MySqlPool,
}

impl MySqlEngine {
    /// Connects to a MySQL server. Mandatory parameters: `hostname`,
    /// `username`, `password`, `database`; `port` defaults to 3306.
    ///
    /// Single-connection pool for the same reason as the SQLite backend:
    /// transaction statements must share one session.
    pub async fn create_connection(params: &ConnectionParams) -> Result<Self> {
        let hostname = params.require("hostname")?;
        let username = params.require("username")?;
        let password = params.require("password")?;
        let database = params.require("database")?;
        let port = params.get("port").unwrap_or("3306");

        let url = format!(
            "mysql://{}:{}@{}:{}/{}",
            username, password, hostname, port, database
        );
        let pool = MySqlPoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await?;

        Ok(Self { pool })
    }

    fn convert_row(row: &MySqlRow) -> Row {
        let mut out = Row::new();
        for column in row.columns() {
            let name = column.name();
            if let Ok(Some(value)) = row.try_get::<Option<String>, _>(name) {
                out.insert(name.to_string(), Value::String(value));
            } else if let Ok(Some(value)) = row.try_get::<Option<i64>, _>(name) {
                out.insert(name.to_string(), Value::Number(value.into()));
            } else if let Ok(Some(value)) = row.try_get::<Option<i32>, _>(name) {
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
impl StorageEngine for MySqlEngine {
    async fn execute(&mut self, sql: &str) -> Result<u64> {
        debug!(target: "relmap::mysql", sql, "execute");
        let result = sqlx::query(sql).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn fetch(&mut self, sql: &str) -> Result<RowSet> {
        debug!(target: "relmap::mysql", sql, "fetch");
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(Self::convert_row).collect())
    }

    async fn table_exists(&mut self, table: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM information_schema.tables \
             WHERE table_schema = DATABASE() AND table_name = ?",
        )
        .bind(table)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("n") > 0)
    }

    async fn table_columns(&mut self, table: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT column_name FROM information_schema.columns \
             WHERE table_schema = DATABASE() AND table_name = ? \
             ORDER BY ordinal_position",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| row.get::<String, _>("column_name"))
            .collect())
    }

    async fn add_column(&mut self, table: &str, column_ddl: &str) -> Result<u64> {
        self.execute(&format!("ALTER TABLE {} ADD COLUMN {}", table, column_ddl))
            .await
    }

    fn dialect(&self) -> Dialect {
        Dialect::Mysql
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

/// Factory registered under the `mysql` engine name.
pub struct MySqlProvider;

#[async_trait]
impl EngineProvider for MySqlProvider {
    async fn create_connection(&self, params: &ConnectionParams) -> Result<Box<dyn StorageEngine>> {
        Ok(Box::new(MySqlEngine::create_connection(params).await?))
    }
}
