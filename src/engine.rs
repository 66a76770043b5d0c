//! Storage engine adapter boundary: the trait concrete backends implement,
//! the tabular row model, connection parameters, and the named engine
//! registry resolved at startup.

use crate::error::{OrmError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

/// Row from a query result.
#[derive(Debug, Clone, Default)]
pub struct Row {
    pub columns: HashMap<String, Value>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: String, value: Value) {
        self.columns.insert(key, value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.columns.get(key)
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.columns
            .get(key)
            .and_then(|v| v.as_str().map(String::from))
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.columns.get(key).and_then(|v| v.as_i64())
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.columns.get(key).and_then(|v| v.as_f64())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.columns.get(key).and_then(|v| v.as_bool())
    }
}

/// Result of a query.
pub type RowSet = Vec<Row>;

/// SQL dialect hints for backend-specific statement shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Mysql,
}

/// Contract implemented by pluggable storage backends. The core never
/// depends on a concrete engine; all I/O blocks at this boundary.
#[async_trait]
pub trait StorageEngine: Send {
    /// Execute a statement with no result rows; returns affected row count.
    async fn execute(&mut self, sql: &str) -> Result<u64>;

    /// Execute a query and return its rows.
    async fn fetch(&mut self, sql: &str) -> Result<RowSet>;

    /// Whether a physical table exists.
    async fn table_exists(&mut self, table: &str) -> Result<bool>;

    /// Physical column names of a table, declaration order.
    async fn table_columns(&mut self, table: &str) -> Result<Vec<String>>;

    /// ALTER the table to add one column (rendered column DDL).
    async fn add_column(&mut self, table: &str, column_ddl: &str) -> Result<u64>;

    fn dialect(&self) -> Dialect;

    async fn close(self: Box<Self>) -> Result<()>;
}

/// Connection parameter map. Mandatory keys are enforced per backend via
/// `require`, which surfaces the missing key by name.
#[derive(Debug, Clone, Default)]
pub struct ConnectionParams {
    values: HashMap<String, String>,
}

impl ConnectionParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| OrmError::MissingProperty(key.to_string()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ConnectionParams {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Factory side of a storage backend, registered under an engine name.
#[async_trait]
pub trait EngineProvider: Send + Sync {
    async fn create_connection(&self, params: &ConnectionParams) -> Result<Box<dyn StorageEngine>>;
}

/// Explicit registry of named storage engine implementations, resolved at
/// startup. Hot-swapping backends is a supervisor concern, not the core's.
#[derive(Default)]
pub struct EngineRegistry {
    providers: HashMap<String, Box<dyn EngineProvider>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the compiled-in backends.
    pub fn with_defaults() -> Self {
        #[allow(unused_mut)]
        let mut registry = Self::new();
        #[cfg(feature = "sqlite")]
        registry.register("sqlite", Box::new(crate::sqlite::SqliteProvider));
        #[cfg(feature = "mysql")]
        registry.register("mysql", Box::new(crate::mysql::MySqlProvider));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, provider: Box<dyn EngineProvider>) {
        self.providers.insert(name.into(), provider);
    }

    pub fn engines(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }

    pub async fn create_connection(
        &self,
        engine: &str,
        params: &ConnectionParams,
    ) -> Result<Box<dyn StorageEngine>> {
        let provider = self
            .providers
            .get(engine)
            .ok_or_else(|| OrmError::Connection(format!("no storage engine named {}", engine)))?;
        provider.create_connection(params).await
    }
}

impl std::fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRegistry")
            .field("engines", &self.engines())
            .finish()
    }
}
