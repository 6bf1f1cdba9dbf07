use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::command::WriteRecord;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("database {0} does not exist")]
    DatabaseNotFound(String),

    #[error("table {db}.{table} does not exist")]
    TableNotFound { db: String, table: String },

    #[error("queries are not supported by this store")]
    QueryUnsupported,

    #[error("store backend failure: {0}")]
    Backend(String),
}

/// Result page of a query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOutput {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub column_info: Vec<ColumnInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rows: Vec<Row>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub column_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<String>,
}

/// Blocking client for a time-series backend.
///
/// The describe calls create the database or table when it does not exist.
pub trait TimeseriesStore: Send + Sync + 'static {
    fn query(&self, query: &str, next_token: Option<&str>) -> Result<QueryOutput, StoreError>;

    fn write(&self, db: &str, table: &str, records: &[WriteRecord]) -> Result<(), StoreError>;

    fn describe_database(&self, db: &str) -> Result<(), StoreError>;

    fn describe_table(&self, db: &str, table: &str) -> Result<(), StoreError>;
}

type Tables = HashMap<String, Vec<WriteRecord>>;

/// In-process store for local runs: keeps written records, cannot query.
#[derive(Debug, Default)]
pub struct MemoryStore {
    databases: Mutex<HashMap<String, Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records written to `db.table`, if the table exists.
    pub fn records(&self, db: &str, table: &str) -> Option<Vec<WriteRecord>> {
        let databases = self.databases.lock().ok()?;
        databases.get(db)?.get(table).cloned()
    }

    fn with_databases<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, Tables>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut databases = self
            .databases
            .lock()
            .map_err(|_| StoreError::Backend("store lock poisoned".to_string()))?;
        f(&mut databases)
    }
}

impl TimeseriesStore for MemoryStore {
    fn query(&self, _query: &str, _next_token: Option<&str>) -> Result<QueryOutput, StoreError> {
        Err(StoreError::QueryUnsupported)
    }

    fn write(&self, db: &str, table: &str, records: &[WriteRecord]) -> Result<(), StoreError> {
        self.with_databases(|databases| {
            let tables = databases
                .get_mut(db)
                .ok_or_else(|| StoreError::DatabaseNotFound(db.to_string()))?;
            let rows = tables.get_mut(table).ok_or_else(|| StoreError::TableNotFound {
                db: db.to_string(),
                table: table.to_string(),
            })?;
            rows.extend_from_slice(records);
            Ok(())
        })
    }

    fn describe_database(&self, db: &str) -> Result<(), StoreError> {
        self.with_databases(|databases| {
            databases.entry(db.to_string()).or_default();
            Ok(())
        })
    }

    fn describe_table(&self, db: &str, table: &str) -> Result<(), StoreError> {
        self.with_databases(|databases| {
            let tables = databases
                .get_mut(db)
                .ok_or_else(|| StoreError::DatabaseNotFound(db.to_string()))?;
            tables.entry(table.to_string()).or_default();
            Ok(())
        })
    }
}
