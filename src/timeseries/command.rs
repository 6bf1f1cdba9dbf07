use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::handler::CommandError;

/// A decoded worker request, discriminated by its `type` field.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Query {
        data: String,
        #[serde(rename = "nextToken", default)]
        next_token: Option<String>,
    },
    Write {
        db: String,
        table: String,
        records: Vec<WriteRecord>,
    },
    DescribeDb {
        db: String,
    },
    DescribeTable {
        db: String,
        table: String,
    },
}

impl Command {
    pub fn from_value(value: Value) -> Result<Self, CommandError> {
        serde_json::from_value(value)
            .map_err(|e| CommandError::new(format!("Cannot decode request: {}", e)))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Command::Query { .. } => "query",
            Command::Write { .. } => "write",
            Command::DescribeDb { .. } => "describe_db",
            Command::DescribeTable { .. } => "describe_table",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteRecord {
    pub dimensions: Vec<RecordDimension>,
    pub measure_name: String,
    pub measure_value: String,
    /// e.g. `DOUBLE`
    #[serde(rename = "measureType")]
    pub measure_value_type: String,
    pub time: String,
    /// e.g. `MILLISECONDS`
    pub time_unit: String,
    /// Any JSON number; fractional versions are kept as sent.
    pub version: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordDimension {
    pub name: String,
    pub value: String,
}
