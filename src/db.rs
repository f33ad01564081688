//! Database collaborator used by SQL steps and SQL preludes.

use crate::variables::VariableMapping;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};

/// One result row, column name to value.
pub type Row = Map<String, Value>;

/// An open connection.
#[async_trait]
pub trait Database: Send + Sync {
    async fn fetch_all(&self, statement: &str) -> Result<Vec<Row>>;
}

/// Opens connections from connection strings found in the environment.
#[async_trait]
pub trait DatabaseConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn Database>>;
}

/// Merge each row's columns into `target`; later rows overwrite
/// earlier ones.
pub fn merge_rows(rows: &[Row], target: &mut VariableMapping) {
    for row in rows {
        for (column, value) in row {
            target.insert(column.clone(), value.clone());
        }
    }
}
