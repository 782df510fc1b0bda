//! The persistence collaborator
//!
//! Callbacks yield rows; the engine forwards them to whatever [`Storage`]
//! the embedding process configured. The engine itself never interprets row
//! contents, so rows are plain JSON objects.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

/// One extracted record.
pub type Row = Map<String, Value>;

/// Seam between the engine and durable storage.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Insert rows into `table`, returning how many were written.
    async fn insert(&self, rows: &[Row], table: &str) -> anyhow::Result<u64>;

    /// Update rows matching `condition` in `table`, returning how many
    /// changed.
    async fn update(&self, row: &Row, condition: &Row, table: &str) -> anyhow::Result<u64>;
}

/// Storage that logs and drops everything, for dry runs and tests.
#[derive(Debug, Default)]
pub struct NullStorage;

#[async_trait]
impl Storage for NullStorage {
    async fn insert(&self, rows: &[Row], table: &str) -> anyhow::Result<u64> {
        debug!(table, rows = rows.len(), "discarding rows");
        Ok(rows.len() as u64)
    }

    async fn update(&self, _row: &Row, _condition: &Row, table: &str) -> anyhow::Result<u64> {
        debug!(table, "discarding update");
        Ok(0)
    }
}
