// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0
//! # Config Store Interface
//!
//! Persistence contract for the configuration database. Rows are JSON
//! objects with an integer `id`, grouped into named tables
//! (`account.user`, `core.jobs`, ...). Filtering happens above the store
//! with the query DSL; the store only lists, fetches and writes rows.
//!
//! | Implementation | Backend |
//! |----------------|---------|
//! | `InMemoryConfigStore` | `RwLock<HashMap>` (development, tests) |
//! | `PostgresConfigStore` | one JSONB table keyed by `(tbl, id)` |
//!
//! The implementation is selected at daemon startup from `spec.database`.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// All rows of a table, ordered by id.
    async fn list(&self, table: &str) -> Result<Vec<Value>, StoreError>;

    async fn get(&self, table: &str, id: i64) -> Result<Option<Value>, StoreError>;

    /// Insert a row, assigning the next id when the row has none. Returns the id.
    async fn insert(&self, table: &str, row: Value) -> Result<i64, StoreError>;

    /// Insert or replace the row with the given id.
    async fn upsert(&self, table: &str, id: i64, row: Value) -> Result<(), StoreError>;

    /// Merge `changes` into an existing row.
    async fn update(&self, table: &str, id: i64, changes: Value) -> Result<Value, StoreError>;

    async fn delete(&self, table: &str, id: i64) -> Result<(), StoreError>;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Row {id} not found in {table}")]
    NotFound { table: String, id: i64 },

    #[error("Row is not a JSON object")]
    NotAnObject,

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<StoreError> for crate::domain::error::CallError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { table, id } => {
                Self::MatchNotFound(format!("{} {} does not exist", table, id))
            }
            StoreError::NotAnObject => Self::invalid("Row is not a JSON object"),
            other => Self::internal(other),
        }
    }
}
