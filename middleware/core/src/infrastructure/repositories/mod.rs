// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0

//! Config Store Implementations
//!
//! Infrastructure implementations of [`crate::domain::repository::ConfigStore`].
//!
//! - **InMemoryConfigStore** - `RwLock<HashMap>` tables, used for development,
//!   tests, and when `spec.database` is absent
//! - **PostgresConfigStore** - one JSONB table keyed by `(tbl, id)`
//!
//! # Usage
//!
//! ```no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use middlewared_core::infrastructure::db::Database;
//! use middlewared_core::infrastructure::repositories::PostgresConfigStore;
//!
//! let db = Database::new("postgres://localhost/middleware", 5).await?;
//! let store = PostgresConfigStore::new(db.get_pool().clone());
//! store.migrate().await?;
//! # Ok(())
//! # }
//! ```

pub mod postgres;

pub use postgres::PostgresConfigStore;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use crate::domain::repository::{ConfigStore, StoreError};

/// Merge `changes` into `row` key by key. Both must be objects.
pub(crate) fn merge_row(row: &mut Value, changes: Value) -> Result<(), StoreError> {
    let (Value::Object(target), Value::Object(changes)) = (row, changes) else {
        return Err(StoreError::NotAnObject);
    };
    for (key, value) in changes {
        if key != "id" {
            target.insert(key, value);
        }
    }
    Ok(())
}

#[derive(Clone, Default)]
pub struct InMemoryConfigStore {
    tables: Arc<RwLock<HashMap<String, BTreeMap<i64, Value>>>>,
}

impl InMemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> StoreError {
        StoreError::Database("config store lock poisoned".to_string())
    }
}

#[async_trait]
impl ConfigStore for InMemoryConfigStore {
    async fn list(&self, table: &str) -> Result<Vec<Value>, StoreError> {
        let tables = self.tables.read().map_err(|_| Self::poisoned())?;
        Ok(tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get(&self, table: &str, id: i64) -> Result<Option<Value>, StoreError> {
        let tables = self.tables.read().map_err(|_| Self::poisoned())?;
        Ok(tables.get(table).and_then(|rows| rows.get(&id)).cloned())
    }

    async fn insert(&self, table: &str, mut row: Value) -> Result<i64, StoreError> {
        let mut tables = self.tables.write().map_err(|_| Self::poisoned())?;
        let rows = tables.entry(table.to_string()).or_default();
        let object = row.as_object_mut().ok_or(StoreError::NotAnObject)?;
        let id = match object.get("id").and_then(Value::as_i64) {
            Some(id) => id,
            None => rows.keys().next_back().copied().unwrap_or(0) + 1,
        };
        object.insert("id".to_string(), Value::from(id));
        rows.insert(id, row);
        Ok(id)
    }

    async fn upsert(&self, table: &str, id: i64, mut row: Value) -> Result<(), StoreError> {
        let object = row.as_object_mut().ok_or(StoreError::NotAnObject)?;
        object.insert("id".to_string(), Value::from(id));
        let mut tables = self.tables.write().map_err(|_| Self::poisoned())?;
        tables.entry(table.to_string()).or_default().insert(id, row);
        Ok(())
    }

    async fn update(&self, table: &str, id: i64, changes: Value) -> Result<Value, StoreError> {
        let mut tables = self.tables.write().map_err(|_| Self::poisoned())?;
        let row = tables
            .get_mut(table)
            .and_then(|rows| rows.get_mut(&id))
            .ok_or_else(|| StoreError::NotFound {
                table: table.to_string(),
                id,
            })?;
        merge_row(row, changes)?;
        Ok(row.clone())
    }

    async fn delete(&self, table: &str, id: i64) -> Result<(), StoreError> {
        let mut tables = self.tables.write().map_err(|_| Self::poisoned())?;
        tables
            .get_mut(table)
            .and_then(|rows| rows.remove(&id))
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound {
                table: table.to_string(),
                id,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_insert_assigns_sequential_ids() {
        let store = InMemoryConfigStore::new();
        let a = store.insert("account.user", json!({"username": "a"})).await.unwrap();
        let b = store.insert("account.user", json!({"username": "b"})).await.unwrap();
        assert_eq!((a, b), (1, 2));
        let rows = store.list("account.user").await.unwrap();
        assert_eq!(rows[1], json!({"id": 2, "username": "b"}));
    }

    #[tokio::test]
    async fn test_update_merges_and_keeps_id() {
        let store = InMemoryConfigStore::new();
        let id = store.insert("t", json!({"a": 1, "b": 2})).await.unwrap();
        let row = store.update("t", id, json!({"b": 3, "id": 99})).await.unwrap();
        assert_eq!(row, json!({"id": 1, "a": 1, "b": 3}));
    }

    #[tokio::test]
    async fn test_missing_rows_are_not_found() {
        let store = InMemoryConfigStore::new();
        assert!(matches!(
            store.update("t", 5, json!({})).await,
            Err(StoreError::NotFound { id: 5, .. })
        ));
        assert!(matches!(store.delete("t", 5).await, Err(StoreError::NotFound { .. })));
        assert_eq!(store.get("t", 5).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_upsert_replaces() {
        let store = InMemoryConfigStore::new();
        store.upsert("core.jobs", 7, json!({"state": "RUNNING"})).await.unwrap();
        store.upsert("core.jobs", 7, json!({"state": "SUCCESS"})).await.unwrap();
        let row = store.get("core.jobs", 7).await.unwrap().unwrap();
        assert_eq!(row, json!({"id": 7, "state": "SUCCESS"}));
    }
}
