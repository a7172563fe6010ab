// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0
//! # PostgreSQL Config Store
//!
//! `ConfigStore` backed by a single `config_rows` table:
//!
//! ```sql
//! CREATE TABLE config_rows (
//!     tbl  TEXT   NOT NULL,
//!     id   BIGINT NOT NULL,
//!     data JSONB  NOT NULL,
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     PRIMARY KEY (tbl, id)
//! );
//! ```
//!
//! Row ids are allocated inside the inserting transaction as
//! `MAX(id) + 1` per table under a table-scoped advisory lock.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgPool;
use sqlx::Row;

use super::merge_row;
use crate::domain::repository::{ConfigStore, StoreError};

pub struct PostgresConfigStore {
    pool: PgPool,
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

impl PostgresConfigStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the backing table when missing.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS config_rows (
                tbl TEXT NOT NULL,
                id BIGINT NOT NULL,
                data JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (tbl, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for PostgresConfigStore {
    async fn list(&self, table: &str) -> Result<Vec<Value>, StoreError> {
        let rows = sqlx::query("SELECT data FROM config_rows WHERE tbl = $1 ORDER BY id")
            .bind(table)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter()
            .map(|row| row.try_get::<Value, _>("data").map_err(db_err))
            .collect()
    }

    async fn get(&self, table: &str, id: i64) -> Result<Option<Value>, StoreError> {
        let row = sqlx::query("SELECT data FROM config_rows WHERE tbl = $1 AND id = $2")
            .bind(table)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| r.try_get::<Value, _>("data").map_err(db_err))
            .transpose()
    }

    async fn insert(&self, table: &str, mut row: Value) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(table)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let object = row.as_object_mut().ok_or(StoreError::NotAnObject)?;
        let id = match object.get("id").and_then(Value::as_i64) {
            Some(id) => id,
            None => {
                let next: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(id), 0) + 1 FROM config_rows WHERE tbl = $1")
                    .bind(table)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(db_err)?;
                next
            }
        };
        object.insert("id".to_string(), Value::from(id));

        sqlx::query("INSERT INTO config_rows (tbl, id, data) VALUES ($1, $2, $3)")
            .bind(table)
            .bind(id)
            .bind(&row)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(id)
    }

    async fn upsert(&self, table: &str, id: i64, mut row: Value) -> Result<(), StoreError> {
        row.as_object_mut()
            .ok_or(StoreError::NotAnObject)?
            .insert("id".to_string(), Value::from(id));
        sqlx::query(
            r#"
            INSERT INTO config_rows (tbl, id, data, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (tbl, id) DO UPDATE SET
                data = EXCLUDED.data,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(table)
        .bind(id)
        .bind(&row)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn update(&self, table: &str, id: i64, changes: Value) -> Result<Value, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let current = sqlx::query("SELECT data FROM config_rows WHERE tbl = $1 AND id = $2 FOR UPDATE")
            .bind(table)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StoreError::NotFound {
                table: table.to_string(),
                id,
            })?;
        let mut row: Value = current.try_get("data").map_err(db_err)?;
        merge_row(&mut row, changes)?;

        sqlx::query("UPDATE config_rows SET data = $3, updated_at = NOW() WHERE tbl = $1 AND id = $2")
            .bind(table)
            .bind(id)
            .bind(&row)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(row)
    }

    async fn delete(&self, table: &str, id: i64) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM config_rows WHERE tbl = $1 AND id = $2")
            .bind(table)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                table: table.to_string(),
                id,
            });
        }
        Ok(())
    }
}
