//! # Table Store
//!
//! Single-table record store contract. Rows are `(pk, sk, payload)` and
//! `batch_put` returns the subset rejected for retry, matching throughput-
//! throttled stores. The Postgres implementation upserts so same-key writes
//! are idempotent overwrites.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{PipelineError, Result};

/// One denormalized row: primary record or thin index projection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRow {
    pub pk: String,
    pub sk: String,
    pub payload: Value,
}

impl TableRow {
    pub fn new(pk: impl Into<String>, sk: impl Into<String>, payload: Value) -> Self {
        Self {
            pk: pk.into(),
            sk: sk.into(),
            payload,
        }
    }
}

/// Table store contract: single put plus bounded batch put returning the
/// rejected subset.
#[async_trait]
pub trait TableStore: Send + Sync {
    async fn put(&self, row: TableRow) -> Result<()>;

    /// Write up to `max_batch()` rows; returns the rows that were rejected
    /// and must be retried by the caller.
    async fn batch_put(&self, rows: Vec<TableRow>) -> Result<Vec<TableRow>>;

    /// Upper bound on `batch_put` input size.
    fn max_batch(&self) -> usize {
        25
    }
}

/// Postgres-backed single-table store
#[derive(Debug, Clone)]
pub struct PgTableStore {
    pool: PgPool,
    table_name: String,
    max_batch: usize,
}

impl PgTableStore {
    pub fn new(pool: PgPool, table_name: impl Into<String>, max_batch: usize) -> Self {
        Self {
            pool,
            table_name: table_name.into(),
            max_batch,
        }
    }

    /// Create the backing table when it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<()> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                pk TEXT NOT NULL,
                sk TEXT NOT NULL,
                payload JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (pk, sk)
            )",
            self.table_name
        );
        sqlx::query(&ddl).execute(&self.pool).await?;
        Ok(())
    }

    async fn upsert(&self, row: &TableRow) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (pk, sk, payload, updated_at)
             VALUES ($1, $2, $3, now())
             ON CONFLICT (pk, sk) DO UPDATE
             SET payload = EXCLUDED.payload, updated_at = now()",
            self.table_name
        );
        sqlx::query(&sql)
            .bind(&row.pk)
            .bind(&row.sk)
            .bind(&row.payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TableStore for PgTableStore {
    async fn put(&self, row: TableRow) -> Result<()> {
        self.upsert(&row).await
    }

    async fn batch_put(&self, rows: Vec<TableRow>) -> Result<Vec<TableRow>> {
        if rows.len() > self.max_batch {
            return Err(PipelineError::table(
                "batch_put",
                format!("batch of {} exceeds limit {}", rows.len(), self.max_batch),
            ));
        }
        let mut rejected = Vec::new();
        for row in rows {
            if let Err(err) = self.upsert(&row).await {
                debug!(pk = %row.pk, sk = %row.sk, error = %err, "row rejected, queuing for retry");
                rejected.push(row);
            }
        }
        Ok(rejected)
    }

    fn max_batch(&self) -> usize {
        self.max_batch
    }
}

/// In-memory table store for tests. Can simulate throughput throttling by
/// rejecting the first N batch rows.
#[derive(Debug, Clone, Default)]
pub struct MemoryTableStore {
    rows: Arc<RwLock<HashMap<(String, String), Value>>>,
    reject_next: Arc<RwLock<usize>>,
}

impl MemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` batch rows come back rejected.
    pub async fn reject_next(&self, count: usize) {
        *self.reject_next.write().await = count;
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }

    pub async fn get(&self, pk: &str, sk: &str) -> Option<Value> {
        self.rows
            .read()
            .await
            .get(&(pk.to_string(), sk.to_string()))
            .cloned()
    }

    /// All rows under one partition, ordered by sort key.
    pub async fn partition(&self, pk: &str) -> Vec<(String, Value)> {
        let rows = self.rows.read().await;
        let mut matched: Vec<(String, Value)> = rows
            .iter()
            .filter(|((row_pk, _), _)| row_pk == pk)
            .map(|((_, sk), payload)| (sk.clone(), payload.clone()))
            .collect();
        matched.sort_by(|a, b| a.0.cmp(&b.0));
        matched
    }
}

#[async_trait]
impl TableStore for MemoryTableStore {
    async fn put(&self, row: TableRow) -> Result<()> {
        self.rows
            .write()
            .await
            .insert((row.pk, row.sk), row.payload);
        Ok(())
    }

    async fn batch_put(&self, rows: Vec<TableRow>) -> Result<Vec<TableRow>> {
        let mut rejected = Vec::new();
        for row in rows {
            let mut budget = self.reject_next.write().await;
            if *budget > 0 {
                *budget -= 1;
                rejected.push(row);
                continue;
            }
            drop(budget);
            self.put(row).await?;
        }
        Ok(rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_store_upsert_semantics() {
        let store = MemoryTableStore::new();
        store
            .put(TableRow::new("summary", "id-1", json!({"v": 1})))
            .await
            .unwrap();
        store
            .put(TableRow::new("summary", "id-1", json!({"v": 2})))
            .await
            .unwrap();

        assert_eq!(store.len().await, 1);
        assert_eq!(store.get("summary", "id-1").await, Some(json!({"v": 2})));
    }

    #[tokio::test]
    async fn test_memory_store_rejection() {
        let store = MemoryTableStore::new();
        store.reject_next(2).await;

        let rows = vec![
            TableRow::new("a", "1", json!(1)),
            TableRow::new("a", "2", json!(2)),
            TableRow::new("a", "3", json!(3)),
        ];
        let rejected = store.batch_put(rows).await.unwrap();
        assert_eq!(rejected.len(), 2);
        assert_eq!(store.len().await, 1);

        // Retrying the rejected subset succeeds
        let rejected = store.batch_put(rejected).await.unwrap();
        assert!(rejected.is_empty());
        assert_eq!(store.len().await, 3);
    }

    #[tokio::test]
    async fn test_partition_ordering() {
        let store = MemoryTableStore::new();
        for sk in ["2024#2024-03", "2024#2024-01", "2024#2024-02"] {
            store
                .put(TableRow::new("record", sk, json!({})))
                .await
                .unwrap();
        }
        let rows = store.partition("record").await;
        let keys: Vec<&str> = rows.iter().map(|(sk, _)| sk.as_str()).collect();
        assert_eq!(keys, vec!["2024#2024-01", "2024#2024-02", "2024#2024-03"]);
    }
}
