//! Storage abstraction for exported patient rows.
//!
//! The [`RecordStore`] trait is the narrow contract the exporter needs: read
//! the current keys with their stored versions, query rows by filename, and
//! apply a reconciliation plan atomically. Two implementations are
//! provided: [`SqliteStore`] over the `patients_info` table and
//! [`InMemoryStore`] for tests and embedding.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::export::ExportPlan;
use crate::models::IndexedRow;
use crate::schema::PatientRecord;

/// What the exporter compares against to decide whether a row changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredVersion {
    pub record_hash: String,
    pub content_fingerprint: String,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Every stored filename mapped to its record hash and source fingerprint.
    async fn stored_versions(&self) -> Result<BTreeMap<String, StoredVersion>>;

    async fn get(&self, filename: &str) -> Result<Option<IndexedRow>>;

    /// All rows, ordered by filename.
    async fn list(&self) -> Result<Vec<IndexedRow>>;

    /// Apply every upsert and delete in `plan`, or none of them.
    async fn apply(&self, plan: &ExportPlan, exported_at: i64) -> Result<()>;
}

/// In-memory store; `apply` builds the next state and swaps it in under a
/// single write lock.
#[derive(Default)]
pub struct InMemoryStore {
    rows: RwLock<BTreeMap<String, IndexedRow>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn stored_versions(&self) -> Result<BTreeMap<String, StoredVersion>> {
        let rows = self.rows.read().unwrap_or_else(|e| e.into_inner());
        Ok(rows
            .iter()
            .map(|(k, row)| {
                (
                    k.clone(),
                    StoredVersion {
                        record_hash: row.record_hash.clone(),
                        content_fingerprint: row.content_fingerprint.clone(),
                    },
                )
            })
            .collect())
    }

    async fn get(&self, filename: &str) -> Result<Option<IndexedRow>> {
        let rows = self.rows.read().unwrap_or_else(|e| e.into_inner());
        Ok(rows.get(filename).cloned())
    }

    async fn list(&self) -> Result<Vec<IndexedRow>> {
        let rows = self.rows.read().unwrap_or_else(|e| e.into_inner());
        Ok(rows.values().cloned().collect())
    }

    async fn apply(&self, plan: &ExportPlan, exported_at: i64) -> Result<()> {
        let mut rows = self.rows.write().unwrap_or_else(|e| e.into_inner());
        let mut next = rows.clone();
        for filename in &plan.deletes {
            next.remove(filename);
        }
        for upsert in &plan.upserts {
            next.insert(
                upsert.filename.clone(),
                IndexedRow {
                    filename: upsert.filename.clone(),
                    patient_info: upsert.record.clone(),
                    content_fingerprint: upsert.content_fingerprint.clone(),
                    record_hash: upsert.record_hash.clone(),
                    exported_at,
                },
            );
        }
        *rows = next;
        Ok(())
    }
}

/// SQLite implementation over the `patients_info` table.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn row_to_indexed(row: &sqlx::sqlite::SqliteRow) -> Result<IndexedRow> {
    let filename: String = row.get("filename");
    let json: String = row.get("patient_info");
    let patient_info: PatientRecord = serde_json::from_str(&json)
        .with_context(|| format!("stored record for '{}' is not valid", filename))?;
    Ok(IndexedRow {
        filename,
        patient_info,
        content_fingerprint: row.get("content_fingerprint"),
        record_hash: row.get("record_hash"),
        exported_at: row.get("exported_at"),
    })
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn stored_versions(&self) -> Result<BTreeMap<String, StoredVersion>> {
        let rows =
            sqlx::query("SELECT filename, record_hash, content_fingerprint FROM patients_info")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .iter()
            .map(|row| {
                (
                    row.get::<String, _>("filename"),
                    StoredVersion {
                        record_hash: row.get("record_hash"),
                        content_fingerprint: row.get("content_fingerprint"),
                    },
                )
            })
            .collect())
    }

    async fn get(&self, filename: &str) -> Result<Option<IndexedRow>> {
        let row = sqlx::query(
            "SELECT filename, patient_info, content_fingerprint, record_hash, exported_at \
             FROM patients_info WHERE filename = ?",
        )
        .bind(filename)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_indexed).transpose()
    }

    async fn list(&self) -> Result<Vec<IndexedRow>> {
        let rows = sqlx::query(
            "SELECT filename, patient_info, content_fingerprint, record_hash, exported_at \
             FROM patients_info ORDER BY filename ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_indexed).collect()
    }

    async fn apply(&self, plan: &ExportPlan, exported_at: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for filename in &plan.deletes {
            sqlx::query("DELETE FROM patients_info WHERE filename = ?")
                .bind(filename)
                .execute(&mut *tx)
                .await?;
        }

        for upsert in &plan.upserts {
            sqlx::query(
                r#"
                INSERT INTO patients_info (filename, patient_info, content_fingerprint, record_hash, exported_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(filename) DO UPDATE SET
                    patient_info = excluded.patient_info,
                    content_fingerprint = excluded.content_fingerprint,
                    record_hash = excluded.record_hash,
                    exported_at = excluded.exported_at
                "#,
            )
            .bind(&upsert.filename)
            .bind(&upsert.record_json)
            .bind(&upsert.content_fingerprint)
            .bind(&upsert.record_hash)
            .bind(exported_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| anyhow!("upsert of '{}' failed: {}", upsert.filename, e))?;
        }

        // Dropping `tx` on any error above rolls the whole plan back.
        tx.commit().await?;
        Ok(())
    }
}
