//! Reconciling export of a run's collected rows into the record store.
//!
//! The export is a keyed diff, never a truncate-and-reload:
//!
//! | Stored | Collected | Enumerated | Action |
//! |--------|-----------|------------|--------|
//! | no     | yes       | yes        | insert |
//! | yes, other hash or fingerprint | yes | yes | update |
//! | yes, same hash and fingerprint | yes | yes | left untouched |
//! | yes    | no        | yes        | left untouched (row failed this run) |
//! | yes    | no        | no         | delete |
//!
//! Deletion is driven by the source enumeration rather than by the
//! collected set, so a document whose extraction failed keeps its
//! previously exported row.

use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::collector::CollectedRow;
use crate::schema::PatientRecord;
use crate::store::{RecordStore, StoredVersion};

#[derive(Debug, Clone, PartialEq)]
pub struct RowUpsert {
    pub filename: String,
    pub record: PatientRecord,
    pub record_json: String,
    pub record_hash: String,
    pub content_fingerprint: String,
    pub is_new: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportPlan {
    pub upserts: Vec<RowUpsert>,
    pub deletes: Vec<String>,
    pub unchanged: Vec<String>,
}

impl ExportPlan {
    /// Diff the stored keys against this run's rows and enumeration.
    pub fn compute(
        stored: &BTreeMap<String, StoredVersion>,
        collected: &BTreeMap<String, CollectedRow>,
        enumerated: &BTreeSet<String>,
    ) -> Result<Self> {
        let mut plan = ExportPlan::default();

        for (filename, row) in collected {
            let record_json = row.record.to_json()?;
            let record_hash = crate::models::fingerprint(record_json.as_bytes());
            match stored.get(filename) {
                // Same record from new bytes still refreshes the stored fingerprint.
                Some(existing)
                    if existing.record_hash == record_hash
                        && existing.content_fingerprint == row.content_fingerprint =>
                {
                    plan.unchanged.push(filename.clone())
                }
                existing => plan.upserts.push(RowUpsert {
                    filename: filename.clone(),
                    record: row.record.clone(),
                    record_json,
                    record_hash,
                    content_fingerprint: row.content_fingerprint.clone(),
                    is_new: existing.is_none(),
                }),
            }
        }

        plan.deletes = stored
            .keys()
            .filter(|k| !enumerated.contains(*k) && !collected.contains_key(*k))
            .cloned()
            .collect();

        Ok(plan)
    }

    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }

    pub fn summary(&self) -> ExportSummary {
        let inserted = self.upserts.iter().filter(|u| u.is_new).count();
        ExportSummary {
            inserted,
            updated: self.upserts.len() - inserted,
            unchanged: self.unchanged.len(),
            deleted: self.deletes.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportSummary {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
}

/// Serializes exports against one store.
pub struct Exporter {
    store: Arc<dyn RecordStore>,
    lock: Mutex<()>,
}

impl Exporter {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub async fn export(
        &self,
        collected: &BTreeMap<String, CollectedRow>,
        enumerated: &BTreeSet<String>,
    ) -> Result<ExportSummary> {
        let _guard = self.lock.lock().await;

        let stored = self.store.stored_versions().await?;
        let plan = ExportPlan::compute(&stored, collected, enumerated)?;
        let summary = plan.summary();

        if !plan.is_empty() {
            self.store
                .apply(&plan, chrono::Utc::now().timestamp())
                .await?;
        }

        info!(
            inserted = summary.inserted,
            updated = summary.updated,
            unchanged = summary.unchanged,
            deleted = summary.deleted,
            "export complete"
        );
        Ok(summary)
    }
}
