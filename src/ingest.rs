//! Sync pipeline orchestration.
//!
//! Coordinates one run: setup checks → source enumeration → bounded parallel
//! rows (fetch → convert → extract) → collector → reconciling export.
//!
//! A row's failure is logged and skipped; it never aborts the run or touches
//! other rows. Setup failures abort before any document is processed.
//! Cancellation stops new rows from starting and skips the export.

use anyhow::{bail, Context, Result};
use futures::stream::{self, StreamExt};
use serde_json::Value;
use sqlx::SqlitePool;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::collector::{CollectedRow, Collector};
use crate::config::Config;
use crate::convert::{create_converter, MarkdownConverter};
use crate::convert_cache::{ConversionCache, SqliteCacheBackend};
use crate::db;
use crate::export::{ExportSummary, Exporter};
use crate::extraction::{create_extractor, ExtractionError, Extractor};
use crate::migrate;
use crate::models::SourceDocument;
use crate::progress::{ProgressMode, SyncProgressEvent, SyncProgressReporter};
use crate::schema::record_json_schema;
use crate::sources::{create_source, DocumentSource};
use crate::store::{RecordStore, SqliteStore, StoredVersion};

/// Why one document produced no record this run.
#[derive(Debug, Error)]
pub enum RowError {
    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),
}

/// The per-document stages plus the settings shared by every row.
pub struct Pipeline {
    converter: MarkdownConverter,
    extractor: Arc<dyn Extractor>,
    schema: Value,
    instruction: String,
    concurrency: usize,
}

impl Pipeline {
    pub fn new(
        converter: MarkdownConverter,
        extractor: Arc<dyn Extractor>,
        instruction: impl Into<String>,
        concurrency: usize,
    ) -> Self {
        Self {
            converter,
            extractor,
            schema: record_json_schema(),
            instruction: instruction.into(),
            concurrency: concurrency.max(1),
        }
    }

    pub fn converter(&self) -> &MarkdownConverter {
        &self.converter
    }

    pub fn extractor(&self) -> &Arc<dyn Extractor> {
        &self.extractor
    }

    /// Verify converter and extractor before any document is touched.
    pub async fn check(&self) -> Result<()> {
        self.converter
            .check()
            .await
            .context("Converter setup check failed")?;
        self.extractor
            .check()
            .await
            .context("Extractor setup check failed")?;
        Ok(())
    }

    /// fetch → convert → extract for a single filename.
    pub async fn process_document(
        &self,
        source: &dyn DocumentSource,
        filename: &str,
    ) -> Result<CollectedRow, RowError> {
        let content = source
            .fetch(filename)
            .await
            .map_err(|e| RowError::Fetch(format!("{:#}", e)))?;
        let doc = SourceDocument::new(filename, content);

        let markdown = self.converter.convert_document(&doc).await;
        debug!(filename, chars = markdown.len(), "converted");

        let record = self
            .extractor
            .extract(&markdown, &self.schema, &self.instruction)
            .await?;

        Ok(CollectedRow {
            filename: doc.filename,
            content_fingerprint: doc.content_fingerprint,
            record,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedRow {
    pub filename: String,
    pub reason: String,
}

/// Outcome of one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub enumerated: usize,
    pub succeeded: usize,
    pub failed: Vec<FailedRow>,
    /// Documents never started because the run was cancelled.
    pub skipped: usize,
    pub cancelled: bool,
    /// `None` when the export did not run.
    pub export: Option<ExportSummary>,
    pub conversions: u64,
    pub cache_hits: u64,
}

/// Run every enumerated document through `pipeline` and export the result.
pub async fn run_pipeline(
    source: &dyn DocumentSource,
    pipeline: &Pipeline,
    exporter: &Exporter,
    cancel: &AtomicBool,
    progress: &dyn SyncProgressReporter,
) -> Result<SyncReport> {
    pipeline.check().await?;
    exporter
        .store()
        .stored_versions()
        .await
        .context("Record store is not reachable")?;

    progress.report(SyncProgressEvent::Discovering {
        source: source.name().to_string(),
    });
    let enumerated: BTreeSet<String> = source
        .list()
        .await
        .with_context(|| format!("Failed to enumerate source '{}'", source.name()))?
        .into_iter()
        .collect();
    info!(source = source.name(), documents = enumerated.len(), "source enumerated");

    let counters_before = pipeline.converter().cache().counters();
    let collector = Collector::new();
    let total = enumerated.len() as u64;
    let mut report = SyncReport {
        enumerated: enumerated.len(),
        ..SyncReport::default()
    };
    let mut done = 0u64;

    let mut results = stream::iter(enumerated.iter())
        .take_while(|_| futures::future::ready(!cancel.load(Ordering::SeqCst)))
        .map(|filename| async move {
            let result = pipeline.process_document(source, filename).await;
            (filename, result)
        })
        .buffer_unordered(pipeline.concurrency);

    while let Some((filename, result)) = results.next().await {
        done += 1;
        match result {
            Ok(row) => collector.push(row),
            Err(e) => {
                warn!(filename = %filename, reason = %e, "row failed; previous export kept");
                report.failed.push(FailedRow {
                    filename: filename.clone(),
                    reason: e.to_string(),
                });
            }
        }
        progress.report(SyncProgressEvent::Processing {
            source: source.name().to_string(),
            n: done,
            total,
            failed: report.failed.len() as u64,
        });
    }

    drop(results);

    let counters = pipeline.converter().cache().counters();
    report.conversions = counters.conversions.saturating_sub(counters_before.conversions);
    report.cache_hits = counters.hits().saturating_sub(counters_before.hits());
    report.succeeded = collector.len();
    report.skipped = enumerated.len() - done as usize;
    report.failed.sort_by(|a, b| a.filename.cmp(&b.filename));

    if cancel.load(Ordering::SeqCst) {
        report.cancelled = true;
        warn!(
            processed = done,
            skipped = report.skipped,
            "run cancelled; export skipped"
        );
        return Ok(report);
    }

    let rows = collector.into_rows();
    progress.report(SyncProgressEvent::Exporting {
        rows: rows.len() as u64,
    });
    report.export = Some(exporter.export(&rows, &enumerated).await?);

    Ok(report)
}

/// CLI entry point for `intake sync`.
pub async fn run_sync(config: &Config, dry_run: bool, progress: ProgressMode) -> Result<()> {
    let source = create_source(config)?;

    if dry_run {
        let stored = read_stored_versions(&config.db.path).await?;
        return dry_run_summary(source.as_ref(), &stored).await;
    }

    let pool = db::connect(config).await?;
    migrate::apply_schema(&pool).await?;
    let store = Arc::new(SqliteStore::new(pool.clone()));

    let cache = Arc::new(ConversionCache::new(Arc::new(SqliteCacheBackend::new(
        pool.clone(),
    ))));
    let converter = MarkdownConverter::new(create_converter(&config.conversion)?, cache);
    let extractor: Arc<dyn Extractor> = Arc::from(create_extractor(&config.extraction)?);
    let pipeline = Pipeline::new(
        converter,
        extractor,
        config.extraction.instruction.clone(),
        config.pipeline.concurrency,
    );
    let exporter = Exporter::new(store);

    let cancel = Arc::new(AtomicBool::new(false));
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; finishing in-flight documents");
                cancel.store(true, Ordering::SeqCst);
            }
        })
    };

    let run_id = Uuid::new_v4().to_string();
    start_run(&pool, &run_id, &pipeline).await?;

    let reporter = progress.reporter();
    let result = run_pipeline(
        source.as_ref(),
        &pipeline,
        &exporter,
        &cancel,
        reporter.as_ref(),
    )
    .await;
    watcher.abort();

    let result = settle_run(&pool, &run_id, result).await;
    pool.close().await;
    let report = result?;

    println!("sync {}", source.name());
    println!("  documents: {}", report.enumerated);
    println!("  extracted: {}", report.succeeded);
    println!("  failed: {}", report.failed.len());
    for failed in &report.failed {
        println!("    {}: {}", failed.filename, failed.reason);
    }
    println!(
        "  conversions: {} (cache hits: {})",
        report.conversions, report.cache_hits
    );
    if let Some(export) = &report.export {
        println!("  inserted: {}", export.inserted);
        println!("  updated: {}", export.updated);
        println!("  unchanged: {}", export.unchanged);
        println!("  deleted: {}", export.deleted);
    }
    println!("  run: {}", run_id);

    if report.cancelled {
        bail!(
            "sync cancelled after {} of {} documents; nothing was exported",
            report.enumerated - report.skipped,
            report.enumerated
        );
    }
    println!("ok");
    Ok(())
}

/// Stored rows as seen by a dry run. Never creates the database or its schema.
async fn read_stored_versions(db_path: &Path) -> Result<BTreeMap<String, StoredVersion>> {
    let Some(pool) = db::connect_read_only(db_path).await? else {
        return Ok(BTreeMap::new());
    };
    let stored = if migrate::table_exists(&pool, "patients_info").await? {
        SqliteStore::new(pool.clone()).stored_versions().await
    } else {
        Ok(BTreeMap::new())
    };
    pool.close().await;
    stored
}

async fn dry_run_summary(
    source: &dyn DocumentSource,
    stored: &BTreeMap<String, StoredVersion>,
) -> Result<()> {
    let enumerated: BTreeSet<String> = source
        .list()
        .await
        .with_context(|| format!("Failed to enumerate source '{}'", source.name()))?
        .into_iter()
        .collect();

    let new = enumerated.iter().filter(|f| !stored.contains_key(*f)).count();
    let vanished = stored.keys().filter(|f| !enumerated.contains(*f)).count();

    println!("sync {} (dry-run)", source.name());
    println!("  documents found: {}", enumerated.len());
    println!("  not yet exported: {}", new);
    println!("  rows to delete: {}", vanished);
    Ok(())
}

async fn start_run(pool: &SqlitePool, run_id: &str, pipeline: &Pipeline) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO runs (id, started_at, status, converter_version, model)
        VALUES (?, ?, 'running', ?, ?)
        "#,
    )
    .bind(run_id)
    .bind(chrono::Utc::now().timestamp())
    .bind(pipeline.converter().version())
    .bind(pipeline.extractor().model_name())
    .execute(pool)
    .await?;
    Ok(())
}

/// Record the run's outcome and hand back the pipeline result. A failure to
/// record is logged; it never replaces the pipeline's own error.
async fn settle_run(
    pool: &SqlitePool,
    run_id: &str,
    result: Result<SyncReport>,
) -> Result<SyncReport> {
    if let Err(e) = finish_run(pool, run_id, &result).await {
        warn!(run_id, error = %e, "failed to record run outcome");
    }
    result
}

async fn finish_run(pool: &SqlitePool, run_id: &str, result: &Result<SyncReport>) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    let (status, report) = match result {
        Ok(report) if report.cancelled => ("cancelled", report.clone()),
        Ok(report) => ("completed", report.clone()),
        Err(_) => ("failed", SyncReport::default()),
    };
    let export = report.export.unwrap_or_default();

    sqlx::query(
        r#"
        UPDATE runs SET
            finished_at = ?, status = ?, enumerated = ?, succeeded = ?, failed = ?,
            inserted = ?, updated = ?, unchanged = ?, deleted = ?
        WHERE id = ?
        "#,
    )
    .bind(now)
    .bind(status)
    .bind(report.enumerated as i64)
    .bind(report.succeeded as i64)
    .bind(report.failed.len() as i64)
    .bind(export.inserted as i64)
    .bind(export.updated as i64)
    .bind(export.unchanged as i64)
    .bind(export.deleted as i64)
    .bind(run_id)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open(tmp: &TempDir) -> SqlitePool {
        let pool = db::connect_path(&tmp.path().join("intake.sqlite"))
            .await
            .unwrap();
        migrate::apply_schema(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn run_outcome_is_recorded() {
        let tmp = TempDir::new().unwrap();
        let pool = open(&tmp).await;
        sqlx::query(
            "INSERT INTO runs (id, started_at, status, converter_version, model) \
             VALUES ('r1', 1, 'running', 'builtin:v1', 'gpt-4o')",
        )
        .execute(&pool)
        .await
        .unwrap();

        let report = SyncReport {
            enumerated: 3,
            succeeded: 2,
            ..SyncReport::default()
        };
        let settled = settle_run(&pool, "r1", Ok(report.clone())).await.unwrap();
        assert_eq!(settled, report);

        let (status, succeeded): (String, i64) =
            sqlx::query_as("SELECT status, succeeded FROM runs WHERE id = 'r1'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(status, "completed");
        assert_eq!(succeeded, 2);
        pool.close().await;
    }

    #[tokio::test]
    async fn pipeline_error_survives_a_failed_run_update() {
        let tmp = TempDir::new().unwrap();
        let pool = open(&tmp).await;
        sqlx::query("DROP TABLE runs").execute(&pool).await.unwrap();

        let err = settle_run(&pool, "r1", Err(anyhow::anyhow!("record store is not reachable")))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "record store is not reachable");

        let report = settle_run(&pool, "r1", Ok(SyncReport::default()))
            .await
            .unwrap();
        assert_eq!(report, SyncReport::default());
        pool.close().await;
    }
}
