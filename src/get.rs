//! Exported row retrieval by filename.
//!
//! Backs the `intake get` and `intake list` commands.

use anyhow::{bail, Result};
use serde::Serialize;

use crate::config::Config;
use crate::db;
use crate::migrate;
use crate::models::IndexedRow;
use crate::schema::PatientRecord;
use crate::store::{RecordStore, SqliteStore};

/// Row shape printed by `intake get`.
#[derive(Debug, Clone, Serialize)]
pub struct RowResponse {
    pub filename: String,
    pub content_fingerprint: String,
    pub record_hash: String,
    pub exported_at: String, // ISO8601
    pub patient_info: PatientRecord,
}

impl From<IndexedRow> for RowResponse {
    fn from(row: IndexedRow) -> Self {
        Self {
            filename: row.filename,
            content_fingerprint: row.content_fingerprint,
            record_hash: row.record_hash,
            exported_at: format_ts_iso(row.exported_at),
            patient_info: row.patient_info,
        }
    }
}

/// Look up one exported row; a missing filename is an error.
pub async fn get_row(store: &dyn RecordStore, filename: &str) -> Result<RowResponse> {
    match store.get(filename).await? {
        Some(row) => Ok(row.into()),
        None => bail!("no exported row for filename: {}", filename),
    }
}

/// CLI entry point: print the row as pretty JSON on stdout.
pub async fn run_get(config: &Config, filename: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::apply_schema(&pool).await?;
    let store = SqliteStore::new(pool.clone());
    let result = get_row(&store, filename).await;
    pool.close().await;

    let row = match result {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    println!("{}", serde_json::to_string_pretty(&row)?);
    Ok(())
}

/// CLI entry point: one line per exported row.
pub async fn run_list(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::apply_schema(&pool).await?;
    let rows = SqliteStore::new(pool.clone()).list().await?;
    pool.close().await;

    if rows.is_empty() {
        println!("No exported rows.");
        return Ok(());
    }

    println!("{:<40} {:<28} {:<10} EXPORTED", "FILENAME", "NAME", "DOB");
    for row in &rows {
        let dob = row
            .patient_info
            .dob
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".to_string());
        let name = if row.patient_info.name.is_empty() {
            "(unnamed)"
        } else {
            row.patient_info.name.as_str()
        };
        println!(
            "{:<40} {:<28} {:<10} {}",
            row.filename,
            name,
            dob,
            format_ts_iso(row.exported_at)
        );
    }
    println!("{} rows", rows.len());
    Ok(())
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[test]
    fn formats_timestamps_as_utc() {
        assert_eq!(format_ts_iso(0), "1970-01-01T00:00:00Z");
        assert_eq!(format_ts_iso(1_700_000_000), "2023-11-14T22:13:20Z");
    }

    #[tokio::test]
    async fn missing_filename_is_an_error() {
        let store = InMemoryStore::new();
        let err = get_row(&store, "nope.pdf").await.unwrap_err();
        assert!(err.to_string().contains("nope.pdf"));
    }
}
