use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Whether `table` has been created in this database.
pub async fn table_exists(pool: &SqlitePool, table: &str) -> Result<bool> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(table)
            .fetch_one(pool)
            .await?;
    Ok(count > 0)
}

/// Create every table and index the pipeline uses. Safe to run repeatedly.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    // Exported rows, one per source filename
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS patients_info (
            filename TEXT PRIMARY KEY,
            patient_info TEXT NOT NULL,
            content_fingerprint TEXT NOT NULL,
            record_hash TEXT NOT NULL,
            exported_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Markdown per (content, kind, converter version)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversion_cache (
            fingerprint TEXT NOT NULL,
            kind TEXT NOT NULL,
            version TEXT NOT NULL,
            markdown TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (fingerprint, kind, version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            id TEXT PRIMARY KEY,
            started_at INTEGER NOT NULL,
            finished_at INTEGER,
            status TEXT NOT NULL,
            enumerated INTEGER NOT NULL DEFAULT 0,
            succeeded INTEGER NOT NULL DEFAULT 0,
            failed INTEGER NOT NULL DEFAULT 0,
            inserted INTEGER NOT NULL DEFAULT 0,
            updated INTEGER NOT NULL DEFAULT 0,
            unchanged INTEGER NOT NULL DEFAULT 0,
            deleted INTEGER NOT NULL DEFAULT 0,
            converter_version TEXT NOT NULL,
            model TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_conversion_cache_version ON conversion_cache(version)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_started_at ON runs(started_at DESC)")
        .execute(pool)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = db::connect_path(&dir.path().join("nested/intake.sqlite"))
            .await
            .unwrap();
        apply_schema(&pool).await.unwrap();
        apply_schema(&pool).await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(tables, vec!["conversion_cache", "patients_info", "runs"]);
        pool.close().await;
    }
}
