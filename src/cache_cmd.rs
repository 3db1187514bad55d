use anyhow::Result;

use crate::config::Config;
use crate::convert::create_converter;
use crate::convert_cache::{CacheBackend, SqliteCacheBackend};
use crate::db;
use crate::migrate;

/// Print cached entry counts per converter version.
pub async fn run_cache_stats(config: &Config) -> Result<()> {
    let current = create_converter(&config.conversion)?.version();
    let pool = db::connect(config).await?;
    migrate::apply_schema(&pool).await?;
    let stats = SqliteCacheBackend::new(pool.clone()).stats().await?;
    pool.close().await;

    println!("cache stats");
    println!("  current version: {}", current);
    if stats.is_empty() {
        println!("  no cached conversions");
        return Ok(());
    }
    for entry in &stats {
        let marker = if entry.version == current { "*" } else { " " };
        println!(
            "  {} {:<40} {:>8} entries {:>12} bytes",
            marker, entry.version, entry.entries, entry.bytes
        );
    }
    Ok(())
}

/// Drop cached conversions written by any converter version but the current one.
pub async fn run_cache_prune(config: &Config, dry_run: bool) -> Result<()> {
    let current = create_converter(&config.conversion)?.version();
    let pool = db::connect(config).await?;
    migrate::apply_schema(&pool).await?;
    let backend = SqliteCacheBackend::new(pool.clone());

    if dry_run {
        let stale: i64 = backend
            .stats()
            .await?
            .iter()
            .filter(|s| s.version != current)
            .map(|s| s.entries)
            .sum();
        pool.close().await;
        println!("cache prune (dry-run)");
        println!("  entries to remove: {}", stale);
        return Ok(());
    }

    let removed = backend.prune(&current).await?;
    pool.close().await;

    println!("cache prune");
    println!("  kept version: {}", current);
    println!("  removed entries: {}", removed);
    Ok(())
}
