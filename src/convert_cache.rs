//! Content-addressed cache for the conversion stage.
//!
//! Entries are keyed by `(content fingerprint, file kind, converter
//! version)`. Changing the converter version never touches entries written
//! under another version; they simply stop matching and remain valid for
//! anyone still asking for the old version.
//!
//! [`ConversionCache`] puts a single-flight layer in front of a persistent
//! [`CacheBackend`]: concurrent misses for the same key share one
//! conversion, while different keys proceed independently.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub fingerprint: String,
    pub kind: String,
    pub version: String,
}

impl CacheKey {
    pub fn new(fingerprint: impl Into<String>, kind: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            kind: kind.into(),
            version: version.into(),
        }
    }
}

/// Per-version entry counts, for `intake cache stats`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionStats {
    pub version: String,
    pub entries: i64,
    pub bytes: i64,
}

/// Persistent storage for converted markdown.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<String>>;
    async fn put(&self, key: &CacheKey, markdown: &str) -> Result<()>;
    async fn stats(&self) -> Result<Vec<VersionStats>>;
    /// Remove every entry whose version differs from `keep_version`.
    async fn prune(&self, keep_version: &str) -> Result<u64>;
}

/// Counters for one process lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheCounters {
    pub requests: u64,
    pub conversions: u64,
}

impl CacheCounters {
    pub fn hits(&self) -> u64 {
        self.requests.saturating_sub(self.conversions)
    }
}

pub struct ConversionCache {
    backend: Arc<dyn CacheBackend>,
    inflight: Mutex<HashMap<CacheKey, Arc<OnceCell<String>>>>,
    requests: AtomicU64,
    conversions: AtomicU64,
}

impl ConversionCache {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend,
            inflight: Mutex::new(HashMap::new()),
            requests: AtomicU64::new(0),
            conversions: AtomicU64::new(0),
        }
    }

    pub fn counters(&self) -> CacheCounters {
        CacheCounters {
            requests: self.requests.load(Ordering::Relaxed),
            conversions: self.conversions.load(Ordering::Relaxed),
        }
    }

    /// Return the cached markdown for `key`, running `convert` on a miss.
    ///
    /// `convert` returns `Ok` for output that may be cached and `Err` for
    /// best-effort output that must not be; the text is returned either way.
    /// Backend failures degrade to a miss and never fail the call.
    pub async fn get_or_convert<F, Fut>(&self, key: &CacheKey, convert: F) -> String
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<String, String>>,
    {
        self.requests.fetch_add(1, Ordering::Relaxed);

        let cell = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            inflight
                .entry(key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let result = cell
            .get_or_try_init(|| async move {
                match self.backend.get(key).await {
                    Ok(Some(markdown)) => {
                        debug!(fingerprint = %key.fingerprint, version = %key.version, "conversion cache hit");
                        return Ok(markdown);
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "conversion cache read failed"),
                }

                self.conversions.fetch_add(1, Ordering::Relaxed);
                let markdown = convert().await?;
                if let Err(e) = self.backend.put(key, &markdown).await {
                    warn!(error = %e, "conversion cache write failed");
                }
                Ok(markdown)
            })
            .await
            .cloned();

        // Later requests go to the backend; waiters already holding the
        // cell still see its value.
        {
            let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            if inflight.get(key).is_some_and(|c| Arc::ptr_eq(c, &cell)) {
                inflight.remove(key);
            }
        }

        match result {
            Ok(markdown) | Err(markdown) => markdown,
        }
    }
}

/// Cache held in process memory; nothing survives a restart.
#[derive(Default)]
pub struct MemoryCacheBackend {
    entries: RwLock<HashMap<CacheKey, String>>,
}

impl MemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn get(&self, key: &CacheKey) -> Result<Option<String>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).cloned())
    }

    async fn put(&self, key: &CacheKey, markdown: &str) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.clone(), markdown.to_string());
        Ok(())
    }

    async fn stats(&self) -> Result<Vec<VersionStats>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut by_version: HashMap<&str, (i64, i64)> = HashMap::new();
        for (key, markdown) in entries.iter() {
            let slot = by_version.entry(key.version.as_str()).or_default();
            slot.0 += 1;
            slot.1 += markdown.len() as i64;
        }
        let mut stats: Vec<VersionStats> = by_version
            .into_iter()
            .map(|(version, (entries, bytes))| VersionStats {
                version: version.to_string(),
                entries,
                bytes,
            })
            .collect();
        stats.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(stats)
    }

    async fn prune(&self, keep_version: &str) -> Result<u64> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|key, _| key.version == keep_version);
        Ok((before - entries.len()) as u64)
    }
}

/// Cache persisted in the `conversion_cache` table.
pub struct SqliteCacheBackend {
    pool: SqlitePool,
}

impl SqliteCacheBackend {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CacheBackend for SqliteCacheBackend {
    async fn get(&self, key: &CacheKey) -> Result<Option<String>> {
        let markdown: Option<String> = sqlx::query_scalar(
            "SELECT markdown FROM conversion_cache WHERE fingerprint = ? AND kind = ? AND version = ?",
        )
        .bind(&key.fingerprint)
        .bind(&key.kind)
        .bind(&key.version)
        .fetch_optional(&self.pool)
        .await?;
        Ok(markdown)
    }

    async fn put(&self, key: &CacheKey, markdown: &str) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO conversion_cache (fingerprint, kind, version, markdown, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(fingerprint, kind, version) DO UPDATE SET
                markdown = excluded.markdown,
                created_at = excluded.created_at
            "#,
        )
        .bind(&key.fingerprint)
        .bind(&key.kind)
        .bind(&key.version)
        .bind(markdown)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn stats(&self) -> Result<Vec<VersionStats>> {
        let rows = sqlx::query(
            r#"
            SELECT version, COUNT(*) AS entries, COALESCE(SUM(LENGTH(markdown)), 0) AS bytes
            FROM conversion_cache
            GROUP BY version
            ORDER BY version
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| VersionStats {
                version: row.get("version"),
                entries: row.get("entries"),
                bytes: row.get("bytes"),
            })
            .collect())
    }

    async fn prune(&self, keep_version: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM conversion_cache WHERE version != ?")
            .bind(keep_version)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn cache() -> (Arc<MemoryCacheBackend>, ConversionCache) {
        let backend = Arc::new(MemoryCacheBackend::new());
        (backend.clone(), ConversionCache::new(backend))
    }

    #[tokio::test]
    async fn second_request_is_served_from_cache() {
        let (backend, cache) = cache();
        let calls = AtomicUsize::new(0);
        let key = CacheKey::new("abc", "pdf", "builtin:v1");

        for _ in 0..3 {
            let text = cache
                .get_or_convert(&key, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("markdown".to_string())
                })
                .await;
            assert_eq!(text, "markdown");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(backend.len(), 1);
        assert_eq!(cache.counters().hits(), 2);
    }

    #[tokio::test]
    async fn versions_are_cached_independently() {
        let (backend, cache) = cache();
        let v1 = CacheKey::new("abc", "pdf", "builtin:v1");
        let v2 = CacheKey::new("abc", "pdf", "builtin:v2");

        let a = cache.get_or_convert(&v1, || async { Ok("old".to_string()) }).await;
        let b = cache.get_or_convert(&v2, || async { Ok("new".to_string()) }).await;
        assert_eq!((a.as_str(), b.as_str()), ("old", "new"));

        let again = cache
            .get_or_convert(&v1, || async { Ok("recomputed".to_string()) })
            .await;
        assert_eq!(again, "old");
        assert_eq!(backend.len(), 2);

        assert_eq!(backend.prune("builtin:v2").await.unwrap(), 1);
        assert_eq!(backend.get(&v2).await.unwrap().as_deref(), Some("new"));
        assert_eq!(backend.get(&v1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn uncacheable_output_is_returned_but_not_stored() {
        let (backend, cache) = cache();
        let key = CacheKey::new("abc", "pdf", "builtin:v1");
        let text = cache
            .get_or_convert(&key, || async { Err("partial".to_string()) })
            .await;
        assert_eq!(text, "partial");
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn concurrent_misses_collapse_to_one_conversion() {
        let (_backend, cache) = cache();
        let cache = Arc::new(cache);
        let calls = Arc::new(AtomicUsize::new(0));
        let key = CacheKey::new("same", "pdf", "builtin:v1");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_convert(&key, || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok("shared".to_string())
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), "shared");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn memory_stats_group_by_version() {
        let backend = MemoryCacheBackend::new();
        backend.put(&CacheKey::new("a", "pdf", "v1"), "abc").await.unwrap();
        backend.put(&CacheKey::new("b", "pdf", "v1"), "de").await.unwrap();
        backend.put(&CacheKey::new("a", "pdf", "v2"), "x").await.unwrap();
        let stats = backend.stats().await.unwrap();
        assert_eq!(
            stats,
            vec![
                VersionStats { version: "v1".into(), entries: 2, bytes: 5 },
                VersionStats { version: "v2".into(), entries: 1, bytes: 1 },
            ]
        );
    }
}
