//! Payment-gated response cache.
//!
//! Entries are keyed by a content hash of the input text and the model, so a
//! model change or a key-version bump invalidates everything cached before.
//! The cache never decides whether a caller may see a result: the summarize
//! route verifies the payment before serving a hit, exactly as for a miss.
//! All backend faults are absorbed here and surface only in logs and metrics.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;

use crate::metrics::{CACHE_LOOKUPS, CACHE_STORE_FAILURES};
use crate::timeout::{bounded, RequestDeadline};

/// Bumping this invalidates every existing entry.
pub const CACHE_KEY_VERSION: &str = "v1";

/// Budget for a single backend operation.
pub const CACHE_OP_TIMEOUT: Duration = Duration::from_secs(5);

/// `ai:summary:` + hex(sha256(`v1:{text}:{model}`)).
pub fn cache_key(text: &str, model: &str) -> String {
    let digest = Sha256::digest(format!("{CACHE_KEY_VERSION}:{text}:{model}").as_bytes());
    format!("ai:summary:{}", alloy::hex::encode(digest))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub result: String,
    /// Unix seconds.
    pub cached_at: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("cache operation timed out")]
    Timeout,

    #[error("cache task failed: {0}")]
    Task(String),
}

/// Key/value backend with per-entry expiry. Implementations must be
/// thread-safe; calls may block and are run on the blocking pool.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<CachedResponse>, CacheError>;

    fn put(&self, key: &str, value: &CachedResponse, ttl: Duration) -> Result<(), CacheError>;

    /// Remove expired entries. Returns the number removed.
    fn purge_expired(&self) -> Result<usize, CacheError>;
}

/// In-process backend. Lost on restart.
#[derive(Default)]
pub struct InMemoryCacheStore {
    entries: DashMap<String, (CachedResponse, Instant)>,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CacheStore for InMemoryCacheStore {
    fn get(&self, key: &str) -> Result<Option<CachedResponse>, CacheError> {
        let now = Instant::now();
        let hit = self
            .entries
            .get(key)
            .filter(|entry| entry.1 > now)
            .map(|entry| entry.0.clone());
        if hit.is_none() {
            self.entries.remove_if(key, |_, (_, expires)| *expires <= now);
        }
        Ok(hit)
    }

    fn put(&self, key: &str, value: &CachedResponse, ttl: Duration) -> Result<(), CacheError> {
        self.entries
            .insert(key.to_string(), (value.clone(), Instant::now() + ttl));
        Ok(())
    }

    fn purge_expired(&self) -> Result<usize, CacheError> {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, (_, expires)| *expires > now);
        Ok(before.saturating_sub(self.entries.len()))
    }
}

/// SQLite backend. Survives restarts.
pub struct SqliteCacheStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteCacheStore {
    /// Open (or create) the cache database at `path`.
    ///
    /// On Unix the file is restricted to 0600, since cached summaries may
    /// contain user text.
    pub fn open(path: &str) -> Result<Self, CacheError> {
        let conn = rusqlite::Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS response_cache (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_response_cache_expires ON response_cache(expires_at);
            PRAGMA journal_mode=WAL;",
        )?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) =
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            {
                tracing::warn!(path = %path, error = %e, "failed to restrict cache database permissions");
            }
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, rusqlite::Connection> {
        match self.conn.lock() {
            Ok(c) => c,
            Err(poisoned) => {
                tracing::error!("cache store mutex poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

fn unix_now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl CacheStore for SqliteCacheStore {
    fn get(&self, key: &str) -> Result<Option<CachedResponse>, CacheError> {
        let conn = self.conn();
        let raw: Option<String> = match conn.query_row(
            "SELECT value FROM response_cache WHERE key = ?1 AND expires_at > ?2",
            rusqlite::params![key, unix_now_millis()],
            |row| row.get(0),
        ) {
            Ok(v) => Some(v),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(e.into()),
        };
        raw.map(|v| serde_json::from_str(&v).map_err(CacheError::from))
            .transpose()
    }

    fn put(&self, key: &str, value: &CachedResponse, ttl: Duration) -> Result<(), CacheError> {
        let encoded = serde_json::to_string(value)?;
        let expires_at = unix_now_millis().saturating_add(ttl.as_millis() as i64);
        self.conn().execute(
            "INSERT INTO response_cache (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
            rusqlite::params![key, encoded, expires_at],
        )?;
        Ok(())
    }

    fn purge_expired(&self) -> Result<usize, CacheError> {
        let removed = self.conn().execute(
            "DELETE FROM response_cache WHERE expires_at <= ?1",
            [unix_now_millis()],
        )?;
        Ok(removed)
    }
}

/// Soft-fail front for a [`CacheStore`].
#[derive(Clone)]
pub struct ResponseCache {
    store: Arc<dyn CacheStore>,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn CacheStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Look up a key. Errors and timeouts count as misses.
    pub async fn lookup(&self, deadline: Option<RequestDeadline>, key: &str) -> Option<CachedResponse> {
        let store = Arc::clone(&self.store);
        let owned = key.to_string();
        let outcome = bounded(
            deadline,
            CACHE_OP_TIMEOUT,
            tokio::task::spawn_blocking(move || store.get(&owned)),
        )
        .await;

        let result = match outcome {
            Err(_) => Err(CacheError::Timeout),
            Ok(Err(join)) => Err(CacheError::Task(join.to_string())),
            Ok(Ok(inner)) => inner,
        };
        match result {
            Ok(Some(hit)) => {
                CACHE_LOOKUPS.with_label_values(&["hit"]).inc();
                Some(hit)
            }
            Ok(None) => {
                CACHE_LOOKUPS.with_label_values(&["miss"]).inc();
                None
            }
            Err(e) => {
                CACHE_LOOKUPS.with_label_values(&["error"]).inc();
                tracing::warn!(error = %e, "cache lookup failed, treating as miss");
                None
            }
        }
    }

    /// Write a result, bounded by [`CACHE_OP_TIMEOUT`].
    pub async fn store(&self, key: String, result: String) -> Result<(), CacheError> {
        let store = Arc::clone(&self.store);
        let ttl = self.ttl;
        let entry = CachedResponse {
            result,
            cached_at: chrono::Utc::now().timestamp(),
        };
        let write = tokio::task::spawn_blocking(move || store.put(&key, &entry, ttl));
        match tokio::time::timeout(CACHE_OP_TIMEOUT, write).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join)) => Err(CacheError::Task(join.to_string())),
            Err(_) => Err(CacheError::Timeout),
        }
    }

    /// Store a result in the background. The caller never waits on it and
    /// never sees its errors.
    pub fn store_detached(&self, key: String, result: String) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            match cache.store(key, result).await {
                Ok(()) => tracing::debug!("cached response"),
                Err(e) => {
                    CACHE_STORE_FAILURES.inc();
                    tracing::warn!(error = %e, "failed to cache response");
                }
            }
        })
    }

    /// Periodically purge expired entries from the backend.
    pub fn start_purger(&self, interval: Duration) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let store = Arc::clone(&store);
                match tokio::task::spawn_blocking(move || store.purge_expired()).await {
                    Ok(Ok(0)) => {}
                    Ok(Ok(n)) => tracing::debug!(purged = n, "purged expired cache entries"),
                    Ok(Err(e)) => tracing::warn!(error = %e, "cache purge failed"),
                    Err(e) => tracing::warn!(error = %e, "cache purge task failed"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(result: &str) -> CachedResponse {
        CachedResponse {
            result: result.to_string(),
            cached_at: 1_700_000_000,
        }
    }

    #[test]
    fn test_cache_key_format() {
        let key = cache_key("hello", "model-a");
        assert!(key.starts_with("ai:summary:"));
        assert_eq!(key.len(), "ai:summary:".len() + 64);
        let expected = alloy::hex::encode(Sha256::digest(b"v1:hello:model-a"));
        assert_eq!(key, format!("ai:summary:{expected}"));
    }

    #[test]
    fn test_cache_key_depends_on_text_and_model() {
        assert_eq!(cache_key("t", "m"), cache_key("t", "m"));
        assert_ne!(cache_key("t", "m"), cache_key("t", "m2"));
        assert_ne!(cache_key("t", "m"), cache_key("t2", "m"));
        assert_ne!(cache_key("t ", "m"), cache_key("t", "m"));
    }

    #[test]
    fn test_in_memory_expiry() {
        let store = InMemoryCacheStore::new();
        store.put("k", &entry("a"), Duration::from_millis(20)).unwrap();
        assert_eq!(store.get("k").unwrap(), Some(entry("a")));
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(store.get("k").unwrap(), None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_in_memory_purge() {
        let store = InMemoryCacheStore::new();
        store.put("old", &entry("a"), Duration::from_millis(1)).unwrap();
        store.put("new", &entry("b"), Duration::from_secs(60)).unwrap();
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(store.purge_expired().unwrap(), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_sqlite_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let store = SqliteCacheStore::open(path.to_str().unwrap()).unwrap();

        assert_eq!(store.get("k").unwrap(), None);
        store.put("k", &entry("first"), Duration::from_secs(60)).unwrap();
        store.put("k", &entry("second"), Duration::from_secs(60)).unwrap();
        assert_eq!(store.get("k").unwrap(), Some(entry("second")));

        store.put("gone", &entry("x"), Duration::ZERO).unwrap();
        assert_eq!(store.get("gone").unwrap(), None);
        assert_eq!(store.purge_expired().unwrap(), 1);
    }

    #[test]
    fn test_sqlite_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let path = path.to_str().unwrap();
        {
            let store = SqliteCacheStore::open(path).unwrap();
            store.put("k", &entry("kept"), Duration::from_secs(60)).unwrap();
        }
        let reopened = SqliteCacheStore::open(path).unwrap();
        assert_eq!(reopened.get("k").unwrap(), Some(entry("kept")));
    }

    struct Broken;

    impl CacheStore for Broken {
        fn get(&self, _: &str) -> Result<Option<CachedResponse>, CacheError> {
            Err(CacheError::Task("backend down".into()))
        }
        fn put(&self, _: &str, _: &CachedResponse, _: Duration) -> Result<(), CacheError> {
            Err(CacheError::Task("backend down".into()))
        }
        fn purge_expired(&self) -> Result<usize, CacheError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_lookup_soft_fails() {
        let cache = ResponseCache::new(Arc::new(Broken), Duration::from_secs(60));
        assert_eq!(cache.lookup(None, "k").await, None);
        assert!(matches!(
            cache.store("k".into(), "v".into()).await,
            Err(CacheError::Task(_))
        ));
        // Store failures are swallowed by the detached task.
        cache
            .store_detached("k".into(), "v".into())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_store_then_lookup() {
        let cache = ResponseCache::new(Arc::new(InMemoryCacheStore::new()), Duration::from_secs(60));
        let key = cache_key("text", "model");
        assert_eq!(cache.lookup(None, &key).await, None);
        cache
            .store_detached(key.clone(), "summary".into())
            .await
            .unwrap();
        let hit = cache.lookup(None, &key).await.unwrap();
        assert_eq!(hit.result, "summary");
        assert!(hit.cached_at > 0);
    }
}
