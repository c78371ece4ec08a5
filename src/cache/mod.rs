//! Fingerprinted, TTL-based cache over synthesized queries. The fingerprint
//! bakes in the schema version, so publishing a new schema makes every old
//! entry unreachable without an explicit flush.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use crate::exec::ResultSummary;

/// Lowercases and collapses whitespace so trivially different phrasings of
/// the same interpretation hash alike.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// `sha256(normalized interpretation text, schema version)` as hex.
pub fn fingerprint(interpretation_text: &str, schema_version: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize(interpretation_text).as_bytes());
    hasher.update(b"\x00");
    hasher.update(schema_version.to_le_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub sql_text: String,
    pub result_summary: ResultSummary,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    // Per-fingerprint locks for the compute-once rule. Kept separate from
    // `entries` so a slow computation never blocks unrelated fingerprints.
    locks: HashMap<String, Arc<Mutex<()>>>,
}

pub struct QueryCache {
    inner: Mutex<CacheInner>,
    ttl: Duration,
}

impl QueryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            ttl,
        }
    }

    /// Expired entries are misses and are reclaimed on the way out.
    pub async fn get(&self, fingerprint: &str) -> Option<CacheEntry> {
        let mut inner = self.inner.lock().await;
        match inner.entries.get(fingerprint) {
            Some(entry) if !entry.is_expired() => Some(entry.clone()),
            Some(_) => {
                inner.entries.remove(fingerprint);
                None
            }
            None => None,
        }
    }

    pub async fn put(&self, fingerprint: &str, sql_text: String, result_summary: ResultSummary) {
        let now = Utc::now();
        let entry = CacheEntry {
            fingerprint: fingerprint.to_string(),
            sql_text,
            result_summary,
            created_at: now,
            expires_at: now + chrono::Duration::from_std(self.ttl).unwrap_or_default(),
        };
        let mut inner = self.inner.lock().await;
        inner.entries.insert(fingerprint.to_string(), entry);
    }

    /// Compute-once: concurrent callers for the same fingerprint serialize on
    /// a per-fingerprint lock; whoever wins computes, everyone else finds the
    /// stored entry when they re-check. Failed computations are not cached,
    /// and the error goes back to the caller that hit it.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        fingerprint: &str,
        compute: F,
    ) -> Result<(CacheEntry, bool), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(String, ResultSummary), E>>,
    {
        let lock = {
            let mut inner = self.inner.lock().await;
            inner
                .locks
                .entry(fingerprint.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        let guard = lock.lock().await;

        let result = if let Some(entry) = self.get(fingerprint).await {
            debug!(fingerprint, "cache hit");
            Ok((entry, true))
        } else {
            match compute().await {
                Ok((sql_text, summary)) => {
                    self.put(fingerprint, sql_text, summary).await;
                    let entry = self
                        .get(fingerprint)
                        .await
                        .expect("entry stored under held fingerprint lock");
                    Ok((entry, false))
                }
                Err(e) => Err(e),
            }
        };

        drop(guard);
        self.release_lock(fingerprint, &lock).await;
        result
    }

    /// Drops the fingerprint's lock from the map once nothing else holds it.
    /// The map and the caller account for two strong counts; any waiter
    /// cloned its own handle under the inner lock and keeps the entry alive.
    async fn release_lock(&self, fingerprint: &str, lock: &Arc<Mutex<()>>) {
        let mut inner = self.inner.lock().await;
        if Arc::strong_count(lock) == 2 {
            inner.locks.remove(fingerprint);
        }
    }

    /// Removes every expired entry and every lock with no live holder. The
    /// get path already reclaims entries lazily; this exists for periodic
    /// housekeeping.
    pub async fn sweep(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| !entry.is_expired());
        inner.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - inner.entries.len()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn summary(rows: usize) -> ResultSummary {
        ResultSummary {
            columns: vec!["name".to_string()],
            rows: vec![],
            row_count: rows,
            truncated: false,
        }
    }

    #[test]
    fn fingerprint_normalizes_text() {
        let a = fingerprint("Top  5 campaigns BY spend", 1);
        let b = fingerprint("top 5 campaigns by spend", 1);
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_incorporates_schema_version() {
        let a = fingerprint("top 5 campaigns by spend", 1);
        let b = fingerprint("top 5 campaigns by spend", 2);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn get_after_put_returns_same_sql_within_ttl() {
        let cache = QueryCache::new(Duration::from_secs(60));
        cache
            .put("fp", "SELECT name FROM campaigns".to_string(), summary(3))
            .await;

        let entry = cache.get("fp").await.expect("entry present");
        assert_eq!(entry.sql_text, "SELECT name FROM campaigns");
        assert_eq!(entry.result_summary.row_count, 3);
    }

    #[tokio::test]
    async fn expired_entry_is_a_miss() {
        let cache = QueryCache::new(Duration::from_millis(10));
        cache.put("fp", "SELECT 1".to_string(), summary(1)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get("fp").await.is_none());
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn sweep_reclaims_expired_entries() {
        let cache = QueryCache::new(Duration::from_millis(10));
        cache.put("a", "SELECT 1".to_string(), summary(1)).await;
        cache.put("b", "SELECT 2".to_string(), summary(1)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.sweep().await, 2);
    }

    #[tokio::test]
    async fn concurrent_callers_compute_once() {
        let cache = Arc::new(QueryCache::new(Duration::from_secs(60)));
        let computations = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let computations = computations.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute("fp", || async move {
                        computations.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok::<_, ()>(("SELECT name FROM campaigns".to_string(), summary(5)))
                    })
                    .await
            }));
        }

        for handle in handles {
            let (entry, _) = handle.await.unwrap().unwrap();
            assert_eq!(entry.sql_text, "SELECT name FROM campaigns");
        }
        assert_eq!(computations.load(Ordering::SeqCst), 1);
        assert_eq!(cache.inner.lock().await.locks.len(), 0);
    }

    #[tokio::test]
    async fn fingerprint_locks_are_reclaimed() {
        let cache = QueryCache::new(Duration::from_secs(60));
        for fp in ["a", "b", "c"] {
            cache
                .get_or_compute(fp, || async {
                    Ok::<_, ()>(("SELECT 1".to_string(), summary(1)))
                })
                .await
                .unwrap();
        }

        // Entries persist for hits; the locks that guarded them do not.
        assert_eq!(cache.len().await, 3);
        assert_eq!(cache.inner.lock().await.locks.len(), 0);
    }

    #[tokio::test]
    async fn failed_computation_is_not_cached() {
        let cache = QueryCache::new(Duration::from_secs(60));
        let result = cache
            .get_or_compute("fp", || async { Err::<(String, ResultSummary), _>("boom") })
            .await;
        assert!(result.is_err());
        assert!(cache.get("fp").await.is_none());
    }
}
