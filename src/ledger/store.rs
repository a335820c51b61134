//! Versioned key/value store abstraction for the budget ledger.
//!
//! The ledger needs linearizable read-modify-write per key group without a
//! global lock. The contract here is the optimistic watch/commit pattern:
//! `watch` snapshots a set of keys with per-key versions, a pure closure
//! validates and produces writes, and `commit` applies them only if none of
//! the watched keys changed in between. [`transact`] wraps that in a
//! bounded retry loop so contention is retried a configured number of
//! times, never indefinitely.
//!
//! [`MemoryStore`] is the in-process implementation (used by tests and
//! single-node deployments); any networked store with the same
//! watch/commit semantics plugs in behind [`KvStore`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;

/// Store-level failures (backend unreachable, corrupt payloads).
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Outcome of a watch on a single key. `version == 0` means absent.
#[derive(Debug, Clone)]
pub struct VersionedRead {
    pub key: String,
    pub value: Option<String>,
    pub version: u64,
}

/// One write inside a commit. `value: None` deletes the key.
#[derive(Debug, Clone)]
pub struct KvWrite {
    pub key: String,
    pub value: Option<String>,
    pub ttl: Option<Duration>,
}

impl KvWrite {
    pub fn set(key: impl Into<String>, value: impl Into<String>, ttl: Option<Duration>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            ttl,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
            ttl: None,
        }
    }
}

/// A transactional key/value store with optimistic concurrency.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Snapshot `keys` with their current versions.
    async fn watch(&self, keys: &[String]) -> Result<Vec<VersionedRead>, StoreError>;

    /// Apply `writes` iff every watched key still has its snapshot
    /// version. Returns `Ok(false)` on conflict (no writes applied).
    async fn commit(
        &self,
        watched: &[VersionedRead],
        writes: Vec<KvWrite>,
    ) -> Result<bool, StoreError>;
}

/// Retry budget for optimistic transactions. Kept as a value, not a magic
/// constant, so tests can force contention deterministically.
#[derive(Debug, Clone, Copy)]
pub struct CasRetryPolicy {
    pub max_attempts: u32,
}

impl Default for CasRetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 5 }
    }
}

/// Transaction-level failures, distinct from domain rejections.
#[derive(Debug, Error)]
pub enum TransactError {
    #[error("transaction conflicted {attempts} times; retry budget exhausted")]
    Contention { attempts: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Run a read/validate/write cycle with bounded retries.
///
/// `f` is pure: given the snapshot it either rejects with a domain error
/// `E` (returned untouched, no writes happen) or yields a result plus the
/// writes to commit. On commit conflict the whole cycle re-runs against a
/// fresh snapshot, up to `policy.max_attempts` times.
pub async fn transact<S, T, E, F>(
    store: &S,
    policy: CasRetryPolicy,
    keys: &[String],
    mut f: F,
) -> Result<Result<T, E>, TransactError>
where
    S: KvStore + ?Sized,
    F: FnMut(&[VersionedRead]) -> Result<(T, Vec<KvWrite>), E>,
{
    for _attempt in 1..=policy.max_attempts {
        let snapshot = store.watch(keys).await?;
        let (result, writes) = match f(&snapshot) {
            Ok(outcome) => outcome,
            Err(rejection) => return Ok(Err(rejection)),
        };
        if store.commit(&snapshot, writes).await? {
            return Ok(Ok(result));
        }
    }
    Err(TransactError::Contention {
        attempts: policy.max_attempts,
    })
}

#[derive(Debug, Clone)]
struct MemEntry {
    value: String,
    version: u64,
    expires_at: Option<Instant>,
}

/// In-process [`KvStore`] with per-key versions and lazy TTL expiry.
///
/// Versions come from a store-wide counter so a deleted-and-recreated key
/// never reuses a version a stale watcher might still hold.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, MemEntry>>,
    clock: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock: AtomicU64::new(0),
        }
    }

    fn next_version(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn purge_expired(entries: &mut HashMap<String, MemEntry>) {
        let now = Instant::now();
        entries.retain(|_, entry| entry.expires_at.map_or(true, |at| at > now));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, MemEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn watch(&self, keys: &[String]) -> Result<Vec<VersionedRead>, StoreError> {
        let mut entries = self.lock();
        Self::purge_expired(&mut entries);
        Ok(keys
            .iter()
            .map(|key| match entries.get(key) {
                Some(entry) => VersionedRead {
                    key: key.clone(),
                    value: Some(entry.value.clone()),
                    version: entry.version,
                },
                None => VersionedRead {
                    key: key.clone(),
                    value: None,
                    version: 0,
                },
            })
            .collect())
    }

    async fn commit(
        &self,
        watched: &[VersionedRead],
        writes: Vec<KvWrite>,
    ) -> Result<bool, StoreError> {
        let mut entries = self.lock();
        Self::purge_expired(&mut entries);

        for read in watched {
            let current = entries.get(&read.key).map(|e| e.version).unwrap_or(0);
            if current != read.version {
                return Ok(false);
            }
        }

        for write in writes {
            match write.value {
                Some(value) => {
                    let version = self.next_version();
                    entries.insert(
                        write.key,
                        MemEntry {
                            value,
                            version,
                            expires_at: write.ttl.map(|ttl| Instant::now() + ttl),
                        },
                    );
                }
                None => {
                    entries.remove(&write.key);
                }
            }
        }
        Ok(true)
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("keys", &self.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn absent_keys_read_as_version_zero() {
        let store = MemoryStore::new();
        let reads = store.watch(&keys(&["a", "b"])).await.expect("watch");
        assert!(reads.iter().all(|r| r.value.is_none() && r.version == 0));
    }

    #[tokio::test]
    async fn commit_applies_when_unchanged() {
        let store = MemoryStore::new();
        let snap = store.watch(&keys(&["a"])).await.expect("watch");
        let applied = store
            .commit(&snap, vec![KvWrite::set("a", "1", None)])
            .await
            .expect("commit");
        assert!(applied);

        let reads = store.watch(&keys(&["a"])).await.expect("watch");
        assert_eq!(reads[0].value.as_deref(), Some("1"));
        assert!(reads[0].version > 0);
    }

    #[tokio::test]
    async fn concurrent_commit_conflicts() {
        let store = MemoryStore::new();
        let snap_a = store.watch(&keys(&["k"])).await.expect("watch");
        let snap_b = store.watch(&keys(&["k"])).await.expect("watch");

        assert!(store
            .commit(&snap_a, vec![KvWrite::set("k", "a", None)])
            .await
            .expect("commit"));
        // B's snapshot is stale now.
        assert!(!store
            .commit(&snap_b, vec![KvWrite::set("k", "b", None)])
            .await
            .expect("commit"));

        let reads = store.watch(&keys(&["k"])).await.expect("watch");
        assert_eq!(reads[0].value.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn delete_then_recreate_does_not_reuse_versions() {
        let store = MemoryStore::new();
        let snap = store.watch(&keys(&["k"])).await.expect("watch");
        store
            .commit(&snap, vec![KvWrite::set("k", "1", None)])
            .await
            .expect("commit");
        let stale = store.watch(&keys(&["k"])).await.expect("watch");

        let snap = store.watch(&keys(&["k"])).await.expect("watch");
        store
            .commit(&snap, vec![KvWrite::delete("k")])
            .await
            .expect("commit");
        let snap = store.watch(&keys(&["k"])).await.expect("watch");
        store
            .commit(&snap, vec![KvWrite::set("k", "2", None)])
            .await
            .expect("commit");

        // The pre-delete snapshot must not be committable.
        assert!(!store
            .commit(&stale, vec![KvWrite::set("k", "3", None)])
            .await
            .expect("commit"));
    }

    #[tokio::test]
    async fn ttl_expiry_makes_keys_absent() {
        let store = MemoryStore::new();
        let snap = store.watch(&keys(&["k"])).await.expect("watch");
        store
            .commit(
                &snap,
                vec![KvWrite::set("k", "1", Some(Duration::from_millis(15)))],
            )
            .await
            .expect("commit");

        tokio::time::sleep(Duration::from_millis(40)).await;
        let reads = store.watch(&keys(&["k"])).await.expect("watch");
        assert!(reads[0].value.is_none());
        assert_eq!(reads[0].version, 0);
    }

    #[tokio::test]
    async fn transact_retries_then_gives_up() {
        // A store that always reports a conflict.
        struct Contended;

        #[async_trait]
        impl KvStore for Contended {
            async fn watch(&self, keys: &[String]) -> Result<Vec<VersionedRead>, StoreError> {
                Ok(keys
                    .iter()
                    .map(|k| VersionedRead {
                        key: k.clone(),
                        value: None,
                        version: 0,
                    })
                    .collect())
            }

            async fn commit(
                &self,
                _watched: &[VersionedRead],
                _writes: Vec<KvWrite>,
            ) -> Result<bool, StoreError> {
                Ok(false)
            }
        }

        let mut calls = 0u32;
        let outcome: Result<Result<(), ()>, _> = transact(
            &Contended,
            CasRetryPolicy { max_attempts: 3 },
            &keys(&["k"]),
            |_reads| {
                calls += 1;
                Ok(((), vec![KvWrite::set("k", "v", None)]))
            },
        )
        .await;

        assert_eq!(calls, 3);
        assert!(matches!(
            outcome,
            Err(TransactError::Contention { attempts: 3 })
        ));
    }

    #[tokio::test]
    async fn transact_rejection_short_circuits_without_writes() {
        let store = MemoryStore::new();
        let outcome: Result<Result<(), &str>, _> = transact(
            &store,
            CasRetryPolicy::default(),
            &keys(&["k"]),
            |_reads| Err("rejected"),
        )
        .await;

        assert_eq!(outcome.expect("no store error").err(), Some("rejected"));
        let reads = store.watch(&keys(&["k"])).await.expect("watch");
        assert!(reads[0].value.is_none());
    }
}
