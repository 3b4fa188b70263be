// Credential pool.
//
// Three rotating credential sets live in the remote store; this component
// caches each one in-process, hands out credentials round-robin, and evicts
// credentials observed as invalid. Concurrent cache refreshes are coalesced:
// at most one `SMEMBERS` is in flight per set, later callers join the shared
// future.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use tokio::sync::Mutex;

use crate::kv::{KvError, KvStore};

// Persistent key names, shared with every other deployment of this gateway.
pub const GEMINI_API_KEY_SET: &str = "GEMINI_API_KEY_SET";
pub const TRANSLATE_KEY_SET: &str = "TRANSLATE_KEY_SET";
pub const AUTH_SECRET_SET: &str = "AUTH_SECRET_SET";
pub const GEMINI_API_KEY_INDEX: &str = "GEMINI_API_KEY_INDEX";
pub const TRANSLATE_KEY_INDEX: &str = "TRANSLATE_KEY_INDEX";

/// Selections between best-effort counter writes to the store.
const COUNTER_PERSIST_INTERVAL: u64 = 100;

/// Truncate a credential for logging. Secrets never appear in full.
pub fn redact(credential: &str) -> String {
    let head: String = credential.chars().take(7).collect();
    format!("{head}…")
}

// ── Sets ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeySet {
    GeminiApiKeys,
    TranslateKeys,
    AuthSecrets,
}

impl KeySet {
    pub fn store_key(self) -> &'static str {
        match self {
            KeySet::GeminiApiKeys => GEMINI_API_KEY_SET,
            KeySet::TranslateKeys => TRANSLATE_KEY_SET,
            KeySet::AuthSecrets => AUTH_SECRET_SET,
        }
    }

    fn counter_key(self) -> Option<&'static str> {
        match self {
            KeySet::GeminiApiKeys => Some(GEMINI_API_KEY_INDEX),
            KeySet::TranslateKeys => Some(TRANSLATE_KEY_INDEX),
            KeySet::AuthSecrets => None,
        }
    }

    fn index(self) -> usize {
        match self {
            KeySet::GeminiApiKeys => 0,
            KeySet::TranslateKeys => 1,
            KeySet::AuthSecrets => 2,
        }
    }
}

impl std::fmt::Display for KeySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.store_key())
    }
}

// ── Errors ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError {
    #[error("credential set {0} is empty")]
    NoCredentials(KeySet),

    #[error("key-value store unavailable")]
    Unavailable,

    #[error("credential load failed: {0}")]
    Store(String),
}

impl From<KvError> for PoolError {
    fn from(err: KvError) -> Self {
        match err {
            KvError::Unavailable => PoolError::Unavailable,
            other => PoolError::Store(other.to_string()),
        }
    }
}

// ── Pool ────────────────────────────────────────────────────────────────

type LoadFuture = Shared<BoxFuture<'static, Result<Arc<Vec<String>>, PoolError>>>;

#[derive(Default)]
struct SetCache {
    /// Last successful load, shortened in place by eviction.
    values: Arc<Vec<String>>,
    loaded_at: Option<Instant>,
    /// At most one refresh per set at any instant.
    inflight: Option<LoadFuture>,
}

pub struct KeyPool {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
    caches: [Arc<Mutex<SetCache>>; 3],
    counters: [AtomicU64; 3],
}

impl KeyPool {
    pub fn new(kv: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self {
            kv,
            ttl,
            caches: std::array::from_fn(|_| Arc::new(Mutex::new(SetCache::default()))),
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Current cached values for a set, refreshing from the store when the
    /// cache is stale. Callers racing on a stale cache share one store call.
    pub async fn load(&self, set: KeySet) -> Result<Arc<Vec<String>>, PoolError> {
        loop {
            let (fut, initiated) = {
                let mut cache = self.caches[set.index()].lock().await;
                if let Some(at) = cache.loaded_at {
                    if at.elapsed() < self.ttl {
                        return Ok(cache.values.clone());
                    }
                }
                match cache.inflight.clone() {
                    Some(fut) => (fut, false),
                    None => {
                        let fut = self.start_load(set);
                        cache.inflight = Some(fut.clone());
                        (fut, true)
                    }
                }
            };

            match fut.await {
                Ok(values) => return Ok(values),
                // The initiator surfaces the failure; joiners fall through
                // and initiate a fresh load.
                Err(err) if initiated => return Err(err),
                Err(_) => continue,
            }
        }
    }

    fn start_load(&self, set: KeySet) -> LoadFuture {
        let kv = self.kv.clone();
        let cache = self.caches[set.index()].clone();
        async move {
            let result = kv.members(set.store_key()).await;
            let mut guard = cache.lock().await;
            guard.inflight = None;
            let values = result.map_err(PoolError::from)?;
            if values.is_empty() {
                return Err(PoolError::NoCredentials(set));
            }
            let values = Arc::new(values);
            guard.values = values.clone();
            guard.loaded_at = Some(Instant::now());
            tracing::debug!("keypool: loaded {} credentials for {}", values.len(), set);
            Ok(values)
        }
        .boxed()
        .shared()
    }

    /// Round-robin selection: advance the set's counter and pick
    /// `values[counter mod len]`. Every `COUNTER_PERSIST_INTERVAL`
    /// selections the counter is written back to the store best-effort.
    pub async fn next_key(&self, set: KeySet) -> Result<String, PoolError> {
        let values = self.load(set).await?;
        if values.is_empty() {
            return Err(PoolError::NoCredentials(set));
        }

        let counter = self.counters[set.index()].fetch_add(1, Ordering::Relaxed) + 1;
        let key = values[(counter as usize) % values.len()].clone();

        if counter % COUNTER_PERSIST_INTERVAL == 0 {
            if let Some(counter_key) = set.counter_key() {
                let kv = self.kv.clone();
                let value = counter.to_string();
                tokio::spawn(async move {
                    if let Err(err) = kv.set(counter_key, &value).await {
                        tracing::warn!("keypool: counter persist failed for {counter_key}: {err}");
                    }
                });
            }
        }

        Ok(key)
    }

    /// Drop a credential observed as invalid: remove it from the local
    /// sequence (order of the rest preserved) and from the remote set.
    pub async fn evict(&self, set: KeySet, credential: &str) {
        {
            let mut cache = self.caches[set.index()].lock().await;
            if cache.values.iter().any(|v| v == credential) {
                let remaining: Vec<String> = cache
                    .values
                    .iter()
                    .filter(|v| v.as_str() != credential)
                    .cloned()
                    .collect();
                cache.values = Arc::new(remaining);
            }
        }

        match self.kv.remove_member(set.store_key(), credential).await {
            Ok(()) => {
                tracing::info!("keypool: evicted credential {} from {}", redact(credential), set)
            }
            Err(err) => {
                tracing::warn!(
                    "keypool: failed to remove credential {} from {}: {}",
                    redact(credential),
                    set,
                    err
                )
            }
        }
    }

    /// `true` iff the secret is a known client credential. Checks the cached
    /// auth-secret set first, then falls back to a store membership probe;
    /// a confirmed secret warms the local cache. With the store unavailable
    /// this always answers `false` (default deny).
    pub async fn validate_auth(&self, secret: &str) -> bool {
        if let Ok(values) = self.load(KeySet::AuthSecrets).await {
            if values.iter().any(|v| v == secret) {
                return true;
            }
        }

        match self.kv.is_member(AUTH_SECRET_SET, secret).await {
            Ok(true) => {
                let mut cache = self.caches[KeySet::AuthSecrets.index()].lock().await;
                if !cache.values.iter().any(|v| v == secret) {
                    let mut values = cache.values.as_ref().clone();
                    values.push(secret.to_string());
                    cache.values = Arc::new(values);
                }
                true
            }
            Ok(false) => false,
            Err(err) => {
                tracing::debug!("keypool: auth validation degraded to deny: {err}");
                false
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{KvResult, MemoryKv, UnavailableKv};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::HashMap;

    fn pool_over(kv: Arc<dyn KvStore>) -> KeyPool {
        KeyPool::new(kv, Duration::from_secs(600))
    }

    #[tokio::test]
    async fn round_robin_is_fair() {
        let kv = Arc::new(MemoryKv::new());
        kv.seed_set(GEMINI_API_KEY_SET, &["a", "b", "c"]);
        let pool = pool_over(kv);

        let mut picks: HashMap<String, usize> = HashMap::new();
        for _ in 0..9 {
            let key = pool.next_key(KeySet::GeminiApiKeys).await.unwrap();
            *picks.entry(key).or_default() += 1;
        }
        assert_eq!(picks.len(), 3);
        assert!(picks.values().all(|&n| n == 3), "uneven rotation: {picks:?}");
    }

    #[tokio::test]
    async fn empty_set_yields_no_credentials() {
        let kv = Arc::new(MemoryKv::new());
        let pool = pool_over(kv);
        let err = pool.next_key(KeySet::TranslateKeys).await.unwrap_err();
        assert!(matches!(err, PoolError::NoCredentials(KeySet::TranslateKeys)));
    }

    /// Store whose `members` answers slowly, so concurrent loads overlap.
    struct SlowKv(Arc<MemoryKv>);

    #[async_trait]
    impl KvStore for SlowKv {
        async fn members(&self, set: &str) -> KvResult<Vec<String>> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.0.members(set).await
        }
        async fn is_member(&self, set: &str, value: &str) -> KvResult<bool> {
            self.0.is_member(set, value).await
        }
        async fn add_member(&self, set: &str, value: &str) -> KvResult<()> {
            self.0.add_member(set, value).await
        }
        async fn remove_member(&self, set: &str, value: &str) -> KvResult<()> {
            self.0.remove_member(set, value).await
        }
        async fn incr(&self, counter: &str) -> KvResult<i64> {
            self.0.incr(counter).await
        }
        async fn get(&self, key: &str) -> KvResult<Option<String>> {
            self.0.get(key).await
        }
        async fn set(&self, key: &str, value: &str) -> KvResult<()> {
            self.0.set(key, value).await
        }
        async fn set_with_ttl(&self, key: &str, value: &str, ttl: u64) -> KvResult<()> {
            self.0.set_with_ttl(key, value, ttl).await
        }
        async fn mget(&self, keys: &[String]) -> KvResult<Vec<Option<String>>> {
            self.0.mget(keys).await
        }
        async fn pipeline(&self, commands: Vec<Vec<String>>) -> KvResult<Vec<Value>> {
            self.0.pipeline(commands).await
        }
    }

    #[tokio::test]
    async fn concurrent_loads_coalesce_into_one_store_call() {
        let memory = Arc::new(MemoryKv::new());
        memory.seed_set(GEMINI_API_KEY_SET, &["a", "b"]);
        let pool = Arc::new(pool_over(Arc::new(SlowKv(memory.clone()))));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.load(KeySet::GeminiApiKeys).await })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }

        assert_eq!(
            memory.members_calls.load(Ordering::SeqCst),
            1,
            "concurrent stale loads must share one SMEMBERS call"
        );
    }

    #[tokio::test]
    async fn evict_removes_locally_and_remotely() {
        let kv = Arc::new(MemoryKv::new());
        kv.seed_set(GEMINI_API_KEY_SET, &["a", "b", "c"]);
        let pool = pool_over(kv.clone());

        pool.load(KeySet::GeminiApiKeys).await.unwrap();
        pool.evict(KeySet::GeminiApiKeys, "b").await;

        assert!(!kv.set_contains(GEMINI_API_KEY_SET, "b"));
        assert_eq!(kv.remove_member_calls.load(Ordering::SeqCst), 1);

        // Local sequence shortened immediately, order of the rest preserved.
        let values = pool.load(KeySet::GeminiApiKeys).await.unwrap();
        assert_eq!(values.as_ref(), &["a".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn auth_validates_from_cache_and_membership_fallback() {
        let kv = Arc::new(MemoryKv::new());
        kv.seed_set(AUTH_SECRET_SET, &["alpha"]);
        let pool = pool_over(kv.clone());

        assert!(pool.validate_auth("alpha").await);
        assert!(!pool.validate_auth("nope").await);

        // Added behind the cache's back: membership probe finds it and the
        // local cache is warmed, so the second lookup skips the store.
        kv.add_member(AUTH_SECRET_SET, "beta").await.unwrap();
        assert!(pool.validate_auth("beta").await);
        let calls_before = kv.members_calls.load(Ordering::SeqCst);
        assert!(pool.validate_auth("beta").await);
        assert_eq!(kv.members_calls.load(Ordering::SeqCst), calls_before);
    }

    #[tokio::test]
    async fn auth_denies_when_store_unavailable() {
        let pool = pool_over(Arc::new(UnavailableKv));
        assert!(!pool.validate_auth("anything").await);
    }
}
