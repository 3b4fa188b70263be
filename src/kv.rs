// Key-value store adapter.
//
// The authoritative store behind the gateway is a Redis-compatible service
// reached over its REST bridge (Upstash style): one JSON command array per
// request, `Authorization: Bearer <token>`, `{"result": ...}` back. Only the
// handful of operations the gateway needs is exposed, behind the `KvStore`
// capability so the pool and caches never depend on the wire format.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{Value, json};

// ── Errors ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, thiserror::Error)]
pub enum KvError {
    /// Store credentials are not configured; callers must degrade.
    #[error("key-value store is not configured")]
    Unavailable,

    #[error("key-value store request failed: {0}")]
    Http(String),

    #[error("key-value store rejected command: {0}")]
    Command(String),

    #[error("unexpected key-value store reply: {0}")]
    Decode(String),
}

pub type KvResult<T> = Result<T, KvError>;

// ── Capability ──────────────────────────────────────────────────────────

/// The store operations the core depends on. All are idempotent and
/// retry-safe at the HTTP layer.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// All members of a set, in whatever order the store returns them.
    async fn members(&self, set: &str) -> KvResult<Vec<String>>;

    async fn is_member(&self, set: &str, value: &str) -> KvResult<bool>;

    async fn add_member(&self, set: &str, value: &str) -> KvResult<()>;

    async fn remove_member(&self, set: &str, value: &str) -> KvResult<()>;

    /// Atomically increment a counter, returning the new value.
    async fn incr(&self, counter: &str) -> KvResult<i64>;

    async fn get(&self, key: &str) -> KvResult<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> KvResult<()>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl_seconds: u64) -> KvResult<()>;

    /// Multi-get preserving input order; misses come back as `None`.
    async fn mget(&self, keys: &[String]) -> KvResult<Vec<Option<String>>>;

    /// Run raw commands as one pipeline, results in command order.
    async fn pipeline(&self, commands: Vec<Vec<String>>) -> KvResult<Vec<Value>>;
}

// ── REST client ─────────────────────────────────────────────────────────

/// Redis-over-REST client. Built from `UPSTASH_REDIS_REST_URL` /
/// `UPSTASH_REDIS_REST_TOKEN`; when either is missing every call reports
/// `KvError::Unavailable` so downstream components degrade explicitly.
pub struct KvClient {
    http: reqwest::Client,
    endpoint: Option<(String, String)>,
}

impl KvClient {
    pub fn new(http: reqwest::Client, url: Option<String>, token: Option<String>) -> Self {
        let endpoint = match (url, token) {
            (Some(u), Some(t)) => Some((u.trim_end_matches('/').to_string(), t)),
            _ => {
                tracing::warn!("kv: store credentials not configured, adapter is unavailable");
                None
            }
        };
        Self { http, endpoint }
    }

    fn endpoint(&self) -> KvResult<&(String, String)> {
        self.endpoint.as_ref().ok_or(KvError::Unavailable)
    }

    /// Run one command, returning the raw `result` value.
    async fn command(&self, cmd: &[&str]) -> KvResult<Value> {
        let (base, token) = self.endpoint()?;
        let resp = self
            .http
            .post(base)
            .bearer_auth(token)
            .json(&json!(cmd))
            .send()
            .await
            .map_err(|e| KvError::Http(e.to_string()))?;

        let body: Value = resp
            .json()
            .await
            .map_err(|e| KvError::Decode(e.to_string()))?;
        if let Some(err) = body.get("error").and_then(Value::as_str) {
            return Err(KvError::Command(err.to_string()));
        }
        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }

    fn as_string_vec(value: Value) -> KvResult<Vec<String>> {
        value
            .as_array()
            .ok_or_else(|| KvError::Decode("expected array result".into()))?
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| KvError::Decode("expected string element".into()))
            })
            .collect()
    }
}

#[async_trait]
impl KvStore for KvClient {
    async fn members(&self, set: &str) -> KvResult<Vec<String>> {
        Self::as_string_vec(self.command(&["SMEMBERS", set]).await?)
    }

    async fn is_member(&self, set: &str, value: &str) -> KvResult<bool> {
        Ok(self.command(&["SISMEMBER", set, value]).await?.as_i64() == Some(1))
    }

    async fn add_member(&self, set: &str, value: &str) -> KvResult<()> {
        self.command(&["SADD", set, value]).await.map(|_| ())
    }

    async fn remove_member(&self, set: &str, value: &str) -> KvResult<()> {
        self.command(&["SREM", set, value]).await.map(|_| ())
    }

    async fn incr(&self, counter: &str) -> KvResult<i64> {
        self.command(&["INCR", counter])
            .await?
            .as_i64()
            .ok_or_else(|| KvError::Decode("expected integer result".into()))
    }

    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        Ok(self
            .command(&["GET", key])
            .await?
            .as_str()
            .map(str::to_string))
    }

    async fn set(&self, key: &str, value: &str) -> KvResult<()> {
        self.command(&["SET", key, value]).await.map(|_| ())
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl_seconds: u64) -> KvResult<()> {
        let ttl = ttl_seconds.to_string();
        self.command(&["SET", key, value, "EX", ttl.as_str()])
            .await
            .map(|_| ())
    }

    async fn mget(&self, keys: &[String]) -> KvResult<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut cmd = vec!["MGET"];
        cmd.extend(keys.iter().map(String::as_str));
        let result = self.command(&cmd).await?;
        result
            .as_array()
            .ok_or_else(|| KvError::Decode("expected array result".into()))?
            .iter()
            .map(|v| match v {
                Value::Null => Ok(None),
                Value::String(s) => Ok(Some(s.clone())),
                other => Err(KvError::Decode(format!("unexpected mget element: {other}"))),
            })
            .collect()
    }

    async fn pipeline(&self, commands: Vec<Vec<String>>) -> KvResult<Vec<Value>> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        let (base, token) = self.endpoint()?;
        let resp = self
            .http
            .post(format!("{base}/pipeline"))
            .bearer_auth(token)
            .json(&commands)
            .send()
            .await
            .map_err(|e| KvError::Http(e.to_string()))?;

        let body: Value = resp
            .json()
            .await
            .map_err(|e| KvError::Decode(e.to_string()))?;
        let entries = body
            .as_array()
            .ok_or_else(|| KvError::Decode("expected pipeline array".into()))?;
        Ok(entries
            .iter()
            .map(|e| e.get("result").cloned().unwrap_or(Value::Null))
            .collect())
    }
}

// ── In-memory store for tests ───────────────────────────────────────────

/// In-process `KvStore` used by `AppState::new_test` and the integration
/// tests. Ignores TTLs; counts `members`/`remove_member` calls so tests can
/// assert on load coalescing and eviction.
#[doc(hidden)]
#[derive(Default)]
pub struct MemoryKv {
    sets: std::sync::Mutex<HashMap<String, Vec<String>>>,
    strings: std::sync::Mutex<HashMap<String, String>>,
    pub members_calls: std::sync::atomic::AtomicUsize,
    pub remove_member_calls: std::sync::atomic::AtomicUsize,
}

#[doc(hidden)]
impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_set(&self, set: &str, values: &[&str]) {
        self.sets
            .lock()
            .unwrap()
            .insert(set.to_string(), values.iter().map(|v| v.to_string()).collect());
    }

    pub fn seed_string(&self, key: &str, value: &str) {
        self.strings
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }

    pub fn set_contains(&self, set: &str, value: &str) -> bool {
        self.sets
            .lock()
            .unwrap()
            .get(set)
            .is_some_and(|v| v.iter().any(|m| m == value))
    }

    pub fn string_value(&self, key: &str) -> Option<String> {
        self.strings.lock().unwrap().get(key).cloned()
    }

    pub fn string_count(&self) -> usize {
        self.strings.lock().unwrap().len()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn members(&self, set: &str) -> KvResult<Vec<String>> {
        self.members_calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(self
            .sets
            .lock()
            .unwrap()
            .get(set)
            .cloned()
            .unwrap_or_default())
    }

    async fn is_member(&self, set: &str, value: &str) -> KvResult<bool> {
        Ok(self.set_contains(set, value))
    }

    async fn add_member(&self, set: &str, value: &str) -> KvResult<()> {
        let mut sets = self.sets.lock().unwrap();
        let entry = sets.entry(set.to_string()).or_default();
        if !entry.iter().any(|m| m == value) {
            entry.push(value.to_string());
        }
        Ok(())
    }

    async fn remove_member(&self, set: &str, value: &str) -> KvResult<()> {
        self.remove_member_calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if let Some(entry) = self.sets.lock().unwrap().get_mut(set) {
            entry.retain(|m| m != value);
        }
        Ok(())
    }

    async fn incr(&self, counter: &str) -> KvResult<i64> {
        let mut strings = self.strings.lock().unwrap();
        let next = strings
            .get(counter)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0)
            + 1;
        strings.insert(counter.to_string(), next.to_string());
        Ok(next)
    }

    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        Ok(self.string_value(key))
    }

    async fn set(&self, key: &str, value: &str) -> KvResult<()> {
        self.seed_string(key, value);
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: &str, _ttl_seconds: u64) -> KvResult<()> {
        self.seed_string(key, value);
        Ok(())
    }

    async fn mget(&self, keys: &[String]) -> KvResult<Vec<Option<String>>> {
        let strings = self.strings.lock().unwrap();
        Ok(keys.iter().map(|k| strings.get(k).cloned()).collect())
    }

    async fn pipeline(&self, commands: Vec<Vec<String>>) -> KvResult<Vec<Value>> {
        let mut out = Vec::with_capacity(commands.len());
        for cmd in commands {
            match cmd.first().map(String::as_str) {
                Some("SET") if cmd.len() >= 3 => {
                    self.seed_string(&cmd[1], &cmd[2]);
                    out.push(json!("OK"));
                }
                other => {
                    return Err(KvError::Command(format!(
                        "unsupported pipeline command: {other:?}"
                    )));
                }
            }
        }
        Ok(out)
    }
}

/// Store that always reports unavailable; used to exercise default-deny
/// paths in tests.
#[doc(hidden)]
#[derive(Default)]
pub struct UnavailableKv;

#[async_trait]
impl KvStore for UnavailableKv {
    async fn members(&self, _set: &str) -> KvResult<Vec<String>> {
        Err(KvError::Unavailable)
    }
    async fn is_member(&self, _set: &str, _value: &str) -> KvResult<bool> {
        Err(KvError::Unavailable)
    }
    async fn add_member(&self, _set: &str, _value: &str) -> KvResult<()> {
        Err(KvError::Unavailable)
    }
    async fn remove_member(&self, _set: &str, _value: &str) -> KvResult<()> {
        Err(KvError::Unavailable)
    }
    async fn incr(&self, _counter: &str) -> KvResult<i64> {
        Err(KvError::Unavailable)
    }
    async fn get(&self, _key: &str) -> KvResult<Option<String>> {
        Err(KvError::Unavailable)
    }
    async fn set(&self, _key: &str, _value: &str) -> KvResult<()> {
        Err(KvError::Unavailable)
    }
    async fn set_with_ttl(&self, _key: &str, _value: &str, _ttl: u64) -> KvResult<()> {
        Err(KvError::Unavailable)
    }
    async fn mget(&self, _keys: &[String]) -> KvResult<Vec<Option<String>>> {
        Err(KvError::Unavailable)
    }
    async fn pipeline(&self, _commands: Vec<Vec<String>>) -> KvResult<Vec<Value>> {
        Err(KvError::Unavailable)
    }
}
