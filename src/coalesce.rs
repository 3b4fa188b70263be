// In-flight request coalescing.
//
// Identical concurrent client requests collapse into a single pipeline
// execution: the first arrival installs a shared future under the request's
// fingerprint, later arrivals within the window await the same future and
// receive the same response. Entries linger for a short tail window after
// completion so immediate repeats still join.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use http::StatusCode;
use sha1::{Digest, Sha1};

// ── Fingerprint ─────────────────────────────────────────────────────────

/// Canonical identity of a client request. Idempotent verbs key on the full
/// URL; POST keys on path plus a body digest. A POST whose body could not be
/// read gets a uniqueness salt, deliberately defeating deduplication.
pub fn fingerprint(method: &http::Method, uri: &http::Uri, body: Option<&[u8]>) -> String {
    if method == http::Method::POST {
        match body {
            Some(bytes) => format!("POST:{}:{}", uri.path(), hex::encode(Sha1::digest(bytes))),
            None => format!(
                "POST:{}:{}:{}",
                uri.path(),
                chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default(),
                uuid::Uuid::new_v4()
            ),
        }
    } else {
        format!("{method}:{uri}")
    }
}

// ── Coalescer ───────────────────────────────────────────────────────────

/// The response shape shared between coalesced callers. Joiners receive the
/// same status and body bytes; per-caller framing (request-id header) is
/// rebuilt by the HTTP layer.
#[derive(Debug, Clone)]
pub struct SharedResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body: Bytes,
}

type PendingFuture = Shared<BoxFuture<'static, SharedResponse>>;

pub struct Coalescer {
    pending: Arc<tokio::sync::Mutex<HashMap<String, PendingFuture>>>,
    tail_ttl: Duration,
}

impl Coalescer {
    pub fn new(tail_ttl: Duration) -> Self {
        Self {
            pending: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            tail_ttl,
        }
    }

    /// Run `work` under the given fingerprint, or join an execution already
    /// in flight. The entry is removed `tail_ttl` after the result is
    /// delivered.
    pub async fn run<F>(&self, key: String, work: F) -> SharedResponse
    where
        F: Future<Output = SharedResponse> + Send + 'static,
    {
        let (fut, inserted) = {
            let mut pending = self.pending.lock().await;
            match pending.get(&key) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let fut: PendingFuture = work.boxed().shared();
                    pending.insert(key.clone(), fut.clone());
                    (fut.clone(), true)
                }
            }
        };

        if inserted {
            // The cleanup task holds its own handle on the shared future, so
            // the pipeline runs to completion even if every client goes away;
            // the entry leaves the map one tail window after delivery.
            let done = fut.clone();
            let pending = self.pending.clone();
            let ttl = self.tail_ttl;
            tokio::spawn(async move {
                let _ = done.await;
                tokio::time::sleep(ttl).await;
                pending.lock().await.remove(&key);
            });
        } else {
            tracing::debug!("coalesce: joined in-flight request");
        }

        fut.await
    }

    #[doc(hidden)]
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────
