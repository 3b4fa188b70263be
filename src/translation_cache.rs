// Content-addressed translation cache.
//
// Keys are a pure function of (text, source language, target language); the
// records live in the remote store under a `translation:` prefix with a
// configurable TTL. A small local LRU memoizes the identifier → key mapping
// so batch traffic does not re-hash hot texts.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use lru::LruCache;
use sha1::{Digest, Sha1};

use crate::kv::KvStore;
use crate::models::TranslationRecord;

const CACHE_PREFIX: &str = "translation:";

/// Identifiers shorter than this are embedded in the key directly
/// (url-safe base64); longer ones are hashed.
const SHORT_IDENTIFIER_LIMIT: usize = 100;

/// Derive the store key for one translation. Total in its inputs: equal
/// triples yield equal keys, any differing component yields a different key.
pub fn cache_key(text: &str, source_lang: Option<&str>, target_lang: &str) -> String {
    let identifier = format!(
        "{}:{}:{}",
        source_lang.unwrap_or("auto"),
        target_lang,
        text
    );
    if identifier.len() < SHORT_IDENTIFIER_LIMIT {
        format!("{CACHE_PREFIX}{}", URL_SAFE_NO_PAD.encode(identifier.as_bytes()))
    } else {
        format!("{CACHE_PREFIX}{}", hex::encode(Sha1::digest(identifier.as_bytes())))
    }
}

pub struct TranslationCache {
    kv: Arc<dyn KvStore>,
    ttl_seconds: u64,
    key_memo: std::sync::Mutex<LruCache<String, String>>,
}

impl TranslationCache {
    pub fn new(kv: Arc<dyn KvStore>, ttl_seconds: u64, key_memo_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(key_memo_capacity.max(1)).unwrap();
        Self {
            kv,
            ttl_seconds,
            key_memo: std::sync::Mutex::new(LruCache::new(capacity)),
        }
    }

    fn memoized_key(&self, text: &str, source_lang: Option<&str>, target_lang: &str) -> String {
        let identifier = format!("{}:{}:{}", source_lang.unwrap_or("auto"), target_lang, text);
        let mut memo = self.key_memo.lock().unwrap();
        if let Some(key) = memo.get(&identifier) {
            return key.clone();
        }
        let key = cache_key(text, source_lang, target_lang);
        memo.put(identifier, key.clone());
        key
    }

    /// Look up a single prior translation. Store trouble reads as a miss.
    pub async fn get(
        &self,
        text: &str,
        source_lang: Option<&str>,
        target_lang: &str,
    ) -> Option<TranslationRecord> {
        let key = self.memoized_key(text, source_lang, target_lang);
        match self.kv.get(&key).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).ok(),
            Ok(None) => None,
            Err(err) => {
                tracing::debug!("translation_cache: read degraded to miss: {err}");
                None
            }
        }
    }

    /// Batch lookup, one `MGET` in input order. Returns text → record for
    /// every hit; an unavailable store yields an empty map.
    pub async fn get_multiple(
        &self,
        texts: &[String],
        source_lang: Option<&str>,
        target_lang: &str,
    ) -> HashMap<String, TranslationRecord> {
        if texts.is_empty() {
            return HashMap::new();
        }
        let keys: Vec<String> = texts
            .iter()
            .map(|t| self.memoized_key(t, source_lang, target_lang))
            .collect();

        let rows = match self.kv.mget(&keys).await {
            Ok(rows) => rows,
            Err(err) => {
                tracing::debug!("translation_cache: batch read degraded to miss: {err}");
                return HashMap::new();
            }
        };

        texts
            .iter()
            .zip(rows)
            .filter_map(|(text, raw)| {
                let record: TranslationRecord = serde_json::from_str(&raw?).ok()?;
                Some((text.clone(), record))
            })
            .collect()
    }

    /// Write a single translation. Failures are logged and dropped.
    pub async fn set(
        &self,
        text: &str,
        source_lang: Option<&str>,
        target_lang: &str,
        record: &TranslationRecord,
    ) {
        let key = self.memoized_key(text, source_lang, target_lang);
        let Ok(raw) = serde_json::to_string(record) else {
            return;
        };
        if let Err(err) = self.kv.set_with_ttl(&key, &raw, self.ttl_seconds).await {
            tracing::debug!("translation_cache: write dropped: {err}");
        }
    }

    /// Write a batch of translations as one pipelined `SET ... EX` per entry.
    pub async fn set_multiple(
        &self,
        entries: &[(String, TranslationRecord)],
        source_lang: Option<&str>,
        target_lang: &str,
    ) {
        if entries.is_empty() {
            return;
        }
        let ttl = self.ttl_seconds.to_string();
        let commands: Vec<Vec<String>> = entries
            .iter()
            .filter_map(|(text, record)| {
                let raw = serde_json::to_string(record).ok()?;
                Some(vec![
                    "SET".to_string(),
                    self.memoized_key(text, source_lang, target_lang),
                    raw,
                    "EX".to_string(),
                    ttl.clone(),
                ])
            })
            .collect();

        if let Err(err) = self.kv.pipeline(commands).await {
            tracing::debug!("translation_cache: batch write dropped: {err}");
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────
