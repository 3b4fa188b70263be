// Translation batch engine.
//
// Deduplicates the request's texts, serves what it can from the translation
// cache, and fans the misses out to the upstream model under a fair
// semaphore (`PARALLEL_TRANSLATION_LIMIT` permits, FIFO waiters). Output
// order always matches input order; a text that cannot be translated comes
// back as itself with `detected_source_lang: "unknown"` instead of failing
// the batch.

use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::Semaphore;

use crate::circuit::BreakerRegistry;
use crate::config::Config;
use crate::keypool::{KeyPool, KeySet};
use crate::models::TranslationRecord;
use crate::retry::{RetryContext, RetryError, execute_with_retry, validate_json_response};
use crate::translation_cache::TranslationCache;

pub struct Translator {
    config: Arc<Config>,
    http: reqwest::Client,
    pool: Arc<KeyPool>,
    cache: Arc<TranslationCache>,
    breakers: Arc<BreakerRegistry>,
    permits: Arc<Semaphore>,
}

/// Prompt sent to the model. An unset or `auto` source language lets the
/// model detect it.
fn build_prompt(text: &str, source_lang: Option<&str>, target_lang: &str) -> String {
    match source_lang {
        Some(source) if source != "auto" => {
            format!("Translate from {source} to {target_lang}: \"{text}\"")
        }
        _ => format!("Translate to {target_lang}: \"{text}\""),
    }
}

/// Pull the translated text out of a generateContent response.
fn extract_translation(body: &Value) -> Option<String> {
    let text = body
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .get(0)?
        .get("text")?
        .as_str()?
        .trim();
    (!text.is_empty()).then(|| text.to_string())
}

impl Translator {
    pub fn new(
        config: Arc<Config>,
        http: reqwest::Client,
        pool: Arc<KeyPool>,
        cache: Arc<TranslationCache>,
        breakers: Arc<BreakerRegistry>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.parallel_translation_limit.max(1)));
        Self {
            config,
            http,
            pool,
            cache,
            breakers,
            permits,
        }
    }

    /// The dedicated translation pool when it is populated, the general
    /// Gemini pool otherwise.
    async fn credential_set(&self) -> KeySet {
        match self.pool.load(KeySet::TranslateKeys).await {
            Ok(values) if !values.is_empty() => KeySet::TranslateKeys,
            _ => KeySet::GeminiApiKeys,
        }
    }

    fn generate_content_url(&self) -> String {
        format!(
            "{}/{}/models/{}:generateContent",
            self.config.gemini_base_url, self.config.gemini_api_version, self.config.gemini_model
        )
    }

    /// Translate one batch. The output is aligned 1:1 with `texts`.
    ///
    /// Only pool-level trouble (no credentials, exhausted transport) fails
    /// the call; per-text upstream failures degrade to fallback records.
    pub async fn translate_batch(
        &self,
        texts: &[String],
        target_lang: &str,
        source_lang: Option<&str>,
        request_id: &str,
    ) -> Result<Vec<TranslationRecord>, RetryError> {
        // Dedup preserving first occurrence; remember where each text goes.
        let mut unique: Vec<String> = Vec::new();
        for text in texts {
            if !unique.contains(text) {
                unique.push(text.clone());
            }
        }

        let mut translations = self
            .cache
            .get_multiple(&unique, source_lang, target_lang)
            .await;
        let misses: Vec<&String> = unique
            .iter()
            .filter(|t| !translations.contains_key(*t))
            .collect();

        tracing::debug!(
            "translate[{}]: {} texts, {} unique, {} cache hits, {} misses",
            request_id,
            texts.len(),
            unique.len(),
            translations.len(),
            misses.len()
        );

        let results = futures_util::future::join_all(misses.iter().map(|text| async {
            let _permit = self
                .permits
                .acquire()
                .await
                .expect("translation semaphore closed");
            self.translate_one(text.as_str(), source_lang, target_lang, request_id)
                .await
                .map(|(record, cacheable)| (text.to_string(), record, cacheable))
        }))
        .await;

        let mut fresh: Vec<(String, TranslationRecord)> = Vec::new();
        for result in results {
            let (text, record, cacheable) = result?;
            // Fallback records never reach the cache; they would pin the
            // failure for the whole cache TTL.
            if cacheable {
                fresh.push((text.clone(), record.clone()));
            }
            translations.insert(text, record);
        }

        if !fresh.is_empty() {
            let cache = self.cache.clone();
            let source = source_lang.map(str::to_string);
            let target = target_lang.to_string();
            tokio::spawn(async move {
                cache
                    .set_multiple(&fresh, source.as_deref(), &target)
                    .await;
            });
        }

        Ok(texts
            .iter()
            .map(|text| {
                translations.get(text).cloned().unwrap_or(TranslationRecord {
                    detected_source_lang: "unknown".to_string(),
                    text: text.clone(),
                })
            })
            .collect())
    }

    /// Translate a single text: cache probe, then the retry executor against
    /// the upstream model. Exhaustion and parse failures produce the
    /// fallback record carrying the original text. The flag says whether the
    /// record is a fresh translation worth writing back to the cache.
    async fn translate_one(
        &self,
        text: &str,
        source_lang: Option<&str>,
        target_lang: &str,
        request_id: &str,
    ) -> Result<(TranslationRecord, bool), RetryError> {
        if let Some(record) = self.cache.get(text, source_lang, target_lang).await {
            return Ok((record, false));
        }

        let prompt = build_prompt(text, source_lang, target_lang);
        let body = json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "system_instruction": { "parts": [{ "text": self.config.system_instruction }] },
        });
        let url = self.generate_content_url();

        let ctx = RetryContext {
            breakers: &self.breakers,
            pool: &self.pool,
            set: self.credential_set().await,
            max_attempts: self.config.max_retries,
            request_timeout: self.config.request_timeout,
            request_id,
        };

        let response = execute_with_retry(
            ctx,
            &self.http,
            |credential| {
                self.http
                    .post(&url)
                    .query(&[("key", credential)])
                    .json(&body)
            },
            validate_json_response,
        )
        .await?;

        let translated = response
            .as_ref()
            .and_then(|resp| resp.json())
            .as_ref()
            .and_then(extract_translation);

        match translated {
            Some(text) => Ok((
                TranslationRecord {
                    detected_source_lang: source_lang.unwrap_or("auto").to_string(),
                    text,
                },
                true,
            )),
            None => {
                tracing::warn!(
                    "translate[{}]: no usable translation for one text, returning original",
                    request_id
                );
                Ok((
                    TranslationRecord {
                        detected_source_lang: source_lang.unwrap_or("unknown").to_string(),
                        text: text.to_string(),
                    },
                    false,
                ))
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_includes_source_only_when_known() {
        assert_eq!(
            build_prompt("Hello", Some("en"), "es"),
            "Translate from en to es: \"Hello\""
        );
        assert_eq!(build_prompt("Hello", None, "es"), "Translate to es: \"Hello\"");
        assert_eq!(
            build_prompt("Hello", Some("auto"), "es"),
            "Translate to es: \"Hello\""
        );
    }

    #[test]
    fn extracts_and_trims_candidate_text() {
        let body = json!({
            "candidates": [{ "content": { "parts": [{ "text": "  Hola  " }] } }]
        });
        assert_eq!(extract_translation(&body), Some("Hola".to_string()));

        assert_eq!(extract_translation(&json!({ "candidates": [] })), None);
        assert_eq!(
            extract_translation(&json!({
                "candidates": [{ "content": { "parts": [{ "text": "   " }] } }]
            })),
            None
        );
    }
}
