// Application state.
//
// Every core component is built eagerly at startup and owned here; handlers
// reach them through the cloned `AppState`. Nothing initializes lazily
// except the credential caches, which refresh behind their single-inflight
// load protocol.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::circuit::BreakerRegistry;
use crate::coalesce::Coalescer;
use crate::config::Config;
use crate::keypool::KeyPool;
use crate::kv::{KvClient, KvStore};
use crate::translation_cache::TranslationCache;
use crate::translator::Translator;

/// Central application state. Clone-friendly, everything inside is Arc.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub http_client: reqwest::Client,
    pub kv: Arc<dyn KvStore>,
    pub key_pool: Arc<KeyPool>,
    pub translator: Arc<Translator>,
    pub breakers: Arc<BreakerRegistry>,
    pub coalescer: Arc<Coalescer>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let http_client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .expect("Failed to build HTTP client");

        let kv: Arc<dyn KvStore> = Arc::new(KvClient::new(
            http_client.clone(),
            config.kv_rest_url.clone(),
            config.kv_rest_token.clone(),
        ));

        Self::assemble(Arc::new(config), http_client, kv)
    }

    fn assemble(config: Arc<Config>, http_client: reqwest::Client, kv: Arc<dyn KvStore>) -> Self {
        let key_pool = Arc::new(KeyPool::new(kv.clone(), config.cache_duration));
        let translation_cache = Arc::new(TranslationCache::new(
            kv.clone(),
            config.translation_cache_ttl,
            config.key_cache_size,
        ));
        let breakers = Arc::new(BreakerRegistry::with_settings(
            config.circuit_failure_threshold,
            config.circuit_success_threshold,
            config.circuit_timeout,
        ));
        let translator = Arc::new(Translator::new(
            config.clone(),
            http_client.clone(),
            key_pool.clone(),
            translation_cache,
            breakers.clone(),
        ));
        let coalescer = Arc::new(Coalescer::new(config.request_dedup_ttl));

        tracing::info!(
            "state: initialised (model {}, upstream {}, kv configured: {})",
            config.gemini_model,
            config.gemini_base_url,
            config.kv_rest_url.is_some()
        );

        Self {
            config,
            http_client,
            kv,
            key_pool,
            translator,
            breakers,
            coalescer,
            start_time: Instant::now(),
        }
    }

    /// Test-only constructor over an injected store (usually `kv::MemoryKv`)
    /// so integration tests run without a real key-value service.
    #[doc(hidden)]
    pub fn new_test(kv: Arc<dyn KvStore>) -> Self {
        Self::new_test_with_config(Config::for_tests(), kv)
    }

    /// Test-only constructor with full control over the configuration
    /// (mock upstream base URL, short timeouts, breaker thresholds).
    #[doc(hidden)]
    pub fn new_test_with_config(config: Config, kv: Arc<dyn KvStore>) -> Self {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .expect("Failed to build HTTP client");
        Self::assemble(Arc::new(config), http_client, kv)
    }
}
