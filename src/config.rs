// Environment-driven configuration.
//
// Every option is read once at startup into a `Config` value owned by
// `AppState`; nothing reads the environment lazily afterwards.

use std::time::Duration;

/// Gateway configuration, loaded from the environment (see `.env.example`).
#[derive(Debug, Clone)]
pub struct Config {
    /// Upper bound on retry-executor attempts per upstream call.
    pub max_retries: u32,
    /// TTL for the in-process credential-set caches.
    pub cache_duration: Duration,
    /// TTL (seconds) for translation entries in the remote store.
    pub translation_cache_ttl: u64,
    /// Capacity of the local cache-key memo.
    pub key_cache_size: usize,
    /// Per-attempt upstream timeout.
    pub request_timeout: Duration,
    /// Maximum concurrent upstream translation calls.
    pub parallel_translation_limit: usize,
    /// Reserved inter-batch delay (kept for config compatibility).
    pub batch_delay: Duration,
    /// Tail window during which a completed request still coalesces repeats.
    pub request_dedup_ttl: Duration,
    /// Fallback log level when RUST_LOG is unset (none/error/warn/info/debug).
    pub log_level: String,

    /// Consecutive failures before a host's circuit opens.
    pub circuit_failure_threshold: u32,
    /// Successful trial calls before an open circuit closes again.
    pub circuit_success_threshold: u32,
    /// Cooldown while a circuit stays open.
    pub circuit_timeout: Duration,

    /// Upstream model name, e.g. `gemini-2.0-flash`.
    pub gemini_model: String,
    /// Upstream base URL, no trailing slash.
    pub gemini_base_url: String,
    /// Upstream API version path segment.
    pub gemini_api_version: String,
    /// System prompt sent with every translation request.
    pub system_instruction: String,

    /// Upstash-style REST endpoint of the key-value store. `None` together
    /// with a missing token means the KV adapter reports unavailable.
    pub kv_rest_url: Option<String>,
    /// Bearer token for the key-value store.
    pub kv_rest_token: Option<String>,

    /// HTTP listen port.
    pub port: u16,
}

const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are a professional translation engine. \
Translate the text exactly as asked and reply with the translated text only, \
no explanations, no quotes.";

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    /// Read all recognized options, applying defaults for anything unset.
    pub fn from_env() -> Self {
        Self {
            max_retries: env_parse("MAX_RETRIES", 20),
            cache_duration: Duration::from_secs(env_parse("CACHE_DURATION_SECONDS", 600)),
            translation_cache_ttl: env_parse("TRANSLATION_CACHE_TTL", 86_400),
            key_cache_size: env_parse("KEY_CACHE_SIZE", 1000),
            request_timeout: Duration::from_millis(env_parse("REQUEST_TIMEOUT_MS", 20_000)),
            parallel_translation_limit: env_parse("PARALLEL_TRANSLATION_LIMIT", 10),
            batch_delay: Duration::from_millis(env_parse("BATCH_DELAY_MS", 50)),
            request_dedup_ttl: Duration::from_millis(env_parse("REQUEST_DEDUP_TTL_MS", 100)),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            circuit_failure_threshold: env_parse("CIRCUIT_FAILURE_THRESHOLD", 5),
            circuit_success_threshold: env_parse("CIRCUIT_SUCCESS_THRESHOLD", 2),
            circuit_timeout: Duration::from_secs(env_parse("CIRCUIT_TIMEOUT_SECONDS", 60)),
            gemini_model: std::env::var("GEMINI_MODEL")
                .unwrap_or_else(|_| "gemini-2.0-flash".to_string()),
            gemini_base_url: std::env::var("GEMINI_BASE_URL")
                .unwrap_or_else(|_| "https://generativelanguage.googleapis.com".to_string())
                .trim_end_matches('/')
                .to_string(),
            gemini_api_version: std::env::var("GEMINI_API_VERSION")
                .unwrap_or_else(|_| "v1beta".to_string()),
            system_instruction: std::env::var("TRANSLATION_SYSTEM_INSTRUCTION")
                .unwrap_or_else(|_| DEFAULT_SYSTEM_INSTRUCTION.to_string()),
            kv_rest_url: env_opt("UPSTASH_REDIS_REST_URL"),
            kv_rest_token: env_opt("UPSTASH_REDIS_REST_TOKEN"),
            port: env_parse("PORT", 8080),
        }
    }

    /// Config for tests: defaults everywhere, no KV store configured.
    #[doc(hidden)]
    pub fn for_tests() -> Self {
        Self {
            max_retries: 20,
            cache_duration: Duration::from_secs(600),
            translation_cache_ttl: 86_400,
            key_cache_size: 1000,
            request_timeout: Duration::from_millis(20_000),
            parallel_translation_limit: 10,
            batch_delay: Duration::from_millis(50),
            request_dedup_ttl: Duration::from_millis(100),
            log_level: "none".to_string(),
            circuit_failure_threshold: 5,
            circuit_success_threshold: 2,
            circuit_timeout: Duration::from_secs(60),
            gemini_model: "gemini-2.0-flash".to_string(),
            gemini_base_url: "https://generativelanguage.googleapis.com".to_string(),
            gemini_api_version: "v1beta".to_string(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            kv_rest_url: None,
            kv_rest_token: None,
            port: 0,
        }
    }
}
