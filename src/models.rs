use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

// ── Translate API ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct TranslateRequest {
    pub source_lang: Option<String>,
    pub target_lang: Option<String>,
    /// Kept loose so malformed shapes produce a 400, not a framework 422.
    pub text_list: Option<serde_json::Value>,
}

/// One translated text. Cached verbatim in the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TranslationRecord {
    pub detected_source_lang: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TranslateResponse {
    pub translations: Vec<TranslationRecord>,
}

// ── Health & metadata ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ServiceInfo {
    pub name: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub endpoints: Vec<String>,
}
