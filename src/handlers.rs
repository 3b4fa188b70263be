use axum::Json;
use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};

use crate::auth::extract_client_key;
use crate::coalesce::{SharedResponse, fingerprint};
use crate::keypool::{KeySet, PoolError};
use crate::models::{HealthResponse, ServiceInfo, TranslateRequest, TranslationRecord};
use crate::retry::{RetryContext, RetryError, execute_with_retry, validate_json_response};
use crate::state::AppState;
use crate::RequestId;

/// Largest accepted `text_list`.
const MAX_BATCH_SIZE: usize = 100;

/// Largest client body we buffer before fingerprinting.
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

// ═══════════════════════════════════════════════════════════════════════
//  Error type
// ═══════════════════════════════════════════════════════════════════════

/// Central API error for the gateway surface. Full details are logged
/// server-side; clients receive the fixed error string, a sanitized
/// message, and the request id.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("missing authentication")]
    MissingAuth,

    #[error("invalid client authentication key")]
    InvalidAuth,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("batch too large")]
    BatchTooLarge,

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingAuth | ApiError::InvalidAuth => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) | ApiError::BatchTooLarge => StatusCode::BAD_REQUEST,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The stable `error` string clients match on.
    fn client_error(&self) -> &'static str {
        match self {
            ApiError::MissingAuth => "Missing authentication",
            ApiError::InvalidAuth => "Invalid client authentication key",
            ApiError::BadRequest(_) | ApiError::BatchTooLarge => "Invalid request",
            // A pool without credentials is an operator problem, not the
            // client's; the text stays generic.
            ApiError::Unavailable(_) | ApiError::Internal(_) => "An internal error occurred",
        }
    }

    fn client_message(&self) -> String {
        match self {
            ApiError::MissingAuth => {
                "Provide a key in the request path, x-goog-api-key, or Authorization header"
                    .to_string()
            }
            ApiError::InvalidAuth => "The supplied client key is not authorized".to_string(),
            ApiError::BadRequest(reason) => reason.clone(),
            ApiError::BatchTooLarge => format!("Maximum batch size is {MAX_BATCH_SIZE} texts"),
            ApiError::Unavailable(_) | ApiError::Internal(_) => {
                "The gateway could not complete the request".to_string()
            }
        }
    }

    fn from_retry(err: RetryError) -> Self {
        match &err {
            RetryError::Pool(PoolError::NoCredentials(_) | PoolError::Unavailable) => {
                ApiError::Unavailable(err.to_string())
            }
            _ => ApiError::Internal(err.to_string()),
        }
    }

    fn into_shared(self, request_id: &str) -> SharedResponse {
        tracing::error!(
            "api error ({}): {} [request_id={}]",
            self.status().as_u16(),
            self,
            request_id
        );
        json_shared(
            self.status(),
            json!({
                "error": self.client_error(),
                "message": self.client_message(),
                "requestId": request_id,
            }),
        )
    }
}

fn json_shared(status: StatusCode, body: Value) -> SharedResponse {
    SharedResponse {
        status,
        content_type: Some("application/json".to_string()),
        body: Bytes::from(body.to_string()),
    }
}

fn respond(shared: SharedResponse) -> Response {
    let mut builder = Response::builder().status(shared.status);
    if let Some(ct) = shared.content_type {
        builder = builder.header(http::header::CONTENT_TYPE, ct);
    }
    builder
        .body(Body::from(shared.body))
        .expect("response build cannot fail with valid parts")
}

fn request_id_of(req: &Request) -> String {
    req.extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

// ═══════════════════════════════════════════════════════════════════════
//  POST /translate/{key}
// ═══════════════════════════════════════════════════════════════════════

#[utoipa::path(post, path = "/translate/{key}", tag = "translate",
    request_body = TranslateRequest,
    responses(
        (status = 200, description = "Batch translated", body = crate::models::TranslateResponse),
        (status = 400, description = "Malformed request"),
        (status = 401, description = "Missing or invalid client key"),
        (status = 500, description = "Pipeline failure"),
    )
)]
pub async fn translate(State(state): State<AppState>, req: Request) -> Response {
    let request_id = request_id_of(&req);
    let (parts, body) = req.into_parts();

    // Buffer the body once; fingerprinting, auth, and parsing all read the
    // same bytes. An unreadable body gets a salted fingerprint, which
    // deliberately opts it out of coalescing.
    let body_bytes = axum::body::to_bytes(body, MAX_BODY_BYTES).await.ok();

    let key = fingerprint(&parts.method, &parts.uri, body_bytes.as_deref());
    let path = parts.uri.path().to_string();
    let method = parts.method.clone();
    let headers = parts.headers.clone();
    let state_for_run = state.clone();
    let id_for_run = request_id.clone();

    let shared = state
        .coalescer
        .run(key, async move {
            match process_translate(
                &state_for_run,
                &method,
                &path,
                &headers,
                body_bytes,
                &id_for_run,
            )
            .await
            {
                Ok(records) => json_shared(StatusCode::OK, json!({ "translations": records })),
                Err(err) => err.into_shared(&id_for_run),
            }
        })
        .await;

    respond(shared)
}

async fn process_translate(
    state: &AppState,
    method: &http::Method,
    path: &str,
    headers: &http::HeaderMap,
    body: Option<Bytes>,
    request_id: &str,
) -> Result<Vec<TranslationRecord>, ApiError> {
    let client_key = extract_client_key(method, path, headers).ok_or(ApiError::MissingAuth)?;
    if !state.key_pool.validate_auth(&client_key).await {
        return Err(ApiError::InvalidAuth);
    }

    let body = body.ok_or_else(|| ApiError::BadRequest("Request body is required".into()))?;
    let request: TranslateRequest = serde_json::from_slice(&body)
        .map_err(|_| ApiError::BadRequest("Request body must be valid JSON".into()))?;

    let texts = parse_text_list(request.text_list.as_ref())?;
    let target_lang = request
        .target_lang
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::BadRequest("target_lang is required".into()))?;
    if texts.len() > MAX_BATCH_SIZE {
        return Err(ApiError::BatchTooLarge);
    }
    let source_lang = request
        .source_lang
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());

    state
        .translator
        .translate_batch(&texts, target_lang, source_lang, request_id)
        .await
        .map_err(ApiError::from_retry)
}

fn parse_text_list(value: Option<&Value>) -> Result<Vec<String>, ApiError> {
    let items = value
        .and_then(Value::as_array)
        .ok_or_else(|| ApiError::BadRequest("text_list must be an array of strings".into()))?;
    items
        .iter()
        .map(|item| {
            item.as_str().map(str::to_string).ok_or_else(|| {
                ApiError::BadRequest("text_list must be an array of strings".into())
            })
        })
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════
//  Generic passthrough: /providers/{name}/{*path}, /v1/{*path}, /v1beta/{*path}
// ═══════════════════════════════════════════════════════════════════════

/// Map a client path to the upstream path. `/v1...` routes forward as-is;
/// `/providers/<name>/...` strips the provider prefix first.
fn upstream_path(path: &str) -> Result<&str, ApiError> {
    if let Some(rest) = path.strip_prefix("/providers/") {
        let (provider, forwarded) = rest.split_once('/').unwrap_or((rest, ""));
        if provider != "gemini" && provider != "google" {
            return Err(ApiError::BadRequest(format!("Unknown provider: {provider}")));
        }
        if forwarded.is_empty() {
            return Err(ApiError::BadRequest("Missing upstream path".into()));
        }
        Ok(forwarded)
    } else {
        Ok(path.trim_start_matches('/'))
    }
}

pub async fn passthrough(State(state): State<AppState>, req: Request) -> Response {
    let request_id = request_id_of(&req);
    let (parts, body) = req.into_parts();
    let body_bytes = axum::body::to_bytes(body, MAX_BODY_BYTES).await.ok();

    let key = fingerprint(&parts.method, &parts.uri, body_bytes.as_deref());
    let state_for_run = state.clone();
    let id_for_run = request_id.clone();
    let method = parts.method.clone();
    let uri = parts.uri.clone();
    let headers = parts.headers.clone();

    let shared = state
        .coalescer
        .run(key, async move {
            match proxy_upstream(&state_for_run, method, &uri, &headers, body_bytes, &id_for_run)
                .await
            {
                Ok(response) => response,
                Err(err) => err.into_shared(&id_for_run),
            }
        })
        .await;

    respond(shared)
}

async fn proxy_upstream(
    state: &AppState,
    method: http::Method,
    uri: &http::Uri,
    headers: &http::HeaderMap,
    body: Option<Bytes>,
    request_id: &str,
) -> Result<SharedResponse, ApiError> {
    let forwarded = upstream_path(uri.path())?;
    let mut url = format!("{}/{}", state.config.gemini_base_url, forwarded);
    if let Some(query) = uri.query() {
        url.push('?');
        url.push_str(query);
    }

    let content_type = headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = body.unwrap_or_default();

    let ctx = RetryContext {
        breakers: &state.breakers,
        pool: &state.key_pool,
        set: KeySet::GeminiApiKeys,
        max_attempts: state.config.max_retries,
        request_timeout: state.config.request_timeout,
        request_id,
    };

    let reqwest_method =
        reqwest::Method::from_bytes(method.as_str().as_bytes()).unwrap_or(reqwest::Method::GET);
    let response = execute_with_retry(
        ctx,
        &state.http_client,
        |credential| {
            let mut builder = state
                .http_client
                .request(reqwest_method.clone(), &url)
                .header("x-goog-api-key", credential)
                .body(body.clone());
            if let Some(ct) = &content_type {
                builder = builder.header(http::header::CONTENT_TYPE, ct.clone());
            }
            builder
        },
        validate_json_response,
    )
    .await
    .map_err(ApiError::from_retry)?;

    let Some(response) = response else {
        return Err(ApiError::Internal("upstream produced no response".into()));
    };

    Ok(SharedResponse {
        status: response.status,
        content_type: response.content_type().map(str::to_string),
        body: response.body,
    })
}

// ═══════════════════════════════════════════════════════════════════════
//  Health & metadata
// ═══════════════════════════════════════════════════════════════════════

#[utoipa::path(get, path = "/health", tag = "health",
    responses((status = 200, description = "Service is up", body = HealthResponse))
)]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now(),
    })
}

#[utoipa::path(get, path = "/", tag = "health",
    responses((status = 200, description = "Service metadata", body = ServiceInfo))
)]
pub async fn root(State(state): State<AppState>) -> Json<ServiceInfo> {
    Json(ServiceInfo {
        name: "lingua-gateway".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        endpoints: vec![
            "POST /translate/{key}".to_string(),
            "ANY /providers/{provider}/{path}".to_string(),
            "ANY /v1/{path}".to_string(),
            "ANY /v1beta/{path}".to_string(),
            "GET /health".to_string(),
        ],
    })
}

pub async fn favicon() -> StatusCode {
    StatusCode::NO_CONTENT
}

pub async fn openapi_json() -> impl IntoResponse {
    use utoipa::OpenApi;
    Json(crate::ApiDoc::openapi())
}
