pub mod auth;
pub mod circuit;
pub mod coalesce;
pub mod config;
pub mod handlers;
pub mod keypool;
pub mod kv;
pub mod models;
pub mod retry;
pub mod state;
pub mod translation_cache;
pub mod translator;

use axum::Router;
use axum::routing::{any, get, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use state::AppState;

// ═══════════════════════════════════════════════════════════════════════
//  Request correlation ID middleware
// ═══════════════════════════════════════════════════════════════════════

/// Correlation id assigned to every request, available to handlers through
/// request extensions.
#[derive(Clone)]
pub struct RequestId(pub String);

/// Middleware that assigns a UUID v4 correlation ID to each request.
///
/// - Accepts an incoming `X-Request-ID` header to propagate from upstream
/// - Stores the id in request extensions for handlers and error bodies
/// - Returns it in the `X-Request-ID` response header
async fn request_id_middleware(
    mut req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    req.extensions_mut().insert(RequestId(request_id.clone()));
    tracing::debug!(request_id = %request_id, "request correlation ID assigned");

    let mut response = next.run(req).await;

    if let Ok(header_value) = axum::http::HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", header_value);
    }

    response
}

// ── OpenAPI documentation ───────────────────────────────────────────────

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Lingua Gateway API",
        description = "Multi-tenant translation gateway in front of the Gemini generative-language API",
        license(name = "MIT")
    ),
    paths(
        handlers::health,
        handlers::root,
        handlers::translate,
    ),
    components(schemas(
        models::TranslateRequest,
        models::TranslationRecord,
        models::TranslateResponse,
        models::HealthResponse,
        models::ServiceInfo,
    )),
    tags(
        (name = "health", description = "Health & service metadata"),
        (name = "translate", description = "Batch translation"),
    )
)]
pub struct ApiDoc;

/// Build the application router with the given shared state.
/// Extracted from `main()` so integration tests can construct the app
/// without binding to a network port; rate limiting is layered on in main.
pub fn create_router(state: AppState) -> Router {
    let translate_routes = Router::new()
        .route("/translate", post(handlers::translate))
        .route("/translate/", post(handlers::translate))
        .route("/translate/{key}", post(handlers::translate));

    let passthrough_routes = Router::new()
        .route("/providers/{provider}/{*path}", any(handlers::passthrough))
        .route("/v1/{*path}", any(handlers::passthrough))
        .route("/v1beta/{*path}", any(handlers::passthrough));

    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .route("/favicon.ico", get(handlers::favicon))
        .route("/api-docs/openapi.json", get(handlers::openapi_json))
        .merge(translate_routes)
        .merge(passthrough_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        // Request correlation ID, surfaced as X-Request-ID on every response
        .layer(axum::middleware::from_fn(request_id_middleware))
        .with_state(state)
}
