// Retry executor.
//
// Drives one upstream request through multiple credentials until a validated
// response is obtained. Per-status policies: 403 evicts the credential and
// rotates on, 429 backs off linearly, 5xx and transport errors back off
// exponentially. Every outbound call is admitted by the circuit breaker for
// the request host; a tripped breaker counts as an attempt failure and never
// reaches the client directly.

use std::collections::HashSet;
use std::time::Duration;

use axum::body::Bytes;
use http::{HeaderMap, StatusCode};
use serde_json::Value;

use crate::circuit::{BreakerRegistry, CircuitOpen};
use crate::keypool::{KeyPool, KeySet, PoolError, redact};

const MAX_BACKOFF_MS: u64 = 5_000;

// ── Buffered upstream response ──────────────────────────────────────────

/// An upstream response with the body buffered up front, so validation and
/// downstream processing can both read it without consuming anything.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl UpstreamResponse {
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }

    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

/// Default response validation: a successful JSON response must decode to a
/// non-empty object; any other successful response just needs a body.
pub fn validate_json_response(response: &UpstreamResponse) -> bool {
    if !response.status.is_success() {
        return false;
    }
    if response.content_type().is_some_and(|ct| ct.contains("json")) {
        return response
            .json()
            .and_then(|v| v.as_object().map(|obj| !obj.is_empty()))
            .unwrap_or(false);
    }
    !response.body.is_empty()
}

// ── Errors ──────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum AttemptError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpen),
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("upstream request failed after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: AttemptError,
    },
}

// ── Executor ────────────────────────────────────────────────────────────

/// Everything an execution needs besides the request itself.
pub struct RetryContext<'a> {
    pub breakers: &'a BreakerRegistry,
    pub pool: &'a KeyPool,
    pub set: KeySet,
    pub max_attempts: u32,
    pub request_timeout: Duration,
    pub request_id: &'a str,
}

/// 429 policy: linear backoff, capped.
fn rate_limit_delay(attempt: u32) -> Duration {
    Duration::from_millis((1_000 * (u64::from(attempt) + 1)).min(MAX_BACKOFF_MS))
}

/// 5xx / transport policy: exponential backoff, capped.
fn error_delay(attempt: u32) -> Duration {
    let ms = 100u64.saturating_mul(1u64 << attempt.min(16));
    Duration::from_millis(ms.min(MAX_BACKOFF_MS))
}

/// Run the attempt loop. Returns the first validated response; if no attempt
/// validates, the last response received (so callers still see the upstream
/// status); `Ok(None)` when nothing ever came back and nothing was worth
/// rethrowing.
pub async fn execute_with_retry<B, V>(
    ctx: RetryContext<'_>,
    client: &reqwest::Client,
    build_request: B,
    validate_response: V,
) -> Result<Option<UpstreamResponse>, RetryError>
where
    B: Fn(&str) -> reqwest::RequestBuilder,
    V: Fn(&UpstreamResponse) -> bool,
{
    let mut tried: HashSet<String> = HashSet::new();
    let mut skips: u32 = 0;
    let mut last_response: Option<UpstreamResponse> = None;

    let mut attempt: u32 = 0;
    while attempt < ctx.max_attempts {
        let credential = ctx.pool.next_key(ctx.set).await?;

        // A credential that already failed this call is skipped without
        // consuming an attempt; the skip loop itself is bounded so a pool
        // smaller than max_attempts cannot spin forever.
        if !tried.insert(credential.clone()) {
            skips += 1;
            if skips >= ctx.max_attempts {
                tracing::debug!(
                    "retry[{}]: every pooled credential tried, giving up rotation",
                    ctx.request_id
                );
                break;
            }
            continue;
        }

        let request = match build_request(&credential).timeout(ctx.request_timeout).build() {
            Ok(req) => req,
            Err(err) => {
                // A request that cannot even be built will not improve with
                // a different credential.
                return Err(RetryError::Exhausted {
                    attempts: attempt + 1,
                    source: AttemptError::Network(err),
                });
            }
        };
        let host = request.url().host_str().unwrap_or("unknown").to_string();
        let breaker = ctx.breakers.for_host(&host);

        let outcome: Result<UpstreamResponse, AttemptError> = match breaker.try_acquire() {
            Err(open) => Err(open.into()),
            Ok(()) => match client.execute(request).await {
                Ok(resp) => {
                    let status = resp.status();
                    let headers = resp.headers().clone();
                    match resp.bytes().await {
                        Ok(body) => {
                            breaker.record_success();
                            Ok(UpstreamResponse {
                                status,
                                headers,
                                body,
                            })
                        }
                        Err(err) => {
                            breaker.record_failure();
                            Err(err.into())
                        }
                    }
                }
                Err(err) => {
                    breaker.record_failure();
                    Err(err.into())
                }
            },
        };

        match outcome {
            Ok(response) => match response.status.as_u16() {
                403 => {
                    tracing::info!(
                        "retry[{}]: credential {} rejected with 403, rotating",
                        ctx.request_id,
                        redact(&credential)
                    );
                    ctx.pool.evict(ctx.set, &credential).await;
                    last_response = Some(response);
                }
                429 => {
                    let delay = rate_limit_delay(attempt);
                    tracing::warn!(
                        "retry[{}]: rate limited on attempt {}, backing off {:?}",
                        ctx.request_id,
                        attempt,
                        delay
                    );
                    last_response = Some(response);
                    tokio::time::sleep(delay).await;
                }
                status if status >= 500 => {
                    let delay = error_delay(attempt);
                    tracing::warn!(
                        "retry[{}]: upstream {} on attempt {}, backing off {:?}",
                        ctx.request_id,
                        status,
                        attempt,
                        delay
                    );
                    last_response = Some(response);
                    tokio::time::sleep(delay).await;
                }
                _ => {
                    if validate_response(&response) {
                        return Ok(Some(response));
                    }
                    tracing::warn!(
                        "retry[{}]: response failed validation on attempt {}",
                        ctx.request_id,
                        attempt
                    );
                    last_response = Some(response);
                }
            },
            Err(err) => {
                if attempt + 1 >= ctx.max_attempts {
                    return Err(RetryError::Exhausted {
                        attempts: attempt + 1,
                        source: err,
                    });
                }
                let delay = error_delay(attempt);
                tracing::warn!(
                    "retry[{}]: attempt {} failed ({}), backing off {:?}",
                    ctx.request_id,
                    attempt,
                    err,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }

        attempt += 1;
    }

    Ok(last_response)
}

// ── Tests ───────────────────────────────────────────────────────────────
