// Per-host circuit breakers.
//
// Each upstream host gets a three-state breaker (Closed / Open / HalfOpen)
// created on demand. The retry executor asks the breaker for admission
// before every outbound call and reports the outcome afterwards; while a
// breaker is open, calls fail immediately with the remaining cooldown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_SUCCESS_THRESHOLD: u32 = 2;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Admission refused: the breaker is open for another `retry_after`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("circuit open, retry in {retry_after:?}")]
pub struct CircuitOpen {
    pub retry_after: Duration,
}

struct Inner {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    open_until: Option<Instant>,
}

pub struct CircuitBreaker {
    failure_threshold: u32,
    success_threshold: u32,
    timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    fn new(failure_threshold: u32, success_threshold: u32, timeout: Duration) -> Self {
        Self {
            failure_threshold,
            success_threshold,
            timeout,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                open_until: None,
            }),
        }
    }

    /// Ask for admission. Open breakers refuse until the cooldown elapses,
    /// then move to HalfOpen and admit trial calls. Concurrent HalfOpen
    /// probes are permitted; all of them feed the success/failure counts.
    pub fn try_acquire(&self) -> Result<(), CircuitOpen> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let until = inner.open_until.unwrap_or_else(Instant::now);
                let now = Instant::now();
                if now < until {
                    Err(CircuitOpen {
                        retry_after: until - now,
                    })
                } else {
                    inner.state = BreakerState::HalfOpen;
                    inner.success_count = 0;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.failure_count = 0;
        if inner.state == BreakerState::HalfOpen {
            inner.success_count += 1;
            if inner.success_count >= self.success_threshold {
                inner.state = BreakerState::Closed;
                inner.success_count = 0;
                inner.open_until = None;
                tracing::info!("circuit: closed after successful trial calls");
            }
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.success_count = 0;
        match inner.state {
            BreakerState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.open_until = Some(Instant::now() + self.timeout);
                    tracing::warn!(
                        "circuit: opened after {} consecutive failures, cooling down {:?}",
                        inner.failure_count,
                        self.timeout
                    );
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.open_until = Some(Instant::now() + self.timeout);
                tracing::warn!("circuit: trial call failed, reopening for {:?}", self.timeout);
            }
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }
}

// ── Registry ────────────────────────────────────────────────────────────

/// Hands out one shared breaker per upstream host, created on first use.
pub struct BreakerRegistry {
    failure_threshold: u32,
    success_threshold: u32,
    timeout: Duration,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::with_settings(
            DEFAULT_FAILURE_THRESHOLD,
            DEFAULT_SUCCESS_THRESHOLD,
            DEFAULT_TIMEOUT,
        )
    }

    pub fn with_settings(
        failure_threshold: u32,
        success_threshold: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            failure_threshold,
            success_threshold,
            timeout,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn for_host(&self, host: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap();
        breakers
            .entry(host.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    self.failure_threshold,
                    self.success_threshold,
                    self.timeout,
                ))
            })
            .clone()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(ft: u32, st: u32, timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(ft, st, timeout)
    }

    #[test]
    fn opens_after_failure_threshold() {
        let b = breaker(3, 2, Duration::from_secs(60));
        for _ in 0..2 {
            b.try_acquire().unwrap();
            b.record_failure();
        }
        assert_eq!(b.state(), BreakerState::Closed);

        b.try_acquire().unwrap();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);

        let err = b.try_acquire().unwrap_err();
        assert!(err.retry_after > Duration::ZERO);
    }

    #[test]
    fn success_resets_failure_count() {
        let b = breaker(3, 2, Duration::from_secs(60));
        b.record_failure();
        b.record_failure();
        b.record_success();
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_closes_after_successes_and_reopens_on_failure() {
        let b = breaker(1, 2, Duration::from_millis(20));
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        b.try_acquire().unwrap();
        assert_eq!(b.state(), BreakerState::HalfOpen);

        // One trial failure sends it straight back to Open.
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        b.try_acquire().unwrap();
        b.record_success();
        assert_eq!(b.state(), BreakerState::HalfOpen);
        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn registry_reuses_breaker_per_host() {
        let registry = BreakerRegistry::new();
        let a = registry.for_host("upstream.example");
        let b = registry.for_host("upstream.example");
        let c = registry.for_host("other.example");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
