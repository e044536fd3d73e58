//! Upstream traffic governor.
//!
//! Every LLM / embeddings call goes through a [`Throttle`]:
//!
//! 1. acquire a concurrency permit (bounded in-flight calls),
//! 2. acquire RPM + TPM budget from the token buckets,
//! 3. run the call; reconcile TPM with the reported actual usage,
//! 4. on a transient failure, back off exponentially (with jitter) and retry
//!    up to the configured attempt count; permanent failures surface at once.
//!
//! All waits — permit, bucket, backoff sleep, the call itself — race the
//! caller's [`CancellationToken`]. No FIFO fairness is promised across
//! submissions, only the rate bounds and the concurrency cap.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::config::{ConcurrencyConfig, RateLimitConfig, RetryConfig};
use crate::llm::{ChatResponse, EmbeddingsResponse, ProviderError};

/// Upper bound on a single bucket wait before re-checking; keeps waiters
/// responsive to budget freed by reconciliation.
const MAX_BUCKET_NAP: Duration = Duration::from_secs(5);

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CallError {
    #[error("call cancelled")]
    Cancelled,

    #[error("retries exhausted after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: ProviderError,
    },

    #[error("upstream error: {0}")]
    Upstream(#[from] ProviderError),
}

// ── Usage reporting ───────────────────────────────────────────────────────────

/// A call result that may know its actual token consumption.
pub trait Metered {
    fn actual_tokens(&self) -> Option<u64>;
}

impl Metered for ChatResponse {
    fn actual_tokens(&self) -> Option<u64> {
        self.usage.map(|u| u.total())
    }
}

impl Metered for EmbeddingsResponse {
    fn actual_tokens(&self) -> Option<u64> {
        self.usage.map(|u| u.total())
    }
}

// ── Retry policy ──────────────────────────────────────────────────────────────

/// Exponential backoff schedule; attempt 0 sleeps `initial_backoff_s`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff_s: f64,
    pub max_backoff_s: f64,
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    pub fn from_config(cfg: &RetryConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            initial_backoff_s: cfg.initial_backoff_s.max(0.0),
            max_backoff_s: cfg.max_backoff_s.max(0.0),
            backoff_multiplier: cfg.backoff_multiplier.max(1.0),
        }
    }

    /// Backoff before retry number `attempt` (0-based), without jitter.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let secs = self.initial_backoff_s * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_secs_f64(secs.min(self.max_backoff_s))
    }
}

// ── Token buckets ─────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Bucket {
    capacity: f64,
    refill_per_s: f64,
    available: f64,
    last: Instant,
}

impl Bucket {
    fn new(per_minute: u32, now: Instant) -> Self {
        let capacity = f64::from(per_minute);
        Self {
            capacity,
            refill_per_s: capacity / 60.0,
            available: capacity,
            last: now,
        }
    }

    fn enabled(&self) -> bool {
        self.capacity > 0.0
    }

    fn refill(&mut self, now: Instant) {
        if !self.enabled() {
            return;
        }
        let dt = now.saturating_duration_since(self.last).as_secs_f64();
        self.available = (self.available + dt * self.refill_per_s).min(self.capacity);
        self.last = now;
    }

    /// Seconds until `need` units are available; zero when satisfiable now.
    fn wait_for(&self, need: f64) -> f64 {
        if !self.enabled() || self.available >= need {
            0.0
        } else {
            (need - self.available) / self.refill_per_s
        }
    }
}

/// Sliding-window RPM/TPM limiter backed by two continuously-refilled
/// buckets. A zero `rpm`/`tpm` disables the corresponding bucket.
#[derive(Debug)]
pub struct RateLimiter {
    inner: Mutex<(Bucket, Bucket)>,
}

impl RateLimiter {
    pub fn new(cfg: RateLimitConfig) -> Self {
        let now = Instant::now();
        Self {
            inner: Mutex::new((Bucket::new(cfg.rpm, now), Bucket::new(cfg.tpm, now))),
        }
    }

    /// Block until `requests` request units and `tokens` token units are
    /// available, then take both. Cancellable.
    pub async fn acquire(
        &self,
        requests: u64,
        tokens: u64,
        cancel: &CancellationToken,
    ) -> Result<(), CallError> {
        let req_need = requests as f64;
        let tok_need = tokens as f64;

        loop {
            let wait = {
                let mut guard = self.inner.lock().await;
                let (req, tok) = &mut *guard;
                let now = Instant::now();
                req.refill(now);
                tok.refill(now);

                let wait = req.wait_for(req_need).max(tok.wait_for(tok_need));
                if wait <= 0.0 {
                    if req.enabled() {
                        req.available -= req_need;
                    }
                    if tok.enabled() {
                        tok.available -= tok_need;
                    }
                    return Ok(());
                }
                wait
            };

            let nap = Duration::from_secs_f64(wait.max(0.05)).min(MAX_BUCKET_NAP);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CallError::Cancelled),
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    /// Settle the token bucket against reported usage: credit back an
    /// over-estimate, debit an under-estimate (the bucket may go negative
    /// and recovers through refill).
    pub async fn reconcile(&self, estimated: u64, actual: u64) {
        let mut guard = self.inner.lock().await;
        let (_, tok) = &mut *guard;
        if !tok.enabled() {
            return;
        }
        let delta = estimated as f64 - actual as f64;
        tok.available = (tok.available + delta).min(tok.capacity);
    }
}

// ── Throttle ──────────────────────────────────────────────────────────────────

/// Concurrency cap + rate limiter + retry, bundled per upstream.
#[derive(Debug, Clone)]
pub struct Throttle {
    semaphore: Option<Arc<Semaphore>>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
}

impl Throttle {
    pub fn new(
        concurrency: ConcurrencyConfig,
        rate_limit: RateLimitConfig,
        retry: &RetryConfig,
    ) -> Self {
        let semaphore = if concurrency.max_in_flight > 0 {
            Some(Arc::new(Semaphore::new(concurrency.max_in_flight as usize)))
        } else {
            None
        };
        Self {
            semaphore,
            limiter: Arc::new(RateLimiter::new(rate_limit)),
            retry: RetryPolicy::from_config(retry),
        }
    }

    /// Run `work` under the concurrency cap, rate budget, and retry policy.
    ///
    /// `work` is invoked once per attempt; each attempt consumes fresh
    /// RPM/TPM budget because each attempt is a real upstream request.
    pub async fn call<T, F, Fut>(
        &self,
        estimated_tokens: u64,
        cancel: &CancellationToken,
        work: F,
    ) -> Result<T, CallError>
    where
        T: Metered,
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, ProviderError>>,
    {
        // Held across the whole attempt loop; released on every exit path
        // when `_permit` drops.
        let _permit = match &self.semaphore {
            Some(sem) => {
                let sem = sem.clone();
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(CallError::Cancelled),
                    permit = sem.acquire_owned() => {
                        Some(permit.map_err(|_| CallError::Cancelled)?)
                    }
                }
            }
            None => None,
        };

        let mut attempt: u32 = 0;
        loop {
            self.limiter.acquire(1, estimated_tokens, cancel).await?;

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CallError::Cancelled),
                outcome = work() => outcome,
            };

            match outcome {
                Ok(result) => {
                    if let Some(actual) = result.actual_tokens() {
                        self.limiter.reconcile(estimated_tokens, actual).await;
                    }
                    return Ok(result);
                }
                Err(e) if !e.is_transient() => return Err(CallError::Upstream(e)),
                Err(e) if attempt >= self.retry.max_retries => {
                    return Err(CallError::Exhausted { attempts: attempt + 1, source: e });
                }
                Err(e) => {
                    let base = self.retry.backoff_for(attempt);
                    let jitter = {
                        let mut rng = rand::thread_rng();
                        rng.gen_range(0.5..=1.0)
                    };
                    let delay = base.mul_f64(jitter);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient upstream error, backing off"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(CallError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                    debug!(attempt, "retrying upstream call");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Plain;

    impl Metered for Plain {
        fn actual_tokens(&self) -> Option<u64> {
            None
        }
    }

    fn throttle(max_in_flight: u32, rpm: u32, tpm: u32, max_retries: u32) -> Throttle {
        Throttle::new(
            ConcurrencyConfig { max_in_flight },
            RateLimitConfig { rpm, tpm },
            &RetryConfig {
                max_retries,
                initial_backoff_s: 0.1,
                max_backoff_s: 1.0,
                backoff_multiplier: 2.0,
            },
        )
    }

    #[test]
    fn backoff_schedule_is_capped() {
        let p = RetryPolicy {
            max_retries: 5,
            initial_backoff_s: 1.0,
            max_backoff_s: 4.0,
            backoff_multiplier: 2.0,
        };
        assert_eq!(p.backoff_for(0), Duration::from_secs(1));
        assert_eq!(p.backoff_for(1), Duration::from_secs(2));
        assert_eq!(p.backoff_for(2), Duration::from_secs(4));
        assert_eq!(p.backoff_for(5), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn rpm_bucket_delays_excess_requests() {
        let t = throttle(0, 2, 0, 0);
        let cancel = CancellationToken::new();

        let start = Instant::now();
        for _ in 0..2 {
            t.call(1, &cancel, || async { Ok(Plain) }).await.unwrap();
        }
        assert!(start.elapsed() < Duration::from_millis(100));

        // Third request must wait for refill (~30s at rpm=2).
        t.call(1, &cancel, || async { Ok(Plain) }).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(25));
    }

    #[tokio::test(start_paused = true)]
    async fn tpm_bucket_counts_token_estimates() {
        let t = throttle(0, 0, 60, 0);
        let cancel = CancellationToken::new();

        let start = Instant::now();
        t.call(60, &cancel, || async { Ok(Plain) }).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(100));

        // Bucket is empty; 30 tokens refill in ~30s.
        t.call(30, &cancel, || async { Ok(Plain) }).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(25));
    }

    #[tokio::test]
    async fn concurrency_cap_bounds_in_flight_calls() {
        let t = Arc::new(throttle(2, 0, 0, 0));
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let t = t.clone();
            let current = current.clone();
            let peak = peak.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                t.call(1, &cancel, || {
                    let current = current.clone();
                    let peak = peak.clone();
                    async move {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                        Ok(Plain)
                    }
                })
                .await
                .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2, "peak = {}", peak.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_retry_until_success() {
        let t = throttle(0, 0, 0, 3);
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let calls2 = calls.clone();
        let result = t
            .call(1, &cancel, move || {
                let calls = calls2.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ProviderError::Http { status: 503, message: "unavailable".into() })
                    } else {
                        Ok(Plain)
                    }
                }
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_stop_after_max_and_surface_last_error() {
        let t = throttle(0, 0, 0, 2);
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let calls2 = calls.clone();
        let result: Result<Plain, _> = t
            .call(1, &cancel, move || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ProviderError::Timeout("deadline".into()))
                }
            })
            .await;
        match result {
            Err(CallError::Exhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected Exhausted, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_do_not_retry() {
        let t = throttle(0, 0, 0, 5);
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let calls2 = calls.clone();
        let result: Result<Plain, _> = t
            .call(1, &cancel, move || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ProviderError::Http { status: 400, message: "bad".into() })
                }
            })
            .await;
        assert!(matches!(result, Err(CallError::Upstream(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff_sleep() {
        let t = throttle(0, 0, 0, 10);
        let cancel = CancellationToken::new();

        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel2.cancel();
        });

        let result: Result<Plain, _> = t
            .call(1, &cancel, || async {
                Err(ProviderError::Timeout("deadline".into()))
            })
            .await;
        assert!(matches!(result, Err(CallError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_credits_back_overestimates() {
        let limiter = RateLimiter::new(RateLimitConfig { rpm: 0, tpm: 100 });
        let cancel = CancellationToken::new();

        limiter.acquire(0, 100, &cancel).await.unwrap();
        // Actual usage was 10 — 90 tokens come back and the next acquire
        // should not need a refill wait.
        limiter.reconcile(100, 10).await;
        let start = Instant::now();
        limiter.acquire(0, 80, &cancel).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
