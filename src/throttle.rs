//! Token bucket throttle for the instrumentation itself.
//!
//! [`Throttled`] caps how many requests per second get traced, independently
//! of whatever the wrapped collector decides. Requests over the rate are
//! passed through untraced.

use crate::policy::MetloApp;
use crate::trace::{MetloTrace, TraceMeta, TraceReq};
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Instant;

// ============================================================================
// Token Bucket
// ============================================================================

/// Token bucket rate limiter.
///
/// - Tokens accumulate at `refill_rate` per second up to `max_tokens`
/// - Each successful `try_acquire()` consumes one token
/// - `try_acquire()` never waits
pub struct TokenBucket {
    inner: Mutex<TokenBucketInner>,
}

struct TokenBucketInner {
    /// Current number of tokens
    tokens: f64,
    /// Maximum tokens (bucket capacity)
    max_tokens: f64,
    /// Tokens added per second
    refill_rate: f64,
    /// Last time tokens were refilled
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a bucket admitting `rate_per_second` acquisitions per second,
    /// starting full.
    ///
    /// A rate of zero or less never admits anything.
    #[must_use]
    pub fn new(rate_per_second: f64) -> Self {
        let rate = rate_per_second.max(0.0);
        Self {
            inner: Mutex::new(TokenBucketInner {
                tokens: rate,
                max_tokens: rate,
                refill_rate: rate,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Try to take a token without waiting.
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        // A poisoned lock only means another request panicked mid-refill;
        // the counters are still usable.
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let now = Instant::now();
        let elapsed = now.duration_since(inner.last_refill);
        inner.tokens += elapsed.as_secs_f64() * inner.refill_rate;
        inner.tokens = inner.tokens.min(inner.max_tokens);
        inner.last_refill = now;

        if inner.tokens >= 1.0 {
            inner.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

// ============================================================================
// Throttled collector
// ============================================================================

/// Wraps a collector so at most `traces_per_second` requests are admitted.
pub struct Throttled<A> {
    inner: A,
    bucket: TokenBucket,
}

impl<A> Throttled<A> {
    pub fn new(inner: A, traces_per_second: f64) -> Self {
        Self {
            inner,
            bucket: TokenBucket::new(traces_per_second),
        }
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }
}

#[async_trait]
impl<A: MetloApp> MetloApp for Throttled<A> {
    fn allow(&self) -> bool {
        // Ask the collector first so a denial doesn't burn a token.
        self.inner.allow() && self.bucket.try_acquire()
    }

    fn should_block(&self, request: &TraceReq, meta: &TraceMeta) -> bool {
        self.inner.should_block(request, meta)
    }

    fn update_rate_limit(&self, trace: &MetloTrace) {
        self.inner.update_rate_limit(trace)
    }

    async fn send(&self, trace: MetloTrace) {
        self.inner.send(trace).await
    }
}

// ============================================================================
// Tests
// ============================================================================
