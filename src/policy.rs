//! The collector interface the layer reports to.
//!
//! A [`MetloApp`] owns every decision the layer does not make itself:
//!
//! - **allow**: global admission gate, checked before any capture work
//! - **should_block**: per-request block decision, before the handler runs
//! - **update_rate_limit**: synchronous notification after each exchange
//! - **send**: fire-and-forget delivery of the finished trace
//!
//! Implementations are shared across every in-flight request and must do
//! their own synchronization.

use crate::trace::{MetloTrace, TraceMeta, TraceReq};
use async_trait::async_trait;
use std::sync::Arc;

/// Policy and collection backend driven by [`MetloLayer`](crate::layer::MetloLayer).
#[async_trait]
pub trait MetloApp: Send + Sync + 'static {
    /// Whether this request should be instrumented at all.
    ///
    /// Returning `false` skips every extraction step and forwards the request
    /// untouched.
    fn allow(&self) -> bool;

    /// Whether the request should be denied with `403 Forbidden` before the
    /// handler sees it.
    fn should_block(&self, request: &TraceReq, meta: &TraceMeta) -> bool;

    /// Called on the request's task once the exchange completes, before the
    /// trace is dispatched. Blocks the request for as long as it runs.
    ///
    /// # Panics
    ///
    /// Implementations must not panic. When the client disconnects mid
    /// response this runs from the response body's `Drop`, which may itself
    /// be running during unwinding; a second panic there aborts the process.
    fn update_rate_limit(&self, trace: &MetloTrace);

    /// Deliver a finished trace.
    ///
    /// Runs on a detached task. Nothing awaits it and nothing observes its
    /// outcome.
    async fn send(&self, trace: MetloTrace);
}

#[async_trait]
impl<A: MetloApp + ?Sized> MetloApp for Arc<A> {
    fn allow(&self) -> bool {
        (**self).allow()
    }

    fn should_block(&self, request: &TraceReq, meta: &TraceMeta) -> bool {
        (**self).should_block(request, meta)
    }

    fn update_rate_limit(&self, trace: &MetloTrace) {
        (**self).update_rate_limit(trace)
    }

    async fn send(&self, trace: MetloTrace) {
        (**self).send(trace).await
    }
}
