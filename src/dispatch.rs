//! Detached trace dispatch.
//!
//! Dispatch is deliberately lossy: each trace is handed to
//! [`MetloApp::send`] on a spawned task whose handle is dropped on the spot.
//! Nothing waits for it, its errors are never seen, and a trace still in
//! flight when the process exits is gone. The optional in-flight bound drops
//! traces instead of queueing them so the request path never waits on the
//! collector.

use crate::policy::MetloApp;
use crate::trace::MetloTrace;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Spawns [`MetloApp::send`] for finished traces.
pub struct Dispatcher<A> {
    app: Arc<A>,
    permits: Option<Arc<Semaphore>>,
}

impl<A> Clone for Dispatcher<A> {
    fn clone(&self) -> Self {
        Self {
            app: Arc::clone(&self.app),
            permits: self.permits.clone(),
        }
    }
}

impl<A: MetloApp> Dispatcher<A> {
    /// Create a dispatcher; `max_in_flight` bounds concurrent sends.
    pub fn new(app: Arc<A>, max_in_flight: Option<usize>) -> Self {
        Self {
            app,
            permits: max_in_flight.map(|n| Arc::new(Semaphore::new(n))),
        }
    }

    /// Hand `trace` to the collector on a detached task.
    ///
    /// Returns whether a task was spawned. `false` means the trace was dropped,
    /// either because the in-flight bound was reached or because there is no
    /// tokio runtime to spawn on.
    pub fn dispatch(&self, trace: MetloTrace) -> bool {
        let Ok(handle) = Handle::try_current() else {
            warn!("No tokio runtime available, dropping trace");
            return false;
        };

        let permit = match &self.permits {
            None => None,
            Some(permits) => match Arc::clone(permits).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    warn!(
                        path = %trace.request.url.path,
                        "Dispatch limit reached, dropping trace"
                    );
                    return false;
                }
            },
        };

        debug!(
            method = %trace.request.method,
            path = %trace.request.url.path,
            status = trace.response.status,
            "Dispatching trace"
        );

        let app = Arc::clone(&self.app);
        // The JoinHandle is dropped: the task is detached.
        drop(handle.spawn(async move {
            let _permit = permit;
            app.send(trace).await;
        }));
        true
    }

    /// Number of additional dispatches that may start right now, if bounded.
    pub fn available(&self) -> Option<usize> {
        self.permits.as_ref().map(|p| p.available_permits())
    }
}
