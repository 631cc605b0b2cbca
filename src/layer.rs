//! Tower layer that traces every request passing through it.
//!
//! Per request, in order:
//!
//! 1. [`MetloApp::allow`]; on `false` the request is forwarded untouched.
//! 2. The request body is read in full and the request trace assembled.
//! 3. [`MetloApp::should_block`]; on `true` the client gets
//!    `403 Forbidden` and the inner service is never called.
//! 4. The inner service runs with the original body re-attached. If reading
//!    it failed, the inner service sees the bytes read so far followed by
//!    the same error, exactly as it would without this layer.
//! 5. When the response body has been fully sent, the response trace is
//!    assembled from the captured prefix, [`MetloApp::update_rate_limit`]
//!    runs, and the trace is dispatched on a detached task.
//!
//! Instrumentation problems never fail a request; they are logged and the
//! affected trace fields fall back to defaults.

use crate::capture::{BoxError, CaptureBody};
use crate::config::MetloConfig;
use crate::dispatch::Dispatcher;
use crate::policy::MetloApp;
use crate::replay::{read_body, ReplayBody};
use crate::trace::{request_trace, response_trace, trace_meta, MetloTrace};
use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::request::Parts;
use http::{Request, Response, StatusCode};
use http_body::Body;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::{debug, info, warn};

/// Resolves the authenticated user for a request, if there is one.
pub type UserExtractor = Arc<dyn Fn(&Parts) -> Option<String> + Send + Sync>;

/// Body returned to blocked clients.
pub const FORBIDDEN_BODY: &str = "Forbidden";

/// Layer wrapping services in [`MetloService`].
pub struct MetloLayer<A> {
    app: Arc<A>,
    config: MetloConfig,
    user_extractor: Option<UserExtractor>,
    dispatcher: Dispatcher<A>,
}

impl<A> Clone for MetloLayer<A> {
    fn clone(&self) -> Self {
        Self {
            app: Arc::clone(&self.app),
            config: self.config.clone(),
            user_extractor: self.user_extractor.clone(),
            dispatcher: self.dispatcher.clone(),
        }
    }
}

impl<A> fmt::Debug for MetloLayer<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetloLayer")
            .field("config", &self.config)
            .field("user_extractor", &self.user_extractor.is_some())
            .finish()
    }
}

impl<A: MetloApp> MetloLayer<A> {
    /// Instrument with default settings: destination `localhost:0`, no user
    /// extraction.
    pub fn new(app: A) -> Self {
        Self::from_arc(Arc::new(app), MetloConfig::default())
    }

    /// Instrument reporting `server_host:server_port` as the destination and
    /// resolving users with `user_extractor`.
    pub fn custom<F>(
        app: A,
        server_host: impl Into<String>,
        server_port: u16,
        user_extractor: Option<F>,
    ) -> Self
    where
        F: Fn(&Parts) -> Option<String> + Send + Sync + 'static,
    {
        let config = MetloConfig::new(server_host, server_port);
        let mut layer = Self::from_arc(Arc::new(app), config);
        layer.user_extractor = user_extractor.map(|f| Arc::new(f) as UserExtractor);
        layer
    }

    /// Instrument with a collector that is shared elsewhere.
    pub fn from_arc(app: Arc<A>, config: MetloConfig) -> Self {
        let dispatcher = Dispatcher::new(Arc::clone(&app), config.max_in_flight_dispatches);
        Self {
            app,
            config,
            user_extractor: None,
            dispatcher,
        }
    }

    /// Replace the configuration.
    pub fn with_config(self, config: MetloConfig) -> Self {
        let Self {
            app, user_extractor, ..
        } = self;
        let mut layer = Self::from_arc(app, config);
        layer.user_extractor = user_extractor;
        layer
    }

    /// Resolve `request.user` with `extractor`.
    pub fn with_user_extractor<F>(mut self, extractor: F) -> Self
    where
        F: Fn(&Parts) -> Option<String> + Send + Sync + 'static,
    {
        self.user_extractor = Some(Arc::new(extractor));
        self
    }

    pub fn config(&self) -> &MetloConfig {
        &self.config
    }
}

impl<S, A> Layer<S> for MetloLayer<A> {
    type Service = MetloService<S, A>;

    fn layer(&self, inner: S) -> Self::Service {
        MetloService {
            inner,
            instrumentation: Arc::new(Instrumentation {
                app: Arc::clone(&self.app),
                config: self.config.clone(),
                user_extractor: self.user_extractor.clone(),
                dispatcher: self.dispatcher.clone(),
            }),
        }
    }
}

/// Per-service state shared by all requests through one [`MetloService`].
struct Instrumentation<A> {
    app: Arc<A>,
    config: MetloConfig,
    user_extractor: Option<UserExtractor>,
    dispatcher: Dispatcher<A>,
}

impl<A: MetloApp> Instrumentation<A> {
    fn user(&self, parts: &Parts) -> Option<String> {
        self.user_extractor.as_ref().and_then(|extract| extract(parts))
    }

    /// Final step of a completed exchange: rate-limit update, then dispatch.
    fn finish(&self, trace: MetloTrace) {
        self.app.update_rate_limit(&trace);
        self.dispatcher.dispatch(trace);
    }
}

/// Service produced by [`MetloLayer`].
pub struct MetloService<S, A> {
    inner: S,
    instrumentation: Arc<Instrumentation<A>>,
}

impl<S: Clone, A> Clone for MetloService<S, A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            instrumentation: Arc::clone(&self.instrumentation),
        }
    }
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

impl<S, A, ReqBody, ResBody> Service<Request<ReqBody>> for MetloService<S, A>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    A: MetloApp,
    ReqBody: ReplayBody + Send + 'static,
    ReqBody::Data: Send,
    ReqBody::Error: Into<BoxError>,
    ResBody: Body<Data = Bytes> + Unpin + Send + 'static,
    ResBody::Error: Into<BoxError>,
{
    type Response = Response<CaptureBody<ResBody>>;
    type Error = S::Error;
    type Future = BoxFuture<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        // Take the service that was driven to readiness, leave a clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let instrumentation = Arc::clone(&self.instrumentation);

        Box::pin(async move {
            if !instrumentation.app.allow() {
                debug!("Instrumentation not admitted, passing request through");
                let response = inner.call(req).await?;
                return Ok(response.map(CaptureBody::passthrough));
            }

            let (parts, body) = req.into_parts();
            let read = read_body(body).await;
            if let Some(e) = &read.error {
                warn!(
                    error = %e,
                    read = read.bytes.len(),
                    "Request body read failed, tracing the bytes received"
                );
            }

            let user = instrumentation.user(&parts);
            let request = request_trace(&parts, &read.bytes, user);
            let meta = trace_meta(&parts, &instrumentation.config);

            if instrumentation.app.should_block(&request, &meta) {
                info!(
                    method = %request.method,
                    path = %request.url.path,
                    source = %meta.source,
                    "Blocking request"
                );
                return Ok(forbidden());
            }

            let body = ReqBody::replay(read.bytes, read.error);
            let response = inner.call(Request::from_parts(parts, body)).await?;

            let (res_parts, res_body) = response.into_parts();
            let status = res_parts.status;
            let headers = res_parts.headers.clone();
            let max_body = instrumentation.config.max_body;

            let body = CaptureBody::observed(res_body, max_body, move |captured| {
                let trace = MetloTrace {
                    request,
                    response: response_trace(status, &headers, captured),
                    meta,
                };
                instrumentation.finish(trace);
            });

            Ok(Response::from_parts(res_parts, body))
        })
    }
}

fn forbidden<B>() -> Response<CaptureBody<B>> {
    let mut response = Response::new(CaptureBody::fixed(FORBIDDEN_BODY));
    *response.status_mut() = StatusCode::FORBIDDEN;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
