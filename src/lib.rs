//! metlo-tower - Metlo API traffic instrumentation for tower/axum servers.
//!
//! [`MetloLayer`] wraps an HTTP service and, for every admitted request,
//! builds a [`MetloTrace`] of the exchange and hands it to a [`MetloApp`]
//! collector. The collector also decides which requests are traced at all and
//! which are blocked before reaching the handler.
//!
//! ```rust,ignore
//! let app = Router::new()
//!     .route("/ping", get(|| async { "pong" }))
//!     .layer(MetloLayer::new(my_collector));
//!
//! axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
//! ```
//!
//! Serving with `ConnectInfo<SocketAddr>` lets traces carry the client's
//! address and port; without it both fall back to empty / zero.
//!
//! # Memory
//!
//! Request bodies are buffered whole, since the trace needs them before the
//! handler runs. The handler gets them back through [`ReplayBody`], which is
//! implemented for `axum::body::Body` and the `http-body-util` boxed bodies.
//! Response bodies stream through untouched and only the first
//! [`MAX_BODY`] bytes are kept.
//!
//! # Delivery
//!
//! Traces are dispatched on detached tokio tasks. There is no retry and no
//! flush on shutdown.

pub mod capture;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod layer;
pub mod policy;
pub mod replay;
pub mod throttle;
pub mod trace;

pub use capture::{CaptureBody, CaptureBuffer, MAX_BODY};
pub use config::MetloConfig;
pub use error::{ConfigError, TraceError};
pub use layer::{MetloLayer, MetloService, UserExtractor};
pub use policy::MetloApp;
pub use replay::ReplayBody;
pub use throttle::Throttled;
pub use trace::{MetloTrace, NameValue, TraceMeta, TraceReq, TraceRes, TraceUrl, METLO_SOURCE};
