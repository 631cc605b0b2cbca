//! Demo server: a small axum app instrumented with `MetloLayer`.
//!
//! Each completed trace is logged as JSON instead of being shipped to a Metlo
//! collector, which makes this handy for eyeballing what the layer records.
//!
//! ```text
//! cargo run --features demo --bin demo_server -- --port 8080 --block-path /admin
//! curl -i localhost:8080/ping
//! ```

use async_trait::async_trait;
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use metlo_tower::{MetloApp, MetloConfig, MetloLayer, MetloTrace, Throttled, TraceMeta, TraceReq};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "demo_server", about = "Metlo instrumentation demo server")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "DEMO_LISTEN", default_value = "0.0.0.0")]
    listen: String,

    /// Port to listen on
    #[arg(long, env = "DEMO_PORT", default_value_t = 8080)]
    port: u16,

    /// Requests under this path prefix are blocked with 403
    #[arg(long)]
    block_path: Vec<String>,

    /// Maximum traces per second
    #[arg(long, default_value_t = 10.0)]
    traces_per_second: f64,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
}

/// Logs every trace instead of sending it anywhere.
struct LogCollector {
    block_paths: Vec<String>,
    completed: AtomicU64,
}

#[async_trait]
impl MetloApp for LogCollector {
    fn allow(&self) -> bool {
        true
    }

    fn should_block(&self, request: &TraceReq, meta: &TraceMeta) -> bool {
        let blocked = self
            .block_paths
            .iter()
            .any(|prefix| request.url.path.starts_with(prefix.as_str()));
        if blocked {
            info!(path = %request.url.path, source = %meta.source, "Policy match");
        }
        blocked
    }

    fn update_rate_limit(&self, _trace: &MetloTrace) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    async fn send(&self, trace: MetloTrace) {
        match serde_json::to_string(&trace) {
            Ok(json) => info!(
                completed = self.completed.load(Ordering::Relaxed),
                trace = %json,
                "Trace"
            ),
            Err(e) => warn!(error = %e, "Failed to serialize trace"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if args.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let addr: SocketAddr = format!("{}:{}", args.listen, args.port).parse()?;

    let mut config = MetloConfig::from_env();
    config.server_port = args.port;

    let collector = Throttled::new(
        LogCollector {
            block_paths: args.block_path,
            completed: AtomicU64::new(0),
        },
        args.traces_per_second,
    );
    let layer = MetloLayer::from_arc(Arc::new(collector), config);

    let app = Router::new()
        .route("/ping", get(|| async { "pong" }))
        .route("/echo", post(|body: String| async move { body }))
        .route("/admin", get(|| async { "secret" }))
        .layer(layer);

    info!("Demo server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        tracing::error!("Failed to bind to {}: {}", addr, e);
        e
    })?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|e| {
        tracing::error!("Server error: {}", e);
        e
    })?;

    Ok(())
}
