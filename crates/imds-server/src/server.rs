//! Router, middleware chain, and the hardened HTTP server.
//!
//! Middleware runs outermost-first: request logging, then the metadata
//! header check, then rate limiting, then the mux. The header check is the
//! SSRF defense: requests must carry `Metadata: true` unless the path is one
//! of the cloud-init-consumed endpoints, whose clients cannot set headers.
//!
//! The exempt set is closed on purpose. Adding a credential-bearing endpoint
//! to it would be a security bug.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::header::{HeaderValue, RETRY_AFTER};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use axum_server::Handle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tracing::info;

use crate::config::ImdsConfig;
use crate::handlers::{self, error_response};
use crate::rate_limit::RateLimiter;

/// Header that must be `true` on non-exempt paths.
pub const METADATA_HEADER: &str = "Metadata";

/// Paths cloud-init and health probes reach without custom headers.
pub const HEADER_EXEMPT_PATHS: &[&str] = &[
    "/healthz",
    "/v1/meta-data",
    "/v1/user-data",
    "/v1/network-config",
    "/openstack/latest/meta_data.json",
];

/// Budget for reading a request's header section.
const READ_HEADER_TIMEOUT: Duration = Duration::from_secs(5);

/// Budget for producing a response once a request is in; requests that blow
/// it answer 408.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Cap on request header bytes.
const MAX_HEADER_BYTES: usize = 1024;

/// Drain budget for in-flight requests on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Shared state behind every handler. The identity record and user data are
/// immutable after startup; only the rate limiter is written to.
pub struct ImdsState {
    /// Server configuration.
    pub config: ImdsConfig,
    /// Process-wide token bucket.
    pub limiter: RateLimiter,
}

impl ImdsState {
    /// State with the default (100 rps / burst 100) limiter.
    pub fn new(config: ImdsConfig) -> Self {
        Self {
            config,
            limiter: RateLimiter::default(),
        }
    }

    /// State with a custom limiter; used by tests to exhaust small buckets.
    pub fn with_limiter(config: ImdsConfig, limiter: RateLimiter) -> Self {
        Self { config, limiter }
    }
}

/// Build the IMDS router with the full middleware chain.
pub fn imds_router(state: Arc<ImdsState>) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/v1/token", get(handlers::token))
        .route("/v1/identity", get(handlers::identity))
        // NoCloud cloud-init endpoints
        .route("/v1/meta-data", get(handlers::meta_data))
        .route("/v1/user-data", get(handlers::user_data))
        .route("/v1/network-config", get(handlers::network_config))
        // OpenStack endpoint (cloudbase-init on Windows guests)
        .route(
            "/openstack/latest/meta_data.json",
            get(handlers::openstack_meta_data),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
        .layer(middleware::from_fn(metadata_header_middleware))
        .layer(middleware::from_fn(logging_middleware))
        .with_state(state)
}

/// The IMDS HTTP server.
pub struct ImdsServer {
    config: ImdsConfig,
}

impl ImdsServer {
    /// Create a server for the given configuration.
    pub fn new(config: ImdsConfig) -> Self {
        Self { config }
    }

    /// Serve until the token is cancelled, then drain within the shutdown
    /// grace period.
    pub async fn run(self, shutdown: CancellationToken) -> io::Result<()> {
        let addr = self.config.listen_addr;
        let state = Arc::new(ImdsState::new(self.config));
        // The response budget sits on the server, not in the router's
        // middleware chain, same as the other connection hardening knobs.
        let app = imds_router(state).layer(TimeoutLayer::new(RESPONSE_TIMEOUT));

        let handle = Handle::new();
        {
            let handle = handle.clone();
            tokio::spawn(async move {
                shutdown.cancelled().await;
                info!("shutting down IMDS server");
                handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
            });
        }

        info!(%addr, "IMDS server listening");
        let mut server = axum_server::bind(addr);
        server
            .http_builder()
            .http1()
            .header_read_timeout(READ_HEADER_TIMEOUT)
            .max_buf_size(MAX_HEADER_BYTES);
        server
            .handle(handle)
            .serve(app.into_make_service())
            .await
    }
}

async fn logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();
    let response = next.run(request).await;
    info!(
        %method,
        path,
        status = response.status().as_u16(),
        elapsed = ?start.elapsed(),
        "request"
    );
    response
}

async fn metadata_header_middleware(request: Request, next: Next) -> Response {
    if HEADER_EXEMPT_PATHS.contains(&request.uri().path()) {
        return next.run(request).await;
    }

    let value = request
        .headers()
        .get(METADATA_HEADER)
        .and_then(|v| v.to_str().ok());
    if value != Some("true") {
        return error_response(
            StatusCode::BAD_REQUEST,
            "missing_header",
            "Metadata: true header is required",
        );
    }

    next.run(request).await
}

async fn rate_limit_middleware(
    State(state): State<Arc<ImdsState>>,
    request: Request,
    next: Next,
) -> Response {
    if !state.limiter.allow() {
        let mut response = error_response(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limited",
            "rate limit exceeded",
        );
        response
            .headers_mut()
            .insert(RETRY_AFTER, HeaderValue::from_static("1"));
        return response;
    }
    next.run(request).await
}
