//! Core library for recall-gate. This module wires the access gate, the
//! conversational memory and the collaborators into an axum router and
//! exposes health and Prometheus-style metrics endpoints.

mod config;
pub mod auth;
pub mod error;
pub mod gate;
pub mod handlers;
pub mod ranker;
pub mod rate_limit;
pub mod services;
pub mod session;
pub mod store;
pub mod util;

pub use config::{AppConfig, CacheBackend, CacheConfig, DocumentConfig, KeySetConfig, ProviderConfig};
pub use error::GateError;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use axum::extract::{DefaultBodyLimit, State};
use axum::extract::Request;
use axum::http::{header, HeaderName, Method, StatusCode};
use axum::middleware::Next;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{HttpKeySource, KeyCache, RefreshPolicy, TokenVerifier};
use crate::rate_limit::RateLimiter;
use crate::services::{OpenAiClient, PineconeIndex, Services, SqliteDocumentStore, TweetSource, XApiClient};
use crate::session::SessionStore;
use crate::store::{CacheStore, MemoryStore, RedisStore, RestStore};
use crate::util::bounded;

/// Labels of every reason a request can be refused before rate limiting.
pub const AUTH_FAILURE_REASONS: [&str; 9] = [
    "missing_auth_header",
    "malformed_auth_header",
    "unknown_signing_key",
    "unsupported_algorithm",
    "issuer_mismatch",
    "token_expired",
    "claims_malformed",
    "invalid_signature",
    "backend_unavailable",
];

const HEALTH_PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Connecting to Redis at startup may take longer than a single command.
const REDIS_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Counters owned by the gate itself. Rate limiter and key cache keep their
/// own and are read at exposition time.
pub struct GateMetrics {
    admitted_total: AtomicU64,
    auth_failures: [AtomicU64; AUTH_FAILURE_REASONS.len()],
    process_start_epoch: f64,
    process_start_instant: Instant,
}

impl Default for GateMetrics {
    fn default() -> Self {
        let start_time = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            admitted_total: AtomicU64::new(0),
            auth_failures: std::array::from_fn(|_| AtomicU64::new(0)),
            process_start_epoch: start_time.as_secs_f64(),
            process_start_instant: Instant::now(),
        }
    }
}

impl GateMetrics {
    pub fn record_admitted(&self) {
        self.admitted_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auth_failure(&self, reason: &str) {
        if let Some(idx) = AUTH_FAILURE_REASONS.iter().position(|r| *r == reason) {
            self.auth_failures[idx].fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn admitted_total(&self) -> u64 {
        self.admitted_total.load(Ordering::Relaxed)
    }

    pub fn auth_failures(&self, reason: &str) -> u64 {
        AUTH_FAILURE_REASONS
            .iter()
            .position(|r| *r == reason)
            .map(|idx| self.auth_failures[idx].load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub verifier: Arc<TokenVerifier>,
    pub limiter: Arc<RateLimiter>,
    pub sessions: Arc<SessionStore>,
    pub services: Services,
    /// Shared cache used by the key cache and the rate limiter.
    pub cache: Arc<dyn CacheStore>,
    pub cache_timeout: Duration,
    pub admin_api_key: Option<Arc<str>>,
    /// Maximum accepted request body size in bytes (None => axum default)
    pub max_request_bytes: Option<usize>,
    pub search_top_k: usize,
    pub metrics: Arc<GateMetrics>,
}

/// Build state from a parsed configuration. The initial key set load is
/// attempted here; failure is logged and retried on the first request.
pub async fn build_state(config: AppConfig) -> anyhow::Result<AppState> {
    let AppConfig {
        keyset,
        cache,
        documents,
        rate_limit,
        admin_api_key,
        max_request_bytes,
        search_top_k,
        providers,
        port: _,
    } = config;

    let store: Arc<dyn CacheStore> = match cache.backend() {
        CacheBackend::Redis(url) => {
            let redis = RedisStore::connect(url, REDIS_CONNECT_TIMEOUT.max(cache.op_timeout))
                .await
                .context("failed to connect to redis")?;
            tracing::info!("shared cache: redis");
            Arc::new(redis)
        }
        CacheBackend::Rest(url) => Arc::new(
            RestStore::new(url, cache.token.clone(), cache.op_timeout)
                .context("failed to build distributed cache client")?,
        ),
        CacheBackend::Memory => {
            tracing::warn!("REDIS_URL not set; counters and key set cache are per process");
            Arc::new(MemoryStore::new())
        }
    };

    let source = HttpKeySource::new(&keyset.jwks_url, keyset.fetch_timeout)
        .context("failed to build key set client")?;
    let keys = Arc::new(KeyCache::new(
        Arc::new(source),
        Some(store.clone()),
        RefreshPolicy {
            stale_after: keyset.stale_after,
            fetch_timeout: keyset.fetch_timeout,
            ..RefreshPolicy::default()
        },
        cache.op_timeout,
    ));
    match keys.load().await {
        Ok(set) => tracing::info!(keys = set.len(), origin = ?set.origin(), "verification keys loaded"),
        Err(e) => tracing::warn!(error = %e, url = %keyset.jwks_url, "initial key set load failed"),
    }
    let verifier = Arc::new(TokenVerifier::new(keys, keyset.issuer));

    let limiter = Arc::new(RateLimiter::new(store.clone(), rate_limit, cache.op_timeout));

    let openai = Arc::new(
        OpenAiClient::new(
            &providers.openai_base_url,
            &providers.openai_api_key,
            &providers.embedding_model,
            &providers.chat_model,
            providers.request_timeout,
        )
        .context("failed to build OpenAI client")?,
    );
    let index = PineconeIndex::new(
        &providers.pinecone_index_host,
        &providers.pinecone_api_key,
        providers.pinecone_namespace.clone(),
        providers.request_timeout,
    )
    .context("failed to build Pinecone client")?;
    let document_store = SqliteDocumentStore::open(&documents.path)
        .with_context(|| format!("failed to open document store at {}", documents.path.display()))?;
    tracing::info!(path = %documents.path.display(), "document store opened");

    let tweets: Option<Arc<dyn TweetSource>> = match providers.x_bearer_token.as_deref() {
        Some(token) => Some(Arc::new(
            XApiClient::new(&providers.x_api_base_url, token, providers.request_timeout)
                .context("failed to build X API client")?,
        )),
        None => {
            tracing::info!("X_API_BEARER_TOKEN not set; tweet import disabled");
            None
        }
    };

    let services = Services {
        embedder: openai.clone(),
        index: Arc::new(index),
        chat: openai,
        documents: Arc::new(document_store),
        tweets,
    };

    Ok(AppState {
        verifier,
        limiter,
        sessions: Arc::new(SessionStore::new()),
        services,
        cache: store,
        cache_timeout: cache.op_timeout,
        admin_api_key: admin_api_key.map(Arc::from),
        max_request_bytes,
        search_top_k,
        metrics: Arc::new(GateMetrics::default()),
    })
}

/// Build state from environment variables (see [`AppConfig::from_env`]).
pub async fn build_state_from_env() -> anyhow::Result<AppState> {
    let config = AppConfig::from_env()?;
    build_state(config).await
}

/// Build the Axum router. Every `/api/*` route sits behind the access gate.
pub fn app(state: AppState) -> Router {
    let max_request_bytes = state.max_request_bytes;

    let api = Router::new()
        .route("/api/save", post(handlers::save))
        .route("/api/save-tweet", post(handlers::save_tweet))
        .route("/api/query", post(handlers::query))
        .route("/api/reset-session", post(handlers::reset_session))
        .route("/api/session/:session_id", get(handlers::get_session))
        .route("/api/usage", get(handlers::usage))
        .route_layer(middleware::from_fn_with_state(state.clone(), gate::access_gate));

    let router = Router::new()
        .merge(api)
        .route("/admin/clear-cache", post(handlers::clear_cache))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http());

    let router = if let Some(limit) = max_request_bytes {
        router.layer(DefaultBodyLimit::max(limit))
    } else {
        router
    };

    // CORS sits outside the gate so preflights never need a token
    router
        .layer(cors_layer())
        .layer(middleware::from_fn(preflight_no_content))
        .with_state(state)
}

/// Browser access from any origin, bearer token or admin key in headers.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::CONTENT_LENGTH,
            header::ACCEPT_ENCODING,
            HeaderName::from_static("x-csrf-token"),
            HeaderName::from_static(gate::ADMIN_KEY_HEADER),
            header::AUTHORIZATION,
            header::ACCEPT,
            header::ORIGIN,
            header::CACHE_CONTROL,
            HeaderName::from_static("x-requested-with"),
        ])
}

/// Answer successful preflights with 204 instead of an empty 200.
async fn preflight_no_content(req: Request, next: Next) -> axum::response::Response {
    let preflight = req.method() == Method::OPTIONS;
    let mut resp = next.run(req).await;
    if preflight && resp.status() == StatusCode::OK {
        *resp.status_mut() = StatusCode::NO_CONTENT;
    }
    resp
}

/// Dependency status for readiness checks. Always 200; `status` turns
/// `degraded` when a dependency fails or no key set is loaded.
async fn health_handler(State(state): State<AppState>) -> axum::response::Response {
    let mut degraded = false;

    let cache_status = match bounded(
        state.cache_timeout.min(HEALTH_PING_TIMEOUT),
        "ping",
        state.cache.ping(),
    )
    .await
    {
        Ok(()) => "ok".to_string(),
        Err(e) => {
            degraded = true;
            format!("error: {}", e)
        }
    };

    let documents_status =
        match tokio::time::timeout(HEALTH_PING_TIMEOUT, state.services.documents.ping()).await {
            Ok(Ok(())) => "ok".to_string(),
            Ok(Err(e)) => {
                degraded = true;
                format!("error: {}", e)
            }
            Err(_) => {
                degraded = true;
                "error: ping timed out".to_string()
            }
        };

    let keyset = match state.verifier.keys().snapshot() {
        Some(set) => serde_json::json!({
            "status": "ok",
            "keys": set.len(),
            "origin": set.origin(),
            "age_secs": set.age().as_secs(),
            "fetched_at": set.fetched_at(),
        }),
        None => {
            degraded = true;
            serde_json::json!({ "status": "missing" })
        }
    };

    let json = serde_json::json!({
        "status": if degraded { "degraded" } else { "ok" },
        "version": env!("CARGO_PKG_VERSION"),
        "services": {
            "cache": { "backend": state.cache.backend(), "status": cache_status },
            "documents": { "backend": state.services.documents.backend(), "status": documents_status },
            "keyset": keyset,
        },
    });
    (StatusCode::OK, Json(json)).into_response()
}

fn write_metric(buf: &mut String, name: &str, kind: &str, help: &str, value: impl std::fmt::Display) {
    use std::fmt::Write as _;
    writeln!(buf, "# HELP {} {}", name, help).ok();
    writeln!(buf, "# TYPE {} {}", name, kind).ok();
    writeln!(buf, "{} {}", name, value).ok();
}

/// Prometheus-style metrics exposition. Text format with simple counters.
async fn metrics_handler(State(state): State<AppState>) -> axum::response::Response {
    use std::fmt::Write as _;
    let mut buf = String::new();
    let keys = state.verifier.keys();

    write_metric(
        &mut buf,
        "recall_requests_admitted_total",
        "counter",
        "Requests admitted by the access gate",
        state.metrics.admitted_total(),
    );

    writeln!(
        &mut buf,
        "# HELP recall_auth_failures_total Requests refused before rate limiting, by reason\n# TYPE recall_auth_failures_total counter"
    )
    .ok();
    for reason in AUTH_FAILURE_REASONS {
        writeln!(
            &mut buf,
            "recall_auth_failures_total{{reason=\"{}\"}} {}",
            reason,
            state.metrics.auth_failures(reason)
        )
        .ok();
    }

    write_metric(
        &mut buf,
        "recall_rate_limited_total",
        "counter",
        "Requests rejected by the rate limiter",
        state.limiter.rejected_total(),
    );
    write_metric(
        &mut buf,
        "recall_rate_limit_fail_open_total",
        "counter",
        "Requests admitted uncounted because the counter backend failed",
        state.limiter.fail_open_total(),
    );
    write_metric(
        &mut buf,
        "recall_keyset_refreshes_total",
        "counter",
        "Successful key set loads",
        keys.refreshes_total(),
    );
    write_metric(
        &mut buf,
        "recall_keyset_refresh_failures_total",
        "counter",
        "Failed key set loads",
        keys.refresh_failures_total(),
    );
    write_metric(
        &mut buf,
        "recall_keyset_origin_fetches_total",
        "counter",
        "Key set fetches from the identity provider",
        keys.origin_fetches_total(),
    );
    let snapshot = keys.snapshot();
    write_metric(
        &mut buf,
        "recall_keyset_keys",
        "gauge",
        "Keys in the current key set (0 if none loaded)",
        snapshot.as_ref().map_or(0, |s| s.len()),
    );
    write_metric(
        &mut buf,
        "recall_keyset_age_seconds",
        "gauge",
        "Seconds since the current key set was loaded (-1 if none)",
        snapshot.as_ref().map_or(-1.0, |s| s.age().as_secs_f64()),
    );
    write_metric(
        &mut buf,
        "recall_sessions_active",
        "gauge",
        "Conversation sessions held in memory",
        state.sessions.len(),
    );

    writeln!(
        &mut buf,
        "# HELP recall_build_info Build information\n# TYPE recall_build_info gauge"
    )
    .ok();
    writeln!(
        &mut buf,
        "recall_build_info{{version=\"{}\"}} 1",
        env!("CARGO_PKG_VERSION")
    )
    .ok();

    write_metric(
        &mut buf,
        "recall_process_start_time_seconds",
        "gauge",
        "Process start time (Unix epoch seconds)",
        state.metrics.process_start_epoch,
    );
    write_metric(
        &mut buf,
        "recall_process_uptime_seconds",
        "gauge",
        "Process uptime seconds",
        state.metrics.process_start_instant.elapsed().as_secs_f64(),
    );

    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        buf,
    )
        .into_response()
}
