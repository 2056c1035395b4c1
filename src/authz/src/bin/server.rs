//! # Gateway HTTP Server
//!
//! Thin HTTP surface over the Tollgate gateway engine: identity resolution
//! plus policy evaluation for each request, policy administration, health
//! and metrics. Forwarding to the upstream service is not done here.
//!
//! ## Endpoints
//!
//! - `ANY /exec` - Resolve the caller and check the target resource
//! - `POST /admin/policies` - Add a subject to a policy entry
//! - `DELETE /admin/policies` - Remove a subject from a policy entry
//! - `DELETE /admin/policies/all` - Remove every entry of a resource
//! - `GET /health` - Health check
//! - `GET /metrics` - Prometheus metrics
//!
//! ## Configuration
//!
//! - `TOLLGATE_CONFIG` - Path of the TOML configuration file (defaults apply when unset)
//! - `RUST_LOG` - Log level (default: info)
//!
//! ## App credentials
//!
//! The server has no app metadata store, so it never warms up app signing
//! records. The exchange processor still consumes `app` events, but those
//! reloads and the startup warm-up need an `AppMetadataSource`, which only an
//! embedding service can supply through `Gateway::start(Some(source))`.
//! Here AK/SK and app id requests resolve against records some other
//! instance or tool has already written to the shared cache.

use axum::{
    extract::{Query, Request, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{any, delete, get, post},
    serve, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::{DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tollgate_authz::config::CacheBackendKind;
use tollgate_authz::{
    ActionKind, AddPolicyRequest, AuthzError, CredentialRequest, ErrorKind, Gateway, GatewayConfig,
    GatewayDecision, InMemoryPolicyCache, PolicyCache, RemovePolicyRequest, ResourceKind,
};

/// Shared application state
#[derive(Clone)]
struct AppState {
    gateway: Arc<Gateway>,
    start_time: std::time::Instant,
}

/// Error response body
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

/// Application error type
#[derive(Debug)]
enum AppError {
    Gateway(AuthzError),
    Rejected(GatewayDecision),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            AppError::Gateway(err) => match err.kind() {
                ErrorKind::BadRequest => (StatusCode::BAD_REQUEST, "bad_request", err.to_string()),
                ErrorKind::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized", err.to_string()),
                ErrorKind::Internal => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    err.to_string(),
                ),
            },
            AppError::Rejected(decision) => (
                StatusCode::UNAUTHORIZED,
                "rejected",
                format!("Access to {} ({}) rejected", decision.resource_uri, decision.action),
            ),
        };

        let body = Json(ErrorResponse {
            error: error.to_string(),
            message,
        });

        (status, body).into_response()
    }
}

impl From<AuthzError> for AppError {
    fn from(err: AuthzError) -> Self {
        AppError::Gateway(err)
    }
}

/// Response for an accepted `/exec` check
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecResponse {
    allowed: bool,
    decision: GatewayDecision,
}

/// Body of `DELETE /admin/policies/all`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoveAllRequest {
    resource_kind: ResourceKind,
    resource_uri: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AdminResponse {
    key: Option<String>,
    changed: usize,
}

/// Health check response
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    uptime_seconds: u64,
    version: String,
}

/// Metrics response (Prometheus format)
struct MetricsResponse {
    metrics: String,
}

impl IntoResponse for MetricsResponse {
    fn into_response(self) -> Response {
        (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            self.metrics,
        )
            .into_response()
    }
}

/// Build the credential view of an incoming HTTP request
fn credential_request(request: &Request) -> CredentialRequest {
    let mut credentials = CredentialRequest::new(request.method().as_str(), request.uri().path());
    if let Some(query) = request.uri().query() {
        credentials = credentials.with_query(query);
    }
    for (name, value) in request.headers() {
        match value.to_str() {
            Ok(value) => credentials.insert_header(name.as_str(), value),
            Err(_) => warn!(header = %name, "Skipping non-UTF-8 header"),
        }
    }
    credentials
}

/// ANY /exec - Identity resolution plus policy check
async fn exec(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    request: Request,
) -> Result<Json<ExecResponse>, AppError> {
    let server = &state.gateway.config().server;

    let resource_uri = params
        .get(&server.resource_uri_param)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            AuthzError::bad_request(format!("Missing query parameter {}", server.resource_uri_param))
        })?;

    let action = match params.get(&server.resource_action_param) {
        Some(raw) => raw.parse::<ActionKind>()?,
        None => ActionKind::from_http_method(request.method().as_str()).ok_or_else(|| {
            AuthzError::bad_request(format!("No action for method {}", request.method()))
        })?,
    };

    let credentials = credential_request(&request);
    let decision = state.gateway.check(&credentials, resource_uri, action).await?;

    info!(
        "Gateway decision: {} {} -> {}",
        decision.action, decision.resource_uri, decision.result
    );

    if !decision.is_allowed() {
        return Err(AppError::Rejected(decision));
    }

    Ok(Json(ExecResponse {
        allowed: true,
        decision,
    }))
}

/// POST /admin/policies
async fn add_policy(
    State(state): State<AppState>,
    Json(req): Json<AddPolicyRequest>,
) -> Result<Json<AdminResponse>, AppError> {
    let key = state.gateway.admin().add_policy(&req).await?;
    info!("Policy added: {}", key);

    Ok(Json(AdminResponse {
        key: Some(key.to_string()),
        changed: 1,
    }))
}

/// DELETE /admin/policies
async fn remove_policy(
    State(state): State<AppState>,
    Json(req): Json<RemovePolicyRequest>,
) -> Result<Json<AdminResponse>, AppError> {
    let removed = state.gateway.admin().remove_policy(&req).await?;

    Ok(Json(AdminResponse {
        key: None,
        changed: usize::from(removed),
    }))
}

/// DELETE /admin/policies/all
async fn remove_all_policies(
    State(state): State<AppState>,
    Json(req): Json<RemoveAllRequest>,
) -> Result<Json<AdminResponse>, AppError> {
    let removed = state
        .gateway
        .admin()
        .remove_all_policies(req.resource_kind, &req.resource_uri)
        .await?;
    info!("Removed {} policy entries for {}", removed, req.resource_uri);

    Ok(Json(AdminResponse {
        key: None,
        changed: removed,
    }))
}

/// GET /health - Health check endpoint
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = state.start_time.elapsed().as_secs();

    Json(HealthResponse {
        status: "healthy".to_string(),
        uptime_seconds: uptime,
        version: tollgate_authz::VERSION.to_string(),
    })
}

/// GET /metrics - Prometheus metrics endpoint
async fn metrics(State(state): State<AppState>) -> MetricsResponse {
    let uptime = state.start_time.elapsed().as_secs();
    let gateway_metrics = state.gateway.metrics().export_prometheus().await;

    let metrics = format!(
        "# HELP tollgate_uptime_seconds Server uptime in seconds\n\
         # TYPE tollgate_uptime_seconds gauge\n\
         tollgate_uptime_seconds {}\n\
         \n\
         {}",
        uptime, gateway_metrics
    );

    MetricsResponse { metrics }
}

/// Create the HTTP router with all endpoints
fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let trace = TraceLayer::new_for_http().on_response(DefaultOnResponse::new().level(Level::INFO));

    Router::new()
        .route("/exec", any(exec))
        .route("/admin/policies", post(add_policy).delete(remove_policy))
        .route("/admin/policies/all", delete(remove_all_policies))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .layer(trace)
        .layer(cors)
        .with_state(state)
}

/// Open the shared policy cache selected by configuration
async fn open_cache(config: &GatewayConfig) -> anyhow::Result<Arc<dyn PolicyCache>> {
    match config.cache.backend {
        CacheBackendKind::Memory => {
            warn!("Using the in-process policy cache; state is not shared between instances");
            Ok(Arc::new(InMemoryPolicyCache::new()))
        }
        #[cfg(feature = "redis")]
        CacheBackendKind::Redis => {
            let cache = tollgate_authz::RedisPolicyCache::connect(&config.cache).await?;
            Ok(Arc::new(cache))
        }
        #[cfg(not(feature = "redis"))]
        CacheBackendKind::Redis => {
            anyhow::bail!("redis backend requested but gateway-server was built without the `redis` feature")
        }
    }
}

/// Graceful shutdown handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }

    info!("Starting graceful shutdown");
}

/// Main server entrypoint
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Tollgate gateway server v{}", tollgate_authz::VERSION);

    let config = GatewayConfig::load()?;
    info!("Configuration:");
    info!("  Bind: {}", config.server.bind_address());
    info!("  Cache backend: {:?}", config.cache.backend);
    info!("  Exchange topic: {}", config.policy.exchange_topic);

    let cache = open_cache(&config).await?;
    let addr = config.server.bind_address();

    let gateway = Arc::new(Gateway::new(config, cache)?);
    // no metadata store: warm-up and app reloads are left to embedders
    let exchange_task = gateway.start(None).await?;
    warn!("No app metadata source configured; app credentials are read from the shared cache only");
    info!("Gateway engine initialized successfully");

    let state = AppState {
        gateway,
        start_time: std::time::Instant::now(),
    };
    let app = create_router(state);

    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
        error!("Failed to bind HTTP server: {}", e);
        e
    })?;

    let result = serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await;

    exchange_task.abort();

    match result {
        Ok(()) => {
            info!("Server shut down gracefully");
            Ok(())
        }
        Err(e) => {
            error!("Server error: {}", e);
            Err(e.into())
        }
    }
}
