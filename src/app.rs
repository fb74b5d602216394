use crate::auth::AuthState;
use crate::config::{CUSTOM_TOKEN_HEADER, GatewayConfig};
use crate::error::{AppError, AppResult};
use crate::stats::StatsCollector;
use crate::token::{SqliteTokenPool, TokenResolver};
use crate::upstream::{UpstreamClient, build_http_client};
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE, HeaderName};
use axum::http::{Method, StatusCode};
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::{Arc, Once, OnceLock};
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub auth: AuthState,
    pub resolver: TokenResolver,
    pub upstream: UpstreamClient,
    pub stats: Arc<StatsCollector>,
    pub metrics: PrometheusHandle,
}

/// Upper bound for chat request bodies; long conversations exceed axum's 2 MB default.
pub const MAX_CHAT_BODY_BYTES: usize = 64 * 1024 * 1024;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_config(GatewayConfig::from_env()).await
}

pub async fn load_state_with_config(config: GatewayConfig) -> AppResult<AppState> {
    let config = Arc::new(config);

    let http = build_http_client().map_err(|err| {
        AppError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "http_client_init_failed",
            err.to_string(),
        )
    })?;
    let upstream = UpstreamClient::new(http, config.clone());

    let mut resolver = TokenResolver::new(config.static_token.clone());
    if config.register_enabled {
        tracing::info!(path = %config.register_db_path, "token pool enabled");
        resolver = resolver.with_pool(Arc::new(SqliteTokenPool::open(&config.register_db_path)));
    }
    if config.anon_token_enabled {
        resolver = resolver.with_anonymous(Arc::new(upstream.clone()));
    }

    if config.signing_secret.is_none() {
        tracing::warn!("ZAI_SIGNING_SECRET not set, signing with the built-in default secret");
    }
    tracing::info!(
        upstream = %config.upstream_url,
        model = %config.model_name,
        default_stream = config.default_stream,
        think_tags_mode = ?config.think_tags_mode,
        "gateway configured"
    );

    let metrics = init_metrics()?;

    Ok(AppState {
        auth: AuthState::new(config.api_key.clone()),
        config,
        resolver,
        upstream,
        stats: Arc::new(StatsCollector::new()),
        metrics,
    })
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "metrics_init_failed",
                    err.to_string(),
                ));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE.get().cloned().ok_or_else(|| {
        AppError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "metrics_init_failed",
            "metrics recorder not available",
        )
    })
}

pub fn build_app(state: AppState) -> Router {
    let mut router = Router::<AppState>::new()
        .route("/", get(crate::handlers::home))
        .route("/v1/models", get(crate::handlers::list_models))
        .route(
            "/v1/chat/completions",
            post(crate::handlers::create_chat_completions)
                .layer(DefaultBodyLimit::max(MAX_CHAT_BODY_BYTES)),
        )
        .route("/metrics", get(crate::handlers::metrics));
    if state.config.dashboard_enabled {
        router = router.merge(build_dashboard_router());
    }

    router
        .with_state(state)
        .layer(cors_layer())
        .layer(SetRequestIdLayer::new(
            HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
            "x-request-id",
        )))
        .layer(TraceLayer::new_for_http())
}

fn build_dashboard_router() -> Router<AppState> {
    Router::new()
        .route("/dashboard/stats", get(crate::handlers::dashboard_stats))
        .route(
            "/dashboard/requests",
            get(crate::handlers::dashboard_requests),
        )
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            CONTENT_TYPE,
            AUTHORIZATION,
            HeaderName::from_static(CUSTOM_TOKEN_HEADER),
        ])
}
