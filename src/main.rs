use zai_gateway::config::GatewayConfig;
use zai_gateway::error::AppError;

#[tokio::main]
async fn main() {
    let config = GatewayConfig::from_env();
    let default_filter = if config.debug_mode {
        "info,zai_gateway=debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .json()
        .init();

    if let Err(err) = run(config).await {
        eprintln!("error: {}", err.message);
        std::process::exit(1);
    }
}

async fn run(config: GatewayConfig) -> Result<(), AppError> {
    let state = zai_gateway::app::load_state_with_config(config).await?;
    let app = zai_gateway::app::build_app(state.clone());
    let addr: std::net::SocketAddr =
        state
            .config
            .listen
            .parse()
            .map_err(|err: std::net::AddrParseError| {
                AppError::new(
                    axum::http::StatusCode::BAD_REQUEST,
                    "listen_invalid",
                    err.to_string(),
                )
            })?;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|err| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "listen_failed",
            err.to_string(),
        )
    })?;
    tracing::info!("listening on {}", addr);
    axum::serve(listener, app).await.map_err(|err| {
        AppError::new(
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "serve_failed",
            err.to_string(),
        )
    })?;
    Ok(())
}
