use options_engine::config::AppConfig;
use options_engine::server;
use options_engine::state::AppState;

#[tokio::main]
async fn main() {
    // Structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("options engine starting");

    let cfg = match AppConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("config error: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        iv_tolerance = cfg.solver.tolerance,
        iv_max_iterations = cfg.solver.max_iterations,
        hv_windows = ?cfg.historical_vol.windows,
        mc_default_paths = cfg.simulation.default_paths,
        mc_max_paths = cfg.simulation.max_paths,
        "config loaded"
    );

    let port = cfg.server_port;
    let app_state = AppState::new(cfg);
    let app = server::router(app_state);

    let addr = format!("0.0.0.0:{port}");
    tracing::info!("server listening on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| {
            tracing::error!("bind error: {e}");
            std::process::exit(1);
        });

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("server error: {e}");
    }
}
