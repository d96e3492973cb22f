pub mod routes;

use crate::state::AppState;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

/// JSON API over the engine. CORS is wide open; the host sits behind
/// whatever gateway serves the presentation layer.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/price", post(routes::post_price))
        .route("/api/implied-vol", post(routes::post_implied_vol))
        .route("/api/historical-vol", post(routes::post_historical_vol))
        .route("/api/chain/normalize", post(routes::post_normalize_chain))
        .route("/api/strategy/payoff", post(routes::post_payoff))
        .route("/api/strategy/simulate", post(routes::post_simulate))
        .route("/api/counters", get(routes::get_counters))
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .with_state(state)
}
