use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::{get, post},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    server::AppState,
    transport::{
        middleware::{add_response_headers, check_auth},
        routes::{info, token},
        websocket_server::websocket_handler,
    },
};

pub fn router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/token", post(token::mint_token))
        .route("/info", get(info::get_info))
        .route_layer(middleware::from_fn_with_state(state.clone(), check_auth));

    Router::new()
        .merge(protected)
        .route("/realtime", get(websocket_handler))
        .route("/version", get(info::get_version))
        .layer(middleware::from_fn(add_response_headers))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
