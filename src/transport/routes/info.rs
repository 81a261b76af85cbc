use std::sync::Arc;

use axum::{extract::State, response::Json};

use crate::{
    protocol::{GitInfo, Info, Version},
    server::AppState,
};

/// GET /info
pub async fn get_info(State(state): State<Arc<AppState>>) -> Json<Info> {
    Json(Info {
        version: Version::parse(env!("CARGO_PKG_VERSION")),
        build_time: env!("BUILD_TIME").parse().unwrap_or(0),
        git: GitInfo {
            branch: env!("GIT_BRANCH").to_string(),
            commit: env!("GIT_COMMIT").to_string(),
        },
        rooms: state.registry.topic_count(),
    })
}

/// GET /version
pub async fn get_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
