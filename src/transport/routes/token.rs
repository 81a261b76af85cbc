use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::Json};
use tracing::{debug, error};

use crate::{
    common::errors::ApiError,
    credentials::{TokenGrant, TokenRequest},
    server::AppState,
};

const PATH: &str = "/token";

/// POST /token: mints an audio transport token for one channel and uid.
pub async fn mint_token(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TokenRequest>,
) -> Result<Json<TokenGrant>, (StatusCode, Json<ApiError>)> {
    if request.channel_name.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ApiError::bad_request("channelName must not be empty", PATH)),
        ));
    }
    if request.uid.0 == 0 {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ApiError::bad_request("uid must be non-zero", PATH)),
        ));
    }

    match state.minter.mint(&request.channel_name, request.uid) {
        Ok(grant) => {
            debug!(
                "Minted token for channel={} uid={} expiry={}",
                request.channel_name, request.uid, grant.expiry
            );
            Ok(Json(grant))
        }
        Err(e) => {
            error!("Token minting failed: {}", e);
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::internal(e.to_string(), PATH)),
            ))
        }
    }
}
