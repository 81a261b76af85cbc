use std::{sync::Arc, time::Duration};

use crate::{configs::Config, credentials::TokenMinter, realtime::RoomRegistry};

/// Top-level application state shared by every route.
pub struct AppState {
    /// Rooms of the realtime relay served on `/realtime`.
    pub registry: Arc<RoomRegistry>,
    pub minter: TokenMinter,
    pub config: Config,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let minter = TokenMinter::new(
            config.server.app_id.clone(),
            config.server.app_certificate.as_bytes(),
            Duration::from_secs(config.server.token_ttl_secs),
        );
        Self {
            registry: Arc::new(RoomRegistry::new()),
            minter,
            config,
        }
    }
}
