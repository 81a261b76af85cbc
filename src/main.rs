use std::{net::SocketAddr, sync::Arc};

use partyline::{common::logger, configs::Config, log_println, server::AppState, transport};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = Config::load()?;
    logger::init(&config);

    log_println!(
        "partyline {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_COMMIT")
    );

    let address: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    if config.server.password.is_none() {
        info!("No server password configured, /token is open");
    }

    let state = Arc::new(AppState::new(config));
    let app = transport::router(state);

    info!("Relay listening on {}", address);
    let listener = tokio::net::TcpListener::bind(address).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await?;

    Ok(())
}
