//! The relay server: connection admission, pairing bookkeeping, and
//! encrypted-message routing for one user's desktop/mobile device set.

pub mod admission;
pub mod pairing_graph;
pub mod pairing_store;
pub mod registry;
pub mod router;

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tracing::info;

use crate::config::RelayServerConfig;
use admission::{build_router, AppState};
use router::ServerState;

/// Binds the relay server's listener and runs until the process receives a
/// shutdown signal (SIGINT / SIGTERM on Unix, Ctrl-C elsewhere).
pub async fn run(config: RelayServerConfig) -> Result<()> {
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "relay server listening");

    let state = Arc::new(AppState {
        config,
        relay: ServerState::new(),
        started_at: Instant::now(),
    });

    let sweep_state = state.clone();
    tokio::spawn(async move { sweep_state.relay.run_pairing_sweep().await });

    let app = build_router(state);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("relay server: shutdown signal received");
}
