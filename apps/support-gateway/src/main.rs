//! Support chat gateway: serves the `/support` routes over an in-memory
//! message store.
//!
//! ```text
//! POST /support/chats                      -> create a chat
//! GET  /support/chats/{id}/stream?since=0  -> WebSocket push
//! ```

use std::sync::Arc;

use anyhow::Result;
use support_chat_core::{
    DeliveryCoordinator, GatewayConfig, GatewayState, InMemoryMessageStore, router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    support_chat_telemetry::install("support-gateway")?;

    let config = GatewayConfig::from_env()?;
    let store = Arc::new(InMemoryMessageStore::with_max_history(config.max_history));
    let coordinator = DeliveryCoordinator::new(store);
    let bind = config.bind;

    let app = router(GatewayState::new(coordinator, config))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    info!("support-gateway listening on {}", bind);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        // without a signal handler the server runs until killed
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
