mod http;
mod ws;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;

use pubsub_engine::Broker;

#[derive(Clone)]
pub(crate) struct AppState {
    broker: Arc<Broker>,
    ws_buffer: usize,
    shutdown: CancellationToken,
}

/// Routes of the publish/subscribe API, without a listener.
pub fn router(broker: Arc<Broker>, ws_buffer: usize, shutdown: CancellationToken) -> Router {
    let state = AppState {
        broker,
        ws_buffer: ws_buffer.max(1),
        shutdown,
    };

    Router::new()
        .route("/api/topics", get(http::handle_list_topics))
        .route("/api/topics/{name}/messages", post(http::handle_publish))
        .route("/api/topics/{name}/subscribe", get(ws::handle_subscribe))
        .with_state(state)
}

/// HTTP + WebSocket API server. Returns once `shutdown` fires and open
/// connections have drained.
pub async fn run(
    port: u16,
    broker: Arc<Broker>,
    ws_buffer: usize,
    shutdown: CancellationToken,
) -> Result<(), String> {
    let app = router(broker, ws_buffer, shutdown.clone());

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .map_err(|e| format!("bind api :{port}: {e}"))?;
    tracing::info!(port, "api listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| format!("axum serve: {e}"))?;

    Ok(())
}
