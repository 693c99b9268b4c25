use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use pubsub_engine::Broker;

use crate::config::{ServeArgs, ServerConfig};
use crate::error::ServerError;

/// How long open subscriptions get to wind down after Ctrl+C.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run(args: ServeArgs) -> Result<(), ServerError> {
    tracing::info!("pubsub-server starting");

    // --- Load config ---
    let config = ServerConfig::resolve(&args)?;
    tracing::info!(
        config = args.config.as_deref().unwrap_or("<defaults>"),
        data_dir = %config.broker.data_dir.display(),
        fsync = config.broker.fsync,
        "loaded config"
    );

    // --- Open broker: discovery errors are fatal ---
    let broker = Arc::new(Broker::open(config.broker.clone()).await?);
    for name in broker.topic_names() {
        if let Some(topic) = broker.topic(&name) {
            tracing::info!(
                topic = %name,
                segments = topic.segments().len(),
                next_offset = topic.next_offset(),
                "topic ready"
            );
        }
    }

    // --- CancellationToken for graceful shutdown ---
    let token = CancellationToken::new();

    // --- API server (HTTP + WS) ---
    let api_broker = Arc::clone(&broker);
    let api_port = config.api_port;
    let ws_buffer = config.ws_buffer;
    let api_token = token.clone();
    let mut api_handle = tokio::spawn(async move {
        pubsub_api_server::run(api_port, api_broker, ws_buffer, api_token).await
    });

    tracing::info!("server ready");

    // --- Wait for Ctrl+C or an early API failure ---
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("shutting down...");
        }
        res = &mut api_handle => {
            token.cancel();
            return match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(ServerError::Api(e)),
                Err(e) => Err(ServerError::Api(format!("api task: {e}"))),
            };
        }
    }

    // Readers see the cancellation and close their sockets.
    token.cancel();

    match tokio::time::timeout(DRAIN_TIMEOUT, &mut api_handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => tracing::error!(error = %e, "api server error"),
        Ok(Err(e)) => tracing::error!(error = %e, "api task failed"),
        Err(_) => {
            tracing::warn!(timeout = ?DRAIN_TIMEOUT, "api server did not drain, aborting");
            api_handle.abort();
        }
    }

    tracing::info!(topics = broker.topic_names().len(), "shutdown complete");
    Ok(())
}
