use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::Response;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use pubsub_engine::{Message, TailingReader};

use super::http::error_response;
use super::AppState;

// ═══════════════════════════════════════════════════════════════
//  WebSocket: GET /api/topics/{name}/subscribe?offset=N
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
pub(crate) struct SubscribeParams {
    #[serde(default)]
    offset: u64,
}

/// Resolves the topic before upgrading so a missing topic or bad name is a
/// plain HTTP error instead of a socket that closes right away.
pub(crate) async fn handle_subscribe(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<SubscribeParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let cancel = state.shutdown.child_token();
    let reader = match state.broker.stream_from(&name, params.offset, cancel.clone()) {
        Ok(reader) => reader,
        Err(e) => return error_response(&e),
    };

    let buffer = state.ws_buffer;
    ws.on_upgrade(move |socket| ws_connection(socket, reader, cancel, buffer))
}

// ═══════════════════════════════════════════════════════════════
//  Protocol types
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Serialize)]
struct WsRecord {
    offset: u64,
    key: String,
    value: String,
}

impl From<&Message> for WsRecord {
    fn from(m: &Message) -> Self {
        Self {
            offset: m.offset,
            key: STANDARD.encode(&m.key),
            value: STANDARD.encode(&m.value),
        }
    }
}

#[derive(Debug, Serialize)]
struct WsError {
    error: String,
}

/// Pump task → socket writer.
enum Outgoing {
    Record(WsRecord),
    Error(String),
}

// ═══════════════════════════════════════════════════════════════
//  Connection handler
// ═══════════════════════════════════════════════════════════════

async fn ws_connection(
    mut socket: WebSocket,
    reader: TailingReader,
    cancel: CancellationToken,
    buffer: usize,
) {
    let topic = reader.topic().to_string();
    let (tx, mut rx) = mpsc::channel::<Outgoing>(buffer);
    let pump_task = tokio::spawn(pump(reader, tx));

    loop {
        tokio::select! {
            biased;

            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                    // Subscribers have nothing to say; pings are answered by axum.
                    Some(Ok(_)) => continue,
                }
            }

            out = rx.recv() => {
                let Some(out) = out else {
                    // Reader ended on cancellation.
                    let _ = socket.send(WsMessage::Close(None)).await;
                    break;
                };
                let (json, last) = match out {
                    Outgoing::Record(record) => (serde_json::to_string(&record), false),
                    Outgoing::Error(error) => (serde_json::to_string(&WsError { error }), true),
                };
                let json = match json {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::error!(topic = %topic, error = %e, "encode ws frame");
                        break;
                    }
                };
                if socket.send(WsMessage::Text(json.into())).await.is_err() {
                    break;
                }
                if last {
                    let _ = socket.send(WsMessage::Close(None)).await;
                    break;
                }
            }
        }
    }

    cancel.cancel();
    drop(rx);
    if let Err(e) = pump_task.await {
        tracing::warn!(topic = %topic, error = %e, "subscription pump panicked");
    }
    tracing::debug!(topic = %topic, "ws subscriber disconnected");
}

/// Drives the reader and forwards each message. A slow socket fills the
/// bounded channel and stalls only this reader.
async fn pump(mut reader: TailingReader, tx: mpsc::Sender<Outgoing>) {
    loop {
        let out = match reader.next().await {
            Ok(Some(message)) => Outgoing::Record(WsRecord::from(&message)),
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(topic = %reader.topic(), error = %e, "subscription failed");
                let _ = tx.send(Outgoing::Error(e.to_string())).await;
                return;
            }
        };
        if tx.send(out).await.is_err() {
            return;
        }
    }
}
