use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use pubsub_engine::{BrokerError, ErrorKind, Record};

use super::AppState;

// ═══════════════════════════════════════════════════════════════
//  REST: GET /api/topics
// ═══════════════════════════════════════════════════════════════

pub(crate) async fn handle_list_topics(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.broker.topic_names())
}

// ═══════════════════════════════════════════════════════════════
//  REST: POST /api/topics/{name}/messages
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
pub(crate) struct PublishRequest {
    messages: Vec<WireRecord>,
}

/// Key and value as standard base64; a missing key is empty.
#[derive(Debug, Deserialize)]
struct WireRecord {
    #[serde(default)]
    key: String,
    value: String,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub(crate) struct PublishResponse {
    first_offset: u64,
    next_offset: u64,
}

pub(crate) async fn handle_publish(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<PublishRequest>,
) -> Response {
    let records = match decode_records(request) {
        Ok(records) => records,
        Err(e) => return error_response(&e),
    };

    match state.broker.append(&name, records).await {
        Ok(range) => Json(PublishResponse {
            first_offset: range.start,
            next_offset: range.end,
        })
        .into_response(),
        Err(e) => {
            tracing::warn!(topic = %name, error = %e, "publish failed");
            error_response(&e)
        }
    }
}

fn decode_records(request: PublishRequest) -> Result<Vec<Record>, BrokerError> {
    request
        .messages
        .into_iter()
        .enumerate()
        .map(|(i, m)| {
            let key = STANDARD
                .decode(&m.key)
                .map_err(|e| BrokerError::InvalidArgument(format!("messages[{i}].key: {e}")))?;
            let value = STANDARD
                .decode(&m.value)
                .map_err(|e| BrokerError::InvalidArgument(format!("messages[{i}].value: {e}")))?;
            Ok(Record::new(key, value))
        })
        .collect()
}

pub(crate) fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::CorruptFrame | ErrorKind::Io | ErrorKind::Config => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

pub(crate) fn error_response(err: &BrokerError) -> Response {
    let body = serde_json::json!({ "error": err.to_string(), "kind": err.kind().to_string() });
    (status_for(err.kind()), Json(body)).into_response()
}
