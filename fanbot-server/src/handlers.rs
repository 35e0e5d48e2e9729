use crate::assembler::assemble;
use crate::relay::spawn_relay;
use crate::upstream::{UpstreamError, UpstreamReply};
use crate::AppState;
use axum::{
    body::Bytes,
    extract::State,
    http::{
        header::{CACHE_CONTROL, CONTENT_TYPE},
        HeaderName, StatusCode,
    },
    response::{IntoResponse, Response},
    Json,
};
use fanbot_shared::{ChatReply, ClientChatRequest, HealthStatus, ReplyMeta};
use std::time::Instant;
use tracing::{error, info, warn};

/// Returned in place of an empty model answer.
pub const NO_REPLY: &str = "No response received from the model.";

const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

pub async fn health(State(state): State<AppState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        ok: true,
        time: chrono::Utc::now().to_rfc3339(),
        ollama_host: state.config.ollama_host.clone(),
        model: state.config.model.clone(),
    })
}

/// Whole-reply mode. Always answers exactly once, with a JSON payload.
pub async fn chat(
    State(state): State<AppState>,
    body: Bytes,
) -> (StatusCode, Json<ChatReply>) {
    let started = Instant::now();
    let messages = assemble(&read_request(&body));
    info!("Sync chat request with {} messages", messages.len());

    let reply = match state
        .upstream
        .send(messages, false, state.config.chat_timeout)
        .await
    {
        Ok(UpstreamReply::Accepted(body)) => body.read_reply().await,
        Ok(UpstreamReply::Rejected { status, body }) => {
            error!("Inference server rejected chat request: {} {}", status, body);
            return (
                StatusCode::BAD_GATEWAY,
                Json(ChatReply {
                    reply: format!("Upstream error (HTTP_{}).\n{}", status.as_u16(), body),
                    meta: None,
                }),
            );
        }
        Err(e) => Err(e),
    };

    match reply {
        Ok(content) => {
            let content = content.trim();
            let reply = if content.is_empty() { NO_REPLY } else { content };
            (
                StatusCode::OK,
                Json(ChatReply {
                    reply: reply.to_string(),
                    meta: Some(ReplyMeta {
                        elapsed_ms: u64::try_from(started.elapsed().as_millis())
                            .unwrap_or(u64::MAX),
                        model: state.upstream.model().to_string(),
                    }),
                }),
            )
        }
        Err(e) => server_error(e),
    }
}

/// Incremental mode: raw text, headers first, body fed by the relay.
pub async fn chat_stream(
    State(state): State<AppState>,
    body: Bytes,
) -> Response {
    let messages = assemble(&read_request(&body));
    info!("Stream chat request with {} messages", messages.len());

    let body = spawn_relay(state.upstream.clone(), messages, state.config.chat_timeout);
    (
        [
            (CONTENT_TYPE, "text/plain; charset=utf-8"),
            (CACHE_CONTROL, "no-cache, no-transform"),
            (X_ACCEL_BUFFERING, "no"),
        ],
        body,
    )
        .into_response()
}

/// Each field is read on its own: an out-of-contract field is ignored
/// without discarding the others. An unreadable body is an empty request,
/// which the assembler turns into the default greeting.
fn read_request(body: &[u8]) -> ClientChatRequest {
    if body.is_empty() {
        return ClientChatRequest::default();
    }
    match serde_json::from_slice::<serde_json::Value>(body) {
        Ok(value) => ClientChatRequest::from_value(&value),
        Err(e) => {
            warn!("Ignoring unreadable chat request body: {}", e);
            ClientChatRequest::default()
        }
    }
}

fn server_error(err: UpstreamError) -> (StatusCode, Json<ChatReply>) {
    error!("Sync chat failed: {:?}", err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ChatReply {
            reply: format!("Server error.\nDetail: {err}"),
            meta: None,
        }),
    )
}
