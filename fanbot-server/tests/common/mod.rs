//! Stub inference server and helpers shared by the integration tests.
#![allow(dead_code)]

use axum::{
    body::Body,
    extract::State,
    http::{header::CONTENT_TYPE, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use bytes::Bytes;
use fanbot_server::{app, config::RelayConfig, AppState};
use futures_util::{stream, StreamExt};
use serde_json::Value;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;

pub const MODEL: &str = "test-model";

#[derive(Clone)]
pub enum StubReply {
    /// One complete response.
    Full { status: StatusCode, body: String },
    /// Body written chunk by chunk; optionally never finished.
    Chunks { chunks: Vec<Vec<u8>>, hang: bool },
}

impl StubReply {
    pub fn json(status: StatusCode, body: Value) -> Self {
        Self::Full {
            status,
            body: body.to_string(),
        }
    }

    pub fn text(status: StatusCode, body: &str) -> Self {
        Self::Full {
            status,
            body: body.to_string(),
        }
    }

    pub fn ndjson(lines: &[&str]) -> Self {
        Self::Chunks {
            chunks: lines.iter().map(|l| format!("{l}\n").into_bytes()).collect(),
            hang: false,
        }
    }
}

#[derive(Clone)]
struct StubState {
    reply: StubReply,
    requests: Arc<Mutex<Vec<Value>>>,
}

pub struct StubUpstream {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<Value>>>,
}

impl StubUpstream {
    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }

    pub fn config(&self, chat_timeout: Duration) -> RelayConfig {
        RelayConfig {
            ollama_host: format!("http://{}", self.addr),
            model: MODEL.to_string(),
            chat_timeout,
            warmup: false,
            ..Default::default()
        }
    }

    pub fn state(&self) -> AppState {
        AppState::new(self.config(Duration::from_secs(5))).unwrap()
    }
}

pub async fn spawn_upstream(reply: StubReply) -> StubUpstream {
    let requests = Arc::new(Mutex::new(Vec::new()));
    let state = StubState {
        reply,
        requests: requests.clone(),
    };
    let router = Router::new()
        .route("/api/chat", post(stub_chat))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    StubUpstream { addr, requests }
}

async fn stub_chat(State(state): State<StubState>, Json(body): Json<Value>) -> Response {
    state.requests.lock().unwrap().push(body);

    match state.reply {
        StubReply::Full { status, body } => (status, body).into_response(),
        StubReply::Chunks { chunks, hang } => {
            let chunks = stream::iter(chunks).then(|chunk| async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok::<_, Infallible>(Bytes::from(chunk))
            });
            let body = if hang {
                Body::from_stream(chunks.chain(stream::pending()))
            } else {
                Body::from_stream(chunks)
            };
            ([(CONTENT_TYPE, "application/x-ndjson")], body).into_response()
        }
    }
}

/// A port with nothing listening on it.
pub fn closed_port_config(chat_timeout: Duration) -> RelayConfig {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    RelayConfig {
        ollama_host: format!("http://{addr}"),
        model: MODEL.to_string(),
        chat_timeout,
        warmup: false,
        ..Default::default()
    }
}

pub async fn post_json(state: AppState, uri: &str, body: &str) -> Response {
    let request = Request::post(uri)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    app(state).oneshot(request).await.unwrap()
}

pub async fn body_string(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// Data frames exactly as the relay emitted them.
pub async fn body_frames(response: Response) -> Vec<String> {
    response
        .into_body()
        .into_data_stream()
        .map(|frame| String::from_utf8(frame.unwrap().to_vec()).unwrap())
        .collect()
        .await
}
