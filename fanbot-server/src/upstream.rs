//! Client for the inference server's `/api/chat` endpoint.

use bytes::Bytes;
use fanbot_shared::{ChatMessage, Utf8Decoder};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

const WARMUP_PROMPT: &str = "Dis OK.";

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("inference server unreachable: {0}")]
    Transport(String),
    #[error("inference server timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid reply from inference server: {0}")]
    Decode(String),
}

/// Outbound body: `{ model, messages, stream }`.
#[derive(Debug, Clone, Serialize)]
pub struct RelayRequest {
    #[serde(rename = "model")]
    pub target_model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(rename = "stream")]
    pub streaming: bool,
}

/// A non-success status is an answer, not an error: each endpoint decides
/// how to surface it.
#[derive(Debug)]
pub enum UpstreamReply {
    Accepted(UpstreamBody),
    Rejected { status: StatusCode, body: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WarmupOutcome {
    Ready,
    Rejected(StatusCode),
    Failed(String),
}

/// Response body still bound to the deadline of the call that opened it.
/// Dropping it closes the upstream connection.
#[derive(Debug)]
pub struct UpstreamBody {
    response: reqwest::Response,
    deadline: Instant,
    timeout: Duration,
}

impl UpstreamBody {
    /// Next raw chunk, `None` at end of body. Fails with `Timeout` as soon as
    /// the deadline passes, whatever the socket is doing.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, UpstreamError> {
        match timeout_at(self.deadline, self.response.chunk()).await {
            Ok(Ok(chunk)) => Ok(chunk),
            Ok(Err(e)) => Err(UpstreamError::Transport(describe(&e))),
            Err(_) => Err(UpstreamError::Timeout(self.timeout)),
        }
    }

    pub async fn text(mut self) -> Result<String, UpstreamError> {
        let mut decoder = Utf8Decoder::new();
        let mut text = String::new();
        while let Some(chunk) = self.next_chunk().await? {
            text.push_str(&decoder.decode(&chunk));
        }
        text.push_str(&decoder.finish());
        Ok(text)
    }

    /// Reads a non-streaming reply and returns `message.content`
    /// (empty when absent).
    pub async fn read_reply(self) -> Result<String, UpstreamError> {
        let text = self.text().await?;
        let value: Value =
            serde_json::from_str(&text).map_err(|e| UpstreamError::Decode(e.to_string()))?;
        Ok(value
            .pointer("/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }
}

pub struct UpstreamClient {
    http: Client,
    chat_url: String,
    model: String,
}

impl UpstreamClient {
    pub fn new(http: Client, chat_url: String, model: String) -> Self {
        info!("Initializing upstream client for {} with model {}", chat_url, model);
        Self {
            http,
            chat_url,
            model,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Single attempt, no retry. The deadline covers connecting, the
    /// response headers and every later body read.
    pub async fn send(
        &self,
        messages: Vec<ChatMessage>,
        streaming: bool,
        timeout: Duration,
    ) -> Result<UpstreamReply, UpstreamError> {
        let deadline = Instant::now() + timeout;
        let request = RelayRequest {
            target_model: self.model.clone(),
            messages,
            streaming,
        };
        debug!(
            messages = request.messages.len(),
            streaming, "sending chat request upstream"
        );

        let send = self.http.post(&self.chat_url).json(&request).send();
        let response = match timeout_at(deadline, send).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(UpstreamError::Transport(describe(&e))),
            Err(_) => return Err(UpstreamError::Timeout(timeout)),
        };

        let status = response.status();
        let body = UpstreamBody {
            response,
            deadline,
            timeout,
        };
        if !status.is_success() {
            let text = body.text().await.unwrap_or_default();
            return Ok(UpstreamReply::Rejected { status, body: text });
        }
        Ok(UpstreamReply::Accepted(body))
    }

    /// Best-effort request that makes the inference server load the model.
    /// Logged only; callers never see the outcome as an error.
    pub async fn warmup(&self, timeout: Duration) -> WarmupOutcome {
        info!("Warming up model {}", self.model);
        let outcome = match self
            .send(vec![ChatMessage::user(WARMUP_PROMPT)], false, timeout)
            .await
        {
            Ok(UpstreamReply::Accepted(body)) => match body.text().await {
                Ok(_) => WarmupOutcome::Ready,
                Err(e) => WarmupOutcome::Failed(e.to_string()),
            },
            Ok(UpstreamReply::Rejected { status, body }) => {
                warn!("Warmup rejected by inference server: {} {}", status, body);
                WarmupOutcome::Rejected(status)
            }
            Err(e) => WarmupOutcome::Failed(e.to_string()),
        };
        match &outcome {
            WarmupOutcome::Ready => info!("Warmup finished"),
            WarmupOutcome::Failed(reason) => warn!("Warmup failed: {}", reason),
            WarmupOutcome::Rejected(_) => {}
        }
        outcome
    }
}

/// reqwest's top-level message is generic; the cause chain says what broke.
fn describe(err: &reqwest::Error) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
