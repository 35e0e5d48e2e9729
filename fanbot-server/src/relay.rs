//! Drives an upstream streaming call through the frame decoder and forwards
//! each text increment to the downstream response as soon as it is decoded.

use crate::decoder::FrameDecoder;
use crate::upstream::{UpstreamClient, UpstreamError, UpstreamReply};
use axum::body::Body;
use bytes::Bytes;
use fanbot_shared::ChatMessage;
use futures_util::stream;
use reqwest::StatusCode;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

/// One increment in flight at a time: upstream is not read while the
/// client has not taken the previous one.
const DOWNSTREAM_CAPACITY: usize = 1;

/// Extra time granted to write the closing diagnostic once the deadline has
/// already passed.
const DIAGNOSTIC_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// A `done` record was seen.
    Completed,
    /// Upstream closed the body without a `done` record.
    EndOfStream,
    Rejected(StatusCode),
    Failed(String),
    ClientGone,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayReport {
    pub outcome: RelayOutcome,
    pub increments: usize,
    pub dropped_records: usize,
}

/// Starts the session on its own task and hands back the body to return to
/// the client. The body ends when the session does.
pub fn spawn_relay(
    upstream: Arc<UpstreamClient>,
    messages: Vec<ChatMessage>,
    timeout: Duration,
) -> Body {
    let (tx, rx) = mpsc::channel::<Bytes>(DOWNSTREAM_CAPACITY);

    tokio::spawn(async move {
        let report = relay(&upstream, messages, timeout, &tx).await;
        match &report.outcome {
            RelayOutcome::Completed | RelayOutcome::EndOfStream => info!(
                outcome = ?report.outcome,
                increments = report.increments,
                dropped_records = report.dropped_records,
                "stream session finished"
            ),
            RelayOutcome::Rejected(status) => {
                warn!(%status, "stream session ended: inference server rejected the request")
            }
            RelayOutcome::Failed(reason) => error!(
                increments = report.increments,
                "stream session failed: {}", reason
            ),
            RelayOutcome::ClientGone => debug!(
                increments = report.increments,
                "stream session ended: client disconnected"
            ),
        }
    });

    let increments = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|bytes| (Ok::<_, Infallible>(bytes), rx))
    });
    Body::from_stream(increments)
}

/// Runs one streaming session to completion, writing increments to
/// `downstream`. Never returns before the session is over, and never leaves
/// the upstream connection open.
pub async fn relay(
    upstream: &UpstreamClient,
    messages: Vec<ChatMessage>,
    timeout: Duration,
    downstream: &mpsc::Sender<Bytes>,
) -> RelayReport {
    let mut session = RelaySession {
        downstream,
        decoder: FrameDecoder::new(),
        increments: 0,
        deadline: Instant::now() + timeout,
        timeout,
    };
    let outcome = session.run(upstream, messages, timeout).await;
    if session.decoder.residual_len() > 0 {
        debug!(
            residual = session.decoder.residual_len(),
            "discarding unterminated upstream data"
        );
    }
    RelayReport {
        outcome,
        increments: session.increments,
        dropped_records: session.decoder.dropped(),
    }
}

struct RelaySession<'a> {
    downstream: &'a mpsc::Sender<Bytes>,
    decoder: FrameDecoder,
    increments: usize,
    /// Bounds downstream writes too: a client that stops reading cannot keep
    /// the session open past the call's deadline.
    deadline: Instant,
    timeout: Duration,
}

enum WriteError {
    ClientGone,
    Stalled,
}

impl RelaySession<'_> {
    async fn run(
        &mut self,
        upstream: &UpstreamClient,
        messages: Vec<ChatMessage>,
        timeout: Duration,
    ) -> RelayOutcome {
        let reply = tokio::select! {
            _ = self.downstream.closed() => return RelayOutcome::ClientGone,
            reply = upstream.send(messages, true, timeout) => reply,
        };

        let mut body = match reply {
            Ok(UpstreamReply::Accepted(body)) => body,
            Ok(UpstreamReply::Rejected { status, body }) => {
                let text = if body.trim().is_empty() {
                    format!("Upstream error (HTTP {})", status.as_u16())
                } else {
                    body
                };
                if let Err(e) = self.write(text).await {
                    return self.write_failed(e);
                }
                return RelayOutcome::Rejected(status);
            }
            Err(e) => return self.fail(e).await,
        };

        loop {
            let chunk = tokio::select! {
                _ = self.downstream.closed() => return RelayOutcome::ClientGone,
                chunk = body.next_chunk() => chunk,
            };
            let chunk = match chunk {
                Ok(Some(chunk)) => chunk,
                Ok(None) => return RelayOutcome::EndOfStream,
                Err(e) => return self.fail(e).await,
            };

            for frame in self.decoder.feed(&chunk) {
                if !frame.delta.is_empty() {
                    if let Err(e) = self.write(frame.delta).await {
                        // Dropping `body` here closes the upstream connection.
                        return self.write_failed(e);
                    }
                    self.increments += 1;
                }
                if frame.done {
                    // Whatever upstream still has queued is dropped with `body`.
                    return RelayOutcome::Completed;
                }
            }
        }
    }

    async fn write(&self, text: String) -> Result<(), WriteError> {
        self.write_until(text, self.deadline).await
    }

    async fn write_until(&self, text: String, deadline: Instant) -> Result<(), WriteError> {
        match timeout_at(deadline, self.downstream.send(Bytes::from(text))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(WriteError::ClientGone),
            Err(_) => Err(WriteError::Stalled),
        }
    }

    fn write_failed(&self, err: WriteError) -> RelayOutcome {
        match err {
            WriteError::ClientGone => RelayOutcome::ClientGone,
            WriteError::Stalled => RelayOutcome::Failed(format!(
                "client stopped reading; timed out after {:?}",
                self.timeout
            )),
        }
    }

    async fn fail(&self, err: UpstreamError) -> RelayOutcome {
        let separator = if self.increments > 0 { "\n" } else { "" };
        let deadline = self.deadline.max(Instant::now()) + DIAGNOSTIC_GRACE;
        // The client may already be gone or stalled; nothing more to do then.
        let _ = self
            .write_until(format!("{separator}Server error: {err}"), deadline)
            .await;
        RelayOutcome::Failed(err.to_string())
    }
}
