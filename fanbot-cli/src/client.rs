use anyhow::Result;
use fanbot_shared::{ChatReply, ClientChatRequest, HealthStatus, Utf8Decoder};
use futures::StreamExt;
use std::future::Future;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMode {
    Streaming,
    Whole,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    Delta(String),
    Finished,
    /// The relay answered with an error text.
    Failed(String),
    /// The relay could not be reached at all.
    Unreachable(String),
}

/// Every event carries the generation of the request that produced it, so
/// the UI can drop anything from a superseded request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedEvent {
    pub generation: u64,
    pub event: ChatEvent,
}

struct ActiveRequest {
    generation: u64,
    cancel: CancellationToken,
}

/// HTTP client for the relay. At most one request is consumed at a time:
/// starting a new one cancels the previous one.
pub struct RelayClient {
    http: reqwest::Client,
    base_url: String,
    events: mpsc::UnboundedSender<TaggedEvent>,
    generation: u64,
    active: Option<ActiveRequest>,
}

impl RelayClient {
    pub fn new(base_url: String) -> (Self, mpsc::UnboundedReceiver<TaggedEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let client = Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            events,
            generation: 0,
            active: None,
        };
        (client, events_rx)
    }

    /// Starts a request and returns its generation.
    pub fn send(&mut self, request: ClientChatRequest, mode: ReplyMode) -> u64 {
        self.cancel();
        self.generation += 1;
        let generation = self.generation;
        let cancel = CancellationToken::new();
        self.active = Some(ActiveRequest {
            generation,
            cancel: cancel.clone(),
        });

        let http = self.http.clone();
        let events = self.events.clone();
        let url = match mode {
            ReplyMode::Streaming => format!("{}/api/ai/chat/stream", self.base_url),
            ReplyMode::Whole => format!("{}/api/ai/chat", self.base_url),
        };
        info!("Sending request #{} to {}", generation, url);

        tokio::spawn(async move {
            let emit = |event| {
                let _ = events.send(TaggedEvent { generation, event });
            };
            let result = tokio::select! {
                // Dropping the request future closes the connection.
                _ = cancel.cancelled() => {
                    debug!("Request #{} cancelled", generation);
                    return;
                }
                result = exchange(&http, &url, &request, mode, &emit) => result,
            };
            match result {
                Ok(()) => emit(ChatEvent::Finished),
                Err(e) if e.is_connect() || e.is_timeout() => {
                    warn!("Relay unreachable: {}", e);
                    emit(ChatEvent::Unreachable(e.to_string()));
                }
                Err(e) => {
                    warn!("Request #{} failed: {}", generation, e);
                    emit(ChatEvent::Failed(e.to_string()));
                }
            }
        });

        generation
    }

    /// Cancels the open request, if any. Returns whether one was open.
    pub fn cancel(&mut self) -> bool {
        match self.active.take() {
            Some(active) => {
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| active.generation == generation)
    }

    /// Marks the request as done so later cancels are no-ops.
    pub fn complete(&mut self, generation: u64) {
        if self.is_current(generation) {
            self.active = None;
        }
    }

    /// A detached health query, suitable for handing to the status cache.
    pub fn fetch_health(&self) -> impl Future<Output = Result<HealthStatus>> + Send + 'static {
        let http = self.http.clone();
        let url = format!("{}/api/health", self.base_url);
        async move {
            let status = http
                .get(&url)
                .send()
                .await?
                .error_for_status()?
                .json::<HealthStatus>()
                .await?;
            Ok(status)
        }
    }
}

async fn exchange<F>(
    http: &reqwest::Client,
    url: &str,
    request: &ClientChatRequest,
    mode: ReplyMode,
    emit: &F,
) -> Result<(), reqwest::Error>
where
    F: Fn(ChatEvent),
{
    let response = http.post(url).json(request).send().await?;

    match mode {
        ReplyMode::Streaming => {
            // The relay's stream is raw text; a character may straddle two reads.
            let mut decoder = Utf8Decoder::new();
            let mut body = response.bytes_stream();
            while let Some(chunk) = body.next().await {
                let text = decoder.decode(&chunk?);
                if !text.is_empty() {
                    emit(ChatEvent::Delta(text));
                }
            }
            let tail = decoder.finish();
            if !tail.is_empty() {
                emit(ChatEvent::Delta(tail));
            }
        }
        ReplyMode::Whole => {
            let ok = response.status().is_success();
            let reply = response.json::<ChatReply>().await?;
            if ok {
                emit(ChatEvent::Delta(reply.reply));
            } else {
                emit(ChatEvent::Failed(reply.reply));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, routing::post, Json, Router};
    use std::convert::Infallible;
    use std::time::Duration;

    async fn stub_stream(Json(request): Json<ClientChatRequest>) -> Body {
        let first = request.message.unwrap_or_default();
        let text = futures::stream::once(async move { Ok::<_, Infallible>(first) });
        if request.context.as_deref() == Some("hang") {
            Body::from_stream(text.chain(futures::stream::pending()))
        } else {
            Body::from_stream(text)
        }
    }

    async fn spawn_relay() -> String {
        let router = Router::new().route("/api/ai/chat/stream", post(stub_stream));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn request(message: &str, context: Option<&str>) -> ClientChatRequest {
        ClientChatRequest {
            message: Some(message.to_string()),
            context: context.map(str::to_string),
            messages: None,
        }
    }

    #[tokio::test]
    async fn newer_request_supersedes_open_stream() {
        let (mut client, mut events) = RelayClient::new(spawn_relay().await);

        let first = client.send(request("first", Some("hang")), ReplyMode::Streaming);
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            TaggedEvent {
                generation: first,
                event: ChatEvent::Delta("first".into()),
            }
        );

        let second = client.send(request("second", None), ReplyMode::Streaming);
        assert!(!client.is_current(first));
        assert!(client.is_current(second));

        let mut seen = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            let done = event.generation == second && event.event == ChatEvent::Finished;
            seen.push(event);
            if done {
                break;
            }
        }

        assert!(seen.iter().all(|e| e.generation == second), "{seen:?}");
        assert_eq!(seen[0].event, ChatEvent::Delta("second".into()));
    }

    #[tokio::test]
    async fn cancel_stops_delivery() {
        let (mut client, mut events) = RelayClient::new(spawn_relay().await);

        let generation = client.send(request("partial", Some("hang")), ReplyMode::Streaming);
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.generation, generation);

        assert!(client.cancel());
        assert!(!client.cancel());
        assert!(!client.is_current(generation));

        // Nothing else arrives for a cancelled request.
        let next = tokio::time::timeout(Duration::from_millis(200), events.recv()).await;
        assert!(next.is_err(), "unexpected event: {next:?}");
    }

    #[tokio::test]
    async fn unreachable_relay_is_reported() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (mut client, mut events) = RelayClient::new(format!("http://{addr}"));
        let generation = client.send(request("hi", None), ReplyMode::Whole);
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.generation, generation);
        assert!(matches!(event.event, ChatEvent::Unreachable(_)), "{event:?}");
    }
}
