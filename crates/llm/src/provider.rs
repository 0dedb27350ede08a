use std::future::Future;
use std::pin::Pin;

use futures::{Stream, StreamExt};
use snafu::Snafu;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::model::Model;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub api_key: String,
    pub endpoint: String,
}

impl ProviderConfig {
    pub fn new(
        provider_id: impl Into<String>,
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
            endpoint: endpoint.into().trim().to_string(),
        }
    }
}

/// Speaker role as understood by the backend wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    System,
    User,
    Assistant,
    Function,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Function => "function",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderMessage {
    pub role: Role,
    pub content: String,
    pub name: Option<String>,
}

impl ProviderMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
        }
    }

    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.name = name;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub model_id: String,
    pub messages: Vec<ProviderMessage>,
}

impl StreamRequest {
    pub fn new(model_id: impl Into<String>, messages: Vec<ProviderMessage>) -> Self {
        Self {
            model_id: model_id.into(),
            messages,
        }
    }
}

/// Event pushed from a provider worker to the stream consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Delta(String),
    Done,
    Error(String),
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ProviderWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ProviderError {
    #[snafu(display("provider '{provider_id}' is not supported"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("stream request for model '{model_id}' has no messages"))]
    EmptyMessageSet {
        stage: &'static str,
        model_id: String,
    },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("failed to finalize HTTP request body: {message}"))]
    BuildHttpRequestBody {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("provider model endpoint returned status {status}: {body}"))]
    ModelFetchStatus {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("failed to parse provider model list: {details}"))]
    ModelPayloadParse {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
    #[snafu(display("model '{model_id}' returned no text"))]
    EmptyCompletion {
        stage: &'static str,
        model_id: String,
    },
    #[snafu(display("backend failed on `{stage}`: {message}"))]
    Backend {
        stage: &'static str,
        message: String,
    },
}

/// Consumer half of a provider stream.
///
/// Dropping it cancels the token handed to the worker.
pub struct ProviderEventStream {
    events: mpsc::UnboundedReceiver<StreamEvent>,
    cancel: CancellationToken,
}

pub struct ProviderStreamHandle {
    pub stream: ProviderEventStream,
    pub worker: ProviderWorker,
}

impl ProviderEventStream {
    pub(crate) fn new(
        events: mpsc::UnboundedReceiver<StreamEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self { events, cancel }
    }

    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }
}

impl Drop for ProviderEventStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub trait LlmProvider: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn default_model(&self) -> &str;
    fn fallback_models(&self) -> &[Model];
    /// Lists the models the backend serves right now.
    fn fetch_models<'a>(&'a self) -> BoxFuture<'a, ProviderResult<Vec<Model>>>;
    /// Single-shot, non-streaming completion of one prompt.
    fn generate_once<'a>(
        &'a self,
        model_id: &'a str,
        prompt: &'a str,
    ) -> BoxFuture<'a, ProviderResult<String>>;
    /// Opens a stream; the returned worker must be polled (usually spawned) to make progress.
    fn stream_chat(
        &self,
        request: StreamRequest,
        cancel: CancellationToken,
    ) -> ProviderResult<ProviderStreamHandle>;
}

pub fn make_event_stream(
    cancel: CancellationToken,
) -> (mpsc::UnboundedSender<StreamEvent>, ProviderEventStream) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    (event_tx, ProviderEventStream::new(event_rx, cancel))
}

pub fn emit_error_event(event_tx: &mpsc::UnboundedSender<StreamEvent>, error: ProviderError) {
    let _ = event_tx.send(StreamEvent::Error(error.to_string()));
}

/// Forwards backend fragments into the event channel.
///
/// The token is checked once per fragment boundary, before each send. A cancelled
/// stream ends without a terminal event; the consumer owns the cancelled outcome.
pub async fn pump_fragments<S>(
    fragments: S,
    event_tx: mpsc::UnboundedSender<StreamEvent>,
    cancel: CancellationToken,
) where
    S: Stream<Item = ProviderResult<String>>,
{
    let mut fragments = std::pin::pin!(fragments);
    let mut forwarded = 0usize;

    while let Some(item) = fragments.next().await {
        if cancel.is_cancelled() {
            tracing::debug!(forwarded, "provider stream cancelled at fragment boundary");
            return;
        }

        match item {
            Ok(text) => {
                if text.is_empty() {
                    continue;
                }
                if event_tx.send(StreamEvent::Delta(text)).is_err() {
                    return;
                }
                forwarded += 1;
            }
            Err(error) => {
                tracing::warn!(forwarded, error = %error, "provider stream emitted an error chunk");
                emit_error_event(&event_tx, error);
                return;
            }
        }
    }

    if !cancel.is_cancelled() {
        let _ = event_tx.send(StreamEvent::Done);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragments(items: &[&str]) -> Vec<ProviderResult<String>> {
        items.iter().map(|item| Ok((*item).to_string())).collect()
    }

    #[tokio::test]
    async fn pump_forwards_fragments_in_order_then_done() {
        let cancel = CancellationToken::new();
        let (event_tx, mut stream) = make_event_stream(cancel.clone());

        pump_fragments(
            futures::stream::iter(fragments(&["Hel", "", "lo"])),
            event_tx,
            cancel,
        )
        .await;

        assert_eq!(stream.recv().await, Some(StreamEvent::Delta("Hel".into())));
        assert_eq!(stream.recv().await, Some(StreamEvent::Delta("lo".into())));
        assert_eq!(stream.recv().await, Some(StreamEvent::Done));
        assert_eq!(stream.recv().await, None);
    }

    #[tokio::test]
    async fn pump_stops_without_terminal_event_when_cancelled() {
        let cancel = CancellationToken::new();
        let (event_tx, mut stream) = make_event_stream(cancel.clone());
        cancel.cancel();

        pump_fragments(
            futures::stream::iter(fragments(&["a", "b"])),
            event_tx,
            cancel,
        )
        .await;

        assert_eq!(stream.recv().await, None);
    }

    #[tokio::test]
    async fn pump_maps_backend_errors_to_a_terminal_error_event() {
        let cancel = CancellationToken::new();
        let (event_tx, mut stream) = make_event_stream(cancel.clone());
        let items = vec![
            Ok("partial".to_string()),
            Err(ProviderError::Backend {
                stage: "test",
                message: "connection reset".to_string(),
            }),
            Ok("never".to_string()),
        ];

        pump_fragments(futures::stream::iter(items), event_tx, cancel).await;

        assert_eq!(
            stream.recv().await,
            Some(StreamEvent::Delta("partial".into()))
        );
        match stream.recv().await {
            Some(StreamEvent::Error(message)) => assert!(message.contains("connection reset")),
            other => panic!("expected error event, got {other:?}"),
        }
        assert_eq!(stream.recv().await, None);
    }

    #[test]
    fn dropping_the_consumer_cancels_the_worker_token() {
        let cancel = CancellationToken::new();
        let (_event_tx, stream) = make_event_stream(cancel.clone());
        assert!(!cancel.is_cancelled());

        drop(stream);
        assert!(cancel.is_cancelled());
    }
}
