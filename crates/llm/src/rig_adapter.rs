use futures::StreamExt;
use rig::completion::{AssistantContent, CompletionModel, Message as RigMessage};
use rig::http_client::{self, HttpClientExt, NoBody};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use serde_json::Value;
use snafu::{ResultExt, ensure};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::model::{DEFAULT_MODEL, Model, default_local_models};
use super::provider::{
    BoxFuture, CompletionsFailedSnafu, EmptyCompletionSnafu, EmptyMessageSetSnafu,
    HttpClientSnafu, LlmProvider, ModelFetchStatusSnafu, ModelPayloadParseSnafu, ProviderConfig,
    ProviderError, ProviderMessage, ProviderResult, ProviderStreamHandle, ProviderWorker, Role,
    StreamEvent, StreamRequest, emit_error_event, make_event_stream, pump_fragments,
};

pub const RIG_OPENAI_PROVIDER_ID: &str = "openai";
pub const OLLAMA_PROVIDER_ID: &str = "ollama";

/// Local OpenAI-compatible servers ignore the key but the client requires one.
const PLACEHOLDER_API_KEY: &str = "ollama";

type RigStreamingResponse = rig::streaming::StreamingCompletionResponse<
    rig::providers::openai::responses_api::streaming::StreamingCompletionResponse,
>;

pub struct RigProviderAdapter {
    config: ProviderConfig,
    fallback_models: Vec<Model>,
}

impl RigProviderAdapter {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            fallback_models: default_local_models(),
        }
    }

    fn build_client(config: &ProviderConfig) -> ProviderResult<openai::Client> {
        let api_key = if config.api_key.is_empty() {
            PLACEHOLDER_API_KEY
        } else {
            config.api_key.as_str()
        };

        let mut builder = openai::Client::builder().api_key(api_key);
        if !config.endpoint.is_empty() {
            builder = builder.base_url(config.endpoint.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    async fn fetch_models_from_provider(&self) -> ProviderResult<Vec<Model>> {
        let client = Self::build_client(&self.config)?;
        let request = client
            .get("/models")
            .context(HttpClientSnafu {
                stage: "build-model-request",
            })?
            .body(NoBody)
            .map_err(|source| ProviderError::BuildHttpRequestBody {
                stage: "build-model-request-body",
                message: source.to_string(),
            })?;

        let response = client.send(request).await.context(HttpClientSnafu {
            stage: "send-model-request",
        })?;
        let status = response.status();
        let payload = http_client::text(response).await.context(HttpClientSnafu {
            stage: "read-model-response",
        })?;

        if !status.is_success() {
            return ModelFetchStatusSnafu {
                stage: "model-http-status",
                status: status.as_u16(),
                body: payload,
            }
            .fail();
        }

        let model_ids = extract_model_ids(&payload)?;
        if model_ids.is_empty() {
            return ModelPayloadParseSnafu {
                stage: "parse-model-response",
                details: "no model identifiers found in provider response".to_string(),
            }
            .fail();
        }

        Ok(model_ids.into_iter().map(Model::from_id).collect())
    }

    fn to_rig_message(message: &ProviderMessage) -> Option<RigMessage> {
        match message.role {
            Role::System => None,
            Role::User => Some(RigMessage::user(message.content.clone())),
            Role::Assistant => Some(RigMessage::assistant(message.content.clone())),
            // The chat endpoint has no function role outside tool calls; send as a labelled user turn.
            Role::Function => {
                let label = message.name.as_deref().unwrap_or(Role::Function.as_str());
                Some(RigMessage::user(format!("{label}: {}", message.content)))
            }
        }
    }

    /// Rig exposes a single preamble field, so system-role messages are folded into it.
    fn merged_preamble(request: &StreamRequest) -> Option<String> {
        let preamble_parts = request
            .messages
            .iter()
            .filter(|message| matches!(message.role, Role::System))
            .map(|message| message.content.trim())
            .filter(|content| !content.is_empty())
            .collect::<Vec<_>>();

        if preamble_parts.is_empty() {
            None
        } else {
            Some(preamble_parts.join("\n\n"))
        }
    }

    async fn open_stream(
        config: &ProviderConfig,
        request: &StreamRequest,
    ) -> ProviderResult<RigStreamingResponse> {
        let client = Self::build_client(config)?;
        let model = client.completion_model(request.model_id.clone());

        let mut messages = request
            .messages
            .iter()
            .filter_map(Self::to_rig_message)
            .collect::<Vec<_>>();

        let Some(prompt) = messages.pop() else {
            tracing::warn!(
                model_id = %request.model_id,
                total_message_count = request.messages.len(),
                "cannot open stream because no user/assistant messages remain after filtering"
            );
            return EmptyMessageSetSnafu {
                stage: "open-stream-filter-messages",
                model_id: request.model_id.clone(),
            }
            .fail();
        };
        let mut builder = model.completion_request(prompt).messages(messages);

        if let Some(preamble) = Self::merged_preamble(request) {
            builder = builder.preamble(preamble);
        }

        builder.stream().await.context(CompletionsFailedSnafu {
            stage: "open-stream",
        })
    }

    fn map_stream_item<R>(item: StreamedAssistantContent<R>) -> Option<String>
    where
        R: Clone + Unpin,
    {
        match item {
            StreamedAssistantContent::Text(text) => Some(text.text),
            // Reasoning traces are not part of the assistant turn.
            StreamedAssistantContent::Reasoning(_)
            | StreamedAssistantContent::ReasoningDelta { .. }
            | StreamedAssistantContent::ToolCall { .. }
            | StreamedAssistantContent::ToolCallDelta { .. }
            | StreamedAssistantContent::Final(_) => None,
        }
    }

    async fn run_stream_worker(
        config: ProviderConfig,
        request: StreamRequest,
        event_tx: mpsc::UnboundedSender<StreamEvent>,
        cancel: CancellationToken,
    ) {
        let stream = match Self::open_stream(&config, &request).await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!(
                    provider_id = %config.provider_id,
                    model_id = %request.model_id,
                    error = %error,
                    "failed to open provider stream"
                );
                emit_error_event(&event_tx, error);
                return;
            }
        };

        let fragments = stream.filter_map(|item| {
            futures::future::ready(match item {
                Ok(content) => Self::map_stream_item(content).map(Ok),
                Err(source) => Some(Err(ProviderError::CompletionsFailed {
                    stage: "stream-chunk",
                    source,
                })),
            })
        });

        pump_fragments(fragments, event_tx, cancel).await;
    }
}

/// Accepts both the OpenAI `/models` shape and Ollama's native tag listing.
fn extract_model_ids(payload: &str) -> ProviderResult<Vec<String>> {
    let value: Value =
        serde_json::from_str(payload).map_err(|source| ProviderError::ModelPayloadParse {
            stage: "parse-model-json",
            details: source.to_string(),
        })?;

    let mut ids = value
        .get("data")
        .or_else(|| value.get("models"))
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| {
                    entry
                        .get("id")
                        .or_else(|| entry.get("name"))
                        .and_then(Value::as_str)
                })
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(ToString::to_string)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    ids.sort();
    ids.dedup();
    Ok(ids)
}

impl LlmProvider for RigProviderAdapter {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn name(&self) -> &str {
        "OpenAI-compatible (rig)"
    }

    fn default_model(&self) -> &str {
        DEFAULT_MODEL
    }

    fn fallback_models(&self) -> &[Model] {
        &self.fallback_models
    }

    fn fetch_models<'a>(&'a self) -> BoxFuture<'a, ProviderResult<Vec<Model>>> {
        Box::pin(async move {
            let models = self.fetch_models_from_provider().await;
            match &models {
                Ok(models) => tracing::debug!(
                    provider_id = %self.id(),
                    model_count = models.len(),
                    "listed provider models"
                ),
                Err(error) => tracing::warn!(
                    provider_id = %self.id(),
                    error = %error,
                    "failed to list provider models"
                ),
            }
            models
        })
    }

    fn generate_once<'a>(
        &'a self,
        model_id: &'a str,
        prompt: &'a str,
    ) -> BoxFuture<'a, ProviderResult<String>> {
        Box::pin(async move {
            let client = Self::build_client(&self.config)?;
            let model = client.completion_model(model_id.to_string());
            let response = model
                .completion_request(RigMessage::user(prompt.to_string()))
                .send()
                .await
                .context(CompletionsFailedSnafu {
                    stage: "generate-once",
                })?;

            let text = response
                .choice
                .iter()
                .filter_map(|content| match content {
                    AssistantContent::Text(text) => Some(text.text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("");

            ensure!(
                !text.trim().is_empty(),
                EmptyCompletionSnafu {
                    stage: "generate-once-text",
                    model_id: model_id.to_string(),
                }
            );

            Ok(text)
        })
    }

    fn stream_chat(
        &self,
        request: StreamRequest,
        cancel: CancellationToken,
    ) -> ProviderResult<ProviderStreamHandle> {
        ensure!(
            !request.messages.is_empty(),
            EmptyMessageSetSnafu {
                stage: "stream-chat",
                model_id: request.model_id.clone(),
            }
        );

        let (event_tx, stream) = make_event_stream(cancel.clone());
        let worker: ProviderWorker = Box::pin(Self::run_stream_worker(
            self.config.clone(),
            request,
            event_tx,
            cancel,
        ));

        Ok(ProviderStreamHandle { stream, worker })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_ids_are_read_from_openai_and_ollama_payloads() {
        let openai = r#"{"object":"list","data":[{"id":"mistral"},{"id":"llama2"},{"id":"llama2"}]}"#;
        let ollama = r#"{"models":[{"name":"qwen2.5:7b","model":"qwen2.5:7b"},{"name":" "}]}"#;

        assert_eq!(
            extract_model_ids(openai).unwrap_or_default(),
            vec!["llama2".to_string(), "mistral".to_string()]
        );
        assert_eq!(
            extract_model_ids(ollama).unwrap_or_default(),
            vec!["qwen2.5:7b".to_string()]
        );
        assert!(extract_model_ids("not json").is_err());
    }

    #[test]
    fn system_messages_fold_into_the_preamble() {
        let request = StreamRequest::new(
            "llama2",
            vec![
                ProviderMessage::new(Role::System, "You are Kosmos."),
                ProviderMessage::new(Role::User, "hi"),
                ProviderMessage::new(Role::System, " Be brief. "),
                ProviderMessage::new(Role::System, "  "),
            ],
        );

        assert_eq!(
            RigProviderAdapter::merged_preamble(&request).as_deref(),
            Some("You are Kosmos.\n\nBe brief.")
        );
        assert!(RigProviderAdapter::to_rig_message(&request.messages[0]).is_none());
        assert!(RigProviderAdapter::to_rig_message(&request.messages[1]).is_some());
        assert_eq!(
            RigProviderAdapter::merged_preamble(&StreamRequest::new("llama2", Vec::new())),
            None
        );
    }

    #[test]
    fn empty_requests_are_rejected_before_a_worker_exists() {
        let adapter =
            RigProviderAdapter::new(ProviderConfig::new("ollama", "", "http://localhost:11434/v1"));
        let result = adapter.stream_chat(
            StreamRequest::new("llama2", Vec::new()),
            CancellationToken::new(),
        );

        assert!(matches!(
            result,
            Err(ProviderError::EmptyMessageSet { .. })
        ));
    }
}
