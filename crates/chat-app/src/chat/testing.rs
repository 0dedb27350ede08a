use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use kosmos_llm::{
    BoxFuture, CancellationToken, LlmProvider, Model, ProviderError, ProviderResult,
    ProviderStreamHandle, StreamRequest, make_event_stream, pump_fragments,
};

#[derive(Debug, Clone)]
pub(crate) enum ScriptStep {
    Text(&'static str),
    Fail(&'static str),
}

/// In-process backend that replays a fixed script.
pub(crate) struct ScriptedProvider {
    steps: Vec<ScriptStep>,
    open_error: Option<&'static str>,
    reply: Result<String, String>,
    models: Vec<Model>,
    models_offline: bool,
    model_fetches: AtomicUsize,
    pub(crate) requests: Mutex<Vec<StreamRequest>>,
    pub(crate) prompts: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub(crate) fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps,
            open_error: None,
            reply: Err("no reply scripted".to_string()),
            models: vec![Model::from_id("llama2")],
            models_offline: false,
            model_fetches: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn texts(fragments: &[&'static str]) -> Self {
        Self::new(fragments.iter().copied().map(ScriptStep::Text).collect())
    }

    pub(crate) fn failing_to_open(message: &'static str) -> Self {
        let mut provider = Self::new(Vec::new());
        provider.open_error = Some(message);
        provider
    }

    pub(crate) fn with_reply(mut self, reply: Result<&str, &str>) -> Self {
        self.reply = reply.map(str::to_string).map_err(str::to_string);
        self
    }

    pub(crate) fn with_models_offline(mut self) -> Self {
        self.models_offline = true;
        self
    }

    pub(crate) fn model_fetches(&self) -> usize {
        self.model_fetches.load(Ordering::SeqCst)
    }

    pub(crate) fn last_request(&self) -> Option<StreamRequest> {
        self.requests.lock().ok()?.last().cloned()
    }

    pub(crate) fn last_prompt(&self) -> Option<String> {
        self.prompts.lock().ok()?.last().cloned()
    }
}

impl LlmProvider for ScriptedProvider {
    fn id(&self) -> &str {
        "scripted"
    }

    fn name(&self) -> &str {
        "Scripted"
    }

    fn default_model(&self) -> &str {
        "llama2"
    }

    fn fallback_models(&self) -> &[Model] {
        &self.models
    }

    fn fetch_models<'a>(&'a self) -> BoxFuture<'a, ProviderResult<Vec<Model>>> {
        Box::pin(async move {
            self.model_fetches.fetch_add(1, Ordering::SeqCst);
            if self.models_offline {
                return Err(ProviderError::Backend {
                    stage: "scripted-fetch-models",
                    message: "backend offline".to_string(),
                });
            }
            Ok(vec![Model::from_id("llama2"), Model::from_id("mistral")])
        })
    }

    fn generate_once<'a>(
        &'a self,
        _model_id: &'a str,
        prompt: &'a str,
    ) -> BoxFuture<'a, ProviderResult<String>> {
        Box::pin(async move {
            if let Ok(mut prompts) = self.prompts.lock() {
                prompts.push(prompt.to_string());
            }
            self.reply.clone().map_err(|message| ProviderError::Backend {
                stage: "scripted-generate-once",
                message,
            })
        })
    }

    fn stream_chat(
        &self,
        request: StreamRequest,
        cancel: CancellationToken,
    ) -> ProviderResult<ProviderStreamHandle> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        if let Some(message) = self.open_error {
            return Err(ProviderError::Backend {
                stage: "scripted-open-stream",
                message: message.to_string(),
            });
        }

        let items = self
            .steps
            .iter()
            .map(|step| match step {
                ScriptStep::Text(text) => Ok((*text).to_string()),
                ScriptStep::Fail(message) => Err(ProviderError::Backend {
                    stage: "scripted-stream",
                    message: (*message).to_string(),
                }),
            })
            .collect::<Vec<_>>();

        let (event_tx, stream) = make_event_stream(cancel.clone());
        let worker = Box::pin(async move {
            pump_fragments(futures::stream::iter(items), event_tx, cancel).await;
        });
        Ok(ProviderStreamHandle { stream, worker })
    }
}
