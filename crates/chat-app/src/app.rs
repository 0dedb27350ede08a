use std::sync::Arc;

use chrono::{DateTime, Utc};
use kosmos_llm::{LlmProvider, Model, ModelCatalog, ProviderError, create_provider};
use kosmos_storage::{JsonFileStore, KeyValueStore};
use snafu::OptionExt;
use tokio::sync::mpsc;

use crate::chat::{
    Chat, ChatId, ChatResult, ChatType, GenerationController, GenerationEvent, GenerationReport,
    GenerationRun, GenerationState, Message, SessionManager, TITLE_HISTORY_LINES, enhance_prompt,
    generate_title,
};
use crate::chat::{ChatNotFoundSnafu, NoActiveChatSnafu};
use crate::database::PersistenceGateway;
use crate::settings::AppSettings;

/// Sidebar row for one chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSummary {
    pub id: ChatId,
    pub chat_type: ChatType,
    pub title: String,
    pub model_name: String,
    pub last_message_at: DateTime<Utc>,
    pub message_count: usize,
}

impl From<&Chat> for ChatSummary {
    fn from(chat: &Chat) -> Self {
        Self {
            id: chat.id,
            chat_type: chat.chat_type,
            title: chat.title.clone(),
            model_name: chat.model_name.clone(),
            last_message_at: chat.last_message_at,
            message_count: chat.messages.len(),
        }
    }
}

/// UI-facing entry point. Every call that changes a chat flushes the store before it returns.
pub struct ChatApp<S> {
    sessions: SessionManager,
    generation: GenerationController,
    gateway: PersistenceGateway<S>,
    user_name: Option<String>,
    models: Option<Vec<Model>>,
}

impl ChatApp<JsonFileStore> {
    /// Wires the configured backend to the JSON store under the data directory.
    pub fn from_settings(settings: &AppSettings) -> Result<Self, ProviderError> {
        let provider = create_provider(settings.provider_config())?;
        let store = JsonFileStore::new(settings.store_path());
        tracing::info!(
            provider_id = provider.id(),
            store = %store.path().display(),
            "opening chat store"
        );
        Ok(Self::new(provider, store, settings))
    }
}

impl<S: KeyValueStore> ChatApp<S> {
    /// Hydrates the sessions from `store`; nothing is selected afterwards.
    pub fn new(provider: Arc<dyn LlmProvider>, store: S, settings: &AppSettings) -> Self {
        let gateway = PersistenceGateway::new(store);
        let sessions = SessionManager::new(gateway.load(), settings.default_model.clone());

        Self {
            sessions,
            generation: GenerationController::new(provider),
            gateway,
            user_name: settings.user_name.clone(),
            models: None,
        }
    }

    /// Picks up the runtime-editable settings: the user label and the default model.
    pub fn apply_settings(&mut self, settings: &AppSettings) {
        self.user_name = settings.user_name.clone();
        self.sessions.set_default_model(settings.default_model.clone());
        tracing::info!(
            default_model = %settings.default_model,
            user_name = ?settings.user_name,
            "settings applied"
        );
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn gateway(&self) -> &PersistenceGateway<S> {
        &self.gateway
    }

    fn flush(&self) -> bool {
        self.gateway.save(self.sessions.sessions())
    }

    pub fn new_chat(&mut self, chat_type: &str, model_name: Option<&str>) -> Chat {
        let chat = self
            .sessions
            .create_chat(ChatType::parse(chat_type), model_name)
            .clone();
        self.flush();
        chat
    }

    /// Most recently active first.
    pub fn chat_summaries(&self) -> Vec<ChatSummary> {
        sorted_summaries(self.sessions.get_all_chats())
    }

    pub fn search(&self, query: &str) -> Vec<ChatSummary> {
        sorted_summaries(self.sessions.search_chats(query))
    }

    /// Opens a chat: looks it up and selects it.
    pub fn get_chat(&mut self, chat_id: ChatId) -> Option<&Chat> {
        self.sessions.get_chat(chat_id)
    }

    pub fn peek_chat(&self, chat_id: ChatId) -> Option<&Chat> {
        self.sessions.peek_chat(chat_id)
    }

    pub fn current_chat(&self) -> Option<&Chat> {
        self.sessions.current_chat()
    }

    pub fn switch_chat(&mut self, chat_id: ChatId) -> ChatResult<()> {
        self.sessions.switch_chat(chat_id)
    }

    pub fn clear_current_chat(&mut self) {
        self.sessions.clear_current_chat();
    }

    pub fn delete_chat(&mut self, chat_id: ChatId) -> bool {
        let removed = self.sessions.delete_chat(chat_id).is_some();
        if removed {
            self.flush();
        }
        removed
    }

    /// Removes a message from the current chat; negative indices count from the end.
    pub fn remove_message(&mut self, index: isize) -> ChatResult<Message> {
        let chat = self.sessions.current_chat_mut().context(NoActiveChatSnafu {
            stage: "remove-message",
        })?;
        let removed = chat.remove_at(index)?;
        self.flush();
        Ok(removed)
    }

    /// Messages of the current chat, empty when nothing is selected.
    pub fn history(&self) -> &[Message] {
        self.sessions
            .current_chat()
            .map(|chat| chat.messages.as_slice())
            .unwrap_or_default()
    }

    pub fn generation_state(&self) -> &GenerationState {
        self.generation.state()
    }

    /// Settles a run that was dropped without [`finish_generation`](Self::finish_generation).
    pub fn reclaim_abandoned_generation(&mut self) -> Option<GenerationReport> {
        let report = self.generation.reclaim_abandoned(&mut self.sessions)?;
        if report.committed {
            self.flush();
        }
        Some(report)
    }

    pub fn start_generation(
        &mut self,
        prompt: &str,
        add_to_history: bool,
    ) -> ChatResult<GenerationRun> {
        self.reclaim_abandoned_generation();
        let run = self.generation.start(
            &mut self.sessions,
            prompt,
            add_to_history,
            self.user_name.as_deref(),
        )?;
        if add_to_history {
            self.flush();
        }
        Ok(run)
    }

    pub fn finish_generation(&mut self, run: GenerationRun) -> ChatResult<GenerationReport> {
        let report = self.generation.finish(&mut self.sessions, run)?;
        if report.committed {
            self.flush();
        }
        Ok(report)
    }

    /// Streams a reply into `sink`: one `Fragment` per delivered piece, then `Complete`.
    ///
    /// A committed reply also refreshes the chat title before `Complete` is sent.
    pub async fn generate(
        &mut self,
        prompt: &str,
        add_to_history: bool,
        sink: &mpsc::UnboundedSender<GenerationEvent>,
    ) -> ChatResult<GenerationReport> {
        let mut run = self.start_generation(prompt, add_to_history)?;
        while let Some(fragment) = run.next_fragment().await {
            if sink.send(GenerationEvent::Fragment(fragment)).is_err() {
                tracing::debug!(generation_id = %run.id(), "event sink closed; cancelling");
                run.cancel_token().cancel();
            }
        }

        let report = self.finish_generation(run)?;
        if report.committed
            && let Err(error) = self.refresh_title(report.chat_id).await
        {
            tracing::warn!(chat_id = %report.chat_id, error = %error, "failed to refresh title");
        }
        if sink.send(GenerationEvent::Complete(report.clone())).is_err() {
            tracing::debug!(
                generation_id = %report.generation_id,
                "event sink closed before completion"
            );
        }
        Ok(report)
    }

    pub fn cancel_generation(&mut self) -> bool {
        self.generation.cancel()
    }

    /// Asks the backend for a better title and stores it when it changed.
    pub async fn refresh_title(&mut self, chat_id: ChatId) -> ChatResult<String> {
        let (model_name, history, previous_title) = {
            let chat = self.sessions.peek_chat(chat_id).context(ChatNotFoundSnafu {
                stage: "refresh-title",
                chat_id,
            })?;
            (
                chat.model_name.clone(),
                chat.history_lines(TITLE_HISTORY_LINES),
                chat.title.clone(),
            )
        };
        let previous_title = Some(previous_title.as_str()).filter(|title| !title.trim().is_empty());

        let provider = self.generation.provider().clone();
        let title = generate_title(provider.as_ref(), &model_name, &history, previous_title).await;

        let changed = self
            .sessions
            .chat_mut(chat_id)
            .is_some_and(|chat| chat.set_title(title.clone()));
        if changed {
            tracing::info!(chat_id = %chat_id, title = %title, "chat title updated");
            self.flush();
        }
        Ok(title)
    }

    /// Rewrites `prompt` with the current chat's model. Errors come back as text.
    pub async fn enhance_prompt(&self, prompt: &str) -> String {
        let Some(chat) = self.sessions.current_chat() else {
            return "Error enhancing prompt: no active chat".to_string();
        };

        let provider = self.generation.provider().clone();
        enhance_prompt(provider.as_ref(), &chat.model_name, prompt).await
    }

    /// Backend models, listed once and then kept for the session. An unreachable backend
    /// yields the static list and is asked again next time.
    pub async fn available_models(&mut self) -> ModelCatalog {
        if let Some(models) = &self.models {
            return ModelCatalog::listed(models.clone());
        }

        let provider = self.generation.provider().clone();
        match provider.fetch_models().await {
            Ok(models) => {
                tracing::info!(provider_id = provider.id(), models = models.len(), "listed models");
                self.models = Some(models.clone());
                ModelCatalog::listed(models)
            }
            Err(error) => {
                tracing::warn!(provider_id = provider.id(), error = %error, "failed to list models");
                ModelCatalog::fallback(provider.fallback_models().to_vec(), error.to_string())
            }
        }
    }

    pub fn chat_types(&self) -> Vec<(ChatType, &'static str)> {
        ChatType::ALL
            .iter()
            .map(|chat_type| (*chat_type, chat_type.label()))
            .collect()
    }

    /// Cancels any generation in flight and writes the final state.
    pub fn shutdown(&mut self) -> bool {
        if self.generation.cancel() {
            tracing::info!("cancelled generation on shutdown");
        }
        self.reclaim_abandoned_generation();
        let saved = self.flush();
        tracing::info!(chats = self.sessions.sessions().len(), saved, "chat app shut down");
        saved
    }
}

fn sorted_summaries(chats: Vec<&Chat>) -> Vec<ChatSummary> {
    let mut summaries = chats.into_iter().map(ChatSummary::from).collect::<Vec<_>>();
    summaries.sort_by(|left, right| {
        right
            .last_message_at
            .cmp(&left.last_message_at)
            .then_with(|| right.id.cmp(&left.id))
    });
    summaries
}
