use std::sync::{Arc, Mutex};

use kosmos_llm::{CancellationToken, LlmProvider, ProviderEventStream, StreamEvent, StreamRequest};
use snafu::OptionExt;

use super::error::{
    ChatResult, GenerationInProgressSnafu, NoActiveChatSnafu, StaleGenerationSnafu,
};
use super::events::{GenerationOutcome, GenerationReport, error_fragment};
use super::ids::{ChatId, GenerationId};
use super::message::MessageRole;
use super::session::SessionManager;

const STREAM_CLOSED_MESSAGE: &str = "generation stream closed before completion";

/// Lifecycle of the controller's single generation slot.
///
/// Terminal states stay observable until the next start or a reset.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum GenerationState {
    #[default]
    Idle,
    Streaming(GenerationId),
    Completed(GenerationId),
    Cancelled(GenerationId),
    Failed {
        id: GenerationId,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationTransition {
    Start(GenerationId),
    Complete(GenerationId),
    Fail { id: GenerationId, message: String },
    Cancel(GenerationId),
}

impl GenerationState {
    /// Returns the streaming generation if and only if state is `Streaming`.
    pub fn active_id(&self) -> Option<GenerationId> {
        match self {
            Self::Streaming(id) => Some(*id),
            _ => None,
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming(_))
    }

    pub fn apply(&self, transition: GenerationTransition) -> ChatResult<Self> {
        match transition {
            GenerationTransition::Start(id) => self.apply_start(id),
            GenerationTransition::Complete(id) => self.apply_finish(id, Self::Completed(id)),
            GenerationTransition::Fail { id, message } => {
                self.apply_finish(id, Self::Failed { id, message })
            }
            GenerationTransition::Cancel(id) => self.apply_finish(id, Self::Cancelled(id)),
        }
    }

    fn apply_start(&self, id: GenerationId) -> ChatResult<Self> {
        match self {
            Self::Streaming(active) => GenerationInProgressSnafu {
                stage: "start-generation",
                active: *active,
            }
            .fail(),
            _ => Ok(Self::Streaming(id)),
        }
    }

    fn apply_finish(&self, id: GenerationId, next: Self) -> ChatResult<Self> {
        match self {
            Self::Streaming(active) if *active == id => Ok(next),
            _ => StaleGenerationSnafu {
                stage: "finish-generation",
                attempted: id,
            }
            .fail(),
        }
    }
}

enum NextEvent {
    Cancelled,
    Event(Option<StreamEvent>),
}

/// What a run leaves behind once it stops being consumed.
struct RunRecord {
    id: GenerationId,
    chat_id: ChatId,
    model_name: String,
    add_to_history: bool,
    text: String,
    delivered: usize,
    outcome: Option<GenerationOutcome>,
}

/// Holds the record of a run dropped without `finish` until the controller reclaims it.
type AbandonedSlot = Arc<Mutex<Option<RunRecord>>>;

/// Consumer side of one generation. Single use: once it yields `None` it stays exhausted.
///
/// Dropping a run without handing it to [`GenerationController::finish`] cancels it; the
/// controller settles it as cancelled on its next call.
pub struct GenerationRun {
    id: GenerationId,
    chat_id: ChatId,
    model_name: String,
    add_to_history: bool,
    cancel: CancellationToken,
    stream: Option<ProviderEventStream>,
    open_error: Option<String>,
    buffer: String,
    delivered: usize,
    outcome: Option<GenerationOutcome>,
    abandoned: AbandonedSlot,
    finished: bool,
}

impl GenerationRun {
    pub fn id(&self) -> GenerationId {
        self.id
    }

    pub fn chat_id(&self) -> ChatId {
        self.chat_id
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Clone of the per-generation token, e.g. for a Ctrl-C listener.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Every fragment delivered so far, concatenated.
    pub fn text(&self) -> &str {
        &self.buffer
    }

    pub fn delivered(&self) -> usize {
        self.delivered
    }

    pub fn outcome(&self) -> Option<&GenerationOutcome> {
        self.outcome.as_ref()
    }

    /// Waits for the next fragment.
    ///
    /// The token is checked before each delivery, so fragments still queued after
    /// cancellation are dropped. Backend errors arrive as one `<ERROR>` fragment.
    pub async fn next_fragment(&mut self) -> Option<String> {
        if self.outcome.is_some() {
            return None;
        }
        if let Some(message) = self.open_error.take() {
            return Some(self.fail(message));
        }
        if self.cancel.is_cancelled() {
            self.settle(GenerationOutcome::Cancelled);
            return None;
        }
        let Some(stream) = self.stream.as_mut() else {
            self.settle(GenerationOutcome::Cancelled);
            return None;
        };

        let next = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => NextEvent::Cancelled,
            event = stream.recv() => NextEvent::Event(event),
        };

        match next {
            NextEvent::Event(Some(StreamEvent::Delta(text))) if !self.cancel.is_cancelled() => {
                self.buffer.push_str(&text);
                self.delivered += 1;
                Some(text)
            }
            NextEvent::Event(Some(StreamEvent::Done)) if !self.cancel.is_cancelled() => {
                self.settle(GenerationOutcome::Completed);
                None
            }
            NextEvent::Event(Some(StreamEvent::Error(message))) if !self.cancel.is_cancelled() => {
                Some(self.fail(message))
            }
            NextEvent::Event(None) if !self.cancel.is_cancelled() => {
                Some(self.fail(STREAM_CLOSED_MESSAGE.to_string()))
            }
            _ => {
                self.settle(GenerationOutcome::Cancelled);
                None
            }
        }
    }

    fn fail(&mut self, message: String) -> String {
        let fragment = error_fragment(&message);
        self.settle(GenerationOutcome::Failed(message));
        fragment
    }

    fn settle(&mut self, outcome: GenerationOutcome) {
        tracing::debug!(
            generation_id = %self.id,
            chat_id = %self.chat_id,
            outcome = outcome.as_str(),
            fragments = self.delivered,
            "generation settled"
        );
        self.outcome = Some(outcome);
    }

    fn take_record(&mut self) -> RunRecord {
        self.finished = true;
        RunRecord {
            id: self.id,
            chat_id: self.chat_id,
            model_name: std::mem::take(&mut self.model_name),
            add_to_history: self.add_to_history,
            text: std::mem::take(&mut self.buffer),
            delivered: self.delivered,
            outcome: self.outcome.take(),
        }
    }
}

impl Drop for GenerationRun {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.cancel.cancel();
        let record = self.take_record();
        tracing::debug!(
            generation_id = %record.id,
            chat_id = %record.chat_id,
            fragments = record.delivered,
            "generation run dropped before finish"
        );
        match self.abandoned.lock() {
            Ok(mut slot) => *slot = Some(record),
            Err(error) => tracing::warn!(error = %error, "abandoned run slot poisoned"),
        }
    }
}

/// Drives at most one streaming generation at a time.
pub struct GenerationController {
    provider: Arc<dyn LlmProvider>,
    state: GenerationState,
    active_cancel: Option<CancellationToken>,
    abandoned: AbandonedSlot,
    next_generation_id: u64,
}

impl GenerationController {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider,
            state: GenerationState::Idle,
            active_cancel: None,
            abandoned: AbandonedSlot::default(),
            next_generation_id: 1,
        }
    }

    pub fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.provider
    }

    pub fn state(&self) -> &GenerationState {
        &self.state
    }

    pub fn is_streaming(&self) -> bool {
        self.state.is_streaming()
    }

    /// Starts streaming a reply for the current chat.
    ///
    /// With `add_to_history` the prompt is stored as a user message first. Otherwise the
    /// request is built from the stored messages alone and the caller owns the user turn.
    pub fn start(
        &mut self,
        sessions: &mut SessionManager,
        prompt: &str,
        add_to_history: bool,
        user_name: Option<&str>,
    ) -> ChatResult<GenerationRun> {
        self.reclaim_abandoned(sessions);
        let chat = sessions.current_chat_mut().context(NoActiveChatSnafu {
            stage: "start-generation",
        })?;
        let id = GenerationId::new(self.next_generation_id);
        let next_state = self.state.apply(GenerationTransition::Start(id))?;
        self.next_generation_id += 1;

        if add_to_history {
            chat.append(MessageRole::User, prompt, user_name.map(str::to_string));
        }
        let messages = chat.request_messages();

        let chat_id = chat.id;
        let model_name = chat.model_name.clone();
        let request = StreamRequest::new(model_name.clone(), messages);
        let cancel = CancellationToken::new();

        let (stream, open_error) = match self.provider.stream_chat(request, cancel.clone()) {
            Ok(handle) => {
                tokio::spawn(handle.worker);
                (Some(handle.stream), None)
            }
            Err(error) => {
                tracing::warn!(
                    chat_id = %chat_id,
                    generation_id = %id,
                    error = %error,
                    "failed to open generation stream"
                );
                (None, Some(error.to_string()))
            }
        };

        self.state = next_state;
        self.active_cancel = Some(cancel.clone());
        tracing::info!(
            chat_id = %chat_id,
            generation_id = %id,
            model = %model_name,
            add_to_history,
            "generation started"
        );

        Ok(GenerationRun {
            id,
            chat_id,
            model_name,
            add_to_history,
            cancel,
            stream,
            open_error,
            buffer: String::new(),
            delivered: 0,
            outcome: None,
            abandoned: Arc::clone(&self.abandoned),
            finished: false,
        })
    }

    /// Requests cancellation of the streaming generation. Returns false when idle or
    /// already cancelled.
    pub fn cancel(&mut self) -> bool {
        let Some(active) = self.state.active_id() else {
            return false;
        };
        let Some(cancel) = self.active_cancel.as_ref() else {
            return false;
        };
        if cancel.is_cancelled() {
            return false;
        }

        cancel.cancel();
        tracing::info!(generation_id = %active, "generation cancellation requested");
        true
    }

    /// Settles a run and commits its text to the chat it was started on.
    ///
    /// Completed and cancelled runs always commit; failed runs commit only when they
    /// produced partial text, which is stored with the inline error appended. A run that
    /// never reached a terminal event counts as cancelled.
    pub fn finish(
        &mut self,
        sessions: &mut SessionManager,
        mut run: GenerationRun,
    ) -> ChatResult<GenerationReport> {
        if run.outcome.is_none() {
            run.cancel.cancel();
        }
        let record = run.take_record();
        self.settle_record(sessions, record)
    }

    /// Settles a run that was dropped without [`finish`](Self::finish), committing what it
    /// delivered. Returns `None` when nothing was abandoned or the run is already stale.
    pub fn reclaim_abandoned(
        &mut self,
        sessions: &mut SessionManager,
    ) -> Option<GenerationReport> {
        let record = match self.abandoned.lock() {
            Ok(mut slot) => slot.take()?,
            Err(error) => {
                tracing::warn!(error = %error, "abandoned run slot poisoned");
                return None;
            }
        };
        if self.state.active_id() != Some(record.id) {
            tracing::debug!(generation_id = %record.id, "discarding stale abandoned run");
            return None;
        }

        match self.settle_record(sessions, record) {
            Ok(report) => Some(report),
            Err(error) => {
                tracing::warn!(error = %error, "failed to settle abandoned run");
                None
            }
        }
    }

    fn settle_record(
        &mut self,
        sessions: &mut SessionManager,
        record: RunRecord,
    ) -> ChatResult<GenerationReport> {
        let outcome = match record.outcome {
            Some(outcome) => outcome,
            None => {
                tracing::debug!(generation_id = %record.id, "generation abandoned before completion");
                GenerationOutcome::Cancelled
            }
        };

        let transition = match &outcome {
            GenerationOutcome::Completed => GenerationTransition::Complete(record.id),
            GenerationOutcome::Cancelled => GenerationTransition::Cancel(record.id),
            GenerationOutcome::Failed(message) => GenerationTransition::Fail {
                id: record.id,
                message: message.clone(),
            },
        };
        self.state = self.state.apply(transition)?;
        self.active_cancel = None;

        let text = record.text;
        let content = match &outcome {
            GenerationOutcome::Completed | GenerationOutcome::Cancelled => Some(text.clone()),
            GenerationOutcome::Failed(message) if !text.is_empty() => {
                Some(format!("{text}{}", error_fragment(message)))
            }
            GenerationOutcome::Failed(_) => None,
        };

        let committed = match content.filter(|_| record.add_to_history) {
            Some(content) => match sessions.chat_mut(record.chat_id) {
                Some(chat) => {
                    chat.append(MessageRole::Assistant, content, Some(record.model_name));
                    true
                }
                None => {
                    tracing::warn!(
                        chat_id = %record.chat_id,
                        generation_id = %record.id,
                        "chat was deleted during generation; dropping the reply"
                    );
                    false
                }
            },
            None => false,
        };

        tracing::info!(
            chat_id = %record.chat_id,
            generation_id = %record.id,
            outcome = outcome.as_str(),
            fragments = record.delivered,
            committed,
            "generation finished"
        );

        Ok(GenerationReport {
            generation_id: record.id,
            chat_id: record.chat_id,
            outcome,
            text,
            committed,
        })
    }

    /// Cancels anything in flight and returns to `Idle`. A run started before the reset
    /// can no longer be finished.
    pub fn reset(&mut self) {
        if let Some(cancel) = self.active_cancel.take() {
            cancel.cancel();
        }
        if let Ok(mut slot) = self.abandoned.lock() {
            slot.take();
        }
        self.state = GenerationState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::error::ChatError;
    use crate::chat::message::ChatType;
    use crate::chat::session::SessionSet;
    use crate::chat::testing::{ScriptStep, ScriptedProvider};

    fn setup(provider: ScriptedProvider) -> (Arc<ScriptedProvider>, GenerationController, SessionManager) {
        let provider = Arc::new(provider);
        let controller = GenerationController::new(provider.clone());
        let mut sessions = SessionManager::new(SessionSet::new(), "llama2");
        sessions.create_chat(ChatType::General, None);
        (provider, controller, sessions)
    }

    async fn drain(run: &mut GenerationRun) -> Vec<String> {
        let mut fragments = Vec::new();
        while let Some(fragment) = run.next_fragment().await {
            fragments.push(fragment);
        }
        fragments
    }

    #[tokio::test]
    async fn completed_generation_commits_the_full_reply() {
        let (provider, mut controller, mut sessions) =
            setup(ScriptedProvider::texts(&["Hel", "lo", "!"]));

        let mut run = controller
            .start(&mut sessions, "Say hello", true, Some("ada"))
            .unwrap();
        assert!(controller.is_streaming());
        assert_eq!(drain(&mut run).await, vec!["Hel", "lo", "!"]);

        let report = controller.finish(&mut sessions, run).unwrap();
        assert_eq!(report.outcome, GenerationOutcome::Completed);
        assert_eq!(report.text, "Hello!");
        assert!(report.committed);
        assert!(matches!(controller.state(), GenerationState::Completed(_)));

        let chat = sessions.current_chat().unwrap();
        assert_eq!(chat.messages.len(), 3);
        assert_eq!(chat.messages[1].role, MessageRole::User);
        assert_eq!(chat.messages[1].name.as_deref(), Some("ada"));
        assert_eq!(chat.messages[2].role, MessageRole::Assistant);
        assert_eq!(chat.messages[2].content, "Hello!");
        assert_eq!(chat.messages[2].name.as_deref(), Some("llama2"));

        let request = provider.last_request().unwrap();
        assert_eq!(request.model_id, "llama2");
        assert_eq!(request.messages.len(), 2);
        assert_eq!(request.messages[1].content, "Say hello");
    }

    #[tokio::test]
    async fn cancelling_after_two_fragments_keeps_exactly_those_two() {
        let (_provider, mut controller, mut sessions) =
            setup(ScriptedProvider::texts(&["one ", "two ", "three ", "four ", "five"]));

        let mut run = controller.start(&mut sessions, "count", true, None).unwrap();
        let mut delivered = Vec::new();
        while let Some(fragment) = run.next_fragment().await {
            delivered.push(fragment);
            if delivered.len() == 2 {
                assert!(controller.cancel());
                assert!(!controller.cancel());
            }
        }

        assert_eq!(delivered, vec!["one ", "two "]);
        assert_eq!(run.outcome(), Some(&GenerationOutcome::Cancelled));

        let report = controller.finish(&mut sessions, run).unwrap();
        assert!(report.committed);
        assert!(matches!(controller.state(), GenerationState::Cancelled(_)));

        let chat = sessions.current_chat().unwrap();
        let last = chat.messages.last().unwrap();
        assert_eq!(last.role, MessageRole::Assistant);
        assert_eq!(last.content, "one two ");
    }

    #[tokio::test]
    async fn backend_error_becomes_a_sentinel_and_keeps_partial_text() {
        let (_provider, mut controller, mut sessions) = setup(ScriptedProvider::new(vec![
            ScriptStep::Text("partial"),
            ScriptStep::Fail("model crashed"),
            ScriptStep::Text("never"),
        ]));

        let mut run = controller.start(&mut sessions, "go", true, None).unwrap();
        let fragments = drain(&mut run).await;

        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0], "partial");
        assert!(fragments[1].starts_with("<ERROR>"));
        assert!(fragments[1].contains("model crashed"));
        assert!(fragments[1].ends_with("</ERROR>"));

        let report = controller.finish(&mut sessions, run).unwrap();
        assert!(matches!(report.outcome, GenerationOutcome::Failed(_)));
        assert!(matches!(controller.state(), GenerationState::Failed { .. }));

        let last = sessions.current_chat().unwrap().messages.last().unwrap().clone();
        assert_eq!(last.role, MessageRole::Assistant);
        assert!(last.content.starts_with("partial<ERROR>"));
    }

    #[tokio::test]
    async fn failing_to_open_the_stream_yields_one_sentinel_and_commits_nothing() {
        let (_provider, mut controller, mut sessions) =
            setup(ScriptedProvider::failing_to_open("connection refused"));

        let mut run = controller.start(&mut sessions, "hello?", true, None).unwrap();
        let fragments = drain(&mut run).await;
        assert_eq!(fragments.len(), 1);
        assert!(fragments[0].contains("connection refused"));

        let report = controller.finish(&mut sessions, run).unwrap();
        assert!(!report.committed);

        let chat = sessions.current_chat().unwrap();
        assert_eq!(chat.messages.len(), 2);
        assert_eq!(chat.messages[1].role, MessageRole::User);
    }

    #[tokio::test]
    async fn second_start_while_streaming_is_rejected() {
        let (_provider, mut controller, mut sessions) =
            setup(ScriptedProvider::texts(&["a", "b"]));

        let run = controller.start(&mut sessions, "first", true, None).unwrap();
        let rejected = controller.start(&mut sessions, "second", true, None);
        assert!(matches!(
            rejected,
            Err(ChatError::GenerationInProgress { active, .. }) if active == run.id()
        ));
        assert_eq!(sessions.current_chat().unwrap().messages.len(), 2);

        let report = controller.finish(&mut sessions, run).unwrap();
        assert_eq!(report.outcome, GenerationOutcome::Cancelled);
        assert!(controller.start(&mut sessions, "third", true, None).is_ok());
    }

    #[tokio::test]
    async fn starting_without_a_current_chat_never_reaches_the_backend() {
        let provider = Arc::new(ScriptedProvider::texts(&["a"]));
        let mut controller = GenerationController::new(provider.clone());
        let mut sessions = SessionManager::new(SessionSet::new(), "llama2");

        let result = controller.start(&mut sessions, "hi", true, None);
        assert!(matches!(result, Err(ChatError::NoActiveChat { .. })));
        assert!(provider.last_request().is_none());
        assert_eq!(controller.state(), &GenerationState::Idle);
    }

    #[tokio::test]
    async fn outside_history_the_request_is_the_stored_messages_only() {
        let (provider, mut controller, mut sessions) = setup(ScriptedProvider::texts(&["ok"]));
        sessions
            .current_chat_mut()
            .unwrap()
            .append(MessageRole::User, "hello", None);

        let mut run = controller.start(&mut sessions, "hello", false, None).unwrap();
        assert_eq!(drain(&mut run).await, vec!["ok"]);
        let report = controller.finish(&mut sessions, run).unwrap();

        assert!(!report.committed);
        assert_eq!(sessions.current_chat().unwrap().messages.len(), 2);
        let request = provider.last_request().unwrap();
        let user_turns = request
            .messages
            .iter()
            .filter(|message| message.content == "hello")
            .count();
        assert_eq!(user_turns, 1);
        assert_eq!(request.messages.len(), 2);
    }

    #[tokio::test]
    async fn dropped_run_is_reclaimed_as_cancelled_with_its_partial_text() {
        let (_provider, mut controller, mut sessions) =
            setup(ScriptedProvider::texts(&["partial ", "rest"]));

        let mut run = controller.start(&mut sessions, "first", true, None).unwrap();
        assert_eq!(run.next_fragment().await.as_deref(), Some("partial "));
        let token = run.cancel_token();
        drop(run);
        assert!(token.is_cancelled());
        assert!(controller.is_streaming());

        let report = controller.reclaim_abandoned(&mut sessions).unwrap();
        assert_eq!(report.outcome, GenerationOutcome::Cancelled);
        assert_eq!(report.text, "partial ");
        assert!(report.committed);
        assert!(matches!(controller.state(), GenerationState::Cancelled(_)));
        assert!(controller.reclaim_abandoned(&mut sessions).is_none());

        let last = sessions.current_chat().unwrap().messages.last().unwrap().clone();
        assert_eq!(last.role, MessageRole::Assistant);
        assert_eq!(last.content, "partial ");
    }

    #[tokio::test]
    async fn start_after_a_dropped_run_succeeds() {
        let (_provider, mut controller, mut sessions) = setup(ScriptedProvider::texts(&["x"]));

        let run = controller.start(&mut sessions, "first", true, None).unwrap();
        drop(run);

        let mut run = controller.start(&mut sessions, "second", true, None).unwrap();
        assert_eq!(drain(&mut run).await, vec!["x"]);
        controller.finish(&mut sessions, run).unwrap();

        let roles = sessions
            .current_chat()
            .unwrap()
            .messages
            .iter()
            .map(|message| message.role)
            .collect::<Vec<_>>();
        assert_eq!(
            roles,
            vec![
                MessageRole::System,
                MessageRole::User,
                MessageRole::Assistant,
                MessageRole::User,
                MessageRole::Assistant,
            ]
        );
    }

    #[tokio::test]
    async fn cancel_is_a_no_op_when_idle() {
        let (_provider, mut controller, _sessions) = setup(ScriptedProvider::texts(&[]));
        assert!(!controller.cancel());
        assert_eq!(controller.state(), &GenerationState::Idle);
    }

    #[tokio::test]
    async fn reply_is_dropped_when_its_chat_was_deleted() {
        let (_provider, mut controller, mut sessions) = setup(ScriptedProvider::texts(&["x"]));

        let mut run = controller.start(&mut sessions, "hi", true, None).unwrap();
        drain(&mut run).await;
        sessions.delete_chat(run.chat_id());

        let report = controller.finish(&mut sessions, run).unwrap();
        assert_eq!(report.outcome, GenerationOutcome::Completed);
        assert!(!report.committed);
    }

    #[tokio::test]
    async fn run_from_before_a_reset_is_stale() {
        let (_provider, mut controller, mut sessions) = setup(ScriptedProvider::texts(&["x"]));

        let run = controller.start(&mut sessions, "hi", true, None).unwrap();
        controller.reset();
        assert!(run.cancel_token().is_cancelled());

        let result = controller.finish(&mut sessions, run);
        assert!(matches!(result, Err(ChatError::StaleGeneration { .. })));
        assert_eq!(controller.state(), &GenerationState::Idle);
        assert!(controller.reclaim_abandoned(&mut sessions).is_none());
    }
}
