use std::collections::HashMap;

use snafu::ensure;

use super::error::{ChatNotFoundSnafu, ChatResult};
use super::ids::ChatId;
use super::message::{Chat, ChatType};

/// Every chat keyed by id, plus the selected chat.
///
/// The selection is a plain id: it never keeps a deleted chat alive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSet {
    chats: HashMap<ChatId, Chat>,
    current: Option<ChatId>,
}

impl SessionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a set with nothing selected. Later duplicates of an id replace earlier ones.
    pub fn from_chats(chats: impl IntoIterator<Item = Chat>) -> Self {
        Self {
            chats: chats.into_iter().map(|chat| (chat.id, chat)).collect(),
            current: None,
        }
    }

    pub fn len(&self) -> usize {
        self.chats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chats.is_empty()
    }

    pub fn get(&self, chat_id: ChatId) -> Option<&Chat> {
        self.chats.get(&chat_id)
    }

    pub fn get_mut(&mut self, chat_id: ChatId) -> Option<&mut Chat> {
        self.chats.get_mut(&chat_id)
    }

    pub fn contains(&self, chat_id: ChatId) -> bool {
        self.chats.contains_key(&chat_id)
    }

    pub fn chats(&self) -> impl Iterator<Item = &Chat> {
        self.chats.values()
    }

    pub fn current_id(&self) -> Option<ChatId> {
        self.current
    }

    fn insert(&mut self, chat: Chat) -> ChatId {
        let chat_id = chat.id;
        self.chats.insert(chat_id, chat);
        chat_id
    }
}

/// Owner of the session set and the only place chats are created or removed.
#[derive(Debug)]
pub struct SessionManager {
    sessions: SessionSet,
    default_model: String,
}

impl SessionManager {
    pub fn new(sessions: SessionSet, default_model: impl Into<String>) -> Self {
        Self {
            sessions,
            default_model: default_model.into(),
        }
    }

    pub fn sessions(&self) -> &SessionSet {
        &self.sessions
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Model for chats created from now on; existing chats keep theirs.
    pub fn set_default_model(&mut self, model_name: impl Into<String>) {
        self.default_model = model_name.into();
    }

    /// Creates a chat, seeds its system message, and selects it.
    pub fn create_chat(&mut self, chat_type: ChatType, model_name: Option<&str>) -> &Chat {
        let model_name = model_name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.default_model)
            .to_string();

        let chat = Chat::new(chat_type, model_name);
        let chat_id = self.sessions.insert(chat);
        self.sessions.current = Some(chat_id);
        tracing::info!(
            chat_id = %chat_id,
            chat_type = chat_type.as_str(),
            "created chat"
        );
        &self.sessions.chats[&chat_id]
    }

    /// Lookup that also selects the chat, matching how the UI opens a conversation.
    pub fn get_chat(&mut self, chat_id: ChatId) -> Option<&Chat> {
        self.select_chat(chat_id)
    }

    pub fn select_chat(&mut self, chat_id: ChatId) -> Option<&Chat> {
        let chat = self.sessions.chats.get(&chat_id);
        match chat {
            Some(chat) => {
                self.sessions.current = Some(chat_id);
                tracing::debug!(chat_id = %chat_id, messages = chat.messages.len(), "selected chat");
            }
            None => tracing::debug!(chat_id = %chat_id, "chat not found"),
        }
        chat
    }

    /// Side-effect free lookup.
    pub fn peek_chat(&self, chat_id: ChatId) -> Option<&Chat> {
        self.sessions.get(chat_id)
    }

    pub fn chat_mut(&mut self, chat_id: ChatId) -> Option<&mut Chat> {
        self.sessions.get_mut(chat_id)
    }

    /// Unordered snapshot; callers sort.
    pub fn get_all_chats(&self) -> Vec<&Chat> {
        self.sessions.chats().collect()
    }

    /// Case-insensitive match on the title or any message body.
    pub fn search_chats(&self, query: &str) -> Vec<&Chat> {
        let lowered_query = query.to_lowercase();
        self.sessions
            .chats()
            .filter(|chat| chat.matches_query(&lowered_query))
            .collect()
    }

    pub fn switch_chat(&mut self, chat_id: ChatId) -> ChatResult<()> {
        ensure!(
            self.sessions.contains(chat_id),
            ChatNotFoundSnafu {
                stage: "switch-chat",
                chat_id,
            }
        );
        self.sessions.current = Some(chat_id);
        tracing::debug!(chat_id = %chat_id, "switched chat");
        Ok(())
    }

    /// Removes a chat. Deleting the selected chat leaves nothing selected.
    pub fn delete_chat(&mut self, chat_id: ChatId) -> Option<Chat> {
        let Some(removed) = self.sessions.chats.remove(&chat_id) else {
            tracing::warn!(chat_id = %chat_id, "chat not found for deletion");
            return None;
        };

        if self.sessions.current == Some(chat_id) {
            self.sessions.current = None;
        }
        tracing::info!(chat_id = %chat_id, "deleted chat");
        Some(removed)
    }

    pub fn current_chat(&self) -> Option<&Chat> {
        self.sessions.current.and_then(|chat_id| self.sessions.get(chat_id))
    }

    pub fn current_chat_mut(&mut self) -> Option<&mut Chat> {
        let chat_id = self.sessions.current?;
        self.sessions.get_mut(chat_id)
    }

    pub fn clear_current_chat(&mut self) {
        self.sessions.current = None;
    }
}
