use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use kosmos_llm::{ProviderMessage, Role};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::error::{ChatResult, MessageIndexOutOfRangeSnafu};
use super::ids::ChatId;

/// Title every chat starts with until the first user message or a synthesized title.
pub const DEFAULT_CHAT_TITLE: &str = "New Chat";
/// Placeholder titles keep this many characters of the first user message.
pub const PLACEHOLDER_TITLE_MAX_CHARS: usize = 50;
const PLACEHOLDER_TITLE_ELLIPSIS: &str = "...";

static THINK_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<think>.*?</think>").expect("valid regex"));

/// Chat speaker role, persisted as its lowercase tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Function,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Function => "function",
        }
    }
}

impl From<MessageRole> for Role {
    fn from(role: MessageRole) -> Self {
        match role {
            MessageRole::System => Role::System,
            MessageRole::User => Role::User,
            MessageRole::Assistant => Role::Assistant,
            MessageRole::Function => Role::Function,
        }
    }
}

/// One conversation turn. Never mutated after it is appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    pub name: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>, name: Option<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name,
            timestamp: Utc::now(),
        }
    }

    fn to_provider_message(&self) -> ProviderMessage {
        ProviderMessage::new(self.role.into(), self.content.clone()).with_name(self.name.clone())
    }
}

/// Fixed chat taxonomy. Unknown tags parse as `General`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ChatType {
    #[default]
    General,
    Code,
    Creative,
    Analysis,
}

impl ChatType {
    pub const ALL: [ChatType; 4] = [Self::General, Self::Code, Self::Creative, Self::Analysis];

    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "general" => Self::General,
            "code" => Self::Code,
            "creative" => Self::Creative,
            "analysis" => Self::Analysis,
            other => {
                tracing::debug!(chat_type = other, "unknown chat type; using general");
                Self::General
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Code => "code",
            Self::Creative => "creative",
            Self::Analysis => "analysis",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::General => "General Chat",
            Self::Code => "Code Assistant",
            Self::Creative => "Creative Writing",
            Self::Analysis => "Data Analysis",
        }
    }

    pub fn system_prompt(self) -> &'static str {
        match self {
            Self::General => "You are a helpful AI assistant.",
            Self::Code => {
                "You are an expert programming assistant. Provide clear, well-documented code and explanations."
            }
            Self::Creative => {
                "You are a creative writing assistant. Help with storytelling, poetry, and creative content."
            }
            Self::Analysis => {
                "You are a data analysis assistant. Help with data interpretation and analysis."
            }
        }
    }
}

impl From<String> for ChatType {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<ChatType> for String {
    fn from(chat_type: ChatType) -> Self {
        chat_type.as_str().to_string()
    }
}

/// Conversation aggregate: metadata plus the ordered message log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chat {
    pub id: ChatId,
    pub chat_type: ChatType,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
    pub system_prompt: Option<String>,
    pub model_name: String,
    pub messages: Vec<Message>,
}

impl Chat {
    /// Creates a chat seeded with the system message for its type.
    pub fn new(chat_type: ChatType, model_name: impl Into<String>) -> Self {
        let now = Utc::now();
        let system_message = Message {
            role: MessageRole::System,
            content: format!("This is a system prompt. {}", chat_type.system_prompt()),
            name: None,
            timestamp: now,
        };

        Self {
            id: ChatId::new_v4(),
            chat_type,
            title: DEFAULT_CHAT_TITLE.to_string(),
            created_at: now,
            last_message_at: now,
            system_prompt: None,
            model_name: model_name.into(),
            messages: vec![system_message],
        }
    }

    pub fn has_placeholder_title(&self) -> bool {
        self.title.trim().is_empty() || self.title.starts_with(DEFAULT_CHAT_TITLE)
    }

    /// Appends a message stamped with the current time.
    ///
    /// A user message on a chat that still has the placeholder title also becomes the title.
    pub fn append(
        &mut self,
        role: MessageRole,
        content: impl Into<String>,
        name: Option<String>,
    ) -> Message {
        let message = Message::new(role, content, name);
        self.touch(message.timestamp);

        if role == MessageRole::User && self.has_placeholder_title() {
            self.title = placeholder_title(&message.content);
        }

        self.messages.push(message.clone());
        message
    }

    /// Removes one message; negative indices count from the end.
    pub fn remove_at(&mut self, index: isize) -> ChatResult<Message> {
        let len = self.messages.len();
        let resolved = if index < 0 {
            len.checked_sub(index.unsigned_abs())
        } else {
            Some(index.unsigned_abs())
        };

        let Some(position) = resolved.filter(|position| *position < len) else {
            return MessageIndexOutOfRangeSnafu {
                stage: "remove-message",
                index,
                len,
            }
            .fail();
        };
        Ok(self.messages.remove(position))
    }

    /// Replaces the title and bumps `last_message_at`. Returns false when unchanged.
    pub fn set_title(&mut self, title: impl Into<String>) -> bool {
        let title = title.into();
        if title == self.title {
            return false;
        }

        self.title = title;
        self.touch(Utc::now());
        true
    }

    /// The last `count` messages as `role: content` lines.
    pub fn history_lines(&self, count: usize) -> Vec<String> {
        let start = self.messages.len().saturating_sub(count);
        self.messages[start..]
            .iter()
            .map(|message| format!("{}: {}", message.role.as_str(), message.content))
            .collect()
    }

    pub fn matches_query(&self, lowered_query: &str) -> bool {
        self.title.to_lowercase().contains(lowered_query)
            || self
                .messages
                .iter()
                .any(|message| message.content.to_lowercase().contains(lowered_query))
    }

    /// Messages in the order the backend receives them.
    ///
    /// `system_prompt` leads only when no stored system message already carries it.
    pub fn request_messages(&self) -> Vec<ProviderMessage> {
        let mut request = Vec::with_capacity(self.messages.len() + 1);

        if let Some(system_prompt) = self.system_prompt.as_deref()
            && !system_prompt.trim().is_empty()
            && !self.messages.iter().any(|message| {
                message.role == MessageRole::System && message.content == system_prompt
            })
        {
            request.push(ProviderMessage::new(Role::System, system_prompt));
        }

        request.extend(self.messages.iter().map(Message::to_provider_message));
        request
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.last_message_at {
            self.last_message_at = at;
        }
    }
}

fn placeholder_title(content: &str) -> String {
    let mut characters = content.chars();
    let prefix: String = characters
        .by_ref()
        .take(PLACEHOLDER_TITLE_MAX_CHARS)
        .collect();

    if characters.next().is_some() {
        format!("{prefix}{PLACEHOLDER_TITLE_ELLIPSIS}")
    } else {
        prefix
    }
}

/// Drops `<think>…</think>` blocks that reasoning models prepend to their answers.
pub fn strip_thinking(response: &str) -> String {
    THINK_BLOCK.replace_all(response, "").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::error::ChatError;

    fn chat_with_turns(turns: &[&str]) -> Chat {
        let mut chat = Chat::new(ChatType::General, "llama2");
        for turn in turns {
            chat.append(MessageRole::User, *turn, None);
        }
        chat
    }

    #[test]
    fn new_chat_is_seeded_with_the_type_template() {
        let chat = Chat::new(ChatType::Code, "llama2");

        assert_eq!(chat.title, DEFAULT_CHAT_TITLE);
        assert_eq!(chat.created_at, chat.last_message_at);
        assert_eq!(chat.messages.len(), 1);
        assert_eq!(chat.messages[0].role, MessageRole::System);
        assert!(chat.messages[0]
            .content
            .contains(ChatType::Code.system_prompt()));
    }

    #[test]
    fn first_user_message_becomes_the_placeholder_title() {
        let mut chat = chat_with_turns(&["How do I sort a Vec?"]);
        assert_eq!(chat.title, "How do I sort a Vec?");

        chat.append(MessageRole::User, "And in reverse?", None);
        assert_eq!(chat.title, "How do I sort a Vec?");
    }

    #[test]
    fn long_first_message_is_truncated_by_characters() {
        let long = "é".repeat(60);
        let chat = chat_with_turns(&[long.as_str()]);

        assert_eq!(chat.title.chars().count(), PLACEHOLDER_TITLE_MAX_CHARS + 3);
        assert!(chat.title.starts_with(&"é".repeat(50)));
        assert!(chat.title.ends_with("..."));

        let exact = "x".repeat(50);
        assert_eq!(chat_with_turns(&[exact.as_str()]).title, exact);
    }

    #[test]
    fn assistant_messages_never_set_the_title() {
        let mut chat = Chat::new(ChatType::General, "llama2");
        chat.append(MessageRole::Assistant, "Hello!", Some("llama2".to_string()));

        assert_eq!(chat.title, DEFAULT_CHAT_TITLE);
    }

    #[test]
    fn empty_title_counts_as_placeholder() {
        let mut chat = Chat::new(ChatType::General, "llama2");
        chat.title.clear();
        chat.append(MessageRole::User, "hi", None);

        assert_eq!(chat.title, "hi");
    }

    #[test]
    fn last_message_at_never_moves_backwards() {
        let mut chat = Chat::new(ChatType::General, "llama2");
        let future = Utc::now() + chrono::Duration::hours(1);
        chat.last_message_at = future;

        chat.append(MessageRole::User, "hi", None);
        assert_eq!(chat.last_message_at, future);
    }

    #[test]
    fn remove_at_accepts_negative_indices() {
        let mut chat = chat_with_turns(&["one", "two"]);
        assert_eq!(chat.messages.len(), 3);

        let removed = chat.remove_at(-1).unwrap();
        assert_eq!(removed.content, "two");
        assert_eq!(chat.messages.len(), 2);

        let removed = chat.remove_at(-2).unwrap();
        assert_eq!(removed.role, MessageRole::System);
        assert_eq!(chat.messages.len(), 1);
    }

    #[test]
    fn remove_at_rejects_out_of_range_indices() {
        let mut chat = chat_with_turns(&["one", "two"]);

        assert!(matches!(
            chat.remove_at(100),
            Err(ChatError::MessageIndexOutOfRange { index: 100, len: 3, .. })
        ));
        assert!(matches!(
            chat.remove_at(-4),
            Err(ChatError::MessageIndexOutOfRange { .. })
        ));
        assert!(matches!(
            chat.remove_at(3),
            Err(ChatError::MessageIndexOutOfRange { .. })
        ));
        assert_eq!(chat.messages.len(), 3);
        assert!(chat.remove_at(-3).is_ok());
    }

    #[test]
    fn set_title_reports_whether_anything_changed() {
        let mut chat = Chat::new(ChatType::General, "llama2");
        let before = chat.last_message_at;

        assert!(!chat.set_title(DEFAULT_CHAT_TITLE));
        assert_eq!(chat.last_message_at, before);
        assert!(chat.set_title("Sorting in Rust"));
        assert!(chat.last_message_at >= before);
    }

    #[test]
    fn history_lines_keep_only_the_tail() {
        let chat = chat_with_turns(&["a", "b", "c", "d"]);
        let lines = chat.history_lines(4);

        assert_eq!(lines, vec!["user: a", "user: b", "user: c", "user: d"]);
        assert_eq!(chat.history_lines(10).len(), 5);
    }

    #[test]
    fn request_messages_lead_with_a_distinct_system_prompt() {
        let mut chat = chat_with_turns(&["hi"]);
        assert_eq!(chat.request_messages().len(), 2);

        chat.system_prompt = Some("Answer in French.".to_string());
        let request = chat.request_messages();
        assert_eq!(request.len(), 3);
        assert_eq!(request[0].role, Role::System);
        assert_eq!(request[0].content, "Answer in French.");

        chat.system_prompt = Some(chat.messages[0].content.clone());
        assert_eq!(chat.request_messages().len(), 2);
    }

    #[test]
    fn request_messages_carry_author_names() {
        let mut chat = Chat::new(ChatType::General, "llama2");
        chat.append(MessageRole::User, "hi", Some("ada".to_string()));

        let request = chat.request_messages();
        assert_eq!(request[1].name.as_deref(), Some("ada"));
        assert_eq!(request[1].role, Role::User);
    }

    #[test]
    fn chat_type_parsing_falls_back_to_general() {
        assert_eq!(ChatType::parse("CODE"), ChatType::Code);
        assert_eq!(ChatType::parse("bogus-type"), ChatType::General);
        assert_eq!(String::from(ChatType::Analysis), "analysis");
        assert_eq!(
            serde_json::from_str::<ChatType>("\"poetry\"").unwrap(),
            ChatType::General
        );
        assert_eq!(
            serde_json::to_string(&MessageRole::Assistant).unwrap(),
            "\"assistant\""
        );
    }

    #[test]
    fn thinking_blocks_are_stripped() {
        let raw = "<think>\nplan the answer\n</think>\n\nImproved prompt";
        assert_eq!(strip_thinking(raw), "Improved prompt");
        assert_eq!(strip_thinking("  plain  "), "plain");
    }
}
