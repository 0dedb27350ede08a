use chrono::{DateTime, Local, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use kosmos_llm::DEFAULT_MODEL;
use kosmos_storage::{KeyValueStore, StorageError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::{OptionExt, ResultExt, Snafu};

use crate::chat::{Chat, ChatId, ChatType, Message, MessageRole, SessionSet};

/// Store key holding the list of every chat.
pub const CHATS_KEY: &str = "chats";
const NAIVE_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PersistenceError {
    #[snafu(display("chat entry {index} is malformed: {source}"))]
    DecodeChat {
        stage: &'static str,
        index: usize,
        source: serde_json::Error,
    },
    #[snafu(display("`{field}` timestamp '{raw}' is not ISO-8601"))]
    InvalidTimestamp {
        stage: &'static str,
        field: &'static str,
        raw: String,
    },
    #[snafu(display("failed to encode chats: {source}"))]
    EncodeChats {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("store failed on `{stage}`: {source}"))]
    Store {
        stage: &'static str,
        source: StorageError,
    },
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MessageRecord {
    role: MessageRole,
    content: String,
    #[serde(default)]
    name: Option<String>,
    timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatRecord {
    id: ChatId,
    #[serde(rename = "type", default)]
    chat_type: ChatType,
    title: String,
    created_at: String,
    last_message_at: String,
    #[serde(default)]
    system_prompt: Option<String>,
    #[serde(default = "default_model_name")]
    model_name: String,
    #[serde(default)]
    messages: Vec<MessageRecord>,
}

fn default_model_name() -> String {
    DEFAULT_MODEL.to_string()
}

impl From<&Chat> for ChatRecord {
    fn from(chat: &Chat) -> Self {
        Self {
            id: chat.id,
            chat_type: chat.chat_type,
            title: chat.title.clone(),
            created_at: format_timestamp(&chat.created_at),
            last_message_at: format_timestamp(&chat.last_message_at),
            system_prompt: chat.system_prompt.clone(),
            model_name: chat.model_name.clone(),
            messages: chat
                .messages
                .iter()
                .map(|message| MessageRecord {
                    role: message.role,
                    content: message.content.clone(),
                    name: message.name.clone(),
                    timestamp: format_timestamp(&message.timestamp),
                })
                .collect(),
        }
    }
}

impl ChatRecord {
    fn into_chat(self) -> PersistenceResult<Chat> {
        let messages = self
            .messages
            .into_iter()
            .map(|message| {
                Ok(Message {
                    role: message.role,
                    content: message.content,
                    name: message.name,
                    timestamp: parse_timestamp("timestamp", &message.timestamp)?,
                })
            })
            .collect::<PersistenceResult<Vec<_>>>()?;

        Ok(Chat {
            id: self.id,
            chat_type: self.chat_type,
            title: self.title,
            created_at: parse_timestamp("created_at", &self.created_at)?,
            last_message_at: parse_timestamp("last_message_at", &self.last_message_at)?,
            system_prompt: self.system_prompt,
            model_name: self.model_name,
            messages,
        })
    }
}

fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// RFC 3339 first; offset-less timestamps are read as local time.
fn parse_timestamp(field: &'static str, raw: &str) -> PersistenceResult<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }

    let naive = NaiveDateTime::parse_from_str(raw, NAIVE_TIMESTAMP_FORMAT)
        .ok()
        .context(InvalidTimestampSnafu {
            stage: "parse-timestamp",
            field,
            raw,
        })?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
        .context(InvalidTimestampSnafu {
            stage: "resolve-local-timestamp",
            field,
            raw,
        })
}

fn decode_chat(index: usize, entry: Value) -> PersistenceResult<Chat> {
    let record: ChatRecord = serde_json::from_value(entry).context(DecodeChatSnafu {
        stage: "decode-chat",
        index,
    })?;
    record.into_chat()
}

/// Moves the session set in and out of a key-value store.
///
/// Storage failures never reach the engine: `save` logs them, `load` degrades to an
/// empty or partial set.
#[derive(Debug)]
pub struct PersistenceGateway<S> {
    store: S,
}

impl<S: KeyValueStore> PersistenceGateway<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Writes every chat, oldest first, as one document under [`CHATS_KEY`].
    pub fn try_save(&self, sessions: &SessionSet) -> PersistenceResult<()> {
        let mut chats = sessions.chats().collect::<Vec<_>>();
        chats.sort_by(|left, right| {
            left.created_at
                .cmp(&right.created_at)
                .then_with(|| left.id.cmp(&right.id))
        });

        let records = chats.into_iter().map(ChatRecord::from).collect::<Vec<_>>();
        let payload = serde_json::to_value(&records).context(EncodeChatsSnafu {
            stage: "encode-chats",
        })?;
        self.store
            .put(CHATS_KEY, payload)
            .context(StoreSnafu { stage: "put-chats" })
    }

    /// Returns whether the write landed.
    pub fn save(&self, sessions: &SessionSet) -> bool {
        match self.try_save(sessions) {
            Ok(()) => {
                tracing::debug!(chats = sessions.len(), "saved chats");
                true
            }
            Err(error) => {
                tracing::warn!(chats = sessions.len(), error = %error, "failed to save chats");
                false
            }
        }
    }

    pub fn load(&self) -> SessionSet {
        let payload = match self.store.get(CHATS_KEY) {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                tracing::debug!("no saved chats");
                return SessionSet::new();
            }
            Err(error) => {
                tracing::warn!(error = %error, "failed to read saved chats");
                return SessionSet::new();
            }
        };

        let Value::Array(entries) = payload else {
            tracing::warn!("saved chats are not a list; starting empty");
            return SessionSet::new();
        };

        let total = entries.len();
        let chats = entries
            .into_iter()
            .enumerate()
            .filter_map(|(index, entry)| match decode_chat(index, entry) {
                Ok(chat) => Some(chat),
                Err(error) => {
                    tracing::warn!(index, error = %error, "skipping malformed chat entry");
                    None
                }
            })
            .collect::<Vec<_>>();

        tracing::info!(loaded = chats.len(), total, "loaded chats");
        SessionSet::from_chats(chats)
    }
}
