use super::ids::{ChatId, GenerationId};

pub const ERROR_TAG_OPEN: &str = "<ERROR>";
pub const ERROR_TAG_CLOSE: &str = "</ERROR>";

/// Inline error fragment; the UI renders it instead of receiving an error value.
pub fn error_fragment(message: &str) -> String {
    format!("{ERROR_TAG_OPEN}{message}{ERROR_TAG_CLOSE}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

impl GenerationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed(_) => "failed",
        }
    }
}

/// What a finished generation produced and whether it reached the chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationReport {
    pub generation_id: GenerationId,
    pub chat_id: ChatId,
    pub outcome: GenerationOutcome,
    pub text: String,
    pub committed: bool,
}

/// Events pushed to the UI while a generation runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationEvent {
    Fragment(String),
    Complete(GenerationReport),
}
