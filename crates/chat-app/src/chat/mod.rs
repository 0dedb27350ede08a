mod enhance;
mod error;
mod events;
mod generation;
mod ids;
mod message;
mod session;
mod title;

#[cfg(test)]
pub(crate) mod testing;

pub use enhance::enhance_prompt;
pub use error::{ChatError, ChatResult};
pub(crate) use error::{ChatNotFoundSnafu, NoActiveChatSnafu};
pub use events::{
    ERROR_TAG_CLOSE, ERROR_TAG_OPEN, GenerationEvent, GenerationOutcome, GenerationReport,
    error_fragment,
};
pub use generation::{GenerationController, GenerationRun, GenerationState, GenerationTransition};
pub use ids::{ChatId, GenerationId};
pub use message::{
    Chat, ChatType, DEFAULT_CHAT_TITLE, Message, MessageRole, PLACEHOLDER_TITLE_MAX_CHARS,
    strip_thinking,
};
pub use session::{SessionManager, SessionSet};
pub use title::{FALLBACK_TITLE, TITLE_HISTORY_LINES, generate_title, parse_title_reply};
