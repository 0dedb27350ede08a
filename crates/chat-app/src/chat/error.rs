use snafu::Snafu;

use super::ids::{ChatId, GenerationId};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("no active chat on `{stage}`"))]
    NoActiveChat { stage: &'static str },
    #[snafu(display("chat '{chat_id}' was not found"))]
    ChatNotFound {
        stage: &'static str,
        chat_id: ChatId,
    },
    #[snafu(display("message index {index} is out of range for {len} messages"))]
    MessageIndexOutOfRange {
        stage: &'static str,
        index: isize,
        len: usize,
    },
    #[snafu(display("generation {active} is still streaming"))]
    GenerationInProgress {
        stage: &'static str,
        active: GenerationId,
    },
    #[snafu(display("generation {attempted} is not the active generation"))]
    StaleGeneration {
        stage: &'static str,
        attempted: GenerationId,
    },
}

pub type ChatResult<T> = Result<T, ChatError>;
