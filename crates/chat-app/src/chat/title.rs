use std::sync::LazyLock;

use kosmos_llm::LlmProvider;
use regex::Regex;

/// Title used when synthesis fails and the chat had none.
pub const FALLBACK_TITLE: &str = "New Conversation";
/// Trailing messages the synthesizer sees.
pub const TITLE_HISTORY_LINES: usize = 4;

static CURRENT_TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\[Current Title: "(.*?)"\]"#).expect("valid regex"));

fn title_prompt(history: &[String], previous_title: Option<&str>) -> String {
    let start = history.len().saturating_sub(TITLE_HISTORY_LINES);
    let conversation = history[start..].join("\n");
    let previous_title = previous_title.unwrap_or("None");

    format!(
        "Generate a concise, relevant title (3-8 words) that captures the core topic of the current conversation. Before generating a new title, you MUST follow these steps:

Check Context: Recall the previous title (if any) and analyze whether the current discussion is still focused on the same core topic.

Decision Criteria: Only generate a new title if:
- The conversation has significantly shifted to a new subject (>50% new context)
- The previous title no longer accurately represents the discussion
- No title exists yet

Previous Title: {previous_title}
Current Conversation: {conversation}

Title Quality: Make titles:
- Specific yet concise
- Keyword-rich
- Action-oriented when appropriate
- Free of special characters

Format: Always output the title in this exact format:
[Current Title: \"Your Generated Title Here\"]"
    )
}

/// Pulls the title out of a `[Current Title: "..."]` reply.
pub fn parse_title_reply(reply: &str) -> Option<String> {
    CURRENT_TITLE
        .captures(reply)
        .and_then(|captures| captures.get(1))
        .map(|title| title.as_str().to_string())
}

/// Asks the backend for a title. Never fails: a missing marker or a backend error keeps
/// `previous_title`, or yields [`FALLBACK_TITLE`] when there was none.
pub async fn generate_title(
    provider: &dyn LlmProvider,
    model_name: &str,
    history: &[String],
    previous_title: Option<&str>,
) -> String {
    let fallback = || previous_title.unwrap_or(FALLBACK_TITLE).to_string();
    let prompt = title_prompt(history, previous_title);

    match provider.generate_once(model_name, &prompt).await {
        Ok(reply) => parse_title_reply(&reply).unwrap_or_else(|| {
            tracing::debug!(model = model_name, "title reply had no title marker");
            fallback()
        }),
        Err(error) => {
            tracing::error!(model = model_name, error = %error, "title generation failed");
            fallback()
        }
    }
}
