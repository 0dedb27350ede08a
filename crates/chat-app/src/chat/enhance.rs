use kosmos_llm::LlmProvider;

use super::message::strip_thinking;

const ENHANCE_INSTRUCTION: &str = "Enhance the following prompt to improve its clarity, creativity, and effectiveness. Return only the final, enhanced prompt with no additional commentary or chain-of-thought.";

/// Rewrites a prompt with one single-shot call.
///
/// Failures come back as display text so the input box can show them in place.
pub async fn enhance_prompt(provider: &dyn LlmProvider, model_name: &str, prompt: &str) -> String {
    let request = format!("{ENHANCE_INSTRUCTION}\n\nPrompt: {prompt}");

    match provider.generate_once(model_name, &request).await {
        Ok(reply) => strip_thinking(&reply),
        Err(error) => {
            tracing::warn!(model = model_name, error = %error, "prompt enhancement failed");
            format!("Error enhancing prompt: {error}")
        }
    }
}
