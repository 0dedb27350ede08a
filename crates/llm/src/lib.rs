use std::sync::Arc;

mod model;
mod provider;
mod rig_adapter;

pub use model::{DEFAULT_MODEL, Model, ModelCatalog, default_local_models};
pub use provider::{
    BoxFuture, LlmProvider, ProviderConfig, ProviderError, ProviderEventStream, ProviderMessage,
    ProviderResult, ProviderStreamHandle, ProviderWorker, Role, StreamEvent, StreamRequest,
    emit_error_event, make_event_stream, pump_fragments,
};
pub use rig_adapter::{OLLAMA_PROVIDER_ID, RIG_OPENAI_PROVIDER_ID, RigProviderAdapter};
pub use tokio_util::sync::CancellationToken;

pub fn create_provider(mut config: ProviderConfig) -> ProviderResult<Arc<dyn LlmProvider>> {
    if config.provider_id.trim().is_empty() {
        config.provider_id = OLLAMA_PROVIDER_ID.to_string();
    }

    match config.provider_id.as_str() {
        "ollama" | "local" => {
            config.provider_id = OLLAMA_PROVIDER_ID.to_string();
            Ok(Arc::new(RigProviderAdapter::new(config)))
        }
        "openai" | "rig-openai" => {
            config.provider_id = RIG_OPENAI_PROVIDER_ID.to_string();
            Ok(Arc::new(RigProviderAdapter::new(config)))
        }
        _ => Err(ProviderError::UnsupportedProvider {
            stage: "create-provider",
            provider_id: config.provider_id,
        }),
    }
}
