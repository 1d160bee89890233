//! Client for OpenAI-compatible APIs (OpenAI itself, LiteLLM or Ollama).

use std::time::Duration;

use async_openai::{Client, config::OpenAIConfig};
use backoff::ExponentialBackoffBuilder;

/// Create an OpenAI-compatible client for an explicit API key and optional
/// server URL.
///
/// The client makes exactly one attempt per request. `async-openai` would
/// otherwise retry server errors and rate limits for up to 15 minutes.
pub fn create_llm_client(api_key: &str, api_base: Option<&str>) -> Client<OpenAIConfig> {
    let mut client_config = OpenAIConfig::new().with_api_key(api_key);
    if let Some(api_base) = api_base {
        client_config = client_config.with_api_base(api_base);
    }
    let no_retries = ExponentialBackoffBuilder::new()
        .with_max_elapsed_time(Some(Duration::ZERO))
        .build();
    Client::with_config(client_config).with_backoff(no_retries)
}
