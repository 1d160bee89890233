//! Command-line entry points.

use clap::Args;

use crate::{errors::PipelineError, prelude::*};

pub mod check;
pub mod convert;

/// Credentials for the language-model service.
#[derive(Clone, Args)]
pub struct CredentialOpts {
    /// The API key for the language-model service.
    #[clap(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Override the server URL, for OpenAI-compatible gateways.
    #[clap(long, env = "OPENAI_API_BASE")]
    api_base: Option<String>,
}

impl CredentialOpts {
    /// Get the API key, or fail if none was supplied.
    pub fn require_api_key(&self) -> Result<&str, PipelineError> {
        match self.api_key.as_deref() {
            Some(key) if !key.trim().is_empty() => Ok(key),
            _ => Err(PipelineError::Configuration(
                "OpenAI API key not found. Please set the OPENAI_API_KEY environment variable."
                    .to_owned(),
            )),
        }
    }

    /// The server URL override, if any.
    pub fn api_base(&self) -> Option<&str> {
        self.api_base.as_deref()
    }
}

// Never print the key itself.
impl std::fmt::Debug for CredentialOpts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialOpts")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_base", &self.api_base)
            .finish()
    }
}
