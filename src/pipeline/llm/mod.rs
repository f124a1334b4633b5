//! Model inference collaborator.
//!
//! Every stage talks to the model through `LlmClient`, which takes a single
//! user prompt (plus an optional system prompt) and returns raw text. The
//! pipeline never assumes that text is valid JSON; it always goes through the
//! parse-or-repair gate in `pipeline::repair`.

pub mod anthropic;
pub mod mock;
pub mod ollama;

pub use anthropic::AnthropicClient;
pub use mock::ScriptedLlmClient;
pub use ollama::OllamaClient;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("Model endpoint is not reachable at {0}")]
    Connection(String),

    #[error("Model request timed out after {0}s")]
    Timeout(u64),

    #[error("Model endpoint returned error (status {status}): {body}")]
    Api { status: u16, body: String },

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("Response parsing error: {0}")]
    ResponseParsing(String),

    #[error("Model returned an empty completion")]
    EmptyCompletion,

    #[error("No API key configured for the model backend")]
    MissingApiKey,
}

/// One model invocation. Temperature is always 0.
#[derive(Debug, Clone, Copy)]
pub struct CompletionRequest<'a> {
    pub system: Option<&'a str>,
    pub prompt: &'a str,
    pub max_tokens: u32,
}

impl<'a> CompletionRequest<'a> {
    pub fn new(prompt: &'a str, max_tokens: u32) -> Self {
        Self {
            system: None,
            prompt,
            max_tokens,
        }
    }

    pub fn with_system(mut self, system: &'a str) -> Self {
        self.system = Some(system);
        self
    }
}

/// Model client abstraction (allows mocking).
pub trait LlmClient: Send + Sync {
    fn complete(&self, request: &CompletionRequest<'_>) -> Result<String, LlmError>;

    /// Model name, for logging and the health endpoint.
    fn model(&self) -> &str;
}

/// Map a reqwest failure onto `LlmError`, shared by the HTTP backends.
pub(crate) fn map_transport_error(err: reqwest::Error, base_url: &str, timeout_secs: u64) -> LlmError {
    if err.is_connect() {
        LlmError::Connection(base_url.to_string())
    } else if err.is_timeout() {
        LlmError::Timeout(timeout_secs)
    } else {
        LlmError::HttpClient(err.to_string())
    }
}
