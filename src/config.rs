//! Process configuration.
//!
//! Read once at start-up from the environment (after `.env` is loaded) and
//! used to build the shared pipeline. Nothing here is a global: tests build
//! an `AppConfig` from a closure instead of touching the process environment.

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::pipeline::filter::DEFAULT_FILTER_MAX_ATTEMPTS;

/// Application-level constants
pub const APP_NAME: &str = "Arya";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8000";
pub const DEFAULT_ANTHROPIC_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_ANTHROPIC_MODEL: &str = "claude-3-5-haiku-latest";
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_OLLAMA_MODEL: &str = "llama3.1";
pub const DEFAULT_LLM_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_OUTDATED_MEDS_PATH: &str = "static/outdated_meds.json";
pub const DEFAULT_PUBMED_URL: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils";
pub const DEFAULT_LITERATURE_TIMEOUT_SECS: u64 = 10;

/// Default tracing filter when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    "arya_lib=info,tower_http=info"
}

// ═══════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },

    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("Cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("Invalid link pattern for {name}: {reason}")]
    LinkPattern { name: String, reason: String },

    #[error("Cannot build {what} client: {reason}")]
    Client { what: &'static str, reason: String },
}

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Anthropic,
    Ollama,
}

impl LlmBackend {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "anthropic" | "claude" => Some(Self::Anthropic),
            "ollama" => Some(Self::Ollama),
            _ => None,
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            Self::Anthropic => DEFAULT_ANTHROPIC_MODEL,
            Self::Ollama => DEFAULT_OLLAMA_MODEL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub backend: LlmBackend,
    /// Only required for the Anthropic backend.
    pub api_key: Option<String>,
    pub model: String,
    pub anthropic_url: String,
    pub ollama_url: String,
    pub llm_timeout_secs: u64,
    pub outdated_meds_path: PathBuf,
    /// `None` means the built-in evidence policy.
    pub evidence_policy_path: Option<PathBuf>,
    pub pubmed_url: String,
    pub literature_timeout_secs: u64,
    pub filter_max_attempts: u32,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let backend = match get("ARYA_LLM_BACKEND") {
            Some(raw) => LlmBackend::parse(&raw).ok_or(ConfigError::InvalidValue {
                key: "ARYA_LLM_BACKEND",
                value: raw,
            })?,
            None => LlmBackend::Anthropic,
        };

        let api_key = get("ARYA_API_KEY");
        if backend == LlmBackend::Anthropic && api_key.is_none() {
            return Err(ConfigError::Missing("ARYA_API_KEY"));
        }

        let bind_raw = get("ARYA_BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = bind_raw.parse().map_err(|_| ConfigError::InvalidValue {
            key: "ARYA_BIND_ADDR",
            value: bind_raw.clone(),
        })?;

        let filter_max_attempts =
            parse_positive(&get, "ARYA_FILTER_MAX_ATTEMPTS", DEFAULT_FILTER_MAX_ATTEMPTS)?;

        Ok(Self {
            bind_addr,
            backend,
            api_key,
            model: get("ARYA_MODEL").unwrap_or_else(|| backend.default_model().to_string()),
            anthropic_url: get("ARYA_ANTHROPIC_URL").unwrap_or_else(|| DEFAULT_ANTHROPIC_URL.to_string()),
            ollama_url: get("ARYA_OLLAMA_URL").unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string()),
            llm_timeout_secs: parse_positive(&get, "ARYA_LLM_TIMEOUT_SECS", DEFAULT_LLM_TIMEOUT_SECS)?,
            outdated_meds_path: get("ARYA_OUTDATED_MEDS")
                .unwrap_or_else(|| DEFAULT_OUTDATED_MEDS_PATH.to_string())
                .into(),
            evidence_policy_path: get("ARYA_EVIDENCE_POLICY").map(PathBuf::from),
            pubmed_url: get("ARYA_PUBMED_URL").unwrap_or_else(|| DEFAULT_PUBMED_URL.to_string()),
            literature_timeout_secs: parse_positive(
                &get,
                "ARYA_LITERATURE_TIMEOUT_SECS",
                DEFAULT_LITERATURE_TIMEOUT_SECS,
            )?,
            filter_max_attempts,
        })
    }
}

fn parse_number<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
        None => Ok(default),
    }
}

/// Like `parse_number`, but zero is rejected.
fn parse_positive<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr + Default + PartialEq + ToString,
    G: Fn(&str) -> Option<String>,
{
    let value = parse_number(get, key, default)?;
    if value == T::default() {
        return Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        });
    }
    Ok(value)
}
