//! Configuration system for Folio.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment.
//! The config file is `folio.toml` in the working directory unless an explicit
//! path is given. Environment variables keep the names the deployment already
//! uses (`GEMINI_API_KEY`, `CHROMA_PERSIST_PATH`, `TOP_K`, ...) and are mapped
//! onto the nested configuration keys by [`ENV_KEYS`].

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::embeddings::EmbeddingConfig;
use crate::error::ConfigError;
use crate::gateway::GatewayConfig;
use crate::store::StoreConfig;

/// Config file looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "folio.toml";

/// How an environment value is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvValue {
    /// Taken verbatim, so `CHROMA_COLLECTION_NAME=2024` stays a string.
    Text,
    /// Parsed by figment (numbers, booleans).
    Parsed,
}

/// Environment variable -> configuration key.
pub const ENV_KEYS: &[(&str, &str, EnvValue)] = &[
    ("GEMINI_API_KEY", "llm.api_key", EnvValue::Text),
    ("GEMINI_RAG_MODEL", "llm.model", EnvValue::Text),
    ("GEMINI_BASE_URL", "llm.base_url", EnvValue::Text),
    ("CHROMA_PERSIST_PATH", "store.persist_path", EnvValue::Text),
    ("CHROMA_COLLECTION_NAME", "store.collection_name", EnvValue::Text),
    ("CHROMA_URL", "store.url", EnvValue::Text),
    ("CHROMA_TENANT", "store.tenant", EnvValue::Text),
    ("CHROMA_DATABASE", "store.database", EnvValue::Text),
    ("CHROMA_EMBED_MODEL", "embedding.model", EnvValue::Text),
    ("EMBED_PROVIDER", "embedding.provider", EnvValue::Text),
    ("TOP_K", "rag.top_k", EnvValue::Parsed),
    ("FOLIO_HOST", "server.host", EnvValue::Text),
    ("FOLIO_PORT", "server.port", EnvValue::Parsed),
    ("FASTAPI_HOST", "frontend.host", EnvValue::Text),
    ("FASTAPI_PORT", "frontend.port", EnvValue::Parsed),
];

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FolioConfig {
    pub server: GatewayConfig,
    pub store: StoreConfig,
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
    pub rag: RagConfig,
    pub frontend: FrontendConfig,
}

/// Configuration for the Gemini provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Gemini model identifier (e.g., "gemini-2.5-flash").
    pub model: String,
    /// API key. Usually supplied through `GEMINI_API_KEY`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Optional base URL override for the API endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// System instruction sent with every generation request.
    pub system_instruction: String,
    /// Maximum tokens to generate. Provider default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    /// Sampling temperature. Provider default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    pub retry: RetryConfig,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "gemini-2.5-flash".to_string(),
            api_key: None,
            base_url: None,
            system_instruction: "Answer the user query strictly based on the provided context."
                .to_string(),
            max_output_tokens: None,
            temperature: None,
            timeout_secs: 120,
            retry: RetryConfig::default(),
        }
    }
}

/// Exponential backoff settings for transient provider errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    /// Retries spent on timeouts; each one already waited `timeout_secs`.
    pub max_timeout_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_timeout_retries: 1,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Retrieval settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagConfig {
    /// Number of nearest chunks retrieved per query.
    pub top_k: usize,
    /// Characters of the first stored chunk shown by `/health`.
    pub preview_chars: usize,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            top_k: 3,
            preview_chars: 200,
        }
    }
}

/// Where the terminal frontend finds the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrontendConfig {
    pub host: String,
    pub port: u16,
    /// Must outlast the backend's Gemini timeout plus one timeout retry.
    pub timeout_secs: u64,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8000,
            timeout_secs: 300,
        }
    }
}

impl FrontendConfig {
    /// Base URL of the backend, e.g. `http://localhost:8000`.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl FolioConfig {
    /// Check invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rag.top_k == 0 {
            return Err(ConfigError::Invalid {
                message: "top_k must be at least 1".to_string(),
            });
        }
        if self.store.collection_name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                message: "collection name must not be empty".to_string(),
            });
        }
        if self.embedding.batch_size == 0 {
            return Err(ConfigError::Invalid {
                message: "embedding batch_size must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// A copy that is safe to print: secrets are masked.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.llm.api_key.is_some() {
            copy.llm.api_key = Some("********".to_string());
        }
        copy
    }
}

/// Environment provider for the [`EnvValue::Parsed`] entries of [`ENV_KEYS`],
/// remapped onto nested keys.
fn env_provider() -> Env {
    let names: Vec<&str> = ENV_KEYS
        .iter()
        .filter(|(_, _, kind)| *kind == EnvValue::Parsed)
        .map(|(var, _, _)| *var)
        .collect();
    Env::raw().only(&names).map(|key| {
        match ENV_KEYS
            .iter()
            .find(|(var, _, _)| key.as_str().eq_ignore_ascii_case(var))
        {
            Some((_, path, _)) => (*path).into(),
            None => key.as_str().into(),
        }
    })
}

/// Merge every mapped environment variable; text entries bypass figment's
/// value parsing.
fn merge_env(figment: Figment) -> Figment {
    let mut figment = figment.merge(env_provider());
    for (var, path, kind) in ENV_KEYS {
        if *kind != EnvValue::Text {
            continue;
        }
        if let Ok(value) = std::env::var(var)
            && !value.is_empty()
        {
            figment = figment.merge(Serialized::default(path, value));
        }
    }
    figment
}

/// Load configuration by merging defaults, a TOML file, and environment variables.
///
/// With `path = None`, `folio.toml` in the working directory is used if present.
/// An explicit path that does not exist is an error.
pub fn load_config(path: Option<&Path>) -> Result<FolioConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(FolioConfig::default()));

    match path {
        Some(path) => {
            if !path.exists() {
                return Err(ConfigError::FileNotFound {
                    path: path.to_path_buf(),
                });
            }
            figment = figment.merge(Toml::file(path));
        }
        None => {
            let local = PathBuf::from(DEFAULT_CONFIG_FILE);
            if local.exists() {
                figment = figment.merge(Toml::file(local));
            }
        }
    }

    figment = merge_env(figment);

    let config: FolioConfig = figment.extract().map_err(Box::new)?;
    config.validate()?;
    Ok(config)
}
