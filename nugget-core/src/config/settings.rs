//! Settings configuration loaded from TOML files.
//!
//! This module handles non-sensitive configuration stored in TOML format
//! in the XDG config directory (~/.config/nugget/config.toml). Every
//! retrieval knob is optional here; [`super::RetrievalSettings`] fills the
//! gaps with defaults.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::retrieval::{EmbeddingProviderKind, RankerProviderKind};

const DEFAULT_CONFIG_TOML: &str = r#"# nugget configuration file
# Located at: ~/.config/nugget/config.toml
#
# This file contains non-sensitive configuration.
# API keys are read from the environment variable named by
# `retrieval.ranker.api_key_env`.

[brain]
# root = "~/brain"

[logging]
level = "info"
file_enabled = false
# file_path = "/var/log/nugget.log"

[retrieval.embedding]
provider = "ollama"
url = "http://127.0.0.1:11434"
model = "qwen3-embedding:8b"
batch = 32
timeout_ms = 30000
retries = 3

[retrieval.chunking]
min_tokens = 64
max_tokens = 512
overlap_ratio = 0.12

[retrieval.search]
rrf_k = 60
vector_limit = 50
text_limit = 50
graph_depth = 2
graph_seeds = 10
max_results = 8

[retrieval.ranker]
provider = "passthrough"
# provider = "openai_compatible"
# base_url = "https://api.openai.com/v1"
# model = "gpt-4o-mini"
# api_key_env = "OPENAI_API_KEY"
timeout_ms = 20000
candidate_budget = 40

[retrieval.index]
persist_embeddings = true
watch_debounce_ms = 2000
"#;

/// Settings loaded from TOML configuration file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Settings {
    /// Brain location
    #[serde(default)]
    pub brain: BrainSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingSettings,

    /// Retrieval engine overrides
    #[serde(default)]
    pub retrieval: RetrievalToolsSettings,
}

/// Brain directory settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BrainSettings {
    /// Root of the brain (contains `brain.yaml` and `domains/`).
    /// A leading `~/` expands to the home directory.
    pub root: Option<String>,
}

impl BrainSettings {
    pub fn root_path(&self) -> Option<PathBuf> {
        let raw = self.root.as_deref()?.trim();
        if raw.is_empty() {
            return None;
        }
        if let Some(rest) = raw.strip_prefix("~/") {
            return dirs::home_dir().map(|home| home.join(rest));
        }
        Some(PathBuf::from(raw))
    }
}

/// Logging settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingSettings {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to log to file
    #[serde(default)]
    pub file_enabled: bool,

    /// Log file path (if file_enabled is true)
    pub file_path: Option<String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_enabled: false,
            file_path: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Retrieval configuration as written by the user.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RetrievalToolsSettings {
    #[serde(default)]
    pub embedding: EmbeddingOverrides,

    #[serde(default)]
    pub chunking: ChunkingOverrides,

    #[serde(default)]
    pub search: SearchOverrides,

    #[serde(default)]
    pub ranker: RankerOverrides,

    #[serde(default)]
    pub index: IndexOverrides,
}

/// Embedding provider overrides
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EmbeddingOverrides {
    /// "ollama" or "hashing"
    pub provider: Option<EmbeddingProviderKind>,
    /// Embedding provider base URL
    pub url: Option<String>,
    /// Embedding model name
    pub model: Option<String>,
    /// Embedding dimension (if known)
    pub dim: Option<usize>,
    /// Texts per provider call
    pub batch: Option<usize>,
    /// Per-attempt timeout
    pub timeout_ms: Option<u64>,
    /// Extra attempts after the first failure
    pub retries: Option<usize>,
}

/// Chunker overrides
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ChunkingOverrides {
    pub min_tokens: Option<usize>,
    pub max_tokens: Option<usize>,
    pub overlap_ratio: Option<f32>,
}

/// Hybrid search and graph expansion overrides
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SearchOverrides {
    pub rrf_k: Option<usize>,
    pub vector_limit: Option<usize>,
    pub text_limit: Option<usize>,
    pub graph_depth: Option<u8>,
    pub graph_seeds: Option<usize>,
    pub graph_decay: Option<f64>,
    pub max_results: Option<usize>,
}

/// Relevance ranker overrides
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RankerOverrides {
    /// "passthrough" or "openai_compatible"
    pub provider: Option<RankerProviderKind>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    /// Env var holding the API key
    pub api_key_env: Option<String>,
    pub timeout_ms: Option<u64>,
    pub candidate_budget: Option<usize>,
    pub hop_penalty: Option<f64>,
    pub confidence_weight: Option<f64>,
    pub domain_boost: Option<f64>,
}

/// Index persistence overrides
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct IndexOverrides {
    /// Embedding cache location (defaults to `<brain>/.nugget/index.sqlite3`)
    pub cache_path_override: Option<String>,
    pub persist_embeddings: Option<bool>,
    pub watch_debounce_ms: Option<u64>,
}

/// Errors that can occur when loading settings
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config directory not found")]
    ConfigDirNotFound,
}

impl Settings {
    /// Load settings from the TOML configuration file.
    ///
    /// If the config file doesn't exist, creates it with default values.
    pub fn load() -> Result<Self, SettingsError> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            tracing::info!("Creating default configuration at {:?}", config_path);
            Self::create_default_config(&config_path)?;
        }

        let content = fs::read_to_string(&config_path)?;
        Self::from_toml(&content)
    }

    /// Parse settings from TOML content.
    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        let settings: Self = toml::from_str(content)?;
        Ok(settings)
    }

    /// Serialize settings to TOML content.
    pub fn to_toml(&self) -> Result<String, SettingsError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Get the configuration file path.
    ///
    /// `NUGGET_CONFIG_DIR` wins over the XDG config directory.
    pub fn config_path() -> Result<PathBuf, SettingsError> {
        if let Ok(override_dir) = std::env::var("NUGGET_CONFIG_DIR") {
            return Ok(PathBuf::from(override_dir).join("config.toml"));
        }

        let config_dir = dirs::config_dir()
            .ok_or(SettingsError::ConfigDirNotFound)?
            .join("nugget");

        Ok(config_dir.join("config.toml"))
    }

    fn create_default_config(path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, DEFAULT_CONFIG_TOML)?;
        Ok(())
    }

    /// Save settings to a specific file path.
    pub fn save_to_path(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_toml()?)?;
        Ok(())
    }
}
