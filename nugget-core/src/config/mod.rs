//! Configuration management for nugget.
//!
//! Secrets (API keys) are read from environment variables, everything else
//! from a TOML file.
//!
//! ## Secrets (Environment Variables)
//! - The ranker API key, read from the variable named by
//!   `retrieval.ranker.api_key_env` (default `OPENAI_API_KEY`)
//!
//! ## Settings (TOML File)
//! Located at `~/.config/nugget/config.toml`:
//! ```toml
//! [brain]
//! root = "~/brain"
//!
//! [logging]
//! level = "info"
//!
//! [retrieval.embedding]
//! provider = "ollama"
//! model = "qwen3-embedding:8b"
//!
//! [retrieval.search]
//! rrf_k = 60
//! graph_depth = 2
//! ```

pub mod retrieval;
mod secrets;
mod settings;

use std::path::PathBuf;

pub use retrieval::{
    ChunkingDefaults, EmbeddingDefaults, EmbeddingProviderKind, PruningDefaults, RankerDefaults,
    RankerProviderKind, RetrievalSettings, SearchDefaults,
};
pub use secrets::Secrets;
pub use settings::{
    BrainSettings, ChunkingOverrides, EmbeddingOverrides, IndexOverrides, LoggingSettings,
    RankerOverrides, RetrievalToolsSettings, SearchOverrides, Settings, SettingsError,
};

/// Combined configuration containing both secrets and settings.
#[derive(Debug, Clone)]
pub struct Config {
    /// Secrets loaded from environment variables
    pub secrets: Secrets,
    /// Settings loaded from TOML configuration file
    pub settings: Settings,
}

/// Errors that can occur when loading configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("Brain root is not configured (set [brain].root or pass --brain)")]
    BrainRootNotSet,
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Loads `.env` (if present), then the TOML settings file (creating the
    /// default file on first run). Secrets are not checked here; a missing
    /// ranker key only fails the commands that build a ranker.
    pub fn load() -> Result<Self, ConfigError> {
        let secrets = Secrets::from_env();
        let settings = Settings::load()?;
        Ok(Self { secrets, settings })
    }

    /// Resolved retrieval settings with every default filled in.
    pub fn retrieval_settings(&self) -> RetrievalSettings {
        let mut resolved = RetrievalSettings::from(&self.settings.retrieval);
        if resolved.brain_root.is_none() {
            resolved.brain_root = self.settings.brain.root_path();
        }
        resolved
    }

    /// The brain directory, with an explicit override taking precedence.
    pub fn brain_root(&self, explicit: Option<PathBuf>) -> Result<PathBuf, ConfigError> {
        explicit
            .or_else(|| self.retrieval_settings().brain_root)
            .ok_or(ConfigError::BrainRootNotSet)
    }

    /// API key for the configured ranker, if its env var is set.
    pub fn ranker_api_key(&self) -> Option<String> {
        let resolved = self.retrieval_settings();
        resolved
            .ranker
            .api_key_env
            .as_deref()
            .and_then(|name| self.secrets.get(name))
    }
}
