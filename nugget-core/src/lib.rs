//! Shared configuration for the nugget workspace.
//!
//! Settings come from a TOML file in the XDG config directory, secrets come
//! from the environment. The retrieval crate consumes the resolved
//! [`config::RetrievalSettings`].

pub mod config;

pub use config::{
    Config, ConfigError, RetrievalSettings, RetrievalToolsSettings, Secrets, Settings,
    SettingsError,
};
