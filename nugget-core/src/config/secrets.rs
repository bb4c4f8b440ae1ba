//! Secrets configuration loaded from environment variables only.
//!
//! API keys never live in the TOML file. The settings only name the
//! environment variable that holds a key (`api_key_env`).

use std::collections::BTreeMap;
use std::env;
use std::fmt;

/// Well-known key variables captured eagerly at load time.
const KNOWN_KEYS: &[&str] = &["NUGGET_RANKER_API_KEY", "OPENAI_API_KEY", "OPENROUTER_API_KEY"];

/// Secrets loaded exclusively from environment variables.
#[derive(Clone, Default)]
pub struct Secrets {
    values: BTreeMap<String, String>,
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secrets")
            .field("keys", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Secrets {
    /// Load secrets from environment variables.
    ///
    /// Also loads a `.env` file if present (development convenience).
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self::from_env_inner()
    }

    pub(crate) fn from_env_inner() -> Self {
        let values = KNOWN_KEYS
            .iter()
            .filter_map(|name| {
                env::var(name)
                    .ok()
                    .filter(|value| !value.trim().is_empty())
                    .map(|value| (name.to_string(), value))
            })
            .collect();
        Self { values }
    }

    /// Look up a secret by env var name.
    ///
    /// Variables outside the well-known set are read lazily.
    pub fn get(&self, name: &str) -> Option<String> {
        if let Some(value) = self.values.get(name) {
            return Some(value.clone());
        }
        env::var(name).ok().filter(|value| !value.trim().is_empty())
    }

    /// Build secrets from explicit pairs (tests and embedding hosts).
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_known_keys_are_captured() {
        let _guard = ENV_MUTEX.lock().unwrap();
        unsafe {
            env::set_var("NUGGET_RANKER_API_KEY", "sk-test");
        }
        let secrets = Secrets::from_env_inner();
        assert_eq!(secrets.get("NUGGET_RANKER_API_KEY").as_deref(), Some("sk-test"));
        unsafe {
            env::remove_var("NUGGET_RANKER_API_KEY");
        }
    }

    #[test]
    fn test_blank_values_are_ignored() {
        let _guard = ENV_MUTEX.lock().unwrap();
        unsafe {
            env::set_var("NUGGET_TEST_BLANK_KEY", "   ");
        }
        let secrets = Secrets::default();
        assert!(secrets.get("NUGGET_TEST_BLANK_KEY").is_none());
        unsafe {
            env::remove_var("NUGGET_TEST_BLANK_KEY");
        }
    }

    #[test]
    fn test_debug_hides_values() {
        let secrets = Secrets::from_pairs([("OPENAI_API_KEY", "sk-secret")]);
        let rendered = format!("{secrets:?}");
        assert!(rendered.contains("OPENAI_API_KEY"));
        assert!(!rendered.contains("sk-secret"));
    }
}
