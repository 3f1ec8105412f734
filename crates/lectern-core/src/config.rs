//! Application configuration management.
//!
//! This module handles loading and saving the client configuration: which
//! backend to talk to, where its token endpoints live, timeouts, the
//! validation cooldown, and where the session is persisted.
//!
//! Configuration is stored at `~/.config/lectern/config.json`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::auth::{CredentialStore, FileStore, KeyringStore};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "lectern";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Environment variable overriding the backend URL
pub const API_URL_ENV: &str = "LECTERN_API_URL";

const DEFAULT_API_BASE_URL: &str = "http://localhost:8000";
const DEFAULT_TOKEN_PATH: &str = "/api/token/";
const DEFAULT_REFRESH_PATH: &str = "/api/token/refresh/";

/// HTTP request timeout in seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Seconds a validated access token is trusted without decoding it again.
const DEFAULT_VALIDATION_COOLDOWN_SECS: u64 = 60;

/// Where the session survives between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// `session.json` in the cache directory
    #[default]
    File,
    /// OS keychain
    Keyring,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub token_path: String,
    pub refresh_path: String,
    pub request_timeout_secs: u64,
    pub validation_cooldown_secs: u64,
    pub store: StoreBackend,
    pub last_username: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            token_path: DEFAULT_TOKEN_PATH.to_string(),
            refresh_path: DEFAULT_REFRESH_PATH.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            validation_cooldown_secs: DEFAULT_VALIDATION_COOLDOWN_SECS,
            store: StoreBackend::default(),
            last_username: None,
        }
    }
}

impl Config {
    /// Read `config.json`, or fall back to defaults when there is none.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents)
                .with_context(|| format!("Malformed settings in {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(?path, "No config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e).with_context(|| format!("Cannot open {}", path.display())),
        }
    }

    /// Persist the settings, replacing the previous file in one step.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        let dir = path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("{} has no parent directory", path.display()))?;
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Cannot create {}", dir.display()))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, self)?;
        tmp.persist(&path)
            .with_context(|| format!("Cannot write {}", path.display()))?;
        Ok(())
    }

    fn app_dir(base: Option<PathBuf>, kind: &str) -> Result<PathBuf> {
        base.map(|dir| dir.join(APP_NAME))
            .ok_or_else(|| anyhow::anyhow!("No {} directory on this platform", kind))
    }

    fn config_path() -> Result<PathBuf> {
        Ok(Self::app_dir(dirs::config_dir(), "config")?.join(CONFIG_FILE))
    }

    /// Where the file-backed session store keeps `session.json`.
    pub fn cache_dir(&self) -> Result<PathBuf> {
        Self::app_dir(dirs::cache_dir(), "cache")
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(API_URL_ENV).filter(|url| !url.trim().is_empty()) {
            debug!(%url, "Backend URL overridden from environment");
            self.api_base_url = url.trim().to_string();
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn validation_cooldown(&self) -> Duration {
        Duration::from_secs(self.validation_cooldown_secs)
    }

    /// Absolute URL for a backend path
    pub fn endpoint(&self, path: &str) -> String {
        join_url(&self.api_base_url, path)
    }

    pub fn token_url(&self) -> String {
        self.endpoint(&self.token_path)
    }

    pub fn refresh_url(&self) -> String {
        self.endpoint(&self.refresh_path)
    }

    /// Open the configured session store.
    pub fn open_store(&self) -> Result<Arc<dyn CredentialStore>> {
        Ok(match self.store {
            StoreBackend::File => Arc::new(FileStore::new(self.cache_dir()?)),
            StoreBackend::Keyring => Arc::new(KeyringStore::new()),
        })
    }
}

/// Join a base URL and a path with exactly one slash between them.
/// Absolute URLs are passed through untouched.
pub(crate) fn join_url(base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
