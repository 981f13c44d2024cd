//! Application configuration management.
//!
//! This module handles loading and saving the client configuration: the API
//! base URL, where the session record is stored, refresh timing, and the
//! last used username.
//!
//! Configuration is stored at `~/.config/qadapt/config.json`. The base URL
//! and session store can be overridden with `QADAPT_API_BASE_URL` and
//! `QADAPT_SESSION_STORE`.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::auth::{FileSessionStore, KeyringSessionStore, MemorySessionStore, SessionStore};
use crate::gateway::GatewayOptions;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "qadapt";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// API base URL when neither config nor environment names one
pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8000";

/// Ceiling for `expiry_margin_secs`; larger values are clamped
const MAX_EXPIRY_MARGIN_SECS: i64 = 60 * 60;

pub const ENV_API_BASE_URL: &str = "QADAPT_API_BASE_URL";
pub const ENV_SESSION_STORE: &str = "QADAPT_SESSION_STORE";

/// Where the durable session record lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStoreKind {
    /// `session.json` in the cache directory
    #[default]
    File,
    /// OS keychain
    Keyring,
    /// Process memory only; nothing survives a restart
    Memory,
}

impl FromStr for SessionStoreKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(SessionStoreKind::File),
            "keyring" | "keychain" => Ok(SessionStoreKind::Keyring),
            "memory" => Ok(SessionStoreKind::Memory),
            other => Err(anyhow::anyhow!("Unknown session store: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub api_base_url: Option<String>,
    #[serde(default)]
    pub session_store: SessionStoreKind,
    pub refresh_timeout_secs: Option<u64>,
    pub expiry_margin_secs: Option<i64>,
    pub last_username: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Apply `QADAPT_API_BASE_URL` / `QADAPT_SESSION_STORE` from the environment
    pub fn apply_env(&mut self) {
        self.apply_overrides(
            std::env::var(ENV_API_BASE_URL).ok(),
            std::env::var(ENV_SESSION_STORE).ok(),
        );
    }

    fn apply_overrides(&mut self, base_url: Option<String>, store: Option<String>) {
        if let Some(url) = base_url.filter(|u| !u.trim().is_empty()) {
            self.api_base_url = Some(url.trim().to_string());
        }
        if let Some(store) = store {
            match store.parse() {
                Ok(kind) => self.session_store = kind,
                Err(e) => warn!(error = %e, "Ignoring {}", ENV_SESSION_STORE),
            }
        }
    }

    pub fn api_base_url(&self) -> &str {
        self.api_base_url.as_deref().unwrap_or(DEFAULT_API_BASE_URL)
    }

    pub fn gateway_options(&self) -> GatewayOptions {
        let mut options = GatewayOptions::default();
        if let Some(secs) = self.refresh_timeout_secs.filter(|s| *s > 0) {
            options.refresh_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.expiry_margin_secs.filter(|s| *s >= 0) {
            options.expiry_margin = chrono::Duration::seconds(secs.min(MAX_EXPIRY_MARGIN_SECS));
        }
        options
    }

    /// Build the configured session store
    pub fn session_store(&self) -> Result<Arc<dyn SessionStore>> {
        Ok(match self.session_store {
            SessionStoreKind::File => Arc::new(FileSessionStore::new(self.cache_dir()?)),
            SessionStoreKind::Keyring => Arc::new(KeyringSessionStore::new()),
            SessionStoreKind::Memory => Arc::new(MemorySessionStore::new()),
        })
    }
}
