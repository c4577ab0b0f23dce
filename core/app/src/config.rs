//! Application configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use sehatlink_common::{Error, Result};
use sehatlink_storage::EngineChoice;
use sehatlink_sync::SyncConfig;

/// Longest admin session accepted: one year.
pub const MAX_SESSION_TTL_HOURS: i64 = 24 * 366;

/// Configuration for an [`crate::OfflineService`], stored as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Directory holding the record and ledger tables.
    pub data_dir: PathBuf,
    /// Storage engine name: `local` or `memory`.
    pub storage_engine: String,
    /// Run memory-only when the configured engine cannot be opened.
    pub fallback_to_memory: bool,
    /// Base URL of the remote authority. Without one the service stays
    /// offline and keeps every change pending.
    pub remote_url: Option<String>,
    /// URL probed to decide whether the device is online. Defaults to the
    /// remote URL.
    pub probe_url: Option<String>,
    pub probe_interval_secs: u64,
    /// Lifetime of an admin session.
    pub session_ttl_hours: i64,
    pub sync: SyncConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            storage_engine: "local".to_string(),
            fallback_to_memory: true,
            remote_url: None,
            probe_url: None,
            probe_interval_secs: 30,
            session_ttl_hours: 24,
            sync: SyncConfig::default(),
        }
    }
}

/// `<local data dir>/sehatlink`, or `./sehatlink` when the platform has none.
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sehatlink")
}

/// Default location of the config file.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sehatlink")
        .join("config.json")
}

impl AppConfig {
    /// Load a config file. Missing fields take their defaults.
    ///
    /// # Errors
    /// - `Config` if the file cannot be read, parsed, or fails validation
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Cannot read {}: {}", path.display(), e)))?;
        let config: AppConfig = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("Invalid config {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise return the defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Write the config as pretty JSON, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.engine_choice()?;
        if !(1..=MAX_SESSION_TTL_HOURS).contains(&self.session_ttl_hours) {
            return Err(Error::Config(format!(
                "session_ttl_hours must be between 1 and {}",
                MAX_SESSION_TTL_HOURS
            )));
        }
        if self.sync.submit_timeout_ms == 0 {
            return Err(Error::Config("sync.submit_timeout_ms must be positive".to_string()));
        }
        Ok(())
    }

    /// The configured storage engine, rooted at `data_dir`.
    pub fn engine_choice(&self) -> Result<EngineChoice> {
        EngineChoice::from_name(&self.storage_engine, &self.data_dir)
    }

    /// Session lifetime, clamped to the accepted range.
    pub fn session_ttl(&self) -> chrono::Duration {
        let hours = self.session_ttl_hours.clamp(1, MAX_SESSION_TTL_HOURS);
        chrono::Duration::try_hours(hours).unwrap_or_else(|| chrono::Duration::hours(24))
    }

    /// URL used for connectivity checks, if any.
    pub fn effective_probe_url(&self) -> Option<&str> {
        self.probe_url.as_deref().or(self.remote_url.as_deref())
    }
}
