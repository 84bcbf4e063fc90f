//! Application paths, persisted settings and the on-disk preference store.

use anyhow::{Context, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::engine_manager::EngineConfig;
use crate::core::instance_pool::PoolConfig;
use crate::core::perf_monitor::MonitorConfig;
use crate::core::resource_manager::ResourceConfig;
use crate::core::scheduler::SchedulerConfig;
use crate::entities::{PreferenceStore, UserPreferences};

pub const SETTINGS_FILE: &str = "choreo.json";
pub const PREFS_FILE: &str = "choreo_prefs.json";
pub const LOG_FILE: &str = "choreo.log";

/// Configuration for overriding default application paths
#[derive(Debug, Clone, Default)]
pub struct PathConfig {
    /// Custom config directory (from CLI or ENV)
    pub config_dir: Option<PathBuf>,
}

impl PathConfig {
    /// Priority: CLI args → ENV var (CHOREO_CONFIG_DIR) → None (use defaults)
    pub fn from_env_and_cli(cli_dir: Option<PathBuf>) -> Self {
        let config_dir = cli_dir.or_else(|| std::env::var("CHOREO_CONFIG_DIR").ok().map(PathBuf::from));
        Self { config_dir }
    }

    /// Resolved config directory.
    ///
    /// Priority:
    /// 1. CLI --config-dir argument
    /// 2. CHOREO_CONFIG_DIR environment variable
    /// 3. Platform-specific config directory from dirs-next
    /// 4. "."
    pub fn dir(&self) -> PathBuf {
        if let Some(dir) = &self.config_dir {
            return dir.clone();
        }
        if let Some(dir) = dirs_next::config_dir() {
            return dir.join("choreo");
        }
        PathBuf::from(".")
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.dir().join(name)
    }

    /// Create the config directory if missing.
    pub fn ensure_dir(&self) -> Result<()> {
        let dir = self.dir();
        if !dir.exists() {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Tunables for every component. Missing keys fall back to defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub max_concurrent: usize,
    /// 0 = wait for a slot indefinitely
    pub slot_wait_timeout_ms: u64,
    pub record_retention_secs: u64,
    pub cache_max_entries: usize,
    pub pool_max_instances: usize,
    pub load_timeout_ms: u64,
    pub pool_grace_secs: u64,
    pub memory_pressure_ratio: f64,
    pub memory_check_secs: u64,
    pub hidden_cleanup_secs: u64,
    pub history_len: usize,
    pub recipe_idle_secs: u64,
    /// 0 = auto from core count
    pub loader_threads: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff_ms: 1000,
            max_concurrent: 10,
            slot_wait_timeout_ms: 0,
            record_retention_secs: 600,
            cache_max_entries: 50,
            pool_max_instances: 20,
            load_timeout_ms: 10_000,
            pool_grace_secs: 300,
            memory_pressure_ratio: 0.8,
            memory_check_secs: 30,
            hidden_cleanup_secs: 5,
            history_len: 100,
            recipe_idle_secs: 300,
            loader_threads: 0,
        }
    }
}

impl Settings {
    /// Load from `path`; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let json =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read settings: {}", path.display()))?;
        let settings: Settings =
            serde_json::from_str(&json).with_context(|| format!("Failed to parse settings: {}", path.display()))?;
        Ok(settings.sanitized())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;
        std::fs::write(path, json).with_context(|| format!("Failed to write settings: {}", path.display()))
    }

    /// Clamp values that would stall or disable a component.
    pub fn sanitized(mut self) -> Self {
        if self.max_concurrent == 0 {
            warn!("max_concurrent=0 would block every animation, using 1");
            self.max_concurrent = 1;
        }
        self.max_retries = self.max_retries.max(1);
        self.cache_max_entries = self.cache_max_entries.max(1);
        self.pool_max_instances = self.pool_max_instances.max(1);
        self.history_len = self.history_len.max(1);
        if !(self.memory_pressure_ratio > 0.0 && self.memory_pressure_ratio <= 1.0) {
            warn!("memory_pressure_ratio {} out of (0, 1], using 0.8", self.memory_pressure_ratio);
            self.memory_pressure_ratio = 0.8;
        }
        self
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_retries: self.max_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            retention: Duration::from_secs(self.record_retention_secs),
        }
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            max_concurrent: self.max_concurrent,
            slot_wait_timeout: (self.slot_wait_timeout_ms > 0).then(|| Duration::from_millis(self.slot_wait_timeout_ms)),
            recipe_idle: Duration::from_secs(self.recipe_idle_secs),
        }
    }

    pub fn resources(&self) -> ResourceConfig {
        ResourceConfig {
            max_entries: self.cache_max_entries,
            load_timeout: Duration::from_millis(self.load_timeout_ms),
            pool: PoolConfig {
                max_instances: self.pool_max_instances,
                grace: Duration::from_secs(self.pool_grace_secs),
                ..PoolConfig::default()
            },
            memory_pressure_ratio: self.memory_pressure_ratio,
            memory_check_interval: Duration::from_secs(self.memory_check_secs),
            hidden_cleanup_after: Duration::from_secs(self.hidden_cleanup_secs),
            loader_threads: self.loader_threads,
        }
    }

    pub fn monitor(&self) -> MonitorConfig {
        MonitorConfig {
            history_len: self.history_len,
            ..MonitorConfig::default()
        }
    }
}

/// User preferences persisted as pretty JSON.
#[derive(Debug, Clone)]
pub struct JsonPreferenceStore {
    path: PathBuf,
}

impl JsonPreferenceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_dir(paths: &PathConfig) -> Self {
        Self::new(paths.file(PREFS_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PreferenceStore for JsonPreferenceStore {
    fn load(&self) -> Result<Option<UserPreferences>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let json = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read preferences: {}", self.path.display()))?;
        let prefs = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse preferences: {}", self.path.display()))?;
        Ok(Some(prefs))
    }

    fn save(&self, prefs: &UserPreferences) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(prefs).context("Failed to serialize preferences")?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("Failed to write preferences: {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("choreo-test-{}-{}", tag, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_file_with_custom_dir() {
        let config = PathConfig {
            config_dir: Some(PathBuf::from("/custom")),
        };
        assert_eq!(config.file("test.json"), PathBuf::from("/custom/test.json"));
    }

    #[test]
    fn test_cli_dir_wins() {
        let config = PathConfig::from_env_and_cli(Some(PathBuf::from("/from-cli")));
        assert_eq!(config.dir(), PathBuf::from("/from-cli"));
    }

    #[test]
    fn test_settings_partial_json() {
        let settings: Settings = serde_json::from_str(r#"{ "max_retries": 5, "max_concurrent": 4 }"#).unwrap();
        assert_eq!(settings.max_retries, 5);
        assert_eq!(settings.max_concurrent, 4);
        assert_eq!(settings.cache_max_entries, 50);
        assert_eq!(settings.engine().slot_wait_timeout, None);
        assert_eq!(settings.scheduler().retry_backoff, Duration::from_secs(1));
    }

    #[test]
    fn test_settings_save_load() {
        let dir = temp_dir("settings");
        let path = dir.join(SETTINGS_FILE);
        assert_eq!(Settings::load(&path).unwrap(), Settings::default());

        let settings = Settings {
            slot_wait_timeout_ms: 250,
            ..Settings::default()
        };
        settings.save(&path).unwrap();
        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded, settings);
        assert_eq!(loaded.engine().slot_wait_timeout, Some(Duration::from_millis(250)));
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_settings_sanitized() {
        let settings = Settings {
            max_concurrent: 0,
            memory_pressure_ratio: 3.0,
            ..Settings::default()
        }
        .sanitized();
        assert_eq!(settings.max_concurrent, 1);
        assert_eq!(settings.memory_pressure_ratio, 0.8);
    }

    #[test]
    fn test_bad_settings_error_has_context() {
        let dir = temp_dir("bad");
        let path = dir.join(SETTINGS_FILE);
        std::fs::write(&path, "{ not json").unwrap();
        let err = Settings::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse settings"));
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_json_preference_store() {
        let dir = temp_dir("prefs");
        let store = JsonPreferenceStore::new(dir.join("nested").join(PREFS_FILE));
        assert_eq!(store.load().unwrap(), None);

        let prefs = UserPreferences {
            reduce_motion: true,
            ..UserPreferences::default()
        };
        store.save(&prefs).unwrap();
        assert_eq!(store.load().unwrap(), Some(prefs));
        std::fs::remove_dir_all(dir).ok();
    }
}
