//! codemap-cache configuration management.
//!
//! Handles the configuration file at:
//! - Linux: ~/.config/codemap-cache/config.toml
//! - macOS: ~/Library/Application Support/codemap-cache/config.toml
//! - Windows: %APPDATA%\codemap-cache\config.toml
//!
//! A missing file yields defaults. A few settings can be overridden from the
//! environment (see [`CacheConfig::apply_env_overrides`]).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};
use crate::fs_utils;
use crate::key::CacheStrategy;

pub const ENV_CACHE_ROOT: &str = "CODEMAP_CACHE_ROOT";
pub const ENV_MAX_ENTRIES: &str = "CODEMAP_CACHE_MAX_ENTRIES";
pub const ENV_BUILD_STALE_SECS: &str = "CODEMAP_CACHE_BUILD_STALE_SECS";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Root for metadata, working copies and build artifacts
    pub cache_root: Option<PathBuf>,
    pub max_entries: usize,
    pub default_strategy: CacheStrategy,
    pub build_stale_after_secs: u64,
    pub clone_timeout_secs: u64,
    pub clone_stale_after_secs: u64,
    pub git_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    /// Extra environment variable names child processes may inherit
    pub passthrough_env: Vec<String>,
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_root: None,
            max_entries: 50,
            default_strategy: CacheStrategy::Shared,
            build_stale_after_secs: 30 * 60,
            clone_timeout_secs: 10 * 60,
            clone_stale_after_secs: 20 * 60,
            git_timeout_secs: 5 * 60,
            sweep_interval_secs: 60,
            passthrough_env: Vec::new(),
            engine: EngineConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Code-mapping engine invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub program: String,
    /// Argument template; see `CommandEngine` for placeholders
    pub args: Vec<String>,
    pub max_tokens: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: "codemap-engine".to_string(),
            args: [
                "map",
                "--root",
                "{root}",
                "--files-from",
                "{files}",
                "--max-tokens",
                "{max_tokens}",
                "--output",
                "{output}",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            max_tokens: 100_000,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

const LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

impl CacheConfig {
    /// Default location of the configuration file
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("codemap-cache")
            .join("config.toml")
    }

    /// Load from `path` (or the default location), apply environment
    /// overrides and validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);
        let mut config = Self::load_from(&path)?;
        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a configuration file; a missing file yields defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| {
            CacheError::config(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    /// Apply `CODEMAP_CACHE_*` overrides using `lookup` to read variables
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup(ENV_CACHE_ROOT).filter(|v| !v.trim().is_empty()) {
            self.cache_root = Some(PathBuf::from(root));
        }
        if let Some(raw) = lookup(ENV_MAX_ENTRIES) {
            self.max_entries = raw.trim().parse().map_err(|_| {
                CacheError::config(format!("{} must be a positive integer, got '{}'", ENV_MAX_ENTRIES, raw))
            })?;
        }
        if let Some(raw) = lookup(ENV_BUILD_STALE_SECS) {
            self.build_stale_after_secs = raw.trim().parse().map_err(|_| {
                CacheError::config(format!(
                    "{} must be a number of seconds, got '{}'",
                    ENV_BUILD_STALE_SECS, raw
                ))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_entries == 0 {
            return Err(CacheError::config("max_entries must be at least 1"));
        }
        for (name, value) in [
            ("build_stale_after_secs", self.build_stale_after_secs),
            ("clone_timeout_secs", self.clone_timeout_secs),
            ("clone_stale_after_secs", self.clone_stale_after_secs),
            ("git_timeout_secs", self.git_timeout_secs),
            ("sweep_interval_secs", self.sweep_interval_secs),
        ] {
            if value == 0 {
                return Err(CacheError::config(format!("{} must be at least 1", name)));
            }
        }
        if self.engine.program.trim().is_empty() {
            return Err(CacheError::config("engine.program must not be empty"));
        }
        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(CacheError::config(format!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                LOG_LEVELS.join(", ")
            )));
        }
        Ok(())
    }

    /// Effective cache root
    pub fn cache_root(&self) -> PathBuf {
        self.cache_root
            .clone()
            .unwrap_or_else(fs_utils::get_cache_base_dir)
    }

    pub fn build_stale_after(&self) -> Duration {
        Duration::from_secs(self.build_stale_after_secs)
    }

    pub fn clone_timeout(&self) -> Duration {
        Duration::from_secs(self.clone_timeout_secs)
    }

    pub fn clone_stale_after(&self) -> Duration {
        Duration::from_secs(self.clone_stale_after_secs)
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}
