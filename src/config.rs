//! Application paths and persisted loader settings.

use anyhow::{Context, Result};
use log::{debug, warn};
use std::path::{Path, PathBuf};

use crate::core::chunker::MAX_WORKERS;
use crate::core::progress::DEFAULT_PROGRESS_STEP;
use crate::core::workers::DEFAULT_READ_BLOCK;

/// Settings file name inside the config directory
pub const SETTINGS_FILE: &str = "meshvault.json";
/// Default log file name inside the data directory
pub const LOG_FILE: &str = "meshvault.log";

/// Configuration for overriding default application paths
#[derive(Debug, Clone)]
pub struct PathConfig {
    /// Custom config directory (from CLI or ENV)
    pub config_dir: Option<PathBuf>,
}

impl PathConfig {
    /// Create PathConfig from CLI arguments and environment variables
    ///
    /// Priority: CLI args → ENV var (MESHVAULT_CONFIG_DIR) → None (use defaults)
    pub fn from_env_and_cli(cli_dir: Option<PathBuf>) -> Self {
        let config_dir = cli_dir.or_else(|| {
            std::env::var("MESHVAULT_CONFIG_DIR")
                .ok()
                .map(PathBuf::from)
        });

        Self { config_dir }
    }
}

/// Get path to a configuration file
///
/// Priority:
/// 1. CLI --config-dir argument
/// 2. MESHVAULT_CONFIG_DIR environment variable
/// 3. Local folder IF any config files exist (meshvault.json, meshvault.log)
/// 4. Platform-specific config directory from dirs-next (default)
///
/// Platform paths:
/// - Linux: ~/.config/meshvault/{name}
/// - macOS: ~/Library/Application Support/meshvault/{name}
/// - Windows: %APPDATA%\meshvault\{name}
pub fn config_file(name: &str, config: &PathConfig) -> PathBuf {
    get_config_dir(config).join(name)
}

/// Get path to a data file (logs etc.)
///
/// Same priority as `config_file`, falling back to the platform data directory.
pub fn data_file(name: &str, config: &PathConfig) -> PathBuf {
    get_data_dir(config).join(name)
}

/// Ensure that configuration and data directories exist
pub fn ensure_dirs(config: &PathConfig) -> Result<()> {
    let config_dir = get_config_dir(config);
    let data_dir = get_data_dir(config);

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)
            .with_context(|| {
                format!("Failed to create config directory: {}", config_dir.display())
            })?;
    }

    // Only create data_dir if it's different from config_dir
    if data_dir != config_dir && !data_dir.exists() {
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;
    }

    Ok(())
}

fn has_local_config_files(dir: &Path) -> bool {
    [SETTINGS_FILE, LOG_FILE].iter().any(|f| dir.join(f).exists())
}

/// Resolve a base directory: override, then local config, then `platform_dir`/meshvault.
fn resolve_dir(config: &PathConfig, platform_dir: fn() -> Option<PathBuf>) -> PathBuf {
    if let Some(dir) = &config.config_dir {
        return dir.clone();
    }
    if let Ok(current_dir) = std::env::current_dir() {
        if has_local_config_files(&current_dir) {
            return current_dir;
        }
    }
    if let Some(dir) = platform_dir() {
        return dir.join("meshvault");
    }
    PathBuf::from(".")
}

fn get_config_dir(config: &PathConfig) -> PathBuf {
    resolve_dir(config, dirs_next::config_dir)
}

fn get_data_dir(config: &PathConfig) -> PathBuf {
    resolve_dir(config, dirs_next::data_dir)
}

/// Background loader settings
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct LoaderSettings {
    pub workers: Option<usize>, // None = auto (core count, file-size tier, memory)
    pub cpu_fraction: f64,      // Share of cores used when auto (default 0.75)
    pub progress_step: f64,     // Min progress delta between UI notifications (default 1%)
    pub read_block_size: u64,   // Bytes read between cancellation checks (default 4 MiB)
    pub memory_fraction: f64,   // Share of available RAM chunk buffers may use (default 50%)
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self {
            workers: None,
            cpu_fraction: 0.75,
            progress_step: DEFAULT_PROGRESS_STEP,
            read_block_size: DEFAULT_READ_BLOCK,
            memory_fraction: 0.5,
        }
    }
}

impl LoaderSettings {
    /// Clamp every field into its usable range.
    pub fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        self.workers = self.workers.map(|w| w.clamp(1, MAX_WORKERS));
        if !self.cpu_fraction.is_finite() {
            self.cpu_fraction = defaults.cpu_fraction;
        }
        self.cpu_fraction = self.cpu_fraction.clamp(0.05, 1.0);
        if !self.progress_step.is_finite() {
            self.progress_step = defaults.progress_step;
        }
        self.progress_step = self.progress_step.clamp(0.001, 0.1);
        self.read_block_size = self.read_block_size.clamp(64 * 1024, 64 * 1024 * 1024);
        if !self.memory_fraction.is_finite() {
            self.memory_fraction = defaults.memory_fraction;
        }
        self.memory_fraction = self.memory_fraction.clamp(0.05, 0.95);
        self
    }

    /// Load settings from `path`. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings: {}", path.display()))?;
        let settings: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse settings: {}", path.display()))?;
        let sanitized = settings.clone().sanitized();
        if sanitized != settings {
            warn!("Settings in {} were out of range and have been clamped", path.display());
        }
        Ok(sanitized)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write settings: {}", path.display()))?;
        Ok(())
    }
}
