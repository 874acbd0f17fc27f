//! Application configuration.
//!
//! Configuration is loaded from a TOML file at:
//! 1. `$ATTACHFLOW_CONFIG` (environment variable)
//! 2. `~/.config/attachflow/config.toml` (Linux/macOS)
//!    `%APPDATA%\attachflow\config.toml` (Windows)
//! 3. Built-in defaults

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::archive::{ArchiveFilter, ArchiveFormat};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General behavior settings.
    pub general: GeneralConfig,
    /// Streaming and progress tuning.
    pub transfer: TransferConfig,
    /// Archive format used when a directory is attached.
    pub archive: ArchiveSettings,
    /// Defaults applied when preparing parts for sending.
    pub compose: ComposeConfig,
}

/// General behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Override cache directory for logs.
    pub cache_dir: Option<PathBuf>,
    /// Log level: "error", "warn", "info", "debug", "trace".
    pub log_level: String,
}

/// Streaming and progress tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Bytes read or written per suspension point (default: 4096).
    pub chunk_size: usize,
    /// Minimum milliseconds between two progress emissions (default: 200).
    pub progress_interval_ms: u64,
    /// Milliseconds the "cancelled" indicator stays up (default: 1000).
    pub cancel_reset_ms: u64,
}

/// Archive format and compression filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveSettings {
    /// Container format: "zip" or "tar".
    pub format: ArchiveFormat,
    /// Compression filter applied on top of the container: "none" or "gzip".
    pub filter: ArchiveFilter,
}

/// Defaults applied when preparing parts for sending.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComposeConfig {
    /// Charset label used for text parts that carry none.
    pub default_charset: String,
}

// ── Default implementations ─────────────────────────────────────

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            log_level: "warn".to_string(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 4096,
            progress_interval_ms: 200,
            cancel_reset_ms: 1000,
        }
    }
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            format: ArchiveFormat::Zip,
            filter: ArchiveFilter::None,
        }
    }
}

impl Default for ComposeConfig {
    fn default() -> Self {
        Self {
            default_charset: "utf-8".to_string(),
        }
    }
}

impl TransferConfig {
    /// Chunk size, never zero.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size.max(1)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn cancel_reset_delay(&self) -> Duration {
        Duration::from_millis(self.cancel_reset_ms)
    }
}

// ── Load / save ─────────────────────────────────────────────────

/// Load configuration, searching standard locations.
///
/// Returns the default configuration if no file is found or on parse error.
pub fn load_config() -> Config {
    if let Some(path) = config_file_path() {
        if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(contents) => match toml::from_str::<Config>(&contents) {
                    Ok(cfg) => {
                        tracing::info!(path = %path.display(), "Loaded config");
                        return cfg;
                    }
                    Err(e) => {
                        tracing::warn!(
                            path = %path.display(),
                            error = %e,
                            "Failed to parse config, using defaults"
                        );
                    }
                },
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to read config file, using defaults"
                    );
                }
            }
        }
    }
    Config::default()
}

/// Save configuration to the standard location.
pub fn save_config(config: &Config) -> anyhow::Result<PathBuf> {
    let path = config_file_path()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config file path"))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let contents = toml::to_string_pretty(config)?;
    std::fs::write(&path, contents)?;
    tracing::info!(path = %path.display(), "Saved config");
    Ok(path)
}

/// Determine the config file path (checking env var first, then standard dirs).
pub fn config_file_path() -> Option<PathBuf> {
    if let Ok(env_path) = std::env::var("ATTACHFLOW_CONFIG") {
        return Some(PathBuf::from(env_path));
    }

    dirs::config_dir().map(|d| d.join("attachflow").join("config.toml"))
}

/// Return the cache directory for logs.
pub fn cache_dir(config: &Config) -> PathBuf {
    if let Some(ref dir) = config.general.cache_dir {
        return dir.clone();
    }
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("attachflow")
}

/// Return the log file path.
pub fn log_file_path(config: &Config) -> PathBuf {
    cache_dir(config).join("attachflow.log")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.general.log_level, "warn");
        assert_eq!(cfg.transfer.chunk_size, 4096);
        assert_eq!(cfg.transfer.progress_interval(), Duration::from_millis(200));
        assert_eq!(cfg.transfer.cancel_reset_delay(), Duration::from_secs(1));
        assert_eq!(cfg.archive.format, ArchiveFormat::Zip);
        assert_eq!(cfg.archive.filter, ArchiveFilter::None);
    }

    #[test]
    fn test_serialize_deserialize_roundtrip() {
        let cfg = Config::default();
        let toml_str = toml::to_string_pretty(&cfg).expect("serialize");
        let parsed: Config = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.transfer.chunk_size, cfg.transfer.chunk_size);
        assert_eq!(parsed.archive, cfg.archive);
        assert_eq!(parsed.compose.default_charset, "utf-8");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let partial = r#"
[archive]
format = "tar"
filter = "gzip"

[transfer]
chunk_size = 0
"#;
        let cfg: Config = toml::from_str(partial).expect("parse partial");
        assert_eq!(cfg.archive.format, ArchiveFormat::Tar);
        assert_eq!(cfg.archive.filter, ArchiveFilter::Gzip);
        assert_eq!(cfg.transfer.chunk_size(), 1);
        assert_eq!(cfg.transfer.progress_interval_ms, 200);
        assert_eq!(cfg.general.log_level, "warn");
    }

    #[test]
    fn test_log_file_under_cache_dir() {
        let mut cfg = Config::default();
        cfg.general.cache_dir = Some(PathBuf::from("/var/tmp/af"));
        assert_eq!(log_file_path(&cfg), PathBuf::from("/var/tmp/af/attachflow.log"));
    }
}
