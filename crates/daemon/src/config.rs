use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::OperationError;
use crate::ops::convert::{ReplaceMode, UpmixPolicy};
use crate::paths::PathMapping;

/// Configuration for the safe-mover daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoverConfig {
    /// Catalog service host (without scheme)
    pub catalog_host: String,
    /// Catalog service port
    pub catalog_port: u16,
    /// API key sent in the X-Api-Key header
    pub catalog_api_key: String,
    /// Fast-tier root folder in the catalog's path space
    pub fast_root: String,
    /// Slow-tier root folder in the catalog's path space
    pub slow_root: String,
    /// Ordered catalog-prefix -> host-prefix substitutions
    pub path_mappings: Vec<PathMapping>,
    /// How many terminal outcomes each queue's history retains
    pub history_retention: usize,
    /// Directory where queue, history and command files are stored
    pub data_dir: PathBuf,
    /// Scratch directory for the extracted audio track
    pub temp_dir: PathBuf,
    /// Path to the rsync binary
    pub rsync_bin: PathBuf,
    /// Path to the ffmpeg binary
    pub ffmpeg_bin: PathBuf,
    /// Path to the ffprobe binary
    pub ffprobe_bin: PathBuf,
    /// Whether the convert handler replaces the original in place or keeps
    /// a backup copy of it
    pub replace_mode: ReplaceMode,
    /// Channel mapping policy for the 5.1(side) -> 7.1 upmix
    pub upmix: UpmixPolicy,
    /// Seconds a queue worker sleeps between checks when idle
    pub idle_poll_secs: u64,
}

impl Default for MoverConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl MoverConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            catalog_host: String::new(),
            catalog_port: 7878,
            catalog_api_key: String::new(),
            fast_root: String::new(),
            slow_root: String::new(),
            path_mappings: Vec::new(),
            history_retention: 5,
            data_dir: PathBuf::from("data"),
            temp_dir: PathBuf::from("/tmp"),
            rsync_bin: PathBuf::from("rsync"),
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            replace_mode: ReplaceMode::InPlace,
            upmix: UpmixPolicy::DuplicateRears,
            idle_poll_secs: 1,
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // Try JSON first, then TOML
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    let file_config: MoverConfig = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                    config = file_config;
                } else {
                    let file_config: MoverConfig = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                    config = file_config;
                }
            }
        }

        Ok(config)
    }

    /// Check that the settings every operation depends on are present.
    /// Handlers call this before touching any file.
    pub fn validate(&self) -> Result<(), OperationError> {
        if self.catalog_host.is_empty() {
            return Err(OperationError::Configuration(
                "catalog host is not configured".to_string(),
            ));
        }
        if self.fast_root.is_empty() || self.slow_root.is_empty() {
            return Err(OperationError::Configuration(
                "fast/slow tier root folders are not configured".to_string(),
            ));
        }
        Ok(())
    }

    /// Queue state file for the named queue
    pub fn queue_file(&self, name: &str) -> PathBuf {
        self.data_dir.join(format!("{}_queue.json", name))
    }

    /// History file for the named queue
    pub fn history_file(&self, name: &str) -> PathBuf {
        self.data_dir.join(format!("{}_history.json", name))
    }

    /// Directory where control command files are dropped for the daemon
    pub fn command_dir(&self) -> PathBuf {
        self.data_dir.join("commands")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = MoverConfig::default_config();
        assert_eq!(cfg.history_retention, 5);
        assert_eq!(cfg.idle_poll_secs, 1);
        assert_eq!(cfg.rsync_bin, PathBuf::from("rsync"));
        assert_eq!(cfg.replace_mode, ReplaceMode::InPlace);
        assert_eq!(cfg.upmix, UpmixPolicy::DuplicateRears);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let cfg = MoverConfig::load_config(Some(Path::new("/nonexistent/config.json"))).unwrap();
        assert_eq!(cfg.catalog_port, 7878);
    }

    #[test]
    fn test_load_json_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut cfg = MoverConfig::default_config();
        cfg.catalog_host = "radarr.local".to_string();
        cfg.fast_root = "/movies_ssd".to_string();
        cfg.slow_root = "/movies_hdd".to_string();
        cfg.history_retention = 10;
        std::fs::write(&path, serde_json::to_string_pretty(&cfg).unwrap()).unwrap();

        let loaded = MoverConfig::load_config(Some(&path)).unwrap();
        assert_eq!(loaded.catalog_host, "radarr.local");
        assert_eq!(loaded.history_retention, 10);
        assert!(loaded.validate().is_ok());
    }

    #[test]
    fn test_load_toml_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut cfg = MoverConfig::default_config();
        cfg.catalog_host = "radarr.local".to_string();
        std::fs::write(&path, toml::to_string(&cfg).unwrap()).unwrap();

        let loaded = MoverConfig::load_config(Some(&path)).unwrap();
        assert_eq!(loaded.catalog_host, "radarr.local");
    }

    #[test]
    fn test_validate_rejects_missing_roots() {
        let mut cfg = MoverConfig::default_config();
        cfg.catalog_host = "radarr.local".to_string();
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, OperationError::Configuration(_)));
    }

    #[test]
    fn test_data_file_paths() {
        let cfg = MoverConfig::default_config();
        assert_eq!(cfg.queue_file("copy"), PathBuf::from("data/copy_queue.json"));
        assert_eq!(cfg.history_file("convert"), PathBuf::from("data/convert_history.json"));
        assert_eq!(cfg.command_dir(), PathBuf::from("data/commands"));
    }
}
