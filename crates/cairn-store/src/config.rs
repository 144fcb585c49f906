use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable overriding the default base directory.
pub const CAIRN_HOME_ENV: &str = "CAIRN_HOME";

/// Storage layer configuration. All fields have defaults, so an empty
/// config section deserializes to a working setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory; sessions live under `<base>/sessions/`.
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
    /// History records retained per session before compaction.
    #[serde(default = "default_max_history")]
    pub max_history_records: usize,
    /// Checkpoints retained per session before compaction.
    #[serde(default = "default_max_checkpoints")]
    pub max_checkpoints: usize,
    /// Reserved: periodic backup of session directories.
    #[serde(default)]
    pub auto_backup: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            max_history_records: default_max_history(),
            max_checkpoints: default_max_checkpoints(),
            auto_backup: false,
        }
    }
}

impl StorageConfig {
    /// A config rooted at the given directory, defaults elsewhere.
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Self::default()
        }
    }

    /// Directory holding all session subdirectories.
    pub fn sessions_dir(&self) -> PathBuf {
        self.base_dir.join("sessions")
    }
}

fn default_base_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(CAIRN_HOME_ENV) {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cairn")
}

fn default_max_history() -> usize {
    1000
}

fn default_max_checkpoints() -> usize {
    50
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_deserializes_with_defaults() {
        let config: StorageConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.max_history_records, 1000);
        assert_eq!(config.max_checkpoints, 50);
        assert!(!config.auto_backup);
        assert!(config.sessions_dir().ends_with("sessions"));
    }

    #[test]
    fn explicit_base_dir_wins() {
        let config = StorageConfig::with_base_dir("/tmp/cairn-test");
        assert_eq!(config.sessions_dir(), PathBuf::from("/tmp/cairn-test/sessions"));
    }
}
