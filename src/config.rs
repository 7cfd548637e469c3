use crate::catalog::ToolSpec;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from ctf-jobs.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub reaper: ReaperConfig,
    pub capture: CaptureConfig,
    pub jobs: JobsConfig,
    pub catalog: CatalogConfig,
    pub storage: StorageConfig,
    pub serve: ServeConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    pub poll_interval_ms: u64,
    pub grace_period_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub max_output_bytes: usize,
    pub event_buffer: usize,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub default_timeout_secs: Option<u64>,
    pub long_running_secs: u64,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct CatalogConfig {
    pub allow_network_tools: bool,
    pub tools: Vec<ToolSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub history_db: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServeConfig {
    pub bind: String,
    pub port: u16,
}

/// Errors that can occur while loading the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "invalid config {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

impl AppConfig {
    /// Load config from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        Self::parse(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }
}

impl ReaperConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

impl JobsConfig {
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn long_running(&self) -> Duration {
        Duration::from_secs(self.long_running_secs)
    }
}

// --- Default implementations ---

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            grace_period_ms: 2000,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_output_bytes: 1024 * 1024,
            event_buffer: 1024,
        }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: None,
            long_running_secs: 60,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            history_db: PathBuf::from("ctf-jobs.db"),
        }
    }
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8421,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::ToolCategory;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config.reaper.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.reaper.grace_period(), Duration::from_secs(2));
        assert_eq!(config.capture.max_output_bytes, 1024 * 1024);
        assert_eq!(config.jobs.default_timeout(), None);
        assert_eq!(config.jobs.long_running(), Duration::from_secs(60));
        assert!(!config.catalog.allow_network_tools);
        assert_eq!(config.serve.port, 8421);
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let config = AppConfig::parse(
            r#"
[reaper]
grace_period_ms = 500

[jobs]
default_timeout_secs = 300
"#,
        )
        .unwrap();
        assert_eq!(config.reaper.grace_period(), Duration::from_millis(500));
        assert_eq!(config.reaper.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.jobs.default_timeout(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_zero_timeout_means_none() {
        let config = AppConfig::parse("[jobs]\ndefault_timeout_secs = 0\n").unwrap();
        assert_eq!(config.jobs.default_timeout(), None);
    }

    #[test]
    fn test_tools_table() {
        let config = AppConfig::parse(
            r#"
[catalog]
allow_network_tools = true

[[catalog.tools]]
name = "steghide-info"
category = "Steganography & Media"
program = "steghide"
args = ["info", "{file}"]
"#,
        )
        .unwrap();
        assert!(config.catalog.allow_network_tools);
        let tool = &config.catalog.tools[0];
        assert_eq!(tool.name, "steghide-info");
        assert_eq!(tool.category, ToolCategory::Media);
        assert_eq!(tool.args, vec!["info", "{file}"]);
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.storage.history_db, PathBuf::from("ctf-jobs.db"));
    }

    #[test]
    fn test_load_invalid_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[reaper\npoll_interval_ms = ").unwrap();
        let err = AppConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("bad.toml"));
    }
}
