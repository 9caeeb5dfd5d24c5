//! Client config load/save for `~/.agent-chat/config.yaml`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::transport::TransportConfig;

pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:8787";

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "AGENT_CHAT_CONFIG";

/// Agent endpoint.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ServerSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Stream transport tuning.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct TransportSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accept_unsolicited_resume: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_attempts: Option<u32>,
}

/// Durable transcript location.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct StoreSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Log level and output format (`pretty` or `json`).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct LoggingSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl Config {
    pub fn server_url(&self) -> &str {
        self.server.url.as_deref().unwrap_or(DEFAULT_SERVER_URL)
    }

    pub fn transport_config(&self) -> TransportConfig {
        let defaults = TransportConfig::default();
        TransportConfig {
            resume_timeout: self
                .transport
                .resume_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.resume_timeout),
            accept_unsolicited_resume: self
                .transport
                .accept_unsolicited_resume
                .unwrap_or(defaults.accept_unsolicited_resume),
        }
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.transport.reconnect_attempts.unwrap_or(3)
    }

    /// Transcript database path; defaults next to the config file.
    pub fn store_path(&self) -> Option<PathBuf> {
        match &self.store.path {
            Some(p) => Some(PathBuf::from(p)),
            None => Some(app_dir()?.join("transcript.db")),
        }
    }

    pub fn log_level(&self) -> &str {
        self.logging.level.as_deref().unwrap_or("info")
    }

    pub fn log_format(&self) -> &str {
        self.logging.format.as_deref().unwrap_or("pretty")
    }
}

fn app_dir() -> Option<PathBuf> {
    Some(home_dir()?.join(".agent-chat"))
}

/// Returns the default config file path: `~/.agent-chat/config.yaml`.
pub fn default_config_path() -> Option<PathBuf> {
    Some(app_dir()?.join("config.yaml"))
}

/// Resolve the config path from an explicit override, then `AGENT_CHAT_CONFIG`,
/// then the default location.
pub fn resolve_config_path(override_path: Option<&str>) -> Result<PathBuf, ConfigError> {
    if let Some(p) = override_path {
        return Ok(PathBuf::from(p));
    }
    if let Some(val) = std::env::var_os(CONFIG_ENV) {
        return Ok(PathBuf::from(val));
    }
    default_config_path().ok_or(ConfigError::NoPath)
}

#[cfg(unix)]
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

#[cfg(windows)]
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("USERPROFILE").map(PathBuf::from)
}

#[cfg(not(any(unix, windows)))]
fn home_dir() -> Option<PathBuf> {
    None
}

fn io_error(path: &Path, source: std::io::Error) -> ConfigError {
    ConfigError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Load config from a YAML file.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| io_error(path, e))?;
    serde_yaml::from_str(&contents).map_err(|source| ConfigError::Yaml {
        path: path.display().to_string(),
        source,
    })
}

/// Save config to a YAML file. Creates parent directory if missing.
pub fn save(path: &Path, config: &Config) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
        }
    }
    let contents = serde_yaml::to_string(config).map_err(|source| ConfigError::Yaml {
        path: path.display().to_string(),
        source,
    })?;
    std::fs::write(path, contents).map_err(|e| io_error(path, e))
}
