//! Engine configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Configuration-loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file missing
    #[error("configuration file not found: {0}")]
    NotFound(String),

    /// Configuration file unreadable
    #[error("could not read {path}: {source}")]
    Read {
        /// Offending path.
        path: String,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// Malformed TOML
    #[error("could not parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Detection mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Enforce: matched block-rules and threshold breaches return 403
    #[default]
    Block,
    /// Observe: always allow, still score and log every match
    Detect,
}

impl Mode {
    /// Whether this mode enforces blocking decisions.
    pub fn should_block(&self) -> bool {
        matches!(self, Self::Block)
    }
}

/// Engine configuration, loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Inspection listener address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Path accepting the JSON ingest envelope
    #[serde(default = "default_ingest_path")]
    pub ingest_path: String,

    /// Rule-definition directory
    #[serde(default = "default_rules_dir")]
    pub rules_dir: String,

    /// Match-log sink file; in-memory only when unset
    #[serde(default = "default_log_path")]
    pub log_path: Option<String>,

    /// Maximum body size inspected, in bytes
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,

    /// Critical-score threshold that forces a block
    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: u32,

    /// Verdict when evaluation fails internally: false allows (the
    /// default), true blocks
    #[serde(default)]
    pub fail_closed: bool,

    /// Detection mode
    #[serde(default)]
    pub mode: Mode,
}

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_ingest_path() -> String {
    "/ingest".to_string()
}

fn default_rules_dir() -> String {
    "parsed_rules".to_string()
}

fn default_log_path() -> Option<String> {
    Some("waf.log".to_string())
}

fn default_max_body_size() -> usize {
    1024 * 1024
}

fn default_critical_threshold() -> u32 {
    5
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            ingest_path: default_ingest_path(),
            rules_dir: default_rules_dir(),
            log_path: default_log_path(),
            max_body_size: default_max_body_size(),
            critical_threshold: default_critical_threshold(),
            fail_closed: false,
            mode: Mode::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration, falling back to defaults when the file does
    /// not exist.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}
