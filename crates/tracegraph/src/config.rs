//! Tracing and execution settings.
//!
//! Defaults come from the environment (`TRACEGRAPH_VALIDATE`, `TRACEGRAPH_REMOTE_TIMEOUT_MS`,
//! `TRACEGRAPH_WIRE_ENCODING`); a JSON document can override any subset of fields.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::env;

pub const DEFAULT_REMOTE_TIMEOUT_MS: u64 = 30_000;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    /// Compute proxy values while tracing so structural errors surface early.
    pub validate: bool,
    pub remote: RemoteConfig,
}

impl Default for TraceConfig {
    fn default() -> Self {
        TraceConfig {
            validate: env::validate_enabled(),
            remote: RemoteConfig::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub timeout_ms: u64,
    pub encoding: WireEncoding,
}

impl RemoteConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        RemoteConfig {
            timeout_ms: env::remote_timeout_ms().unwrap_or(DEFAULT_REMOTE_TIMEOUT_MS),
            encoding: env::wire_encoding()
                .and_then(WireEncoding::parse)
                .unwrap_or_default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireEncoding {
    Json,
    #[default]
    Bincode,
}

impl WireEncoding {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => Some(WireEncoding::Json),
            "bincode" | "binary" => Some(WireEncoding::Bincode),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Json(#[from] serde_json::Error),
}

impl TraceConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn with_validation(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }
}
