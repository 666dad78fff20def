use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use plume_nowcast::{BreakpointTable, CorrectionTable, NowCastSettings};
use plume_upstream::UpstreamConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("unknown correction table: {0}")]
    UnknownCorrection(String),
    #[error("unknown breakpoint table: {0}")]
    UnknownBreakpoints(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub upstream: UpstreamSection,
    pub aqi: AqiConfig,
    pub coordinator: CoordinatorConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        // fail at startup rather than on the first tick
        config.nowcast_settings()?;
        Ok(config)
    }

    pub fn nowcast_settings(&self) -> Result<NowCastSettings, ConfigError> {
        let correction = CorrectionTable::by_name(&self.aqi.correction)
            .ok_or_else(|| ConfigError::UnknownCorrection(self.aqi.correction.clone()))?;
        let breakpoints = BreakpointTable::by_name(&self.aqi.breakpoints)
            .ok_or_else(|| ConfigError::UnknownBreakpoints(self.aqi.breakpoints.clone()))?;

        Ok(NowCastSettings {
            correction,
            breakpoints,
            ..NowCastSettings::default()
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    #[default]
    Memory,
    Sqlite {
        path: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamMode {
    #[default]
    Http,
    Simulated,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamSection {
    pub mode: UpstreamMode,
    #[serde(flatten)]
    pub http: UpstreamConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AqiConfig {
    pub correction: String,
    pub breakpoints: String,
}

impl Default for AqiConfig {
    fn default() -> Self {
        Self {
            correction: "epa-2021".to_string(),
            breakpoints: "epa-2012".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Batch requests allowed in flight at once, across credential groups.
    pub max_in_flight: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self { max_in_flight: 4 }
    }
}
