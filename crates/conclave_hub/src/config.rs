//! Configuration of the `conclave-hub` executable.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use conclave_core::CoordinationConfig;
use conclave_core::logging::DEFAULT_FILTER;

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "CONCLAVE_HUB_CONFIG";

pub const DEFAULT_PORT: u16 = 9477;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Address the WebSocket listener binds to.
    pub listen_addr: SocketAddr,
    /// Write daily log files here in addition to the console.
    pub log_dir: Option<PathBuf>,
    /// `EnvFilter` directive; `RUST_LOG` still wins when set.
    pub log_filter: String,
    pub coordination: CoordinationConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            log_dir: None,
            log_filter: DEFAULT_FILTER.to_string(),
            coordination: CoordinationConfig::default(),
        }
    }
}

impl HubConfig {
    /// `$CONCLAVE_HUB_CONFIG`, or `<config dir>/conclave/hub.json`.
    pub fn config_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Ok(PathBuf::from(path));
        }
        let base = dirs::config_dir().context("Could not determine config directory")?;
        Ok(base.join("conclave").join("hub.json"))
    }

    pub fn load() -> Result<Self> {
        Ok(Self::load_or_default(&Self::config_path()?))
    }

    /// Load from `path`. A missing or unreadable file yields the defaults.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match std::fs::read_to_string(path) {
            Ok(data) => match serde_json::from_str(&data) {
                Ok(config) => {
                    info!("Loaded hub config from {}", path.display());
                    config
                }
                Err(e) => {
                    warn!("Corrupt hub config, using defaults: {e}");
                    Self::default()
                }
            },
            Err(e) => {
                warn!("Cannot read hub config, using defaults: {e}");
                Self::default()
            }
        }
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }
}
