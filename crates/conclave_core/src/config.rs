//! Protocol timing and naming configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables shared by both transports. Defaults match the protocol constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Key prefix on the shared medium (`<namespace>.<slot>`).
    pub namespace: String,

    /// Default deadline for application calls.
    #[serde(with = "duration_millis")]
    pub call_timeout: Duration,

    /// How long an optimistic master claim waits for a competing write.
    #[serde(with = "duration_millis")]
    pub settle_window: Duration,

    /// Timeout of the first liveness check sent to an existing master.
    #[serde(with = "duration_millis")]
    pub check_timeout: Duration,

    /// Interval between follower liveness rounds.
    #[serde(with = "duration_millis")]
    pub master_heartbeat: Duration,

    /// Timeout of each check inside a liveness round.
    #[serde(with = "duration_millis")]
    pub master_check_timeout: Duration,

    /// Lower bound of checks per liveness round.
    pub master_retries_min: u32,

    /// Upper bound of checks per liveness round.
    pub master_retries_max: u32,

    /// Backoff step between checks; the n-th retry waits n steps.
    #[serde(with = "duration_millis")]
    pub master_retry_backoff: Duration,

    /// Interval between presence pings (first ping is immediate).
    #[serde(with = "duration_millis")]
    pub peer_heartbeat: Duration,

    /// Age after which a silent peer record is evicted.
    #[serde(with = "duration_millis")]
    pub zombie_threshold: Duration,

    /// Interval of the hub's presence rounds.
    #[serde(with = "duration_millis")]
    pub hub_heartbeat: Duration,

    /// How many times a client tries to acquire a hub before giving up.
    pub hub_attach_attempts: u32,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            namespace: "_CONCLAVE_".to_string(),
            call_timeout: Duration::from_millis(3000),
            settle_window: Duration::from_millis(100),
            check_timeout: Duration::from_millis(500),
            master_heartbeat: Duration::from_millis(1000),
            master_check_timeout: Duration::from_millis(1000),
            master_retries_min: 2,
            master_retries_max: 4,
            master_retry_backoff: Duration::from_millis(25),
            peer_heartbeat: Duration::from_millis(2500),
            zombie_threshold: Duration::from_millis(4000),
            hub_heartbeat: Duration::from_millis(500),
            hub_attach_attempts: 4,
        }
    }
}

impl CoordinationConfig {
    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create directory: {e}"))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {e}"))?;
        std::fs::write(path, json).map_err(|e| format!("Failed to write config file: {e}"))
    }

    /// Load config from a JSON file, or return defaults if the file is missing.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<CoordinationConfig>(&data) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Corrupt config file, using defaults: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read config file, using defaults: {e}");
                }
            }
        }
        Self::default()
    }
}

pub mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}
