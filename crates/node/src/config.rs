//! Node configuration, stored as `config.toml` in the data directory

use std::path::{Path, PathBuf};
use std::time::Duration;

use common::feed::ReplicationConfig;
use common::invitation::InvitationConfig;
use common::network::{SwarmConfig, Topology};
use serde::{Deserialize, Serialize};

pub const APP_NAME: &str = "strand";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const KEY_FILE_NAME: &str = "key.pem";
pub const METADATA_FILE_NAME: &str = "metadata.json";

fn default_log_level() -> String {
    "info".to_string()
}

fn default_invitation_timeout_secs() -> u64 {
    300
}

fn default_auth_code_length() -> usize {
    6
}

fn default_max_auth_attempts() -> usize {
    3
}

fn default_read_timeout_ms() -> u64 {
    10_000
}

fn default_reconnect_min_delay_ms() -> u64 {
    50
}

fn default_reconnect_max_delay_ms() -> u64 {
    16_000
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Where keys, metadata and feeds live; everything stays in memory when unset
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Default filter directive, overridable through `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Directory for daily log files (stdout only if not set)
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    #[serde(default = "default_invitation_timeout_secs")]
    pub invitation_timeout_secs: u64,
    #[serde(default = "default_auth_code_length")]
    pub auth_code_length: usize,
    #[serde(default = "default_max_auth_attempts")]
    pub max_auth_attempts: usize,

    /// Bound on waits for data a peer has to deliver
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_reconnect_min_delay_ms")]
    pub reconnect_min_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    #[serde(default)]
    pub topology: Topology,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            log_level: default_log_level(),
            log_dir: None,
            invitation_timeout_secs: default_invitation_timeout_secs(),
            auth_code_length: default_auth_code_length(),
            max_auth_attempts: default_max_auth_attempts(),
            read_timeout_ms: default_read_timeout_ms(),
            reconnect_min_delay_ms: default_reconnect_min_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            topology: Topology::default(),
        }
    }
}

impl NodeConfig {
    /// `~/.strand`, for callers that want a persistent node without choosing a path
    pub fn default_data_dir() -> Result<PathBuf, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::NoHomeDirectory)?;
        Ok(home.join(format!(".{}", APP_NAME)))
    }

    /// Load `config.toml` from `data_dir`, pointing the config at that directory
    ///
    /// Missing fields take their defaults.
    pub fn load(data_dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data_dir = data_dir.as_ref();
        let path = data_dir.join(CONFIG_FILE_NAME);
        if !path.exists() {
            return Err(ConfigError::MissingFile(path));
        }
        let mut config: NodeConfig = toml::from_str(&std::fs::read_to_string(&path)?)?;
        config.data_dir = Some(data_dir.to_path_buf());
        Ok(config)
    }

    /// Load the config in `data_dir`, writing a default one if there is none
    pub fn load_or_init(data_dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        match Self::load(&data_dir) {
            Err(ConfigError::MissingFile(_)) => {
                let config = NodeConfig {
                    data_dir: Some(data_dir.as_ref().to_path_buf()),
                    ..Default::default()
                };
                config.save()?;
                Ok(config)
            }
            loaded => loaded,
        }
    }

    /// Write the config to `config.toml` in its data directory
    pub fn save(&self) -> Result<(), ConfigError> {
        let data_dir = self.data_dir.as_ref().ok_or(ConfigError::NoDataDir)?;
        std::fs::create_dir_all(data_dir)?;
        std::fs::write(
            data_dir.join(CONFIG_FILE_NAME),
            toml::to_string_pretty(self)?,
        )?;
        Ok(())
    }

    pub fn log_level(&self) -> Result<tracing::Level, ConfigError> {
        self.log_level
            .parse()
            .map_err(|_| ConfigError::InvalidLogLevel(self.log_level.clone()))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn swarm_config(&self) -> SwarmConfig {
        SwarmConfig {
            topology: self.topology,
            reconnect_min_delay: Duration::from_millis(self.reconnect_min_delay_ms),
            reconnect_max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
        }
    }

    pub fn replication_config(&self) -> ReplicationConfig {
        ReplicationConfig {
            max_retry_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            ..Default::default()
        }
    }

    pub fn invitation_config(&self) -> InvitationConfig {
        InvitationConfig {
            timeout: Duration::from_secs(self.invitation_timeout_secs),
            auth_code_length: self.auth_code_length,
            max_auth_attempts: self.max_auth_attempts,
            handshake_timeout: self.read_timeout(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no home directory found")]
    NoHomeDirectory,

    #[error("config has no data directory")]
    NoDataDir,

    #[error("missing required file: {0:?}")]
    MissingFile(PathBuf),

    #[error("invalid log level: {0}")]
    InvalidLogLevel(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),
}
