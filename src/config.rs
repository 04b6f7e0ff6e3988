use crate::error::InvalidConfig;
use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix, e.g. `SWARMTRADE__BAN__BAN_MISBEHAVING_PEERS=false`
pub const ENV_PREFIX: &str = "SWARMTRADE";

/// Which ban-list checks apply when admitting a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BanConfig {
    /// Refuse peers that previously sent a malformed extended message
    pub ban_malformed_senders: bool,

    /// Refuse peers that previously misbehaved
    pub ban_misbehaving_peers: bool,
}

impl Default for BanConfig {
    fn default() -> Self {
        Self {
            ban_malformed_senders: true,
            ban_misbehaving_peers: true,
        }
    }
}

/// How the transport's own piece exchange is suppressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportInteraction {
    /// Leave plain BitTorrent behaviour alone
    #[default]
    None,
    /// Choke peers and ignore their requests
    BlockUploading,
    /// Stay uninterested and ignore inbound pieces
    BlockDownloading,
    BlockUploadingAndDownloading,
}

/// Buy-mode bound on how long a seller may take to service one piece
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PieceTimeoutConfig {
    pub target_rate_bytes_per_sec: f64,
    pub min_timeout_secs: f64,
}

impl Default for PieceTimeoutConfig {
    fn default() -> Self {
        Self {
            target_rate_bytes_per_sec: 10_000.0,
            min_timeout_secs: 3.0,
        }
    }
}

impl PieceTimeoutConfig {
    /// Whole seconds to service a piece of `piece_length` bytes at the target rate
    pub fn piece_timeout(&self, piece_length: u64) -> Duration {
        let target = (piece_length as f64 / self.target_rate_bytes_per_sec).ceil();
        Duration::from_secs(target.max(self.min_timeout_secs) as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

/// Coordinator configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub interaction: TransportInteraction,
    pub ban: BanConfig,
    pub piece_timeout: PieceTimeoutConfig,
    pub log: LogConfig,
}

impl CoordinatorConfig {
    /// Defaults, then an optional TOML file, then `SWARMTRADE__*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }

        builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Check values the types cannot rule out
    pub fn validate(&self) -> Result<(), InvalidConfig> {
        let timeout = &self.piece_timeout;
        if !(timeout.target_rate_bytes_per_sec > 0.0) {
            return Err(InvalidConfig::NonPositiveRate(
                timeout.target_rate_bytes_per_sec,
            ));
        }
        if timeout.min_timeout_secs < 0.0 {
            return Err(InvalidConfig::NegativeMinTimeout(timeout.min_timeout_secs));
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}
