//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const CONFIG_FILE: &str = "config.ron";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Peer-side networking: where the lobby is and how to reach it.
    pub network: NetworkConfig,
    /// Lobby server settings (used by the lobby binary only).
    pub lobby: LobbyConfig,
    /// Logging settings.
    pub log: LogConfig,
}

/// Peer-side networking configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Lobby server host name or IP.
    pub lobby_address: String,
    /// Lobby server port.
    pub lobby_port: u16,
    /// Local port for direct peer connections (0 = ephemeral).
    pub bind_port: u16,
    /// Maximum simultaneous transport connections.
    pub max_connections: usize,
    /// Application identifier used to filter room searches.
    pub app_id: String,
    /// Secret shared with the lobby for the connection handshake.
    pub shared_secret: String,
    /// How long a lobby request may stay unanswered before it is failed.
    pub request_timeout_ms: u64,
    /// Maximum frame payload in bytes.
    pub max_payload_size: u32,
    /// Tell the lobby our listening port so peers can dial us directly.
    /// When off, every peer reaches us through the lobby relay.
    pub advertise_listen_port: bool,
}

/// Lobby server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LobbyConfig {
    /// Address to bind the lobby listener to.
    pub bind_address: String,
    /// Lobby listener port.
    pub port: u16,
    /// Maximum concurrent lobby connections.
    pub max_connections: usize,
    /// Number of chat lines kept for history queries.
    pub chat_history: usize,
    /// Upper bound on the slot count of any room.
    pub max_room_slots: u8,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive (e.g., "info", "debug,tessera_net=trace").
    pub level: String,
}

// --- Default implementations ---

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            lobby_address: "127.0.0.1".to_string(),
            lobby_port: 61111,
            bind_port: 0,
            max_connections: 8,
            app_id: "tessera".to_string(),
            shared_secret: "tessera-shared-secret".to_string(),
            request_timeout_ms: 10_000,
            max_payload_size: 1_048_576,
            advertise_listen_port: true,
        }
    }
}

impl Default for LobbyConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 61111,
            max_connections: 256,
            chat_history: 50,
            max_room_slots: 4,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl NetworkConfig {
    /// `lobby_address:lobby_port` as a connect target.
    pub fn lobby_endpoint(&self) -> String {
        format!("{}:{}", self.lobby_address, self.lobby_port)
    }

    /// Pending-request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Platform configuration directory for Tessera, if the OS exposes one.
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("tessera"))
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);
        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(config_dir.join(CONFIG_FILE), serialized).map_err(ConfigError::WriteError)
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let contents =
            std::fs::read_to_string(config_dir.join(CONFIG_FILE)).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}
