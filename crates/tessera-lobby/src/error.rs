//! Lobby server errors.

use tessera_config::ConfigError;

/// Errors that stop the lobby server from starting or running.
#[derive(Debug, thiserror::Error)]
pub enum LobbyServerError {
    /// Socket setup or accept failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// `bind_address:port` is not a socket address.
    #[error("invalid bind address {0:?}")]
    InvalidAddress(String),
}
