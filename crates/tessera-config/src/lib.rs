//! Configuration for the Tessera networking stack.
//!
//! Settings persist to disk as a RON file. Environment variables override the
//! file for the embedding application; the lobby binary additionally accepts
//! clap CLI overrides.

mod cli;
mod config;
mod env;
mod error;

pub use cli::CliArgs;
pub use config::{Config, LobbyConfig, LogConfig, NetworkConfig, default_config_dir};
pub use env::ENV_PREFIX;
pub use error::ConfigError;
