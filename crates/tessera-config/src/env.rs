//! Environment-variable overrides.
//!
//! The embedding application has no command line of its own, so the
//! networking settings it needs most often can be overridden with
//! `TESSERA_*` variables. Unknown `TESSERA_*` keys are ignored.

use std::str::FromStr;

use crate::Config;
use crate::error::ConfigError;

/// Prefix shared by every recognised variable.
pub const ENV_PREFIX: &str = "TESSERA_";

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

impl Config {
    /// Apply overrides from key/value pairs (normally `std::env::vars()`).
    pub fn apply_env_overrides<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "LOBBY_ADDRESS" => self.network.lobby_address = value,
                "LOBBY_PORT" => self.network.lobby_port = parse(&key, &value)?,
                "BIND_PORT" => self.network.bind_port = parse(&key, &value)?,
                "APP_ID" => self.network.app_id = value,
                "SHARED_SECRET" => self.network.shared_secret = value,
                "REQUEST_TIMEOUT_MS" => self.network.request_timeout_ms = parse(&key, &value)?,
                "ADVERTISE_PORT" => self.network.advertise_listen_port = parse(&key, &value)?,
                "LOG" => self.log.level = value,
                _ => continue,
            }
            log::debug!("Config override from {key}");
        }
        Ok(())
    }

    /// Apply overrides from the process environment.
    pub fn apply_process_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_overrides(std::env::vars())
    }
}
