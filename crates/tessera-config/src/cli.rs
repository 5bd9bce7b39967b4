//! Command-line arguments for the lobby server binary.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Tessera lobby server arguments.
///
/// CLI values override settings loaded from `config.ron` and the environment.
#[derive(Parser, Debug, Default)]
#[command(name = "tessera-lobby", about = "Tessera lobby server")]
pub struct CliArgs {
    /// Address to bind the listener to.
    #[arg(long)]
    pub bind: Option<String>,

    /// Listener port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Shared secret for the connection handshake.
    #[arg(long)]
    pub secret: Option<String>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref bind) = args.bind {
            self.lobby.bind_address = bind.clone();
        }
        if let Some(port) = args.port {
            self.lobby.port = port;
        }
        if let Some(ref secret) = args.secret {
            self.network.shared_secret = secret.clone();
        }
        if let Some(ref level) = args.log_level {
            self.log.level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            port: Some(9000),
            secret: Some("s3cret".to_string()),
            ..CliArgs::default()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.lobby.port, 9000);
        assert_eq!(config.network.shared_secret, "s3cret");
        assert_eq!(config.lobby.bind_address, "0.0.0.0");
    }

    #[test]
    fn test_cli_no_override() {
        let mut config = Config::default();
        config.apply_cli_overrides(&CliArgs::default());
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_cli_parses_flags() {
        let args = CliArgs::parse_from(["tessera-lobby", "--port", "7100", "--log-level", "debug"]);
        assert_eq!(args.port, Some(7100));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
    }
}
