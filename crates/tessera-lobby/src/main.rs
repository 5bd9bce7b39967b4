//! Lobby server entry point.
//!
//! Run with: `cargo run -p tessera-lobby -- --port 61111`

use clap::Parser;
use tessera_config::{CliArgs, Config, default_config_dir};
use tessera_lobby::{LobbyServer, LobbyServerError, ServerConfig};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), LobbyServerError> {
    let args = CliArgs::parse();

    // File, then environment, then CLI.
    let config_dir = args.config.clone().or_else(default_config_dir);
    let mut config = match &config_dir {
        Some(dir) => Config::load_or_create(dir)?,
        None => Config::default(),
    };
    config.apply_process_env()?;
    config.apply_cli_overrides(&args);

    let log_dir = config_dir.as_ref().map(|dir| dir.join("logs"));
    tessera_log::init_logging(log_dir.as_deref(), cfg!(debug_assertions), Some(&config));

    info!("Tessera lobby");
    info!(
        "Rooms: up to {} slots | chat history: {} lines | connections: {}",
        config.lobby.max_room_slots, config.lobby.chat_history, config.lobby.max_connections
    );

    let server = LobbyServer::new(ServerConfig::from_config(&config)?);
    let listener = server.bind().await?;

    tokio::select! {
        result = server.run_with_listener(listener) => result?,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Ctrl-C received");
            server.shutdown();
            // Give connection tasks a moment to say goodbye.
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
    }
    Ok(())
}
