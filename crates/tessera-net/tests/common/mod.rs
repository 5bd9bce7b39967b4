//! Shared harness: a real lobby on an ephemeral port and players that drive
//! a `NetworkSubsystem` against it.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tessera_config::{Config, NetworkConfig};
use tessera_lobby::{LobbyServer, ServerConfig};
use tessera_net::{
    LobbyEvent, NetSystem, NetworkSubsystem, PlayerEndpoint, ReceiveStatus, ReceptionNotifier,
    SubsystemEvent,
};
use tessera_protocol::{
    FrameConfig, NumericPlayerId, Packet, PeerId, read_packet, write_packet,
};
use tokio::runtime::Runtime;

pub const SECRET: &str = "integration-secret";
pub const APP_ID: &str = "integration";
pub const TIMEOUT: Duration = Duration::from_secs(10);

fn io_runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("test-lobby")
        .enable_all()
        .build()
        .unwrap()
}

/// Network settings pointing at a lobby on `port`.
pub fn network_config(port: u16) -> NetworkConfig {
    NetworkConfig {
        lobby_address: "127.0.0.1".into(),
        lobby_port: port,
        app_id: APP_ID.into(),
        shared_secret: SECRET.into(),
        request_timeout_ms: 5_000,
        ..NetworkConfig::default()
    }
}

/// Poll `condition` until it holds or [`TIMEOUT`] passes.
pub fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}

// ---------------------------------------------------------------------------
// Lobby
// ---------------------------------------------------------------------------

/// A lobby server running on its own runtime.
pub struct TestLobby {
    pub server: Arc<LobbyServer>,
    pub port: u16,
    runtime: Runtime,
}

impl TestLobby {
    pub fn start() -> Self {
        tessera_log::init_logging(None, false, None);

        let mut config = Config::default();
        config.lobby.bind_address = "127.0.0.1".into();
        config.lobby.port = 0;
        config.network.shared_secret = SECRET.into();

        let runtime = io_runtime();
        let server = Arc::new(LobbyServer::new(ServerConfig::from_config(&config).unwrap()));
        let listener = runtime.block_on(server.bind()).unwrap();
        let port = listener.local_addr().unwrap().port();
        let srv = Arc::clone(&server);
        runtime.spawn(async move {
            let _ = srv.run_with_listener(listener).await;
        });
        Self {
            server,
            port,
            runtime,
        }
    }

    pub fn network_config(&self) -> NetworkConfig {
        network_config(self.port)
    }
}

impl Drop for TestLobby {
    fn drop(&mut self) {
        self.server.shutdown();
    }
}

/// A lobby that completes the handshake and then never answers.
pub struct SilentLobby {
    pub port: u16,
    runtime: Runtime,
}

impl SilentLobby {
    pub fn start() -> Self {
        let runtime = io_runtime();
        let listener = runtime
            .block_on(tokio::net::TcpListener::bind("127.0.0.1:0"))
            .unwrap();
        let port = listener.local_addr().unwrap().port();
        runtime.spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let frame = FrameConfig::default();
                    let _ = read_packet(&mut stream, &frame).await;
                    let nonce = tessera_protocol::new_nonce();
                    let _ = write_packet(&mut stream, &Packet::Challenge { nonce }, &frame).await;
                    let _ = read_packet(&mut stream, &frame).await;
                    let hello = Packet::Hello {
                        peer: PeerId(7),
                        listen_port: None,
                        app_id: String::new(),
                    };
                    let _ = write_packet(&mut stream, &hello, &frame).await;
                    while read_packet(&mut stream, &frame).await.is_ok() {}
                });
            }
        });
        Self { port, runtime }
    }
}

// ---------------------------------------------------------------------------
// Upcall recording
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upcall {
    Connected(NumericPlayerId, String),
    Disconnected(NumericPlayerId),
}

/// `NetSystem` that remembers every upcall.
#[derive(Default)]
pub struct Recorder {
    upcalls: Mutex<Vec<Upcall>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn upcalls(&self) -> Vec<Upcall> {
        self.upcalls.lock().unwrap().clone()
    }

    pub fn disconnects_of(&self, id: NumericPlayerId) -> usize {
        self.upcalls()
            .iter()
            .filter(|upcall| **upcall == Upcall::Disconnected(id))
            .count()
    }

    pub fn saw_connect(&self, id: NumericPlayerId) -> bool {
        self.upcalls()
            .iter()
            .any(|upcall| matches!(upcall, Upcall::Connected(seen, _) if *seen == id))
    }
}

impl NetSystem for Recorder {
    fn player_connected(&self, id: NumericPlayerId, name: &str) {
        self.upcalls.lock().unwrap().push(Upcall::Connected(id, name.to_string()));
    }

    fn player_disconnected(&self, id: NumericPlayerId) {
        self.upcalls.lock().unwrap().push(Upcall::Disconnected(id));
    }
}

/// `ReceptionNotifier` that keeps the last reported queue length.
#[derive(Default)]
pub struct PendingCounter {
    last: Mutex<usize>,
}

impl PendingCounter {
    pub fn last(&self) -> usize {
        *self.last.lock().unwrap()
    }
}

impl ReceptionNotifier for PendingCounter {
    fn message_received(&self, pending: usize) {
        *self.last.lock().unwrap() = pending;
    }
}

/// Pop one message, if any.
pub fn receive(endpoint: &impl PlayerEndpoint) -> Option<(NumericPlayerId, Vec<u8>)> {
    let mut buffer = [0u8; 1024];
    match endpoint.receive_message(&mut buffer) {
        ReceiveStatus::Success { sender, len } => Some((sender, buffer[..len].to_vec())),
        ReceiveStatus::NoMessages => None,
        ReceiveStatus::Failure { required } => panic!("buffer too small, need {required}"),
    }
}

/// Wait for one message on `endpoint`.
pub fn receive_blocking(endpoint: &impl PlayerEndpoint) -> (NumericPlayerId, Vec<u8>) {
    wait_until("a message", || endpoint.message_count() > 0);
    receive(endpoint).unwrap()
}

// ---------------------------------------------------------------------------
// Players
// ---------------------------------------------------------------------------

/// One process: a subsystem plus the events it has produced so far.
pub struct Player {
    pub name: String,
    pub net: NetworkSubsystem,
    pub events: Vec<SubsystemEvent>,
}

impl Player {
    /// Start, wait for the lobby, then register and log in as `name`.
    pub fn online(config: &NetworkConfig, name: &str) -> Self {
        let mut player = Self {
            name: name.to_string(),
            net: NetworkSubsystem::start(config).unwrap(),
            events: Vec::new(),
        };
        player.expect(|e| matches!(e, SubsystemEvent::Lobby(LobbyEvent::Connected)));

        player.net.lobby().register_account(name, "password").unwrap();
        player.expect(|e| matches!(e, SubsystemEvent::Lobby(LobbyEvent::Registered(Ok(())))));
        player.net.lobby().login(name, "password").unwrap();
        player.expect(|e| matches!(e, SubsystemEvent::Lobby(LobbyEvent::LoggedIn(Ok(_)))));
        player
    }

    /// Drain whatever the subsystem has.
    pub fn pump(&mut self) {
        self.net.wait_for_activity(Duration::from_millis(10));
        let polled = self.net.poll();
        self.events.extend(polled);
    }

    /// Pump until an event matching `predicate` shows up; remove and return it.
    pub fn expect(&mut self, predicate: impl Fn(&SubsystemEvent) -> bool) -> SubsystemEvent {
        let deadline = Instant::now() + TIMEOUT;
        loop {
            if let Some(index) = self.events.iter().position(&predicate) {
                return self.events.remove(index);
            }
            assert!(
                Instant::now() < deadline,
                "{}: expected event not seen, got {:?}",
                self.name,
                self.events
            );
            self.pump();
        }
    }

    pub fn peer(&self) -> PeerId {
        self.net.transport().local_peer()
    }
}
