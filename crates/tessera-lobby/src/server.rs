//! TCP lobby server: accepts peers, authenticates them against the shared
//! secret and feeds their packets through [`LobbyState`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tessera_config::{Config, LobbyConfig};
use tessera_protocol::{
    AuthError, FrameConfig, FrameError, Packet, PeerId, SocketConfig, configure_stream,
    create_listener, new_nonce, read_packet, verify_proof, write_packet,
};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{RwLock, mpsc, watch};

use crate::error::LobbyServerError;
use crate::state::{LobbyState, Outbound};

/// Unique identifier for a TCP connection within a server session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

/// Atomic generator for monotonically increasing [`ConnectionId`]s.
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a new generator starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Return the next unique [`ConnectionId`].
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Error returned when the connection map is at capacity.
#[derive(Debug)]
pub struct ConnectionLimitReached;

/// Outboxes of every authenticated connection.
pub struct ConnectionMap {
    inner: RwLock<HashMap<ConnectionId, mpsc::UnboundedSender<Packet>>>,
    max_connections: usize,
}

impl ConnectionMap {
    /// Create a new map with the given capacity limit.
    pub fn new(max_connections: usize) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            max_connections,
        }
    }

    /// Insert a connection. Returns `Err` if the map is at capacity.
    pub async fn insert(
        &self,
        id: ConnectionId,
        outbox: mpsc::UnboundedSender<Packet>,
    ) -> Result<(), ConnectionLimitReached> {
        let mut map = self.inner.write().await;
        if map.len() >= self.max_connections {
            return Err(ConnectionLimitReached);
        }
        map.insert(id, outbox);
        Ok(())
    }

    /// Remove a connection by ID.
    pub async fn remove(&self, id: &ConnectionId) -> Option<mpsc::UnboundedSender<Packet>> {
        self.inner.write().await.remove(id)
    }

    /// Queue every packet on its connection's outbox, in order.
    pub async fn route(&self, outbound: Vec<Outbound>) {
        if outbound.is_empty() {
            return;
        }
        let map = self.inner.read().await;
        for Outbound { to, packet } in outbound {
            match map.get(&to) {
                Some(outbox) if outbox.send(packet).is_ok() => {}
                _ => tracing::debug!("Connection {to:?} gone, dropping packet"),
            }
        }
    }

    /// Return the number of active connections.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Return whether the map is empty.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

/// Configuration for [`LobbyServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent authenticated connections.
    pub max_connections: usize,
    /// Secret every peer must prove it knows.
    pub shared_secret: String,
    /// Upper bound on the connection handshake.
    pub handshake_timeout: Duration,
    /// Framing limits for every connection.
    pub frame: FrameConfig,
    /// Socket options applied to the listener and accepted streams.
    pub socket: SocketConfig,
    /// Room and chat limits.
    pub lobby: LobbyConfig,
}

impl ServerConfig {
    /// Build from the loaded configuration file.
    pub fn from_config(config: &Config) -> Result<Self, LobbyServerError> {
        let address = format!("{}:{}", config.lobby.bind_address, config.lobby.port);
        let bind_addr = address
            .parse()
            .map_err(|_| LobbyServerError::InvalidAddress(address))?;
        Ok(Self {
            bind_addr,
            max_connections: config.lobby.max_connections,
            shared_secret: config.network.shared_secret.clone(),
            handshake_timeout: Duration::from_secs(5),
            frame: FrameConfig {
                max_payload_size: config.network.max_payload_size,
            },
            socket: SocketConfig::default(),
            lobby: config.lobby.clone(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
enum HandshakeError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("unexpected packet during handshake")]
    Unexpected,
    #[error("shared secret proof rejected")]
    AuthFailed,
    #[error("peer {0} is already connected")]
    DuplicatePeer(PeerId),
    #[error("handshake timed out")]
    TimedOut,
}

/// Identity a connection presented in its `Hello`.
struct Greeting {
    peer: PeerId,
    listen_port: Option<u16>,
    app_id: String,
}

/// What each connection task needs.
#[derive(Clone)]
struct ServerContext {
    config: Arc<ServerConfig>,
    peer: PeerId,
    state: Arc<Mutex<LobbyState>>,
    connections: Arc<ConnectionMap>,
    shutdown_rx: watch::Receiver<bool>,
}

/// The lobby server.
pub struct LobbyServer {
    context: ServerContext,
    id_gen: IdGenerator,
    shutdown_tx: watch::Sender<bool>,
}

impl LobbyServer {
    /// Create a new server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = LobbyState::new(&config.lobby);
        Self {
            context: ServerContext {
                connections: Arc::new(ConnectionMap::new(config.max_connections)),
                config: Arc::new(config),
                peer: PeerId(rand::random()),
                state: Arc::new(Mutex::new(state)),
                shutdown_rx,
            },
            id_gen: IdGenerator::new(),
            shutdown_tx,
        }
    }

    /// Transport identity the lobby presents in its `Hello`.
    pub fn peer(&self) -> PeerId {
        self.context.peer
    }

    /// Authenticated connections.
    pub fn connections(&self) -> &ConnectionMap {
        &self.context.connections
    }

    /// Inspect the lobby state.
    pub fn with_state<R>(&self, f: impl FnOnce(&LobbyState) -> R) -> R {
        f(&lock(&self.context.state))
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        create_listener(self.context.config.bind_addr, &self.context.config.socket).await
    }

    /// Bind to the configured address and run the accept loop.
    pub async fn run(&self) -> Result<(), LobbyServerError> {
        let listener = self.bind().await?;
        self.run_with_listener(listener).await
    }

    /// Run the accept loop with a pre-bound listener (useful for tests).
    pub async fn run_with_listener(&self, listener: TcpListener) -> Result<(), LobbyServerError> {
        let local = listener.local_addr()?;
        tracing::info!(peer = %self.context.peer, "Lobby listening on {local}");
        let mut shutdown_rx = self.context.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, address) = match result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!("Accept failed: {e}");
                            continue;
                        }
                    };

                    if self.context.connections.len().await >= self.context.config.max_connections {
                        tracing::warn!("Connection limit reached, rejecting {address}");
                        continue;
                    }
                    if let Err(e) = configure_stream(&stream, &self.context.config.socket) {
                        tracing::warn!("Failed to configure socket for {address}: {e}");
                    }

                    let id = self.id_gen.next_id();
                    tracing::info!("Accepted connection {id:?} from {address}");
                    tokio::spawn(self.context.clone().serve(id, stream, address));
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        tracing::info!("Lobby shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Signal the server and every connection to shut down. Connected peers
    /// receive `Goodbye`.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl ServerContext {
    async fn serve(self, id: ConnectionId, mut stream: TcpStream, address: SocketAddr) {
        let timeout = self.config.handshake_timeout;
        let result = tokio::time::timeout(timeout, self.handshake(&mut stream))
            .await
            .unwrap_or(Err(HandshakeError::TimedOut));
        let greeting = match result {
            Ok(greeting) => greeting,
            Err(e) => {
                tracing::warn!("Rejected connection {id:?} from {address}: {e}");
                return;
            }
        };

        // Checked again under the same lock as the insert: two handshakes
        // with one identity can finish together.
        let admitted = lock(&self.state).connect_unique(
            id,
            greeting.peer,
            address,
            greeting.listen_port,
            greeting.app_id,
        );
        if !admitted {
            tracing::warn!("Rejected connection {id:?}: peer {} is already connected", greeting.peer);
            return;
        }

        let (reader, writer) = stream.into_split();
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        if self.connections.insert(id, outbox_tx).await.is_err() {
            tracing::warn!("Connection limit reached, dropping {id:?}");
            lock(&self.state).disconnect(id);
            return;
        }
        tracing::info!("Connection {id:?} authenticated as {}", greeting.peer);

        let writer = tokio::spawn(write_loop(writer, outbox_rx, self.config.frame.clone()));
        let shutting_down = self.read_loop(id, reader).await;

        if let Some(outbox) = self.connections.remove(&id).await
            && shutting_down
        {
            let _ = outbox.send(Packet::Goodbye);
        }
        let farewells = lock(&self.state).disconnect(id);
        self.connections.route(farewells).await;
        let _ = writer.await;
        tracing::info!("Connection {id:?} closed");
    }

    async fn handshake(&self, stream: &mut TcpStream) -> Result<Greeting, HandshakeError> {
        let frame = &self.config.frame;
        let Packet::Hello {
            peer,
            listen_port,
            app_id,
        } = read_packet(stream, frame).await?
        else {
            return Err(HandshakeError::Unexpected);
        };

        let nonce = new_nonce();
        write_packet(stream, &Packet::Challenge { nonce }, frame).await?;
        let Packet::ChallengeResponse { proof } = read_packet(stream, frame).await? else {
            return Err(HandshakeError::Unexpected);
        };
        if !verify_proof(&self.config.shared_secret, &nonce, &proof)? {
            return Err(HandshakeError::AuthFailed);
        }
        if lock(&self.state).is_peer_connected(peer) {
            return Err(HandshakeError::DuplicatePeer(peer));
        }

        let hello = Packet::Hello {
            peer: self.peer,
            listen_port: None,
            app_id: String::new(),
        };
        write_packet(stream, &hello, frame).await?;
        Ok(Greeting {
            peer,
            listen_port,
            app_id,
        })
    }

    /// Returns `true` when the loop ended because of a server shutdown.
    async fn read_loop(&self, id: ConnectionId, mut reader: OwnedReadHalf) -> bool {
        let frame = self.config.frame.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                result = read_packet(&mut reader, &frame) => match result {
                    Ok(Packet::Goodbye) => return false,
                    Ok(packet) => {
                        let outbound = lock(&self.state).handle(id, packet);
                        self.connections.route(outbound).await;
                    }
                    Err(FrameError::Packet(e)) => {
                        tracing::warn!("Dropping malformed packet from {id:?}: {e}");
                    }
                    Err(e) => {
                        tracing::debug!("Connection {id:?} read ended: {e}");
                        return false;
                    }
                },
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        return true;
                    }
                }
            }
        }
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut outbox: mpsc::UnboundedReceiver<Packet>, frame: FrameConfig) {
    while let Some(packet) = outbox.recv().await {
        if let Err(e) = write_packet(&mut writer, &packet, &frame).await {
            tracing::debug!("Write failed: {e}");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

fn lock(state: &Mutex<LobbyState>) -> MutexGuard<'_, LobbyState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}
