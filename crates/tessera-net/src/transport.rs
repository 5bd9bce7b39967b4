//! Peer-to-peer packet transport.
//!
//! A [`Transport`] owns a private tokio runtime with a single worker thread
//! (`tessera-io`). Every link is one TCP connection with a reader task and a
//! writer task; the consumer thread talks to it through a cloneable
//! [`TransportHandle`] and never blocks on network I/O.
//!
//! Inbound traffic and connection lifecycle changes are delivered as
//! [`TransportEvent`]s to the registered [`PacketObserver`]s, synchronously
//! and in registration order, on the I/O thread. After each delivery the
//! coalescing notification flag is raised so a consumer blocked in
//! [`TransportHandle::wait_for_notification`] (or woken through the wake
//! hook) knows there is something to drain.
//!
//! # Handshake
//!
//! ```text
//! dialer                      acceptor (peer)        acceptor (lobby)
//!   | -- Hello ------------->   |                       |
//!   | <------------- Hello --   |                       |
//!   | -- Hello ---------------------------------------> |
//!   | <------------------------------------ Challenge -- |
//!   | -- ChallengeResponse ---------------------------> |
//!   | <---------------------------------------- Hello -- |
//! ```
//!
//! A side closing a link on purpose sends `Goodbye` first, which the remote
//! reports as [`TransportEvent::Disconnected`]. Any other loss is
//! [`TransportEvent::ConnectionLost`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tessera_config::NetworkConfig;
use tessera_protocol::{
    AuthError, FrameConfig, FrameError, Packet, PacketKind, PeerId, SocketConfig,
    challenge_proof, configure_stream, create_listener, read_packet, unspecified_v4, write_packet,
};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::error::TransportError;
use crate::notification::{Notification, WakeHook};
use crate::sync::lock;

/// How long [`Transport::stop`] waits for writers to flush their `Goodbye`.
const SHUTDOWN_FLUSH: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Settings for [`Transport::start`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Port to accept direct peer connections on (0 = ephemeral).
    pub bind_port: u16,
    /// Application id sent in `Hello`; inbound peers must match it.
    pub app_id: String,
    /// Secret used to answer the lobby's challenge.
    pub shared_secret: String,
    /// Maximum number of open links. Further inbound connections are refused.
    pub max_connections: usize,
    /// Upper bound on connect plus handshake.
    pub handshake_timeout: Duration,
    /// Framing limits.
    pub frame: FrameConfig,
    /// Socket options for every link.
    pub socket: SocketConfig,
    /// Send our listening port in `Hello`.
    pub advertise_listen_port: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::from_network(&NetworkConfig::default())
    }
}

impl TransportConfig {
    /// Build from the peer-side section of the configuration file.
    pub fn from_network(network: &NetworkConfig) -> Self {
        Self {
            bind_port: network.bind_port,
            app_id: network.app_id.clone(),
            shared_secret: network.shared_secret.clone(),
            max_connections: network.max_connections,
            handshake_timeout: Duration::from_secs(5),
            frame: FrameConfig {
                max_payload_size: network.max_payload_size,
            },
            socket: SocketConfig::default(),
            advertise_listen_port: network.advertise_listen_port,
        }
    }
}

// ---------------------------------------------------------------------------
// Events and observers
// ---------------------------------------------------------------------------

/// Token returned by [`TransportHandle::connect`], echoed in the event that
/// reports the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectAttempt(pub u64);

/// Registration token for [`TransportHandle::register_observer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(pub u64);

/// Something that happened on the I/O thread.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A link finished its handshake.
    Connected {
        /// Remote identity.
        peer: PeerId,
        /// Remote socket address.
        address: SocketAddr,
        /// The attempt that dialed this link, `None` for inbound links.
        attempt: Option<ConnectAttempt>,
    },
    /// An outbound attempt did not produce a link.
    ConnectionFailed {
        /// The failed attempt.
        attempt: ConnectAttempt,
        /// Address as given to `connect`.
        target: String,
        /// Human-readable cause.
        reason: String,
    },
    /// A link dropped without a `Goodbye`.
    ConnectionLost {
        /// Remote identity.
        peer: PeerId,
    },
    /// The remote closed the link on purpose.
    Disconnected {
        /// Remote identity.
        peer: PeerId,
    },
    /// A packet arrived.
    Packet {
        /// Sender of the packet (the link's remote identity).
        from: PeerId,
        /// The decoded packet.
        packet: Packet,
    },
}

/// Receives every [`TransportEvent`] on the I/O thread.
///
/// Implementations must not block; they typically update some state under a
/// short-lived lock and push work into a queue.
pub trait PacketObserver: Send + Sync {
    /// Handle one event. `transport` may be used to send replies.
    fn on_event(&self, event: &TransportEvent, transport: &TransportHandle);
}

impl<F> PacketObserver for F
where
    F: Fn(&TransportEvent, &TransportHandle) + Send + Sync,
{
    fn on_event(&self, event: &TransportEvent, transport: &TransportHandle) {
        self(event, transport);
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct Link {
    id: u64,
    address: SocketAddr,
    outbox: mpsc::UnboundedSender<Packet>,
    writer: JoinHandle<()>,
}

struct TransportShared {
    local_peer: PeerId,
    local_addr: SocketAddr,
    config: TransportConfig,
    runtime: tokio::runtime::Handle,
    links: Mutex<HashMap<PeerId, Link>>,
    observers: Mutex<Vec<(ObserverId, Arc<dyn PacketObserver>)>>,
    next_observer: AtomicU64,
    next_link: AtomicU64,
    next_attempt: AtomicU64,
    notification: Notification,
    shutdown_rx: watch::Receiver<bool>,
}

impl TransportShared {
    fn hello(&self) -> Packet {
        Packet::Hello {
            peer: self.local_peer,
            listen_port: self
                .config
                .advertise_listen_port
                .then(|| self.local_addr.port()),
            app_id: self.config.app_id.clone(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum HandshakeError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("unexpected packet during handshake")]
    Unexpected,
    #[error("application id mismatch: {0:?}")]
    AppMismatch(String),
    #[error("remote presented our own identity")]
    SelfConnection,
    #[error("handshake timed out")]
    TimedOut,
}

// ---------------------------------------------------------------------------
// Transport (owner)
// ---------------------------------------------------------------------------

/// Owner of the I/O runtime and the listening socket.
///
/// Dropping it (or calling [`Transport::stop`]) says `Goodbye` on every link
/// and shuts the runtime down. Must not be dropped from inside an async
/// context.
pub struct Transport {
    handle: TransportHandle,
    shutdown_tx: watch::Sender<bool>,
    runtime: Option<Runtime>,
}

impl Transport {
    /// Start the I/O thread and listen on `config.bind_port`.
    pub fn start(config: TransportConfig) -> Result<Self, TransportError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("tessera-io")
            .enable_all()
            .build()
            .map_err(TransportError::Runtime)?;

        let port = config.bind_port;
        let listener = runtime
            .block_on(create_listener(unspecified_v4(port), &config.socket))
            .map_err(|source| TransportError::Bind { port, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| TransportError::Bind { port, source })?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = TransportHandle {
            shared: Arc::new(TransportShared {
                local_peer: PeerId(rand::random()),
                local_addr,
                config,
                runtime: runtime.handle().clone(),
                links: Mutex::new(HashMap::new()),
                observers: Mutex::new(Vec::new()),
                next_observer: AtomicU64::new(1),
                next_link: AtomicU64::new(1),
                next_attempt: AtomicU64::new(1),
                notification: Notification::default(),
                shutdown_rx,
            }),
        };

        runtime.spawn(handle.clone().accept_loop(listener));
        tracing::info!(peer = %handle.local_peer(), "Transport listening on {local_addr}");

        Ok(Self {
            handle,
            shutdown_tx,
            runtime: Some(runtime),
        })
    }

    /// A cloneable handle for the consumer thread and observers.
    pub fn handle(&self) -> TransportHandle {
        self.handle.clone()
    }

    /// Close every link and stop the I/O thread. Idempotent.
    pub fn stop(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        let shared = &self.handle.shared;

        // Observers hold handles back into the transport; dropping them here
        // releases those references.
        lock(&shared.observers).clear();

        let links: Vec<Link> = lock(&shared.links).drain().map(|(_, link)| link).collect();
        let writers: Vec<JoinHandle<()>> = links
            .into_iter()
            .map(|link| {
                let _ = link.outbox.send(Packet::Goodbye);
                link.writer
            })
            .collect();

        runtime.block_on(async {
            let flush = async {
                for writer in writers {
                    let _ = writer.await;
                }
            };
            if tokio::time::timeout(SHUTDOWN_FLUSH, flush).await.is_err() {
                tracing::warn!("Timed out flushing links during shutdown");
            }
        });

        let _ = self.shutdown_tx.send(true);
        runtime.shutdown_timeout(Duration::from_millis(100));
        tracing::info!("Transport stopped");
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// TransportHandle
// ---------------------------------------------------------------------------

/// Cheap, cloneable access to a running [`Transport`].
#[derive(Clone)]
pub struct TransportHandle {
    shared: Arc<TransportShared>,
}

impl TransportHandle {
    /// Identity of this process.
    pub fn local_peer(&self) -> PeerId {
        self.shared.local_peer
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Port peers can connect to directly.
    pub fn listen_port(&self) -> u16 {
        self.shared.local_addr.port()
    }

    /// Largest frame payload this transport sends or accepts.
    pub fn max_payload_size(&self) -> usize {
        self.shared.config.frame.max_payload_size as usize
    }

    /// Dial `host:port`. The outcome arrives as
    /// [`TransportEvent::Connected`] or [`TransportEvent::ConnectionFailed`]
    /// carrying the returned attempt token.
    pub fn connect(&self, host: &str, port: u16) -> ConnectAttempt {
        self.dial(format!("{host}:{port}"))
    }

    /// Dial a resolved address.
    pub fn connect_addr(&self, address: SocketAddr) -> ConnectAttempt {
        self.dial(address.to_string())
    }

    fn dial(&self, target: String) -> ConnectAttempt {
        let attempt = ConnectAttempt(self.shared.next_attempt.fetch_add(1, Ordering::Relaxed));
        tracing::debug!("Dialing {target} ({attempt:?})");
        self.shared
            .runtime
            .spawn(self.clone().dial_task(target, attempt));
        attempt
    }

    /// Queue a packet on the link to `peer`.
    pub fn send(&self, peer: PeerId, packet: Packet) -> Result<(), TransportError> {
        let links = lock(&self.shared.links);
        let link = links.get(&peer).ok_or(TransportError::NotConnected(peer))?;
        link.outbox
            .send(packet)
            .map_err(|_| TransportError::NotConnected(peer))
    }

    /// Say `Goodbye` and close the link to `peer`. No event is raised
    /// locally. Returns whether a link existed.
    pub fn disconnect(&self, peer: PeerId) -> bool {
        let Some(link) = lock(&self.shared.links).remove(&peer) else {
            return false;
        };
        let _ = link.outbox.send(Packet::Goodbye);
        tracing::info!("Closing link {} to {peer}", link.id);
        true
    }

    /// Whether a link to `peer` is open.
    pub fn is_connected(&self, peer: PeerId) -> bool {
        lock(&self.shared.links).contains_key(&peer)
    }

    /// Remote address of the link to `peer`.
    pub fn peer_address(&self, peer: PeerId) -> Option<SocketAddr> {
        lock(&self.shared.links).get(&peer).map(|link| link.address)
    }

    /// Every peer with an open link.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        lock(&self.shared.links).keys().copied().collect()
    }

    /// Add an observer at the end of the delivery order.
    pub fn register_observer(&self, observer: Arc<dyn PacketObserver>) -> ObserverId {
        let id = ObserverId(self.shared.next_observer.fetch_add(1, Ordering::Relaxed));
        lock(&self.shared.observers).push((id, observer));
        id
    }

    /// Remove an observer. Returns whether it was registered.
    pub fn unregister_observer(&self, id: ObserverId) -> bool {
        let mut observers = lock(&self.shared.observers);
        let before = observers.len();
        observers.retain(|(registered, _)| *registered != id);
        observers.len() != before
    }

    /// Raise the "packets are waiting" flag. Returns `true` only when the
    /// flag was clear, in which case waiters and the wake hook are notified.
    pub fn notify_waiting(&self) -> bool {
        self.shared.notification.notify_waiting()
    }

    /// Clear the flag after draining, so the next arrival notifies again.
    pub fn reset_notification(&self) {
        self.shared.notification.reset();
    }

    /// Whether a notification is pending.
    pub fn is_notification_pending(&self) -> bool {
        self.shared.notification.is_pending()
    }

    /// Install (or remove) the callback run on the clear-to-set transition.
    pub fn set_wake_hook(&self, hook: Option<WakeHook>) {
        self.shared.notification.set_hook(hook);
    }

    /// Block the calling thread until a notification is pending or
    /// `timeout` elapses.
    pub fn wait_for_notification(&self, timeout: Duration) -> bool {
        self.shared.notification.wait(timeout)
    }

    // ---- I/O thread ----

    pub(crate) fn dispatch(&self, event: &TransportEvent) {
        let observers: Vec<Arc<dyn PacketObserver>> = lock(&self.shared.observers)
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in &observers {
            observer.on_event(event, self);
        }
        self.shared.notification.notify_waiting();
    }

    fn link_count(&self) -> usize {
        lock(&self.shared.links).len()
    }

    /// Remove the link only if it is still the one the caller owns.
    fn remove_link(&self, peer: PeerId, link_id: u64) -> bool {
        let mut links = lock(&self.shared.links);
        match links.get(&peer) {
            Some(link) if link.id == link_id => {
                links.remove(&peer);
                true
            }
            _ => false,
        }
    }

    async fn accept_loop(self, listener: TcpListener) {
        let mut shutdown_rx = self.shared.shutdown_rx.clone();

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

                    if self.link_count() >= self.shared.config.max_connections {
                        tracing::warn!("Connection limit reached, rejecting {address}");
                        continue;
                    }
                    if let Err(e) = configure_stream(&stream, &self.shared.config.socket) {
                        tracing::warn!("Failed to configure socket for {address}: {e}");
                    }

                    tokio::spawn(self.clone().accept_task(stream, address));
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        tracing::debug!("Accept loop stopping");
                        break;
                    }
                }
            }
        }
    }

    async fn accept_task(self, mut stream: TcpStream, address: SocketAddr) {
        let timeout = self.shared.config.handshake_timeout;
        let result = tokio::time::timeout(timeout, self.handshake_inbound(&mut stream))
            .await
            .unwrap_or(Err(HandshakeError::TimedOut));
        match result {
            Ok(peer) => self.establish(stream, peer, address, None),
            Err(e) => tracing::warn!("Rejected connection from {address}: {e}"),
        }
    }

    async fn dial_task(self, target: String, attempt: ConnectAttempt) {
        let timeout = self.shared.config.handshake_timeout;
        let result = tokio::time::timeout(timeout, async {
            let mut stream = TcpStream::connect(target.as_str()).await?;
            configure_stream(&stream, &self.shared.config.socket)?;
            let address = stream.peer_addr()?;
            let peer = self.handshake_outbound(&mut stream).await?;
            Ok::<_, HandshakeError>((stream, peer, address))
        })
        .await
        .unwrap_or(Err(HandshakeError::TimedOut));

        match result {
            Ok((stream, peer, address)) => self.establish(stream, peer, address, Some(attempt)),
            Err(e) => {
                tracing::warn!("Connection to {target} failed: {e}");
                self.dispatch(&TransportEvent::ConnectionFailed {
                    attempt,
                    target,
                    reason: e.to_string(),
                });
            }
        }
    }

    async fn handshake_inbound(&self, stream: &mut TcpStream) -> Result<PeerId, HandshakeError> {
        let frame = &self.shared.config.frame;
        let Packet::Hello { peer, app_id, .. } = read_packet(stream, frame).await? else {
            return Err(HandshakeError::Unexpected);
        };
        if peer == self.shared.local_peer {
            return Err(HandshakeError::SelfConnection);
        }
        if app_id != self.shared.config.app_id {
            return Err(HandshakeError::AppMismatch(app_id));
        }
        write_packet(stream, &self.shared.hello(), frame).await?;
        Ok(peer)
    }

    async fn handshake_outbound(&self, stream: &mut TcpStream) -> Result<PeerId, HandshakeError> {
        let frame = &self.shared.config.frame;
        write_packet(stream, &self.shared.hello(), frame).await?;

        loop {
            match read_packet(stream, frame).await? {
                Packet::Hello { peer, .. } if peer == self.shared.local_peer => {
                    return Err(HandshakeError::SelfConnection);
                }
                Packet::Hello { peer, .. } => return Ok(peer),
                Packet::Challenge { nonce } => {
                    let proof = challenge_proof(&self.shared.config.shared_secret, &nonce)?;
                    write_packet(stream, &Packet::ChallengeResponse { proof }, frame).await?;
                }
                _ => return Err(HandshakeError::Unexpected),
            }
        }
    }

    fn establish(
        &self,
        stream: TcpStream,
        peer: PeerId,
        address: SocketAddr,
        attempt: Option<ConnectAttempt>,
    ) {
        let (reader, writer) = stream.into_split();
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = oneshot::channel();
        let link_id = self.shared.next_link.fetch_add(1, Ordering::Relaxed);

        {
            let mut links = lock(&self.shared.links);
            if links.contains_key(&peer) {
                tracing::debug!("Already linked to {peer}, dropping duplicate from {address}");
                return;
            }
            let frame = self.shared.config.frame.clone();
            let writer = tokio::spawn(write_loop(writer, outbox_rx, frame, closed_tx));
            links.insert(
                peer,
                Link {
                    id: link_id,
                    address,
                    outbox: outbox_tx,
                    writer,
                },
            );
        }

        tracing::info!("Link {link_id} to {peer} at {address} established");
        self.dispatch(&TransportEvent::Connected {
            peer,
            address,
            attempt,
        });
        tokio::spawn(self.clone().read_loop(reader, peer, link_id, closed_rx));
    }

    async fn read_loop(
        self,
        mut reader: OwnedReadHalf,
        peer: PeerId,
        link_id: u64,
        mut closed_rx: oneshot::Receiver<()>,
    ) {
        let frame = self.shared.config.frame.clone();
        let mut shutdown_rx = self.shared.shutdown_rx.clone();

        let end = loop {
            tokio::select! {
                result = read_packet(&mut reader, &frame) => match result {
                    Ok(Packet::Goodbye) => break TransportEvent::Disconnected { peer },
                    Ok(packet) if packet.kind() == PacketKind::Handshake => {
                        tracing::debug!("Ignoring stray handshake packet from {peer}");
                    }
                    Ok(packet) => self.dispatch(&TransportEvent::Packet { from: peer, packet }),
                    Err(FrameError::Packet(e)) => {
                        tracing::warn!("Dropping malformed packet from {peer}: {e}");
                    }
                    Err(e) => {
                        tracing::debug!("Link {link_id} to {peer} read ended: {e}");
                        break TransportEvent::ConnectionLost { peer };
                    }
                },
                // The writer finished: either we closed the link or a write failed.
                _ = &mut closed_rx => break TransportEvent::ConnectionLost { peer },
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        return;
                    }
                }
            }
        };

        if self.remove_link(peer, link_id) {
            tracing::info!("Link {link_id} to {peer} closed: {end:?}");
            self.dispatch(&end);
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbox: mpsc::UnboundedReceiver<Packet>,
    frame: FrameConfig,
    _closed: oneshot::Sender<()>,
) {
    while let Some(packet) = outbox.recv().await {
        match write_packet(&mut writer, &packet, &frame).await {
            Ok(()) => {}
            Err(e @ (FrameError::PayloadTooLarge { .. } | FrameError::Packet(_))) => {
                tracing::warn!("Dropping outbound packet: {e}");
            }
            Err(e) => {
                tracing::debug!("Write failed: {e}");
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}
