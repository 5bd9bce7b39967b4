//! Player endpoints: the legacy polling contract.
//!
//! A session creates at most one [`HostEndpoint`] (server role, only on the
//! room owner) and one [`ClientEndpoint`] (client role, on every
//! participant including the host). Both implement [`PlayerEndpoint`] on top
//! of a shared core that owns the name, the receive queue and the upcall
//! objects. Each endpoint registers itself as a transport observer and
//! unregisters when dropped.
//!
//! When the host process also plays, its two endpoints find each other
//! through the session's [`EndpointRegistry`] and exchange messages without
//! touching the network.

mod client;
mod host;

use std::sync::{Arc, Mutex, Weak};

use tessera_protocol::NumericPlayerId;

use crate::error::EndpointError;
use crate::lobby::LobbyClient;
use crate::queue::{MessageEnvelope, MessageQueue, ReceiveStatus};
use crate::sync::lock;
use crate::transport::TransportHandle;

pub use client::ClientEndpoint;
pub use host::HostEndpoint;

/// Bytes reserved in each frame for the packet header around a payload.
const FRAME_OVERHEAD: usize = 64;

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// Connection upcalls into the embedding application. Called on the I/O
/// thread, except for the self-loop announcements made while creating
/// endpoints.
pub trait NetSystem: Send + Sync {
    /// A player became reachable.
    fn player_connected(&self, id: NumericPlayerId, name: &str);
    /// A player went away. Called exactly once per connected player.
    fn player_disconnected(&self, id: NumericPlayerId);
}

/// Told whenever a message lands in an endpoint's queue.
pub trait ReceptionNotifier: Send + Sync {
    /// `pending` is the queue length after the push.
    fn message_received(&self, pending: usize);
}

/// The polling surface the embedding application drives each frame.
pub trait PlayerEndpoint {
    /// Number of messages waiting to be received.
    fn message_count(&self) -> usize;

    /// Send `payload` to player `to`.
    fn send_message(&self, to: NumericPlayerId, payload: &[u8]) -> Result<(), EndpointError>;

    /// Copy the oldest message into `buffer`.
    fn receive_message(&self, buffer: &mut [u8]) -> ReceiveStatus;

    /// Replace the connection upcall object.
    fn set_net_system(&self, system: Arc<dyn NetSystem>);
}

// ---------------------------------------------------------------------------
// Shared plumbing
// ---------------------------------------------------------------------------

pub(crate) struct EndpointCore {
    name: String,
    queue: MessageQueue,
    net_system: Mutex<Arc<dyn NetSystem>>,
    notifier: Option<Arc<dyn ReceptionNotifier>>,
    max_payload: usize,
}

impl EndpointCore {
    fn new(
        name: String,
        net_system: Arc<dyn NetSystem>,
        notifier: Option<Arc<dyn ReceptionNotifier>>,
        transport: &TransportHandle,
    ) -> Self {
        Self {
            name,
            queue: MessageQueue::new(),
            net_system: Mutex::new(net_system),
            notifier,
            max_payload: transport.max_payload_size().saturating_sub(FRAME_OVERHEAD),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn deliver(&self, sender: NumericPlayerId, payload: Vec<u8>) {
        let pending = self.queue.push(MessageEnvelope::new(sender, payload));
        if let Some(notifier) = &self.notifier {
            notifier.message_received(pending);
        }
    }

    fn check_payload(&self, payload: &[u8]) -> Result<(), EndpointError> {
        if payload.len() > self.max_payload {
            return Err(EndpointError::PayloadTooLarge {
                size: payload.len(),
                max: self.max_payload,
            });
        }
        Ok(())
    }

    fn net_system(&self) -> Arc<dyn NetSystem> {
        Arc::clone(&lock(&self.net_system))
    }

    fn set_net_system(&self, system: Arc<dyn NetSystem>) {
        *lock(&self.net_system) = system;
    }

    fn announce_connected(&self, id: NumericPlayerId, name: &str) {
        tracing::info!("{}: player {id} ({name}) connected", self.name);
        self.net_system().player_connected(id, name);
    }

    fn announce_disconnected(&self, id: NumericPlayerId) {
        tracing::info!("{}: player {id} disconnected", self.name);
        self.net_system().player_disconnected(id);
    }

    fn close(&self) {
        let dropped = self.queue.clear();
        if dropped > 0 {
            tracing::debug!("{}: dropped {dropped} unread messages", self.name);
        }
    }
}

/// Weak links between the two endpoints of one session.
#[derive(Default)]
pub(crate) struct EndpointRegistry {
    host: Mutex<Weak<host::HostShared>>,
    client: Mutex<Weak<client::ClientShared>>,
}

impl EndpointRegistry {
    pub(crate) fn has_host(&self) -> bool {
        self.host().is_some()
    }

    pub(crate) fn has_client(&self) -> bool {
        self.client().is_some()
    }

    fn host(&self) -> Option<Arc<host::HostShared>> {
        lock(&self.host).upgrade()
    }

    fn client(&self) -> Option<Arc<client::ClientShared>> {
        lock(&self.client).upgrade()
    }

    fn set_host(&self, host: &Arc<host::HostShared>) {
        *lock(&self.host) = Arc::downgrade(host);
    }

    fn set_client(&self, client: &Arc<client::ClientShared>) {
        *lock(&self.client) = Arc::downgrade(client);
    }

    fn clear_host(&self) {
        *lock(&self.host) = Weak::new();
    }

    fn clear_client(&self) {
        *lock(&self.client) = Weak::new();
    }
}

/// What an endpoint needs from its session.
#[derive(Clone)]
pub(crate) struct EndpointContext {
    pub(crate) transport: TransportHandle,
    pub(crate) lobby: LobbyClient,
    pub(crate) registry: Arc<EndpointRegistry>,
}

/// A live transport whose lobby link is simulated: events are fed straight
/// into the observers instead of arriving over a socket.
#[cfg(test)]
mod fixture {
    use std::sync::{Arc, Mutex};

    use tessera_config::NetworkConfig;
    use tessera_protocol::{NumericPlayerId, Packet, PeerId};

    use super::{EndpointContext, EndpointRegistry, NetSystem};
    use crate::lobby::LobbyClient;
    use crate::transport::{Transport, TransportConfig, TransportEvent, TransportHandle};

    pub(crate) const LOBBY: PeerId = PeerId(0x10b);

    pub(crate) struct Harness {
        _transport: Transport,
        pub(crate) handle: TransportHandle,
        pub(crate) context: EndpointContext,
    }

    impl Harness {
        pub(crate) fn new() -> Self {
            let transport = Transport::start(TransportConfig::default()).unwrap();
            let handle = transport.handle();
            let lobby = LobbyClient::new(handle.clone(), &NetworkConfig::default());
            lobby.mark_connected(LOBBY);
            let context = EndpointContext {
                transport: handle.clone(),
                lobby,
                registry: Arc::new(EndpointRegistry::default()),
            };
            Self {
                _transport: transport,
                handle,
                context,
            }
        }

        pub(crate) fn local_peer(&self) -> PeerId {
            self.handle.local_peer()
        }

        pub(crate) fn from_lobby(&self, packet: Packet) {
            self.from_peer(LOBBY, packet);
        }

        pub(crate) fn from_peer(&self, from: PeerId, packet: Packet) {
            self.handle.dispatch(&TransportEvent::Packet { from, packet });
        }

        pub(crate) fn lost(&self, peer: PeerId) {
            self.handle.dispatch(&TransportEvent::ConnectionLost { peer });
        }
    }

    pub(crate) fn game(sequence: u64, payload: &[u8]) -> Packet {
        Packet::GameMessage {
            sequence,
            payload: payload.to_vec(),
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Upcall {
        Connected(NumericPlayerId),
        Disconnected(NumericPlayerId),
    }

    #[derive(Default)]
    pub(crate) struct Upcalls(Mutex<Vec<Upcall>>);

    impl Upcalls {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub(crate) fn seen(&self) -> Vec<Upcall> {
            self.0.lock().unwrap().clone()
        }

        pub(crate) fn count(&self, upcall: &Upcall) -> usize {
            self.seen().iter().filter(|seen| *seen == upcall).count()
        }
    }

    impl NetSystem for Upcalls {
        fn player_connected(&self, id: NumericPlayerId, _name: &str) {
            self.0.lock().unwrap().push(Upcall::Connected(id));
        }

        fn player_disconnected(&self, id: NumericPlayerId) {
            self.0.lock().unwrap().push(Upcall::Disconnected(id));
        }
    }
}
