//! Client role: talks to the host only.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tessera_protocol::{NumericPlayerId, Packet, PeerId, RoomId, SERVER_PLAYER_ID};

use super::{EndpointContext, EndpointCore, NetSystem, PlayerEndpoint, ReceptionNotifier};
use crate::error::EndpointError;
use crate::queue::ReceiveStatus;
use crate::routing::{DeliveryPath, GameTraffic, SequenceCounter, SequenceGuard, classify_game};
use crate::sync::lock;
use crate::transport::{ObserverId, PacketObserver, TransportEvent, TransportHandle};

#[derive(Default)]
struct ClientState {
    guard: SequenceGuard,
    /// `player_connected` was sent for the server.
    announced: bool,
    /// The host is gone; nothing more will be delivered.
    lost: bool,
}

pub(crate) struct ClientShared {
    pub(super) core: EndpointCore,
    context: EndpointContext,
    host_peer: PeerId,
    host_name: String,
    room: Option<RoomId>,
    is_local_host: bool,
    sequence: SequenceCounter,
    state: Mutex<ClientState>,
}

/// A participant's client-role endpoint.
///
/// The only legal destination is [`SERVER_PLAYER_ID`]. On the host process
/// sends are handed straight to the local [`super::HostEndpoint`]; elsewhere
/// they go over a direct link to the host when one exists and through the
/// lobby relay otherwise. Once joined, the endpoint asks the lobby for a
/// punchthrough introduction to the host.
pub struct ClientEndpoint {
    shared: Arc<ClientShared>,
    observer: Option<ObserverId>,
}

impl ClientEndpoint {
    pub(crate) fn new(
        context: EndpointContext,
        host_peer: PeerId,
        host_name: String,
        room: Option<RoomId>,
        local_name: &str,
        net_system: Arc<dyn NetSystem>,
        notifier: Option<Arc<dyn ReceptionNotifier>>,
    ) -> Self {
        let is_local_host = host_peer == context.transport.local_peer();
        let shared = Arc::new(ClientShared {
            core: EndpointCore::new(local_name.to_string(), net_system, notifier, &context.transport),
            context,
            host_peer,
            host_name,
            room,
            is_local_host,
            sequence: SequenceCounter::new(),
            state: Mutex::new(ClientState::default()),
        });
        shared.context.registry.set_client(&shared);

        if is_local_host {
            shared.announce_host();
            if let Some(host) = shared.context.registry.host() {
                host.core.announce_connected(host.local_client_id, local_name);
            }
            return Self {
                shared,
                observer: None,
            };
        }

        let observer = shared
            .context
            .transport
            .register_observer(Arc::clone(&shared) as Arc<dyn PacketObserver>);

        let joined = shared
            .context
            .lobby
            .current_room()
            .is_some_and(|current| current.owner == host_peer);
        if joined {
            shared.on_joined();
        }

        Self {
            shared,
            observer: Some(observer),
        }
    }

    /// Whether this endpoint lives on the host process.
    pub fn is_local_host(&self) -> bool {
        self.shared.is_local_host
    }

    /// Whether a direct link to the host is open.
    pub fn has_direct_link(&self) -> bool {
        self.shared.is_local_host || self.shared.context.transport.is_connected(self.shared.host_peer)
    }

    /// Whether the host has gone away.
    pub fn is_host_lost(&self) -> bool {
        lock(&self.shared.state).lost
    }
}

impl PlayerEndpoint for ClientEndpoint {
    fn message_count(&self) -> usize {
        self.shared.release_overdue();
        self.shared.core.queue.len()
    }

    fn send_message(&self, to: NumericPlayerId, payload: &[u8]) -> Result<(), EndpointError> {
        let shared = &self.shared;
        shared.core.check_payload(payload)?;
        if to != SERVER_PLAYER_ID {
            return Err(EndpointError::InvalidDestination(to));
        }

        if lock(&shared.state).lost {
            return Err(EndpointError::NotConnected);
        }

        if shared.is_local_host {
            let host = shared
                .context
                .registry
                .host()
                .ok_or(EndpointError::NotConnected)?;
            host.core.deliver(host.local_client_id, payload.to_vec());
            return Ok(());
        }

        let sequence = shared.sequence.next_sequence();
        let direct = Packet::GameMessage {
            sequence,
            payload: payload.to_vec(),
        };
        if shared.context.transport.send(shared.host_peer, direct).is_ok() {
            return Ok(());
        }
        shared
            .context
            .lobby
            .send_to_lobby(Packet::RelayToServer {
                peer: shared.host_peer,
                sequence,
                payload: payload.to_vec(),
            })
            .map_err(|_| EndpointError::NotConnected)
    }

    fn receive_message(&self, buffer: &mut [u8]) -> ReceiveStatus {
        self.shared.release_overdue();
        self.shared.core.queue.pop_into(buffer)
    }

    fn set_net_system(&self, system: Arc<dyn NetSystem>) {
        self.shared.core.set_net_system(system);
    }
}

impl Drop for ClientEndpoint {
    fn drop(&mut self) {
        let shared = &self.shared;
        if let Some(observer) = self.observer {
            shared.context.transport.unregister_observer(observer);
        }
        shared.context.registry.clear_client();

        if shared.is_local_host {
            if let Some(host) = shared.context.registry.host() {
                host.core.announce_disconnected(host.local_client_id);
            }
        } else {
            shared.context.transport.disconnect(shared.host_peer);
        }
        shared.core.close();
    }
}

// ---------------------------------------------------------------------------
// I/O thread
// ---------------------------------------------------------------------------

impl ClientShared {
    fn announce_host(&self) {
        {
            let mut state = lock(&self.state);
            if state.announced || state.lost {
                return;
            }
            state.announced = true;
        }
        self.core.announce_connected(SERVER_PLAYER_ID, &self.host_name);
    }

    fn on_joined(&self) {
        let transport = &self.context.transport;
        if !transport.is_connected(self.host_peer)
            && let Err(e) = self.context.lobby.request_punchthrough(self.host_peer)
        {
            tracing::warn!("Punchthrough request for {} failed: {e}", self.host_peer);
        }
        self.announce_host();
    }

    pub(super) fn on_host_lost(&self, why: &str) {
        let announced = {
            let mut state = lock(&self.state);
            if state.lost {
                return;
            }
            state.lost = true;
            state.announced
        };
        tracing::warn!("{}: host {} lost ({why})", self.core.name(), self.host_peer);
        if announced {
            self.core.announce_disconnected(SERVER_PLAYER_ID);
        }
    }

    fn on_game(&self, traffic: GameTraffic<'_>) {
        let now = Instant::now();
        let ready = {
            let mut state = lock(&self.state);
            if state.lost {
                return;
            }
            let mut ready = state
                .guard
                .accept(traffic.origin, traffic.sequence, traffic.payload.to_vec(), now);
            ready.extend(state.guard.release_overdue(now).into_iter().map(|(_, payload)| payload));
            ready
        };
        for payload in ready {
            self.core.deliver(SERVER_PLAYER_ID, payload);
        }
    }

    fn release_overdue(&self) {
        let ready: Vec<Vec<u8>> = {
            let mut state = lock(&self.state);
            if state.lost {
                return;
            }
            state
                .guard
                .release_overdue(Instant::now())
                .into_iter()
                .map(|(_, payload)| payload)
                .collect()
        };
        for payload in ready {
            self.core.deliver(SERVER_PLAYER_ID, payload);
        }
    }

    fn on_lobby_packet(&self, packet: &Packet, transport: &TransportHandle) {
        match packet {
            Packet::JoinRoomResult(Ok(joined)) if joined.room.owner == self.host_peer => {
                self.on_joined();
            }
            Packet::PunchIntroduction { peer, address } if *peer == self.host_peer => {
                if !transport.is_connected(self.host_peer) {
                    tracing::info!("Dialing host {peer} directly at {address}");
                    transport.connect_addr(*address);
                }
            }
            Packet::PunchFailed { peer, reason } if *peer == self.host_peer => {
                tracing::info!("No direct path to host ({reason}), staying on lobby relay");
            }
            Packet::MemberLeft { peer, .. } if *peer == self.host_peer => {
                self.on_host_lost("host left the room");
            }
            Packet::RoomDestroyed { room } if Some(*room) == self.room => {
                self.on_host_lost("room destroyed");
            }
            Packet::LeaveRoomResult(Ok(room)) if Some(*room) == self.room => {
                self.on_host_lost("left the room");
            }
            _ => {}
        }
    }
}

impl PacketObserver for ClientShared {
    fn on_event(&self, event: &TransportEvent, transport: &TransportHandle) {
        match event {
            TransportEvent::Packet { from, packet } => {
                let lobby_peer = self.context.lobby.lobby_peer();
                if let Some(traffic) = classify_game(*from, lobby_peer, packet) {
                    if traffic.origin == self.host_peer && traffic.path != DeliveryPath::RelayedToHost {
                        self.on_game(traffic);
                    }
                } else if lobby_peer == Some(*from) {
                    self.on_lobby_packet(packet, transport);
                }
            }
            TransportEvent::ConnectionLost { peer } | TransportEvent::Disconnected { peer } => {
                if *peer == self.host_peer {
                    self.on_host_lost("direct link closed");
                } else if self.context.lobby.is_lobby_peer(*peer) {
                    self.on_host_lost("lobby connection closed");
                }
            }
            _ => {}
        }
    }
}
