//! Server role: one queue fed by every client in the room.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tessera_protocol::{BROADCAST_PLAYER_ID, NumericPlayerId, Packet, PeerId, SERVER_PLAYER_ID};

use super::{EndpointContext, EndpointCore, NetSystem, PlayerEndpoint, ReceptionNotifier};
use crate::error::EndpointError;
use crate::queue::ReceiveStatus;
use crate::roster::{Roster, RosterEntry};
use crate::routing::{DeliveryPath, GameTraffic, PeerSequences, SequenceGuard, classify_game};
use crate::sync::lock;
use crate::transport::{ObserverId, PacketObserver, TransportEvent, TransportHandle};

struct HostState {
    roster: Roster,
    incoming: SequenceGuard,
    outgoing: PeerSequences,
}

pub(crate) struct HostShared {
    pub(super) core: EndpointCore,
    context: EndpointContext,
    pub(super) local_client_id: NumericPlayerId,
    state: Mutex<HostState>,
}

/// The host's server-role endpoint.
///
/// Remote players enter the roster when the lobby reports them joining the
/// room and leave it on a leave report or when their link drops. Messages
/// from anyone not in the roster are discarded.
pub struct HostEndpoint {
    shared: Arc<HostShared>,
    observer: ObserverId,
}

impl HostEndpoint {
    pub(crate) fn new(
        context: EndpointContext,
        net_system: Arc<dyn NetSystem>,
        notifier: Option<Arc<dyn ReceptionNotifier>>,
    ) -> Self {
        let local_peer = context.transport.local_peer();
        let local_client_id = NumericPlayerId::derive(local_peer);
        let mut roster = Roster::new();
        roster.reserve(local_client_id);

        let shared = Arc::new(HostShared {
            core: EndpointCore::new("server".to_string(), net_system, notifier, &context.transport),
            context,
            local_client_id,
            state: Mutex::new(HostState {
                roster,
                incoming: SequenceGuard::new(),
                outgoing: PeerSequences::default(),
            }),
        });

        let observer = shared
            .context
            .transport
            .register_observer(Arc::clone(&shared) as Arc<dyn PacketObserver>);
        shared.context.registry.set_host(&shared);

        // Members that joined before the endpoint existed.
        for member in shared.context.lobby.room_members() {
            if member.peer != local_peer {
                shared.admit(member.peer, &member.name);
            }
        }
        if let Some(client) = shared.context.registry.client() {
            shared.core.announce_connected(local_client_id, client.core.name());
        }

        Self { shared, observer }
    }

    /// Id under which the host's own client role appears.
    pub fn local_client_id(&self) -> NumericPlayerId {
        self.shared.local_client_id
    }

    /// Ids of every remote player in the roster.
    pub fn player_ids(&self) -> Vec<NumericPlayerId> {
        let mut ids: Vec<NumericPlayerId> = lock(&self.shared.state)
            .roster
            .entries()
            .iter()
            .map(|entry| entry.id)
            .collect();
        ids.sort();
        ids
    }

    /// Transport identity behind a roster id.
    pub fn player_peer(&self, id: NumericPlayerId) -> Option<PeerId> {
        lock(&self.shared.state).roster.peer_of(id)
    }

    /// Roster id of a transport identity.
    pub fn player_id(&self, peer: PeerId) -> Option<NumericPlayerId> {
        lock(&self.shared.state).roster.id_of(peer)
    }
}

impl PlayerEndpoint for HostEndpoint {
    fn message_count(&self) -> usize {
        self.shared.release_overdue();
        self.shared.core.queue.len()
    }

    fn send_message(&self, to: NumericPlayerId, payload: &[u8]) -> Result<(), EndpointError> {
        let shared = &self.shared;
        shared.core.check_payload(payload)?;

        if to == SERVER_PLAYER_ID {
            return Err(EndpointError::InvalidDestination(to));
        }

        if to == BROADCAST_PLAYER_ID {
            let targets: Vec<(PeerId, u64)> = {
                let mut guard = lock(&shared.state);
                let state = &mut *guard;
                state
                    .roster
                    .entries()
                    .iter()
                    .map(|entry| (entry.peer, state.outgoing.next_for(entry.peer)))
                    .collect()
            };
            for (peer, sequence) in targets {
                if let Err(e) = shared.send_to_peer(peer, sequence, payload) {
                    tracing::warn!("Broadcast to {peer} failed: {e}");
                }
            }
            if let Some(client) = shared.context.registry.client() {
                client.core.deliver(SERVER_PLAYER_ID, payload.to_vec());
            }
            return Ok(());
        }

        if to == shared.local_client_id {
            let client = shared
                .context
                .registry
                .client()
                .ok_or(EndpointError::UnknownPlayer(to))?;
            client.core.deliver(SERVER_PLAYER_ID, payload.to_vec());
            return Ok(());
        }

        let (peer, sequence) = {
            let mut state = lock(&shared.state);
            let peer = state.roster.peer_of(to).ok_or(EndpointError::UnknownPlayer(to))?;
            (peer, state.outgoing.next_for(peer))
        };
        shared.send_to_peer(peer, sequence, payload)
    }

    fn receive_message(&self, buffer: &mut [u8]) -> ReceiveStatus {
        self.shared.release_overdue();
        self.shared.core.queue.pop_into(buffer)
    }

    fn set_net_system(&self, system: Arc<dyn NetSystem>) {
        self.shared.core.set_net_system(system);
    }
}

impl Drop for HostEndpoint {
    fn drop(&mut self) {
        let shared = &self.shared;
        shared.context.transport.unregister_observer(self.observer);
        shared.context.registry.clear_host();

        let members = lock(&shared.state).roster.drain();
        for member in members {
            shared.context.transport.disconnect(member.peer);
        }
        shared.core.close();
    }
}

// ---------------------------------------------------------------------------
// I/O thread
// ---------------------------------------------------------------------------

impl HostShared {
    fn send_to_peer(&self, peer: PeerId, sequence: u64, payload: &[u8]) -> Result<(), EndpointError> {
        let direct = Packet::GameMessage {
            sequence,
            payload: payload.to_vec(),
        };
        if self.context.transport.send(peer, direct).is_ok() {
            return Ok(());
        }
        self.context
            .lobby
            .send_to_lobby(Packet::RelayToClient {
                peer,
                sequence,
                payload: payload.to_vec(),
            })
            .map_err(|_| EndpointError::NotConnected)
    }

    fn admit(&self, peer: PeerId, name: &str) {
        let (id, added) = lock(&self.state).roster.insert(peer, name);
        if added {
            self.core.announce_connected(id, name);
        }
    }

    fn expel(&self, peer: PeerId) {
        let removed = {
            let mut state = lock(&self.state);
            state.incoming.forget(peer);
            state.outgoing.forget(peer);
            state.roster.remove(peer)
        };
        if let Some(entry) = removed {
            self.core.announce_disconnected(entry.id);
        }
    }

    fn expel_all(&self) {
        let removed: Vec<RosterEntry> = {
            let mut state = lock(&self.state);
            state.incoming = SequenceGuard::new();
            state.outgoing.clear();
            state.roster.drain()
        };
        for entry in removed {
            self.core.announce_disconnected(entry.id);
        }
        // The local client has no observer of its own.
        if let Some(client) = self.context.registry.client() {
            client.on_host_lost("room closed");
        }
    }

    fn on_game(&self, traffic: GameTraffic<'_>) {
        let now = Instant::now();
        let ready = {
            let mut guard = lock(&self.state);
            let state = &mut *guard;
            let Some(id) = state.roster.id_of(traffic.origin) else {
                tracing::debug!("Discarding game message from non-member {}", traffic.origin);
                return;
            };
            let mut ready: Vec<(NumericPlayerId, Vec<u8>)> = state
                .incoming
                .accept(traffic.origin, traffic.sequence, traffic.payload.to_vec(), now)
                .into_iter()
                .map(|payload| (id, payload))
                .collect();
            ready.extend(members_only(&state.roster, state.incoming.release_overdue(now)));
            ready
        };
        for (id, payload) in ready {
            self.core.deliver(id, payload);
        }
    }

    /// Deliver whatever a long-open gap was holding back.
    fn release_overdue(&self) {
        let ready: Vec<(NumericPlayerId, Vec<u8>)> = {
            let mut guard = lock(&self.state);
            let state = &mut *guard;
            members_only(&state.roster, state.incoming.release_overdue(Instant::now())).collect()
        };
        for (id, payload) in ready {
            self.core.deliver(id, payload);
        }
    }

    fn on_lobby_packet(&self, packet: &Packet, local_peer: PeerId) {
        let current_room = self.context.lobby.current_room_id();
        match packet {
            Packet::MemberJoined { room, member }
                if current_room == Some(*room) && member.peer != local_peer =>
            {
                self.admit(member.peer, &member.name);
            }
            Packet::MemberLeft { room, peer } if current_room == Some(*room) => self.expel(*peer),
            Packet::RoomDestroyed { .. } | Packet::LeaveRoomResult(Ok(_)) => self.expel_all(),
            _ => {}
        }
    }
}

fn members_only(
    roster: &Roster,
    released: Vec<(PeerId, Vec<u8>)>,
) -> impl Iterator<Item = (NumericPlayerId, Vec<u8>)> + '_ {
    released
        .into_iter()
        .filter_map(|(peer, payload)| roster.id_of(peer).map(|id| (id, payload)))
}

impl PacketObserver for HostShared {
    fn on_event(&self, event: &TransportEvent, transport: &TransportHandle) {
        match event {
            TransportEvent::Packet { from, packet } => {
                let lobby_peer = self.context.lobby.lobby_peer();
                if let Some(traffic) = classify_game(*from, lobby_peer, packet) {
                    if traffic.path != DeliveryPath::RelayedToClient {
                        self.on_game(traffic);
                    }
                } else if lobby_peer == Some(*from) {
                    self.on_lobby_packet(packet, transport.local_peer());
                }
            }
            TransportEvent::ConnectionLost { peer } | TransportEvent::Disconnected { peer } => {
                if self.context.lobby.is_lobby_peer(*peer) {
                    tracing::warn!("Lost the lobby, dropping every player");
                    self.expel_all();
                } else {
                    self.expel(*peer);
                }
            }
            _ => {}
        }
    }
}
