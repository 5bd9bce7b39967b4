//! Lobby client: accounts, directory queries and rooms.
//!
//! Every operation is fire-and-forget: it queues one request packet to the
//! lobby and returns. Responses are matched by packet subtype, update the
//! client's view of the lobby (account, current room and its members) on the
//! I/O thread, and are queued as [`LobbyEvent`]s for the consumer thread to
//! drain with [`LobbyClient::poll_events`].
//!
//! The client must be the first observer registered on its transport, so its
//! view is already updated when endpoints see the same packet.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use tessera_config::NetworkConfig;
use tessera_protocol::{
    ChatMessage, JoinedRoom, MemberInfo, Packet, PeerId, Rejection, RoomId, RoomInfo,
    RoomMetadata, UserInfo,
};

use crate::error::LobbyError;
use crate::sync::lock;
use crate::transport::{ConnectAttempt, PacketObserver, TransportEvent, TransportHandle};

/// Request families that expect exactly one response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Register,
    Login,
    Logout,
    OnlineUsers,
    ChatHistory,
    CreateRoom,
    SearchRooms,
    JoinRoom,
    LeaveRoom,
    ChangePublicSlots,
}

/// Something the lobby told us, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum LobbyEvent {
    /// The lobby connection completed its handshake.
    Connected,
    /// The lobby could not be reached.
    ConnectionFailed(String),
    /// The lobby connection closed.
    Disconnected,
    Registered(Result<(), Rejection>),
    LoggedIn(Result<String, Rejection>),
    LoggedOut(Result<(), Rejection>),
    OnlineUsers(Result<Vec<UserInfo>, Rejection>),
    ChatHistory(Result<Vec<ChatMessage>, Rejection>),
    /// A chat line from any logged-in user, including ourselves.
    ChatReceived(ChatMessage),
    ChatRejected(Rejection),
    RoomCreated(Result<RoomInfo, Rejection>),
    RoomsFound(Result<Vec<RoomInfo>, Rejection>),
    RoomJoined(Result<JoinedRoom, Rejection>),
    RoomLeft(Result<RoomId, Rejection>),
    PublicSlotsChanged(Result<u8, Rejection>),
    MemberJoined {
        room: RoomId,
        member: MemberInfo,
    },
    MemberLeft {
        room: RoomId,
        peer: PeerId,
    },
    RoomDestroyed(RoomId),
    PunchFailed {
        peer: PeerId,
        reason: Rejection,
    },
    /// No response arrived within the request timeout.
    RequestTimedOut(RequestKind),
}

/// Lobby connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LobbyConnection {
    Disconnected,
    Connecting(ConnectAttempt),
    Connected(PeerId),
}

/// Outstanding requests with their deadlines.
#[derive(Debug, Default)]
struct PendingRequests {
    deadlines: HashMap<RequestKind, Instant>,
}

impl PendingRequests {
    fn contains(&self, kind: RequestKind) -> bool {
        self.deadlines.contains_key(&kind)
    }

    fn begin(&mut self, kind: RequestKind, deadline: Instant) {
        self.deadlines.insert(kind, deadline);
    }

    fn complete(&mut self, kind: RequestKind) {
        if self.deadlines.remove(&kind).is_none() {
            tracing::debug!("Response for {kind:?} arrived with no request pending");
        }
    }

    fn expire(&mut self, now: Instant) -> Vec<RequestKind> {
        let expired: Vec<RequestKind> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(kind, _)| *kind)
            .collect();
        for kind in &expired {
            self.deadlines.remove(kind);
        }
        expired
    }
}

#[derive(Debug)]
struct LobbyState {
    connection: LobbyConnection,
    /// Identity of the most recent lobby link, kept after it closes.
    last_lobby: Option<PeerId>,
    account: Option<String>,
    room: Option<RoomInfo>,
    members: Vec<MemberInfo>,
    pending: PendingRequests,
}

impl LobbyState {
    fn lobby_peer(&self) -> Option<PeerId> {
        match self.connection {
            LobbyConnection::Connected(peer) => Some(peer),
            _ => None,
        }
    }

    fn leave_room_locally(&mut self) {
        self.room = None;
        self.members.clear();
    }
}

struct LobbyShared {
    transport: TransportHandle,
    host: String,
    port: u16,
    app_id: String,
    request_timeout: Duration,
    state: Mutex<LobbyState>,
    events_tx: Sender<LobbyEvent>,
    events_rx: Receiver<LobbyEvent>,
}

/// Client side of the lobby protocol. Cheap to clone.
#[derive(Clone)]
pub struct LobbyClient {
    shared: Arc<LobbyShared>,
}

impl LobbyClient {
    /// Create the client and register it as an observer of `transport`.
    ///
    /// Call this before creating any endpoint on the same transport.
    pub fn new(transport: TransportHandle, network: &NetworkConfig) -> Self {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(LobbyShared {
            transport: transport.clone(),
            host: network.lobby_address.clone(),
            port: network.lobby_port,
            app_id: network.app_id.clone(),
            request_timeout: network.request_timeout(),
            state: Mutex::new(LobbyState {
                connection: LobbyConnection::Disconnected,
                last_lobby: None,
                account: None,
                room: None,
                members: Vec::new(),
                pending: PendingRequests::default(),
            }),
            events_tx,
            events_rx,
        });
        transport.register_observer(Arc::clone(&shared) as Arc<dyn PacketObserver>);
        Self { shared }
    }

    /// Start connecting to the lobby. No-op while connecting or connected.
    pub fn connect(&self) {
        let mut state = lock(&self.shared.state);
        if state.connection != LobbyConnection::Disconnected {
            return;
        }
        let attempt = self.shared.transport.connect(&self.shared.host, self.shared.port);
        state.connection = LobbyConnection::Connecting(attempt);
        tracing::info!("Connecting to lobby at {}:{}", self.shared.host, self.shared.port);
    }

    // ---- Views ----

    /// Lobby connection state.
    pub fn connection(&self) -> LobbyConnection {
        lock(&self.shared.state).connection
    }

    /// Whether the lobby handshake has completed.
    pub fn is_connected(&self) -> bool {
        self.lobby_peer().is_some()
    }

    /// Transport identity of the lobby, once connected.
    pub fn lobby_peer(&self) -> Option<PeerId> {
        lock(&self.shared.state).lobby_peer()
    }

    /// Whether `peer` is (or was, before the link closed) the lobby.
    pub fn is_lobby_peer(&self, peer: PeerId) -> bool {
        lock(&self.shared.state).last_lobby == Some(peer)
    }

    /// Our own transport identity.
    pub fn local_peer(&self) -> PeerId {
        self.shared.transport.local_peer()
    }

    /// Account we are logged into.
    pub fn account(&self) -> Option<String> {
        lock(&self.shared.state).account.clone()
    }

    /// Room we are in, as last reported by the lobby.
    pub fn current_room(&self) -> Option<RoomInfo> {
        lock(&self.shared.state).room.clone()
    }

    /// Id of the room we are in.
    pub fn current_room_id(&self) -> Option<RoomId> {
        lock(&self.shared.state).room.as_ref().map(|room| room.id)
    }

    /// Members of the current room, owner included.
    pub fn room_members(&self) -> Vec<MemberInfo> {
        lock(&self.shared.state).members.clone()
    }

    /// Whether a request of `kind` is waiting for its response.
    pub fn is_pending(&self, kind: RequestKind) -> bool {
        lock(&self.shared.state).pending.contains(kind)
    }

    // ---- Account ----

    pub fn register_account(&self, name: &str, password: &str) -> Result<(), LobbyError> {
        self.request(
            RequestKind::Register,
            Packet::Register {
                name: name.to_string(),
                password: password.to_string(),
            },
        )
    }

    pub fn login(&self, name: &str, password: &str) -> Result<(), LobbyError> {
        self.request(
            RequestKind::Login,
            Packet::Login {
                name: name.to_string(),
                password: password.to_string(),
            },
        )
    }

    pub fn logout(&self) -> Result<(), LobbyError> {
        self.request(RequestKind::Logout, Packet::Logout)
    }

    // ---- Directory ----

    pub fn query_online_users(&self) -> Result<(), LobbyError> {
        self.request(RequestKind::OnlineUsers, Packet::QueryOnlineUsers)
    }

    pub fn query_chat_messages(&self) -> Result<(), LobbyError> {
        self.request(RequestKind::ChatHistory, Packet::QueryChatHistory)
    }

    /// Post a chat line. There is no success response; the line comes back
    /// as [`LobbyEvent::ChatReceived`].
    pub fn send_chat_message(&self, text: &str) -> Result<(), LobbyError> {
        self.send_to_lobby(Packet::SendChat {
            text: text.to_string(),
        })
    }

    // ---- Rooms ----

    /// Ask for a new room owned by us. Only one create may be outstanding.
    pub fn create_room(
        &self,
        name: &str,
        metadata: RoomMetadata,
        password: Option<&str>,
        public_slots: u8,
    ) -> Result<(), LobbyError> {
        self.request(
            RequestKind::CreateRoom,
            Packet::CreateRoom {
                name: name.to_string(),
                metadata,
                password: password.map(str::to_string),
                public_slots,
            },
        )
    }

    /// List rooms created under our application id.
    pub fn search_rooms(&self) -> Result<(), LobbyError> {
        self.request(
            RequestKind::SearchRooms,
            Packet::SearchRooms {
                app_id: self.shared.app_id.clone(),
            },
        )
    }

    pub fn join_room(&self, room: RoomId, password: Option<&str>) -> Result<(), LobbyError> {
        self.request(
            RequestKind::JoinRoom,
            Packet::JoinRoom {
                room,
                password: password.map(str::to_string),
            },
        )
    }

    pub fn leave_room(&self) -> Result<(), LobbyError> {
        self.request(RequestKind::LeaveRoom, Packet::LeaveRoom)
    }

    pub fn change_room_public_slots(&self, slots: u8) -> Result<(), LobbyError> {
        self.request(
            RequestKind::ChangePublicSlots,
            Packet::ChangePublicSlots { slots },
        )
    }

    /// Ask the lobby to tell us where `target` can be reached directly.
    pub fn request_punchthrough(&self, target: PeerId) -> Result<(), LobbyError> {
        self.send_to_lobby(Packet::PunchRequest { target })
    }

    // ---- Consumer thread ----

    /// Drain every queued event in arrival order.
    pub fn poll_events(&self) -> Vec<LobbyEvent> {
        self.shared.events_rx.try_iter().collect()
    }

    /// Fail every request whose deadline is at or before `now`. Each one is
    /// queued as [`LobbyEvent::RequestTimedOut`]. Returns how many expired.
    pub fn expire_requests(&self, now: Instant) -> usize {
        let expired = lock(&self.shared.state).pending.expire(now);
        for kind in &expired {
            tracing::warn!("Lobby request {kind:?} timed out");
            self.shared.push(LobbyEvent::RequestTimedOut(*kind));
        }
        expired.len()
    }

    /// Treat `lobby` as an established lobby link without dialing it.
    #[cfg(test)]
    pub(crate) fn mark_connected(&self, lobby: PeerId) {
        let mut state = lock(&self.shared.state);
        state.connection = LobbyConnection::Connected(lobby);
        state.last_lobby = Some(lobby);
    }

    /// Send a packet to the lobby without tracking a response.
    pub(crate) fn send_to_lobby(&self, packet: Packet) -> Result<(), LobbyError> {
        let lobby = self.lobby_peer().ok_or(LobbyError::NotConnected)?;
        self.shared.transport.send(lobby, packet)?;
        Ok(())
    }

    fn request(&self, kind: RequestKind, packet: Packet) -> Result<(), LobbyError> {
        let mut state = lock(&self.shared.state);
        let lobby = state.lobby_peer().ok_or(LobbyError::NotConnected)?;
        if state.pending.contains(kind) {
            return Err(LobbyError::RequestPending(kind));
        }
        self.shared.transport.send(lobby, packet)?;
        state
            .pending
            .begin(kind, Instant::now() + self.shared.request_timeout);
        tracing::debug!("Lobby request {kind:?} sent");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// I/O thread
// ---------------------------------------------------------------------------

impl LobbyShared {
    fn push(&self, event: LobbyEvent) {
        // Both ends live in `self`, so the send cannot fail.
        let _ = self.events_tx.send(event);
    }

    fn on_lobby_packet(&self, packet: &Packet) {
        let mut state = lock(&self.state);
        let event = match packet {
            Packet::RegisterResult(result) => {
                state.pending.complete(RequestKind::Register);
                LobbyEvent::Registered(*result)
            }
            Packet::LoginResult(result) => {
                state.pending.complete(RequestKind::Login);
                if let Ok(name) = result {
                    tracing::info!("Logged in as {name}");
                    state.account = Some(name.clone());
                }
                LobbyEvent::LoggedIn(result.clone())
            }
            Packet::LogoutResult(result) => {
                state.pending.complete(RequestKind::Logout);
                if result.is_ok() {
                    state.account = None;
                    state.leave_room_locally();
                }
                LobbyEvent::LoggedOut(*result)
            }
            Packet::OnlineUsers(result) => {
                state.pending.complete(RequestKind::OnlineUsers);
                LobbyEvent::OnlineUsers(result.clone())
            }
            Packet::ChatHistory(result) => {
                state.pending.complete(RequestKind::ChatHistory);
                LobbyEvent::ChatHistory(result.clone())
            }
            Packet::ChatBroadcast(message) => LobbyEvent::ChatReceived(message.clone()),
            Packet::ChatRejected(reason) => LobbyEvent::ChatRejected(*reason),
            Packet::CreateRoomResult(result) => {
                state.pending.complete(RequestKind::CreateRoom);
                if let Ok(room) = result {
                    state.room = Some(room.clone());
                    state.members = vec![MemberInfo {
                        peer: room.owner,
                        name: room.owner_name.clone(),
                    }];
                }
                LobbyEvent::RoomCreated(result.clone())
            }
            Packet::SearchResult(result) => {
                state.pending.complete(RequestKind::SearchRooms);
                LobbyEvent::RoomsFound(result.clone())
            }
            Packet::JoinRoomResult(result) => {
                state.pending.complete(RequestKind::JoinRoom);
                if let Ok(joined) = result {
                    state.room = Some(joined.room.clone());
                    state.members = joined.members.clone();
                }
                LobbyEvent::RoomJoined(result.clone())
            }
            Packet::LeaveRoomResult(result) => {
                state.pending.complete(RequestKind::LeaveRoom);
                if let Ok(left) = result
                    && state.room.as_ref().is_some_and(|room| room.id == *left)
                {
                    state.leave_room_locally();
                }
                LobbyEvent::RoomLeft(*result)
            }
            Packet::ChangePublicSlotsResult(result) => {
                state.pending.complete(RequestKind::ChangePublicSlots);
                if let (Ok(slots), Some(room)) = (result, state.room.as_mut()) {
                    room.public_slots = *slots;
                }
                LobbyEvent::PublicSlotsChanged(*result)
            }
            Packet::MemberJoined { room, member } => {
                if state.room.as_ref().is_some_and(|current| current.id == *room)
                    && !state.members.iter().any(|m| m.peer == member.peer)
                {
                    state.members.push(member.clone());
                }
                LobbyEvent::MemberJoined {
                    room: *room,
                    member: member.clone(),
                }
            }
            Packet::MemberLeft { room, peer } => {
                if state.room.as_ref().is_some_and(|current| current.id == *room) {
                    state.members.retain(|m| m.peer != *peer);
                }
                LobbyEvent::MemberLeft {
                    room: *room,
                    peer: *peer,
                }
            }
            Packet::RoomDestroyed { room } => {
                if state.room.as_ref().is_some_and(|current| current.id == *room) {
                    tracing::info!("Room {room} was destroyed");
                    state.leave_room_locally();
                }
                LobbyEvent::RoomDestroyed(*room)
            }
            Packet::PunchFailed { peer, reason } => LobbyEvent::PunchFailed {
                peer: *peer,
                reason: *reason,
            },
            // Punch introductions and relayed game traffic belong to the endpoints.
            _ => return,
        };
        drop(state);
        self.push(event);
    }

    fn on_lobby_closed(&self) {
        let mut state = lock(&self.state);
        state.connection = LobbyConnection::Disconnected;
        state.account = None;
        state.leave_room_locally();
        state.pending = PendingRequests::default();
        drop(state);
        tracing::warn!("Lobby connection closed");
        self.push(LobbyEvent::Disconnected);
    }
}

impl PacketObserver for LobbyShared {
    fn on_event(&self, event: &TransportEvent, _transport: &TransportHandle) {
        match event {
            TransportEvent::Connected {
                peer,
                attempt: Some(attempt),
                ..
            } => {
                let mut state = lock(&self.state);
                if state.connection == LobbyConnection::Connecting(*attempt) {
                    state.connection = LobbyConnection::Connected(*peer);
                    state.last_lobby = Some(*peer);
                    drop(state);
                    tracing::info!("Connected to lobby {peer}");
                    self.push(LobbyEvent::Connected);
                }
            }
            TransportEvent::ConnectionFailed {
                attempt, reason, ..
            } => {
                let mut state = lock(&self.state);
                if state.connection == LobbyConnection::Connecting(*attempt) {
                    state.connection = LobbyConnection::Disconnected;
                    drop(state);
                    self.push(LobbyEvent::ConnectionFailed(reason.clone()));
                }
            }
            TransportEvent::ConnectionLost { peer } | TransportEvent::Disconnected { peer } => {
                let is_lobby = lock(&self.state).lobby_peer() == Some(*peer);
                if is_lobby {
                    self.on_lobby_closed();
                }
            }
            TransportEvent::Packet { from, packet } => {
                let is_lobby = lock(&self.state).lobby_peer() == Some(*from);
                if is_lobby {
                    self.on_lobby_packet(packet);
                }
            }
            TransportEvent::Connected { .. } => {}
        }
    }
}
