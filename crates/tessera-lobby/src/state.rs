//! The lobby's bookkeeping: who is connected, who is logged in, which rooms
//! exist and who is in them.
//!
//! [`LobbyState`] is synchronous and does no I/O. Each call takes one input
//! (a new connection, an inbound packet, a closed connection) and returns the
//! packets to send, in order, as [`Outbound`] items for the server to route.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use tessera_config::LobbyConfig;
use tessera_protocol::{
    ChatMessage, JoinedRoom, MemberInfo, Packet, PeerId, Rejection, RoomId, RoomInfo, UserInfo,
};

use crate::accounts::{AccountStore, validate_name};
use crate::server::ConnectionId;

/// One packet addressed to one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub to: ConnectionId,
    pub packet: Packet,
}

/// What the lobby knows about a connection after its handshake.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub peer: PeerId,
    /// Address the connection came from.
    pub address: SocketAddr,
    /// Port the client accepts direct connections on.
    pub listen_port: Option<u16>,
    /// Application id from the client's `Hello`.
    pub app_id: String,
    pub account: Option<String>,
    pub room: Option<RoomId>,
}

struct Room {
    info: RoomInfo,
    password: Option<String>,
    /// Owner first, then joiners in join order.
    members: Vec<ConnectionId>,
}

/// Rooms, accounts, chat and connected clients.
pub struct LobbyState {
    accounts: AccountStore,
    clients: HashMap<ConnectionId, ClientRecord>,
    rooms: BTreeMap<RoomId, Room>,
    next_room: u64,
    chat: VecDeque<ChatMessage>,
    chat_history: usize,
    max_room_slots: u8,
}

impl LobbyState {
    pub fn new(config: &LobbyConfig) -> Self {
        Self {
            accounts: AccountStore::new(),
            clients: HashMap::new(),
            rooms: BTreeMap::new(),
            next_room: 1,
            chat: VecDeque::new(),
            chat_history: config.chat_history,
            max_room_slots: config.max_room_slots.max(1),
        }
    }

    /// Record a connection that passed the handshake.
    pub fn connect(
        &mut self,
        id: ConnectionId,
        peer: PeerId,
        address: SocketAddr,
        listen_port: Option<u16>,
        app_id: String,
    ) {
        self.clients.insert(
            id,
            ClientRecord {
                peer,
                address,
                listen_port,
                app_id,
                account: None,
                room: None,
            },
        );
    }

    /// Record a connection unless another one already presented `peer`.
    /// Returns whether it was recorded.
    pub fn connect_unique(
        &mut self,
        id: ConnectionId,
        peer: PeerId,
        address: SocketAddr,
        listen_port: Option<u16>,
        app_id: String,
    ) -> bool {
        if self.is_peer_connected(peer) {
            return false;
        }
        self.connect(id, peer, address, listen_port, app_id);
        true
    }

    /// Whether some connection presented `peer` in its handshake.
    pub fn is_peer_connected(&self, peer: PeerId) -> bool {
        self.clients.values().any(|client| client.peer == peer)
    }

    /// Forget a closed connection, leaving its room first.
    pub fn disconnect(&mut self, id: ConnectionId) -> Vec<Outbound> {
        let mut out = Vec::new();
        self.leave_room(id, &mut out);
        if let Some(client) = self.clients.remove(&id)
            && let Some(account) = client.account
        {
            tracing::info!("{account} went offline");
        }
        out
    }

    pub fn client(&self, id: ConnectionId) -> Option<&ClientRecord> {
        self.clients.get(&id)
    }

    pub fn connection_count(&self) -> usize {
        self.clients.len()
    }

    pub fn room(&self, id: RoomId) -> Option<&RoomInfo> {
        self.rooms.get(&id).map(|room| &room.info)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Apply one inbound packet from `from`.
    pub fn handle(&mut self, from: ConnectionId, packet: Packet) -> Vec<Outbound> {
        let mut out = Vec::new();
        if !self.clients.contains_key(&from) {
            tracing::warn!("Packet from unknown connection {from:?} ignored");
            return out;
        }

        let reply = match packet {
            Packet::Register { name, password } => {
                Some(Packet::RegisterResult(self.accounts.register(&name, &password)))
            }
            Packet::Login { name, password } => Some(Packet::LoginResult(self.login(from, &name, &password))),
            Packet::Logout => Some(Packet::LogoutResult(self.logout(from, &mut out))),
            Packet::QueryOnlineUsers => Some(Packet::OnlineUsers(
                self.require_login(from).map(|_| self.online_users()),
            )),
            Packet::QueryChatHistory => Some(Packet::ChatHistory(
                self.require_login(from).map(|_| self.chat.iter().cloned().collect()),
            )),
            Packet::SendChat { text } => self.chat(from, text, &mut out).err().map(Packet::ChatRejected),
            Packet::CreateRoom {
                name,
                metadata,
                password,
                public_slots,
            } => {
                let result = self.create_room(from, &name, metadata, password, public_slots);
                Some(Packet::CreateRoomResult(result))
            }
            Packet::SearchRooms { app_id } => Some(Packet::SearchResult(
                self.require_login(from).map(|_| self.search(&app_id)),
            )),
            Packet::JoinRoom { room, password } => {
                let result = self.join_room(from, room, password.as_deref(), &mut out);
                Some(Packet::JoinRoomResult(result))
            }
            Packet::LeaveRoom => {
                let result = self.leave_room(from, &mut out).ok_or(Rejection::NotInRoom);
                Some(Packet::LeaveRoomResult(result))
            }
            Packet::ChangePublicSlots { slots } => {
                Some(Packet::ChangePublicSlotsResult(self.change_slots(from, slots)))
            }
            Packet::PunchRequest { target } => Some(self.punch(from, target)),
            Packet::RelayToServer {
                peer,
                sequence,
                payload,
            } => {
                self.relay_to_server(from, peer, sequence, payload, &mut out);
                None
            }
            Packet::RelayToClient {
                peer,
                sequence,
                payload,
            } => {
                self.relay_to_client(from, peer, sequence, payload, &mut out);
                None
            }
            other => {
                tracing::warn!("Unexpected {:?} packet from {from:?}", other.kind());
                None
            }
        };

        if let Some(packet) = reply {
            out.push(Outbound { to: from, packet });
        }
        out
    }

    // ---- Accounts and directory ----

    fn require_login(&self, id: ConnectionId) -> Result<&str, Rejection> {
        self.clients
            .get(&id)
            .and_then(|client| client.account.as_deref())
            .ok_or(Rejection::NotLoggedIn)
    }

    fn login(&mut self, id: ConnectionId, name: &str, password: &str) -> Result<String, Rejection> {
        if self.require_login(id).is_ok() {
            return Err(Rejection::AlreadyLoggedIn);
        }
        let account = self.accounts.verify(name, password)?;
        if self
            .clients
            .values()
            .any(|client| client.account.as_deref() == Some(account.as_str()))
        {
            return Err(Rejection::AlreadyLoggedIn);
        }
        if let Some(client) = self.clients.get_mut(&id) {
            client.account = Some(account.clone());
        }
        tracing::info!("{account} logged in");
        Ok(account)
    }

    fn logout(&mut self, id: ConnectionId, out: &mut Vec<Outbound>) -> Result<(), Rejection> {
        self.require_login(id)?;
        self.leave_room(id, out);
        if let Some(client) = self.clients.get_mut(&id) {
            client.account = None;
        }
        Ok(())
    }

    fn online_users(&self) -> Vec<UserInfo> {
        let mut users: Vec<UserInfo> = self
            .clients
            .values()
            .filter_map(|client| {
                client.account.as_ref().map(|name| UserInfo {
                    name: name.clone(),
                    peer: client.peer,
                    room: client.room,
                })
            })
            .collect();
        users.sort_by(|a, b| a.name.cmp(&b.name));
        users
    }

    fn chat(&mut self, from: ConnectionId, text: String, out: &mut Vec<Outbound>) -> Result<(), Rejection> {
        let author = self.require_login(from)?.to_string();
        let message = ChatMessage {
            from: author,
            text,
            timestamp_ms: unix_millis(),
        };

        self.chat.push_back(message.clone());
        while self.chat.len() > self.chat_history {
            self.chat.pop_front();
        }

        for (id, client) in &self.clients {
            if client.account.is_some() {
                out.push(Outbound {
                    to: *id,
                    packet: Packet::ChatBroadcast(message.clone()),
                });
            }
        }
        Ok(())
    }

    // ---- Rooms ----

    fn create_room(
        &mut self,
        from: ConnectionId,
        name: &str,
        metadata: tessera_protocol::RoomMetadata,
        password: Option<String>,
        public_slots: u8,
    ) -> Result<RoomInfo, Rejection> {
        let owner_name = self.require_login(from)?.to_string();
        let client = self.clients.get(&from).ok_or(Rejection::NotLoggedIn)?;
        if client.room.is_some() {
            return Err(Rejection::AlreadyInRoom);
        }
        let name = validate_name(name)?;

        let id = RoomId(self.next_room);
        self.next_room += 1;
        let info = RoomInfo {
            id,
            name: name.to_string(),
            owner: client.peer,
            owner_name,
            password_protected: password.is_some(),
            metadata,
            app_id: client.app_id.clone(),
            public_slots: public_slots.clamp(1, self.max_room_slots),
            member_count: 1,
        };
        self.rooms.insert(
            id,
            Room {
                info: info.clone(),
                password,
                members: vec![from],
            },
        );
        if let Some(client) = self.clients.get_mut(&from) {
            client.room = Some(id);
        }
        tracing::info!("{} created {id} '{}'", info.owner_name, info.name);
        Ok(info)
    }

    fn search(&self, app_id: &str) -> Vec<RoomInfo> {
        self.rooms
            .values()
            .filter(|room| room.info.app_id == app_id)
            .map(|room| room.info.clone())
            .collect()
    }

    fn join_room(
        &mut self,
        from: ConnectionId,
        room_id: RoomId,
        password: Option<&str>,
        out: &mut Vec<Outbound>,
    ) -> Result<JoinedRoom, Rejection> {
        let name = self.require_login(from)?.to_string();
        let client = self.clients.get(&from).ok_or(Rejection::NotLoggedIn)?;
        if client.room.is_some() {
            return Err(Rejection::AlreadyInRoom);
        }
        let peer = client.peer;

        let room = self.rooms.get_mut(&room_id).ok_or(Rejection::RoomNotFound)?;
        if room.password.is_some() && room.password.as_deref() != password {
            return Err(Rejection::WrongPassword);
        }
        if room.members.len() >= usize::from(room.info.public_slots) {
            return Err(Rejection::RoomFull);
        }

        let joiner = MemberInfo { peer, name };
        for member in &room.members {
            out.push(Outbound {
                to: *member,
                packet: Packet::MemberJoined {
                    room: room_id,
                    member: joiner.clone(),
                },
            });
        }
        room.members.push(from);
        room.info.member_count = room.members.len() as u8;
        let info = room.info.clone();
        let member_ids = room.members.clone();

        if let Some(client) = self.clients.get_mut(&from) {
            client.room = Some(room_id);
        }
        tracing::info!("{} joined {room_id}", joiner.name);
        Ok(JoinedRoom {
            room: info,
            members: self.member_infos(&member_ids),
        })
    }

    /// Take `id` out of its room. An owner leaving destroys the room.
    /// Returns the room left, if any.
    fn leave_room(&mut self, id: ConnectionId, out: &mut Vec<Outbound>) -> Option<RoomId> {
        let room_id = self.clients.get_mut(&id)?.room.take()?;
        let room = self.rooms.get_mut(&room_id)?;
        room.members.retain(|member| *member != id);

        let leaver = self.clients.get(&id).map(|client| client.peer)?;
        if room.info.owner == leaver {
            let Some(room) = self.rooms.remove(&room_id) else {
                return Some(room_id);
            };
            tracing::info!("{room_id} destroyed, owner left");
            for member in room.members {
                if let Some(client) = self.clients.get_mut(&member) {
                    client.room = None;
                }
                out.push(Outbound {
                    to: member,
                    packet: Packet::RoomDestroyed { room: room_id },
                });
            }
        } else {
            room.info.member_count = room.members.len() as u8;
            for member in &room.members {
                out.push(Outbound {
                    to: *member,
                    packet: Packet::MemberLeft {
                        room: room_id,
                        peer: leaver,
                    },
                });
            }
        }
        Some(room_id)
    }

    fn change_slots(&mut self, from: ConnectionId, slots: u8) -> Result<u8, Rejection> {
        let client = self.clients.get(&from).ok_or(Rejection::NotLoggedIn)?;
        let room_id = client.room.ok_or(Rejection::NotInRoom)?;
        let peer = client.peer;
        let room = self.rooms.get_mut(&room_id).ok_or(Rejection::RoomNotFound)?;
        if room.info.owner != peer {
            return Err(Rejection::NotRoomOwner);
        }
        let slots = slots.min(self.max_room_slots);
        if usize::from(slots) < room.members.len() {
            return Err(Rejection::RoomFull);
        }
        room.info.public_slots = slots;
        Ok(slots)
    }

    fn member_infos(&self, members: &[ConnectionId]) -> Vec<MemberInfo> {
        members
            .iter()
            .filter_map(|id| self.clients.get(id))
            .map(|client| MemberInfo {
                peer: client.peer,
                name: client.account.clone().unwrap_or_default(),
            })
            .collect()
    }

    // ---- Punchthrough and relay ----

    /// Connection of `peer` if it shares a room with `from`.
    fn roommate(&self, from: ConnectionId, peer: PeerId) -> Option<(ConnectionId, RoomId)> {
        let room_id = self.clients.get(&from)?.room?;
        let room = self.rooms.get(&room_id)?;
        room.members
            .iter()
            .find(|member| self.clients.get(member).is_some_and(|client| client.peer == peer))
            .map(|member| (*member, room_id))
    }

    fn punch(&self, from: ConnectionId, target: PeerId) -> Packet {
        let Some((target_conn, _)) = self.roommate(from, target) else {
            return Packet::PunchFailed {
                peer: target,
                reason: Rejection::NotInRoom,
            };
        };
        let Some(record) = self.clients.get(&target_conn) else {
            return Packet::PunchFailed {
                peer: target,
                reason: Rejection::NotInRoom,
            };
        };
        match record.listen_port {
            Some(port) => Packet::PunchIntroduction {
                peer: target,
                address: SocketAddr::new(record.address.ip(), port),
            },
            None => Packet::PunchFailed {
                peer: target,
                reason: Rejection::Unreachable,
            },
        }
    }

    fn relay_to_server(
        &self,
        from: ConnectionId,
        host: PeerId,
        sequence: u64,
        payload: Vec<u8>,
        out: &mut Vec<Outbound>,
    ) {
        let Some(sender) = self.clients.get(&from).map(|client| client.peer) else {
            return;
        };
        match self.roommate(from, host) {
            Some((host_conn, room)) if self.rooms.get(&room).is_some_and(|r| r.info.owner == host) => {
                out.push(Outbound {
                    to: host_conn,
                    packet: Packet::RelayToServer {
                        peer: sender,
                        sequence,
                        payload,
                    },
                });
            }
            _ => tracing::debug!("Dropping relay from {sender} to non-host {host}"),
        }
    }

    fn relay_to_client(
        &self,
        from: ConnectionId,
        client: PeerId,
        sequence: u64,
        payload: Vec<u8>,
        out: &mut Vec<Outbound>,
    ) {
        let Some(sender) = self.clients.get(&from).map(|record| record.peer) else {
            return;
        };
        match self.roommate(from, client) {
            Some((client_conn, room)) if self.rooms.get(&room).is_some_and(|r| r.info.owner == sender) => {
                out.push(Outbound {
                    to: client_conn,
                    packet: Packet::RelayToClient {
                        peer: sender,
                        sequence,
                        payload,
                    },
                });
            }
            _ => tracing::debug!("Dropping relay from non-host {sender} to {client}"),
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
