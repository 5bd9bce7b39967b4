//! Packet types and serialization.
//!
//! Every packet is serialized with [`postcard`] and prefixed with a protocol
//! version byte. The enum discriminant plays the role of the message-id byte:
//! a packet is decoded once at the I/O boundary and dispatched by matching on
//! the variant (or on its coarser [`PacketKind`]).

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::types::{ChatMessage, MemberInfo, PeerId, RoomId, RoomInfo, RoomMetadata, UserInfo};

/// Current wire-protocol version. Prepended to every serialized packet.
pub const PROTOCOL_VERSION: u8 = 1;

// ---------------------------------------------------------------------------
// Packet
// ---------------------------------------------------------------------------

/// Top-level wire packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Packet {
    // --- Handshake ---
    /// First frame on every connection, sent by both sides.
    Hello {
        /// Sender's transport identity.
        peer: PeerId,
        /// Port the sender accepts direct connections on, if any.
        listen_port: Option<u16>,
        /// Application identifier of the sender.
        app_id: String,
    },
    /// Lobby asks a fresh connection to prove it knows the shared secret.
    Challenge {
        /// Random salt for the proof.
        nonce: [u8; 16],
    },
    /// Answer to [`Packet::Challenge`].
    ChallengeResponse {
        /// Key derived from the shared secret and the nonce.
        proof: Vec<u8>,
    },
    /// Sender is closing the connection on purpose.
    Goodbye,

    // --- Account ---
    /// Create an account.
    Register { name: String, password: String },
    /// Outcome of [`Packet::Register`].
    RegisterResult(Result<(), Rejection>),
    /// Log into an account.
    Login { name: String, password: String },
    /// Outcome of [`Packet::Login`]; carries the account name on success.
    LoginResult(Result<String, Rejection>),
    /// Log out of the current account.
    Logout,
    /// Outcome of [`Packet::Logout`].
    LogoutResult(Result<(), Rejection>),

    // --- Directory ---
    /// Ask for every logged-in user.
    QueryOnlineUsers,
    /// Response to [`Packet::QueryOnlineUsers`].
    OnlineUsers(Result<Vec<UserInfo>, Rejection>),
    /// Ask for the recent chat history.
    QueryChatHistory,
    /// Response to [`Packet::QueryChatHistory`].
    ChatHistory(Result<Vec<ChatMessage>, Rejection>),
    /// Post a chat line to the lobby.
    SendChat { text: String },
    /// Outcome of [`Packet::SendChat`], sent only on rejection.
    ChatRejected(Rejection),
    /// A chat line posted by any logged-in user.
    ChatBroadcast(ChatMessage),

    // --- Rooms ---
    /// Create a room owned by the sender.
    CreateRoom {
        name: String,
        metadata: RoomMetadata,
        password: Option<String>,
        public_slots: u8,
    },
    /// Outcome of [`Packet::CreateRoom`].
    CreateRoomResult(Result<RoomInfo, Rejection>),
    /// List rooms created under an application id.
    SearchRooms { app_id: String },
    /// Response to [`Packet::SearchRooms`].
    SearchResult(Result<Vec<RoomInfo>, Rejection>),
    /// Join an existing room.
    JoinRoom {
        room: RoomId,
        password: Option<String>,
    },
    /// Outcome of [`Packet::JoinRoom`].
    JoinRoomResult(Result<JoinedRoom, Rejection>),
    /// Leave the current room.
    LeaveRoom,
    /// Outcome of [`Packet::LeaveRoom`].
    LeaveRoomResult(Result<RoomId, Rejection>),
    /// Change the slot count of the sender's room (owner only).
    ChangePublicSlots { slots: u8 },
    /// Outcome of [`Packet::ChangePublicSlots`].
    ChangePublicSlotsResult(Result<u8, Rejection>),
    /// Sent to existing members when someone joins their room.
    MemberJoined { room: RoomId, member: MemberInfo },
    /// Sent to remaining members when someone leaves their room.
    MemberLeft { room: RoomId, peer: PeerId },
    /// Sent to every member when the owner leaves.
    RoomDestroyed { room: RoomId },

    // --- NAT punchthrough ---
    /// Ask the lobby to introduce the sender to another room member.
    PunchRequest { target: PeerId },
    /// Where to reach `peer` directly.
    PunchIntroduction { peer: PeerId, address: SocketAddr },
    /// The lobby could not introduce the sender to `peer`.
    PunchFailed { peer: PeerId, reason: Rejection },

    // --- Game traffic ---
    /// Game payload sent over a direct peer connection.
    GameMessage { sequence: u64, payload: Vec<u8> },
    /// Game payload for the host's server role, relayed through the lobby.
    ///
    /// Client to lobby: `peer` is the host. Lobby to host: `peer` is the
    /// original sender.
    RelayToServer {
        peer: PeerId,
        sequence: u64,
        payload: Vec<u8>,
    },
    /// Game payload for a client role, relayed through the lobby.
    ///
    /// Host to lobby: `peer` is the client. Lobby to client: `peer` is the
    /// host.
    RelayToClient {
        peer: PeerId,
        sequence: u64,
        payload: Vec<u8>,
    },
}

/// Successful join: the room as it is now and everyone in it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinedRoom {
    /// The joined room.
    pub room: RoomInfo,
    /// Members including the owner and the joiner.
    pub members: Vec<MemberInfo>,
}

/// Why the lobby refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum Rejection {
    #[error("unknown account or wrong password")]
    BadCredentials,
    #[error("account already exists")]
    AccountExists,
    #[error("account already logged in")]
    AlreadyLoggedIn,
    #[error("not logged in")]
    NotLoggedIn,
    #[error("room not found")]
    RoomNotFound,
    #[error("room is full")]
    RoomFull,
    #[error("wrong room password")]
    WrongPassword,
    #[error("only the room owner may do that")]
    NotRoomOwner,
    #[error("already in a room")]
    AlreadyInRoom,
    #[error("not in a room")]
    NotInRoom,
    #[error("invalid name")]
    InvalidName,
    #[error("authentication handshake failed")]
    AuthFailed,
    #[error("peer has no reachable address")]
    Unreachable,
}

// ---------------------------------------------------------------------------
// PacketKind
// ---------------------------------------------------------------------------

/// Coarse routing class of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    /// Connection setup and teardown.
    Handshake,
    /// Account and directory traffic between a peer and the lobby.
    LobbyControl,
    /// Room membership, slots and punchthrough.
    RoomControl,
    /// Game payload for the host's server role, via the lobby.
    RelayToHost,
    /// Game payload for a client role, via the lobby.
    RelayToClient,
    /// Game payload over a direct connection.
    GamePayload,
}

impl Packet {
    /// Routing class of this packet.
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Hello { .. }
            | Packet::Challenge { .. }
            | Packet::ChallengeResponse { .. }
            | Packet::Goodbye => PacketKind::Handshake,
            Packet::Register { .. }
            | Packet::RegisterResult(_)
            | Packet::Login { .. }
            | Packet::LoginResult(_)
            | Packet::Logout
            | Packet::LogoutResult(_)
            | Packet::QueryOnlineUsers
            | Packet::OnlineUsers(_)
            | Packet::QueryChatHistory
            | Packet::ChatHistory(_)
            | Packet::SendChat { .. }
            | Packet::ChatRejected(_)
            | Packet::ChatBroadcast(_) => PacketKind::LobbyControl,
            Packet::CreateRoom { .. }
            | Packet::CreateRoomResult(_)
            | Packet::SearchRooms { .. }
            | Packet::SearchResult(_)
            | Packet::JoinRoom { .. }
            | Packet::JoinRoomResult(_)
            | Packet::LeaveRoom
            | Packet::LeaveRoomResult(_)
            | Packet::ChangePublicSlots { .. }
            | Packet::ChangePublicSlotsResult(_)
            | Packet::MemberJoined { .. }
            | Packet::MemberLeft { .. }
            | Packet::RoomDestroyed { .. }
            | Packet::PunchRequest { .. }
            | Packet::PunchIntroduction { .. }
            | Packet::PunchFailed { .. } => PacketKind::RoomControl,
            Packet::RelayToServer { .. } => PacketKind::RelayToHost,
            Packet::RelayToClient { .. } => PacketKind::RelayToClient,
            Packet::GameMessage { .. } => PacketKind::GamePayload,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during packet decoding.
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    /// The payload was empty (no version byte).
    #[error("empty payload, no version byte")]
    EmptyPayload,

    /// The version byte does not match [`PROTOCOL_VERSION`].
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Postcard (de)serialization failed.
    #[error("postcard error: {0}")]
    Postcard(#[from] postcard::Error),
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Serialize a [`Packet`] into a versioned binary payload.
///
/// Wire format: `[version: u8] [postcard-encoded Packet]`
pub fn encode_packet(packet: &Packet) -> Result<Vec<u8>, PacketError> {
    let body = postcard::to_allocvec(packet)?;
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(PROTOCOL_VERSION);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Deserialize a versioned binary payload into a [`Packet`].
pub fn decode_packet(data: &[u8]) -> Result<Packet, PacketError> {
    let (&version, body) = data.split_first().ok_or(PacketError::EmptyPayload)?;
    if version != PROTOCOL_VERSION {
        return Err(PacketError::UnsupportedVersion(version));
    }
    Ok(postcard::from_bytes(body)?)
}
