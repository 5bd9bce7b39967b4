//! Identifiers and directory records.
//!
//! [`PeerId`] is the transport-level identity of a process; the legacy polling
//! contract never sees it and works with [`NumericPlayerId`] instead.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque, transport-issued identity of one reachable endpoint.
///
/// Each process draws a random id when its transport starts; the id is sent
/// in the connection handshake so both sides of a link agree on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Small integer id used by the legacy polling contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NumericPlayerId(pub u32);

/// Reserved id of the host's server role. Never assigned to a joining peer.
pub const SERVER_PLAYER_ID: NumericPlayerId = NumericPlayerId(0);

/// Destination id meaning "every player in the roster".
pub const BROADCAST_PLAYER_ID: NumericPlayerId = NumericPlayerId(u32::MAX);

impl NumericPlayerId {
    /// Fold a [`PeerId`] into a numeric id.
    ///
    /// The result is a pure function of the peer id and never equals
    /// [`SERVER_PLAYER_ID`] or [`BROADCAST_PLAYER_ID`]. Two peers may still
    /// fold to the same value; the host roster then takes the next free one.
    pub fn derive(peer: PeerId) -> Self {
        let folded = (peer.0 ^ (peer.0 >> 32)) as u32;
        Self(folded).skip_reserved()
    }

    /// Next candidate after `self`, skipping the reserved values.
    pub fn next_candidate(self) -> Self {
        Self(self.0.wrapping_add(1)).skip_reserved()
    }

    /// Whether this id is one of the two reserved values.
    pub fn is_reserved(self) -> bool {
        self == SERVER_PLAYER_ID || self == BROADCAST_PLAYER_ID
    }

    fn skip_reserved(self) -> Self {
        match self {
            SERVER_PLAYER_ID | BROADCAST_PLAYER_ID => Self(1),
            other => other,
        }
    }
}

impl fmt::Display for NumericPlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lobby-assigned room identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoomId(pub u64);

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "room-{}", self.0)
    }
}

/// Scenario metadata attached to a room at creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMetadata {
    /// Scenario (map) name.
    pub scenario: String,
    /// Free-form description shown in room listings.
    pub description: String,
}

/// One room as reported by a search or create response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    /// Lobby-assigned id.
    pub id: RoomId,
    /// Display name chosen by the owner.
    pub name: String,
    /// Transport identity of the owner (the session host).
    pub owner: PeerId,
    /// Account name of the owner.
    pub owner_name: String,
    /// Whether joining requires a password.
    pub password_protected: bool,
    /// Scenario metadata.
    pub metadata: RoomMetadata,
    /// Application identifier the room was created under.
    pub app_id: String,
    /// Total player slots, owner included.
    pub public_slots: u8,
    /// Players currently in the room, owner included.
    pub member_count: u8,
}

/// One member of a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    /// Transport identity of the member.
    pub peer: PeerId,
    /// Account name.
    pub name: String,
}

/// One logged-in user as reported by the online-users query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    /// Account name.
    pub name: String,
    /// Transport identity of the user's connection.
    pub peer: PeerId,
    /// Room the user is currently in, if any.
    pub room: Option<RoomId>,
}

/// One lobby chat line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Account name of the author.
    pub from: String,
    /// Message text.
    pub text: String,
    /// Server wall-clock time (Unix milliseconds).
    pub timestamp_ms: u64,
}
