//! Wire protocol shared by the lobby server and the peer-to-peer transport.
//!
//! Three layers, leaves first:
//! - [`types`]: identifiers (`PeerId`, `NumericPlayerId`, `RoomId`) and the
//!   transient directory records carried inside packets.
//! - [`packet`]: the [`Packet`] tagged union, its [`PacketKind`]
//!   classification, and the versioned postcard codec.
//! - [`framing`]: length-prefixed frames over any tokio stream.
//!
//! [`auth`] holds the shared-secret proof used by the lobby handshake and
//! [`socket`] the TCP options both ends apply to their connections.

pub mod auth;
pub mod framing;
pub mod packet;
pub mod socket;
pub mod types;

pub use auth::{AuthError, NONCE_LEN, challenge_proof, new_nonce, verify_proof};
pub use framing::{FrameConfig, FrameError, read_frame, read_packet, write_frame, write_packet};
pub use packet::{
    JoinedRoom, PROTOCOL_VERSION, Packet, PacketError, PacketKind, Rejection, decode_packet,
    encode_packet,
};
pub use socket::{SocketConfig, configure_stream, create_listener, unspecified_v4};
pub use types::{
    BROADCAST_PLAYER_ID, ChatMessage, MemberInfo, NumericPlayerId, PeerId, RoomId, RoomInfo,
    RoomMetadata, SERVER_PLAYER_ID, UserInfo,
};
