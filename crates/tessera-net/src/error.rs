//! Error types for the transport, lobby client, session and endpoints.
//!
//! Everything here is returned synchronously to the consumer thread. Failures
//! that happen on the I/O thread never come back through these types; they
//! arrive as [`crate::TransportEvent`]s, [`crate::LobbyEvent`]s or
//! [`crate::NetSystem`] upcalls.

use tessera_protocol::{NumericPlayerId, PeerId};

use crate::lobby::RequestKind;

/// Errors from starting or using the transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The listen port could not be opened.
    #[error("failed to bind port {port}: {source}")]
    Bind {
        /// Requested port (0 = ephemeral).
        port: u16,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },

    /// The I/O runtime could not be created.
    #[error("failed to start I/O runtime: {0}")]
    Runtime(#[source] std::io::Error),

    /// No open link to the peer.
    #[error("not connected to peer {0}")]
    NotConnected(PeerId),
}

/// Errors from issuing lobby requests.
#[derive(Debug, thiserror::Error)]
pub enum LobbyError {
    /// No lobby connection is established.
    #[error("not connected to the lobby")]
    NotConnected,

    /// A request of the same kind is still waiting for its response.
    #[error("a {0:?} request is already pending")]
    RequestPending(RequestKind),

    /// The request could not be handed to the transport.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors from session management.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The operation requires the local process to be the room's host.
    #[error("local process is not the session host")]
    NotHost,

    /// The local process is host but does not own the room in the lobby.
    #[error("not authorized to change the room")]
    NotAuthorized,

    /// There is no session to operate on.
    #[error("no active session")]
    NoActiveSession,

    /// A session already exists; leave it first.
    #[error("a session is already active")]
    SessionActive,

    /// The endpoint of that role was already created for this session.
    #[error("endpoint already exists for this session")]
    EndpointExists,

    /// The lobby request backing the operation failed.
    #[error(transparent)]
    Lobby(#[from] LobbyError),
}

/// Errors from the legacy polling contract's send path.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EndpointError {
    /// The destination id is not valid for this endpoint role.
    #[error("invalid destination {0}")]
    InvalidDestination(NumericPlayerId),

    /// The destination id is not in the roster.
    #[error("unknown player {0}")]
    UnknownPlayer(NumericPlayerId),

    /// Neither a direct link nor a lobby relay is available.
    #[error("destination is unreachable")]
    NotConnected,

    /// The payload does not fit in one frame.
    #[error("payload of {size} bytes exceeds maximum {max}")]
    PayloadTooLarge {
        /// Payload length.
        size: usize,
        /// Largest accepted payload.
        max: usize,
    },
}
