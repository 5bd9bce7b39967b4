//! Peer-to-peer multiplayer networking: transport, lobby client, sessions and
//! the polling endpoints the game loop drives.

pub mod endpoint;
pub mod error;
pub mod lobby;
pub mod notification;
pub mod queue;
pub mod roster;
pub mod routing;
pub mod session;
pub mod subsystem;
mod sync;
pub mod transport;

pub use endpoint::{ClientEndpoint, HostEndpoint, NetSystem, PlayerEndpoint, ReceptionNotifier};
pub use error::{EndpointError, LobbyError, SessionError, TransportError};
pub use lobby::{LobbyClient, LobbyConnection, LobbyEvent, RequestKind};
pub use notification::WakeHook;
pub use queue::{MessageEnvelope, MessageQueue, ReceiveStatus};
pub use roster::{Roster, RosterEntry};
pub use routing::{
    DeliveryPath, GameTraffic, PeerSequences, REORDER_HOLD, SequenceCounter, SequenceGuard,
    classify_game,
};
pub use session::{Session, SessionState};
pub use subsystem::{CloseReason, DEFAULT_MAX_PLAYERS, NetworkSubsystem, SubsystemEvent};
pub use transport::{
    ConnectAttempt, ObserverId, PacketObserver, Transport, TransportConfig, TransportEvent,
    TransportHandle,
};
