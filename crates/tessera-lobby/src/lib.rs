//! The well-known lobby server peers authenticate against.
//!
//! It keeps accounts, the online-user directory and chat, tracks rooms and
//! their members, relays game traffic between members of the same room and
//! introduces room members to each other for direct connections.

pub mod accounts;
pub mod error;
pub mod server;
pub mod state;

pub use accounts::AccountStore;
pub use error::LobbyServerError;
pub use server::{ConnectionId, ConnectionMap, IdGenerator, LobbyServer, ServerConfig};
pub use state::{ClientRecord, LobbyState, Outbound};
