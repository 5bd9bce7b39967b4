//! One created or joined room, and the factory for its player endpoints.
//!
//! A session starts `Pending` while its create or join request is in flight,
//! becomes `Active` when the lobby confirms it and ends `Closed` when the room
//! goes away. State changes are applied by [`crate::NetworkSubsystem::poll`]
//! on the consumer thread; the session is never touched from the I/O thread.

use std::sync::Arc;

use tessera_protocol::{PeerId, RoomId, RoomInfo};

use crate::endpoint::{
    ClientEndpoint, EndpointContext, EndpointRegistry, HostEndpoint, NetSystem, ReceptionNotifier,
};
use crate::error::SessionError;
use crate::lobby::LobbyClient;
use crate::transport::TransportHandle;

/// Lifecycle of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Create or join request sent, no answer yet.
    Pending,
    /// The lobby confirmed the room.
    Active,
    /// The room is gone or was never granted. Endpoints stop delivering.
    Closed,
}

/// The local process's view of one matchmade room.
pub struct Session {
    name: String,
    host_peer: PeerId,
    host_name: String,
    is_local_host: bool,
    max_players: u8,
    current_players: u8,
    room: Option<RoomInfo>,
    state: SessionState,
    context: EndpointContext,
}

impl Session {
    /// `is_local_host` is decided by comparing `host_peer` with the
    /// transport's own identity.
    pub(crate) fn create(
        transport: TransportHandle,
        lobby: LobbyClient,
        name: &str,
        host_peer: PeerId,
        host_name: &str,
        max_players: u8,
        room: Option<RoomInfo>,
    ) -> Self {
        let is_local_host = host_peer == transport.local_peer();
        tracing::info!(
            "Session '{name}' created (host {host_peer}, local host: {is_local_host})"
        );
        Self {
            name: name.to_string(),
            host_peer,
            host_name: host_name.to_string(),
            is_local_host,
            max_players,
            current_players: 1,
            room,
            state: SessionState::Pending,
            context: EndpointContext {
                transport,
                lobby,
                registry: Arc::new(EndpointRegistry::default()),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host_peer(&self) -> PeerId {
        self.host_peer
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn is_local_host(&self) -> bool {
        self.is_local_host
    }

    pub fn max_players(&self) -> u8 {
        self.max_players
    }

    /// Players in the room as last reported by the lobby, host included.
    pub fn current_players(&self) -> u8 {
        self.current_players
    }

    pub fn room(&self) -> Option<&RoomInfo> {
        self.room.as_ref()
    }

    pub fn room_id(&self) -> Option<RoomId> {
        self.room.as_ref().map(|room| room.id)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    /// Change the player cap.
    ///
    /// On the host this also asks the lobby to change the room's public
    /// slots, and fails with [`SessionError::NotAuthorized`] when the lobby
    /// does not list us as the room's owner. Elsewhere only the cached value
    /// changes.
    pub fn set_max_players(&mut self, max_players: u8) -> Result<(), SessionError> {
        if self.is_local_host {
            let local = self.context.transport.local_peer();
            let owns_room = self
                .context
                .lobby
                .current_room()
                .is_some_and(|room| room.owner == local);
            if !owns_room {
                return Err(SessionError::NotAuthorized);
            }
            self.context.lobby.change_room_public_slots(max_players)?;
        }
        self.max_players = max_players;
        Ok(())
    }

    /// Create the server-role endpoint. Host only, once per session.
    pub fn create_server(
        &self,
        net_system: Arc<dyn NetSystem>,
        notifier: Option<Arc<dyn ReceptionNotifier>>,
    ) -> Result<HostEndpoint, SessionError> {
        if !self.is_local_host {
            return Err(SessionError::NotHost);
        }
        if self.context.registry.has_host() {
            return Err(SessionError::EndpointExists);
        }
        Ok(HostEndpoint::new(self.context.clone(), net_system, notifier))
    }

    /// Create the client-role endpoint, once per session.
    pub fn create_client(
        &self,
        net_system: Arc<dyn NetSystem>,
        notifier: Option<Arc<dyn ReceptionNotifier>>,
        local_name: &str,
    ) -> Result<ClientEndpoint, SessionError> {
        if self.context.registry.has_client() {
            return Err(SessionError::EndpointExists);
        }
        Ok(ClientEndpoint::new(
            self.context.clone(),
            self.host_peer,
            self.host_name.clone(),
            self.room_id(),
            local_name,
            net_system,
            notifier,
        ))
    }

    // ---- Driven by the subsystem ----

    pub(crate) fn activate(&mut self, room: RoomInfo, players: usize) {
        tracing::info!("Session '{}' active in {}", self.name, room.id);
        self.max_players = room.public_slots;
        self.room = Some(room);
        self.set_current_players(players);
        self.state = SessionState::Active;
    }

    pub(crate) fn set_current_players(&mut self, players: usize) {
        self.current_players = u8::try_from(players).unwrap_or(u8::MAX);
    }

    pub(crate) fn set_cached_max_players(&mut self, max_players: u8) {
        self.max_players = max_players;
    }

    pub(crate) fn close(&mut self) {
        if self.state != SessionState::Closed {
            tracing::info!("Session '{}' closed", self.name);
            self.state = SessionState::Closed;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state != SessionState::Active {
            return;
        }
        if let Err(e) = self.context.lobby.leave_room() {
            tracing::debug!("Leave request for session '{}' not sent: {e}", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Transport, TransportConfig};
    use tessera_config::NetworkConfig;
    use tessera_protocol::NumericPlayerId;

    struct NullSystem;

    impl NetSystem for NullSystem {
        fn player_connected(&self, _id: NumericPlayerId, _name: &str) {}
        fn player_disconnected(&self, _id: NumericPlayerId) {}
    }

    fn start() -> (Transport, LobbyClient) {
        let transport = Transport::start(TransportConfig::default()).unwrap();
        let lobby = LobbyClient::new(transport.handle(), &NetworkConfig::default());
        (transport, lobby)
    }

    #[test]
    fn test_local_host_detection() {
        let (transport, lobby) = start();
        let handle = transport.handle();

        let own = Session::create(handle.clone(), lobby.clone(), "Room1", handle.local_peer(), "me", 2, None);
        assert!(own.is_local_host());
        assert_eq!(own.state(), SessionState::Pending);

        let other = Session::create(handle, lobby, "Room2", PeerId(42), "them", 2, None);
        assert!(!other.is_local_host());
    }

    #[test]
    fn test_create_server_requires_host() {
        let (transport, lobby) = start();
        let session = Session::create(transport.handle(), lobby, "Room1", PeerId(42), "them", 2, None);
        let result = session.create_server(Arc::new(NullSystem), None);
        assert!(matches!(result, Err(SessionError::NotHost)));
    }

    #[test]
    fn test_one_endpoint_per_role() {
        let (transport, lobby) = start();
        let handle = transport.handle();
        let session = Session::create(handle.clone(), lobby, "Room1", handle.local_peer(), "me", 2, None);

        let server = session.create_server(Arc::new(NullSystem), None).unwrap();
        assert!(matches!(
            session.create_server(Arc::new(NullSystem), None),
            Err(SessionError::EndpointExists)
        ));

        let client = session.create_client(Arc::new(NullSystem), None, "me").unwrap();
        assert!(matches!(
            session.create_client(Arc::new(NullSystem), None, "me"),
            Err(SessionError::EndpointExists)
        ));

        // Dropping frees the role again.
        drop(server);
        drop(client);
        assert!(session.create_server(Arc::new(NullSystem), None).is_ok());
    }

    #[test]
    fn test_set_max_players_non_host_caches() {
        let (transport, lobby) = start();
        let mut session = Session::create(transport.handle(), lobby, "Room1", PeerId(42), "them", 2, None);
        session.set_max_players(4).unwrap();
        assert_eq!(session.max_players(), 4);
    }

    #[test]
    fn test_set_max_players_host_without_room() {
        let (transport, lobby) = start();
        let handle = transport.handle();
        let mut session = Session::create(handle.clone(), lobby, "Room1", handle.local_peer(), "me", 2, None);
        assert!(matches!(session.set_max_players(3), Err(SessionError::NotAuthorized)));
        assert_eq!(session.max_players(), 2);
    }
}
