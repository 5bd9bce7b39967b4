//! Root of the networking stack, owned by the embedding application.
//!
//! [`NetworkSubsystem`] starts the transport, connects the lobby client and
//! holds at most one [`Session`]. The application calls [`NetworkSubsystem::poll`]
//! from its main loop (typically after [`NetworkSubsystem::wait_for_activity`]
//! or a wake hook fires) to drain lobby events and advance the session.

use std::time::{Duration, Instant};

use tessera_config::NetworkConfig;
use tessera_protocol::{Rejection, RoomInfo, RoomMetadata};

use crate::error::{SessionError, TransportError};
use crate::lobby::{LobbyClient, LobbyEvent, RequestKind};
use crate::session::{Session, SessionState};
use crate::transport::{Transport, TransportConfig, TransportHandle};

/// Slot count used by [`NetworkSubsystem::create_session`].
pub const DEFAULT_MAX_PLAYERS: u8 = 4;

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CloseReason {
    #[error("room creation rejected: {0}")]
    CreateRejected(Rejection),
    #[error("join rejected: {0}")]
    JoinRejected(Rejection),
    #[error("the lobby did not answer in time")]
    TimedOut,
    #[error("the room was destroyed")]
    RoomDestroyed,
    #[error("lost connection to the lobby")]
    LobbyLost,
    #[error("left the room")]
    Left,
}

/// Output of one [`NetworkSubsystem::poll`].
#[derive(Debug, Clone, PartialEq)]
pub enum SubsystemEvent {
    /// A lobby event, passed through unchanged.
    Lobby(LobbyEvent),
    /// The pending session was confirmed by the lobby.
    SessionActive,
    /// The session ended. It stays readable until the next create or join.
    SessionClosed(CloseReason),
}

/// Transport, lobby client and current session.
pub struct NetworkSubsystem {
    config: NetworkConfig,
    lobby: LobbyClient,
    session: Option<Session>,
    // Dropped last so the session can still say goodbye to the lobby.
    transport: Transport,
}

impl NetworkSubsystem {
    /// Bind the transport and start connecting to the configured lobby.
    pub fn start(config: &NetworkConfig) -> Result<Self, TransportError> {
        let transport = Transport::start(TransportConfig::from_network(config))?;
        let lobby = LobbyClient::new(transport.handle(), config);
        lobby.connect();
        Ok(Self {
            config: config.clone(),
            lobby,
            session: None,
            transport,
        })
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn transport(&self) -> TransportHandle {
        self.transport.handle()
    }

    pub fn lobby(&self) -> &LobbyClient {
        &self.lobby
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn session_mut(&mut self) -> Option<&mut Session> {
        self.session.as_mut()
    }

    /// Create a room with default metadata and [`DEFAULT_MAX_PLAYERS`] slots.
    pub fn create_session(
        &mut self,
        name: &str,
        password: Option<&str>,
    ) -> Result<&mut Session, SessionError> {
        self.create_session_with(name, RoomMetadata::default(), password, DEFAULT_MAX_PLAYERS)
    }

    /// Ask the lobby for a new room owned by us. The session is `Pending`
    /// until [`LobbyEvent::RoomCreated`] arrives.
    pub fn create_session_with(
        &mut self,
        name: &str,
        metadata: RoomMetadata,
        password: Option<&str>,
        max_players: u8,
    ) -> Result<&mut Session, SessionError> {
        self.ensure_no_session()?;
        self.lobby.create_room(name, metadata, password, max_players)?;

        let host_name = self.lobby.account().unwrap_or_default();
        let session = Session::create(
            self.transport.handle(),
            self.lobby.clone(),
            name,
            self.transport.handle().local_peer(),
            &host_name,
            max_players,
            None,
        );
        Ok(self.session.insert(session))
    }

    /// Ask to join `room`. The session is `Pending` until
    /// [`LobbyEvent::RoomJoined`] arrives.
    pub fn join_session(
        &mut self,
        room: &RoomInfo,
        password: Option<&str>,
    ) -> Result<&mut Session, SessionError> {
        self.ensure_no_session()?;
        self.lobby.join_room(room.id, password)?;

        let session = Session::create(
            self.transport.handle(),
            self.lobby.clone(),
            &room.name,
            room.owner,
            &room.owner_name,
            room.public_slots,
            Some(room.clone()),
        );
        Ok(self.session.insert(session))
    }

    /// Drop the current session. An active one asks the lobby to leave the
    /// room without waiting for the answer.
    pub fn leave_session(&mut self) -> Result<(), SessionError> {
        self.session.take().map(drop).ok_or(SessionError::NoActiveSession)
    }

    /// Block the calling thread until the transport signals inbound traffic
    /// or `timeout` passes. Returns whether a notification is pending.
    pub fn wait_for_activity(&self, timeout: Duration) -> bool {
        self.transport.handle().wait_for_notification(timeout)
    }

    /// Expire overdue requests, drain lobby events and advance the session.
    pub fn poll(&mut self) -> Vec<SubsystemEvent> {
        // Cleared first so anything arriving during the drain notifies again.
        self.transport.handle().reset_notification();
        self.lobby.expire_requests(Instant::now());

        let mut out = Vec::new();
        for event in self.lobby.poll_events() {
            let follow_up = self.apply(&event);
            out.push(SubsystemEvent::Lobby(event));
            out.extend(follow_up);
        }
        out
    }

    fn ensure_no_session(&mut self) -> Result<(), SessionError> {
        match &self.session {
            Some(session) if session.state() != SessionState::Closed => Err(SessionError::SessionActive),
            _ => {
                self.session = None;
                Ok(())
            }
        }
    }

    fn apply(&mut self, event: &LobbyEvent) -> Option<SubsystemEvent> {
        let live = self
            .session
            .as_mut()
            .filter(|session| session.state() != SessionState::Closed);

        let Some(session) = live else {
            self.abandon_late_room(event);
            return None;
        };

        let pending = session.state() == SessionState::Pending;
        let current = session.room_id();
        match event {
            LobbyEvent::RoomCreated(Ok(room)) if pending && session.is_local_host() => {
                session.activate(room.clone(), usize::from(room.member_count));
                Some(SubsystemEvent::SessionActive)
            }
            LobbyEvent::RoomCreated(Err(reason)) if pending && session.is_local_host() => {
                Some(close(session, CloseReason::CreateRejected(*reason)))
            }
            LobbyEvent::RoomJoined(Ok(joined)) if pending && current == Some(joined.room.id) => {
                session.activate(joined.room.clone(), joined.members.len());
                Some(SubsystemEvent::SessionActive)
            }
            LobbyEvent::RoomJoined(Err(reason)) if pending && !session.is_local_host() => {
                Some(close(session, CloseReason::JoinRejected(*reason)))
            }
            LobbyEvent::RequestTimedOut(RequestKind::CreateRoom | RequestKind::JoinRoom) if pending => {
                Some(close(session, CloseReason::TimedOut))
            }
            LobbyEvent::MemberJoined { room, .. } | LobbyEvent::MemberLeft { room, .. } if current == Some(*room) => {
                session.set_current_players(self.lobby.room_members().len());
                None
            }
            LobbyEvent::PublicSlotsChanged(result) => {
                match result {
                    Ok(slots) => session.set_cached_max_players(*slots),
                    Err(reason) => {
                        tracing::warn!("Slot change rejected: {reason}");
                        if let Some(room) = self.lobby.current_room() {
                            session.set_cached_max_players(room.public_slots);
                        }
                    }
                }
                None
            }
            LobbyEvent::RoomDestroyed(room) if current == Some(*room) => {
                Some(close(session, CloseReason::RoomDestroyed))
            }
            LobbyEvent::RoomLeft(Ok(room)) if current == Some(*room) => Some(close(session, CloseReason::Left)),
            LobbyEvent::Disconnected | LobbyEvent::ConnectionFailed(_) => {
                Some(close(session, CloseReason::LobbyLost))
            }
            _ => None,
        }
    }

    /// A create or join that succeeds after its session was dropped or
    /// closed leaves the room straight away.
    fn abandon_late_room(&self, event: &LobbyEvent) {
        if matches!(event, LobbyEvent::RoomCreated(Ok(_)) | LobbyEvent::RoomJoined(Ok(_))) {
            tracing::info!("Leaving a room granted after its session ended");
            if let Err(e) = self.lobby.leave_room() {
                tracing::debug!("Late leave request not sent: {e}");
            }
        }
    }
}

fn close(session: &mut Session, reason: CloseReason) -> SubsystemEvent {
    tracing::warn!("Session '{}' ended: {reason}", session.name());
    session.close();
    SubsystemEvent::SessionClosed(reason)
}
