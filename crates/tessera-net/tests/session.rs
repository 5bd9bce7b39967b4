//! End-to-end sessions against a real lobby server.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{
    PendingCounter, Player, Recorder, SilentLobby, TestLobby, Upcall, network_config, receive,
    receive_blocking, wait_until,
};
use tessera_config::NetworkConfig;
use tessera_net::{
    ClientEndpoint, CloseReason, EndpointError, HostEndpoint, LobbyEvent, NetworkSubsystem,
    PlayerEndpoint, ReceptionNotifier, RequestKind, SessionState, SubsystemEvent,
};
use tessera_protocol::{
    BROADCAST_PLAYER_ID, NumericPlayerId, Rejection, RoomInfo, RoomMetadata, SERVER_PLAYER_ID,
};

/// Host creates a room and its server endpoint.
fn host_room(host: &mut Player, slots: u8, password: Option<&str>) -> (HostEndpoint, Arc<Recorder>) {
    host.net
        .create_session_with("Room1", RoomMetadata::default(), password, slots)
        .unwrap();
    host.expect(|e| matches!(e, SubsystemEvent::SessionActive));

    let recorder = Recorder::new();
    let session = host.net.session().unwrap();
    assert!(session.is_local_host());
    let server = session.create_server(recorder.clone(), None).unwrap();
    (server, recorder)
}

/// Find "Room1" through a search.
fn find_room(player: &mut Player) -> RoomInfo {
    player.net.lobby().search_rooms().unwrap();
    let event = player.expect(|e| matches!(e, SubsystemEvent::Lobby(LobbyEvent::RoomsFound(_))));
    let SubsystemEvent::Lobby(LobbyEvent::RoomsFound(Ok(rooms))) = event else {
        panic!("search failed: {event:?}");
    };
    rooms
        .into_iter()
        .find(|room| room.name == "Room1")
        .expect("Room1 listed")
}

/// Join "Room1" and create the client endpoint.
fn join_room(player: &mut Player) -> (ClientEndpoint, Arc<Recorder>) {
    let room = find_room(player);
    player.net.join_session(&room, None).unwrap();
    player.expect(|e| matches!(e, SubsystemEvent::SessionActive));

    let recorder = Recorder::new();
    let name = player.name.clone();
    let client = player
        .net
        .session()
        .unwrap()
        .create_client(recorder.clone(), None, &name)
        .unwrap();
    (client, recorder)
}

#[test]
fn two_player_session_exchanges_messages() {
    let lobby = TestLobby::start();
    let config = lobby.network_config();
    let mut host = Player::online(&config, "host");
    let mut alice = Player::online(&config, "alice");

    let (server, host_system) = host_room(&mut host, 2, None);
    let (client, alice_system) = join_room(&mut alice);

    wait_until("alice in the roster", || server.player_ids().len() == 1);
    let alice_id = server.player_id(alice.peer()).unwrap();
    assert_eq!(server.player_ids(), vec![alice_id]);
    assert_ne!(alice_id, SERVER_PLAYER_ID);
    assert!(host_system.upcalls().contains(&Upcall::Connected(alice_id, "alice".into())));
    assert!(alice_system.upcalls().contains(&Upcall::Connected(SERVER_PLAYER_ID, "host".into())));

    client.send_message(SERVER_PLAYER_ID, b"P").unwrap();
    assert_eq!(receive_blocking(&server), (alice_id, b"P".to_vec()));

    server.send_message(BROADCAST_PLAYER_ID, b"Q").unwrap();
    assert_eq!(receive_blocking(&client), (SERVER_PLAYER_ID, b"Q".to_vec()));

    let session = alice.net.session().unwrap();
    assert_eq!(session.state(), SessionState::Active);
    assert_eq!(session.current_players(), 2);
    assert_eq!(session.max_players(), 2);
}

#[test]
fn messages_keep_their_order() {
    let lobby = TestLobby::start();
    let config = lobby.network_config();
    let mut host = Player::online(&config, "host");
    let mut alice = Player::online(&config, "alice");

    let (server, _) = host_room(&mut host, 2, None);
    let (client, _) = join_room(&mut alice);
    wait_until("alice in the roster", || server.player_ids().len() == 1);
    wait_until("direct link to host", || client.has_direct_link());

    for i in 0..50u8 {
        client.send_message(SERVER_PLAYER_ID, &[i]).unwrap();
    }
    wait_until("all fifty", || server.message_count() == 50);
    for i in 0..50u8 {
        let (_, payload) = receive(&server).unwrap();
        assert_eq!(payload, vec![i]);
    }
    assert_eq!(server.message_count(), 0);
}

#[test]
fn burst_survives_switch_from_relay_to_direct() {
    let lobby = TestLobby::start();
    let config = lobby.network_config();
    let mut host = Player::online(&config, "host");
    let mut alice = Player::online(&config, "alice");

    let (server, _) = host_room(&mut host, 2, None);
    let (client, _) = join_room(&mut alice);

    // Send flat out from the moment the client exists, while the
    // punchthrough dial is still in flight, and keep going for a while after
    // the direct link is up.
    let started = Instant::now();
    let deadline = started + Duration::from_secs(5);
    let mut sent: u32 = 0;
    let mut after_switch = 0;
    while (started.elapsed() < Duration::from_millis(300) || after_switch < 200)
        && Instant::now() < deadline
    {
        client.send_message(SERVER_PLAYER_ID, &sent.to_le_bytes()).unwrap();
        sent += 1;
        if client.has_direct_link() {
            after_switch += 1;
        }
    }
    assert!(client.has_direct_link(), "punchthrough never completed");

    wait_until("every message", || server.message_count() == sent as usize);
    for expected in 0..sent {
        let (_, payload) = receive(&server).unwrap();
        assert_eq!(payload, expected.to_le_bytes().to_vec());
    }
    assert_eq!(server.message_count(), 0);
}

#[test]
fn relay_carries_session_when_host_is_unreachable() {
    let lobby = TestLobby::start();
    let config = lobby.network_config();
    let hidden = NetworkConfig {
        advertise_listen_port: false,
        ..config.clone()
    };
    let mut host = Player::online(&hidden, "host");
    let mut alice = Player::online(&config, "alice");
    let host_peer = host.peer();

    let (server, _) = host_room(&mut host, 2, None);
    let (client, alice_system) = join_room(&mut alice);
    wait_until("alice in the roster", || server.player_ids().len() == 1);
    let alice_id = server.player_id(alice.peer()).unwrap();

    alice.expect(|e| {
        matches!(
            e,
            SubsystemEvent::Lobby(LobbyEvent::PunchFailed { peer, reason: Rejection::Unreachable })
                if *peer == host_peer
        )
    });
    assert!(alice_system.saw_connect(SERVER_PLAYER_ID));

    for i in 0..20u8 {
        client.send_message(SERVER_PLAYER_ID, &[i]).unwrap();
        server.send_message(alice_id, &[i]).unwrap();
    }
    wait_until("relayed to host", || server.message_count() == 20);
    wait_until("relayed to alice", || client.message_count() == 20);
    for i in 0..20u8 {
        assert_eq!(receive(&server), Some((alice_id, vec![i])));
        assert_eq!(receive(&client), Some((SERVER_PLAYER_ID, vec![i])));
    }

    assert!(!client.has_direct_link());
    assert!(!alice.net.transport().is_connected(host_peer));
}

#[test]
fn unknown_destination_is_rejected() {
    let lobby = TestLobby::start();
    let config = lobby.network_config();
    let mut host = Player::online(&config, "host");
    let mut alice = Player::online(&config, "alice");

    let (server, _) = host_room(&mut host, 2, None);
    let (client, _) = join_room(&mut alice);
    wait_until("alice in the roster", || server.player_ids().len() == 1);

    let stranger = NumericPlayerId(12345);
    assert_eq!(
        server.send_message(stranger, b"nope"),
        Err(EndpointError::UnknownPlayer(stranger))
    );
    assert_eq!(
        server.send_message(SERVER_PLAYER_ID, b"nope"),
        Err(EndpointError::InvalidDestination(SERVER_PLAYER_ID))
    );
    assert_eq!(
        client.send_message(stranger, b"nope"),
        Err(EndpointError::InvalidDestination(stranger))
    );

    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(server.message_count(), 0);
    assert_eq!(client.message_count(), 0);
}

#[test]
fn dropped_client_is_reported_once() {
    let lobby = TestLobby::start();
    let config = lobby.network_config();
    let mut host = Player::online(&config, "host");
    let mut alice = Player::online(&config, "alice");

    let (server, host_system) = host_room(&mut host, 2, None);
    let (client, _) = join_room(&mut alice);
    wait_until("alice in the roster", || server.player_ids().len() == 1);
    let alice_id = server.player_id(alice.peer()).unwrap();

    drop(client);
    drop(alice);

    wait_until("alice removed", || server.player_ids().is_empty());
    wait_until("disconnect upcall", || host_system.disconnects_of(alice_id) == 1);
    // Lobby and direct-link notices may both arrive; still one upcall.
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(host_system.disconnects_of(alice_id), 1);
    assert_eq!(server.player_peer(alice_id), None);
}

#[test]
fn host_plays_through_self_loop() {
    let lobby = TestLobby::start();
    let config = lobby.network_config();
    let mut host = Player::online(&config, "host");

    let (server, host_system) = host_room(&mut host, 2, None);
    let notifier = Arc::new(PendingCounter::default());
    let shared: Arc<dyn ReceptionNotifier> = notifier.clone();
    let local_system = Recorder::new();
    let local = host
        .net
        .session()
        .unwrap()
        .create_client(local_system.clone(), Some(shared), "host")
        .unwrap();
    assert!(local.is_local_host());

    let local_id = server.local_client_id();
    assert!(host_system.upcalls().contains(&Upcall::Connected(local_id, "host".into())));
    assert!(local_system.saw_connect(SERVER_PLAYER_ID));

    // Delivered before send_message returns.
    local.send_message(SERVER_PLAYER_ID, b"self").unwrap();
    assert_eq!(server.message_count(), 1);
    assert_eq!(receive(&server), Some((local_id, b"self".to_vec())));

    server.send_message(local_id, b"back").unwrap();
    assert_eq!(notifier.last(), 1);
    assert_eq!(receive(&local), Some((SERVER_PLAYER_ID, b"back".to_vec())));

    drop(local);
    assert_eq!(host_system.disconnects_of(local_id), 1);
    assert_eq!(
        server.send_message(local_id, b"gone"),
        Err(EndpointError::UnknownPlayer(local_id))
    );
}

#[test]
fn wrong_password_closes_pending_session() {
    let lobby = TestLobby::start();
    let config = lobby.network_config();
    let mut host = Player::online(&config, "host");
    let mut alice = Player::online(&config, "alice");

    let (_server, _) = host_room(&mut host, 2, Some("secret"));
    let room = find_room(&mut alice);
    assert!(room.password_protected);

    alice.net.join_session(&room, Some("guess")).unwrap();
    let event = alice.expect(|e| matches!(e, SubsystemEvent::SessionClosed(_)));
    assert_eq!(
        event,
        SubsystemEvent::SessionClosed(CloseReason::JoinRejected(Rejection::WrongPassword))
    );
    assert_eq!(alice.net.session().map(|s| s.state()), Some(SessionState::Closed));

    // A closed session does not block the next attempt.
    alice.net.join_session(&room, Some("secret")).unwrap();
    alice.expect(|e| matches!(e, SubsystemEvent::SessionActive));
}

#[test]
fn full_room_rejects_join() {
    let lobby = TestLobby::start();
    let config = lobby.network_config();
    let mut host = Player::online(&config, "host");
    let mut alice = Player::online(&config, "alice");
    let mut bob = Player::online(&config, "bob");

    let (_server, _) = host_room(&mut host, 2, None);
    let (_client, _) = join_room(&mut alice);

    let room = find_room(&mut bob);
    bob.net.join_session(&room, None).unwrap();
    let event = bob.expect(|e| matches!(e, SubsystemEvent::SessionClosed(_)));
    assert_eq!(
        event,
        SubsystemEvent::SessionClosed(CloseReason::JoinRejected(Rejection::RoomFull))
    );
}

#[test]
fn host_leaving_ends_the_session_for_clients() {
    let lobby = TestLobby::start();
    let config = lobby.network_config();
    let mut host = Player::online(&config, "host");
    let mut alice = Player::online(&config, "alice");

    let (server, _) = host_room(&mut host, 2, None);
    let (client, alice_system) = join_room(&mut alice);
    wait_until("alice in the roster", || server.player_ids().len() == 1);

    host.net.leave_session().unwrap();

    let event = alice.expect(|e| matches!(e, SubsystemEvent::SessionClosed(_)));
    assert_eq!(event, SubsystemEvent::SessionClosed(CloseReason::RoomDestroyed));
    wait_until("server disconnect upcall", || {
        alice_system.disconnects_of(SERVER_PLAYER_ID) == 1
    });
    assert!(client.is_host_lost());
    assert_eq!(
        client.send_message(SERVER_PLAYER_ID, b"late"),
        Err(EndpointError::NotConnected)
    );
}

#[test]
fn max_players_follows_the_lobby() {
    let lobby = TestLobby::start();
    let config = lobby.network_config();
    let mut host = Player::online(&config, "host");

    let (_server, _) = host_room(&mut host, 2, None);
    host.net.session_mut().unwrap().set_max_players(3).unwrap();
    host.expect(|e| matches!(e, SubsystemEvent::Lobby(LobbyEvent::PublicSlotsChanged(Ok(3)))));
    assert_eq!(host.net.session().unwrap().max_players(), 3);
    assert_eq!(host.net.lobby().current_room().unwrap().public_slots, 3);
}

#[test]
fn silent_lobby_times_out_pending_session() {
    let silent = SilentLobby::start();
    let config = tessera_config::NetworkConfig {
        request_timeout_ms: 200,
        ..network_config(silent.port)
    };
    let mut player = Player {
        name: "lonely".into(),
        net: NetworkSubsystem::start(&config).unwrap(),
        events: Vec::new(),
    };
    player.expect(|e| matches!(e, SubsystemEvent::Lobby(LobbyEvent::Connected)));

    player.net.create_session("Room1", None).unwrap();
    assert!(player.net.lobby().is_pending(RequestKind::CreateRoom));

    player.expect(|e| {
        matches!(e, SubsystemEvent::Lobby(LobbyEvent::RequestTimedOut(RequestKind::CreateRoom)))
    });
    let event = player.expect(|e| matches!(e, SubsystemEvent::SessionClosed(_)));
    assert_eq!(event, SubsystemEvent::SessionClosed(CloseReason::TimedOut));
    assert!(!player.net.lobby().is_pending(RequestKind::CreateRoom));
}
