//! Lobby client requests against a real lobby server.

mod common;

use common::{Player, TestLobby};
use tessera_net::{LobbyError, LobbyEvent, RequestKind, SubsystemEvent};
use tessera_protocol::Rejection;

#[test]
fn online_users_lists_everyone_logged_in() {
    let lobby = TestLobby::start();
    let config = lobby.network_config();
    let mut alice = Player::online(&config, "alice");
    let bob = Player::online(&config, "bob");

    alice.net.lobby().query_online_users().unwrap();
    let event = alice.expect(|e| matches!(e, SubsystemEvent::Lobby(LobbyEvent::OnlineUsers(_))));
    let SubsystemEvent::Lobby(LobbyEvent::OnlineUsers(Ok(users))) = event else {
        panic!("query failed: {event:?}");
    };
    let names: Vec<&str> = users.iter().map(|user| user.name.as_str()).collect();
    assert_eq!(names, vec!["alice", "bob"]);
    assert!(users.iter().any(|user| user.peer == bob.peer() && user.room.is_none()));
}

#[test]
fn chat_reaches_every_user_and_history() {
    let lobby = TestLobby::start();
    let config = lobby.network_config();
    let mut alice = Player::online(&config, "alice");
    let mut bob = Player::online(&config, "bob");

    alice.net.lobby().send_chat_message("hello").unwrap();
    let heard = bob.expect(|e| matches!(e, SubsystemEvent::Lobby(LobbyEvent::ChatReceived(_))));
    let SubsystemEvent::Lobby(LobbyEvent::ChatReceived(line)) = heard else {
        unreachable!()
    };
    assert_eq!(line.from, "alice");
    assert_eq!(line.text, "hello");
    // The author hears its own line too.
    alice.expect(|e| matches!(e, SubsystemEvent::Lobby(LobbyEvent::ChatReceived(_))));

    bob.net.lobby().query_chat_messages().unwrap();
    let event = bob.expect(|e| matches!(e, SubsystemEvent::Lobby(LobbyEvent::ChatHistory(_))));
    let SubsystemEvent::Lobby(LobbyEvent::ChatHistory(Ok(history))) = event else {
        panic!("history failed: {event:?}");
    };
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].text, "hello");
}

#[test]
fn duplicate_request_is_refused_until_answered() {
    let lobby = TestLobby::start();
    let config = lobby.network_config();
    let mut alice = Player::online(&config, "alice");

    alice.net.lobby().search_rooms().unwrap();
    assert!(matches!(
        alice.net.lobby().search_rooms(),
        Err(LobbyError::RequestPending(RequestKind::SearchRooms))
    ));
    alice.expect(|e| matches!(e, SubsystemEvent::Lobby(LobbyEvent::RoomsFound(Ok(_)))));
    assert!(!alice.net.lobby().is_pending(RequestKind::SearchRooms));
    alice.net.lobby().search_rooms().unwrap();
}

#[test]
fn second_login_of_same_account_is_rejected() {
    let lobby = TestLobby::start();
    let config = lobby.network_config();
    let _alice = Player::online(&config, "alice");
    let mut twin = Player::online(&config, "twin");

    twin.net.lobby().logout().unwrap();
    twin.expect(|e| matches!(e, SubsystemEvent::Lobby(LobbyEvent::LoggedOut(Ok(())))));
    twin.net.lobby().login("alice", "password").unwrap();
    let event = twin.expect(|e| matches!(e, SubsystemEvent::Lobby(LobbyEvent::LoggedIn(_))));
    assert_eq!(
        event,
        SubsystemEvent::Lobby(LobbyEvent::LoggedIn(Err(Rejection::AlreadyLoggedIn)))
    );
}
