//! Integration tests across the shared, server and client crates
//!
//! The scenario tests drive the server dispatcher with an explicit clock; the
//! network tests run a real server and clients over loopback UDP.

use serde_json::json;
use server::accounts::{GameRecord, MemoryDirectory};
use server::dispatch::Dispatcher;
use shared::message::ConnectRequest;
use shared::{GameCredential, GameId, GameKind, MessageData, MessageKind, OutgoingMessage, UserId};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

const GAME: GameId = GameId(1);

fn directory_with_game(kind: GameKind) -> Arc<MemoryDirectory> {
    let directory = Arc::new(MemoryDirectory::new());
    directory
        .add_game(GameRecord {
            id: GAME,
            name: "Integration".into(),
            host: UserId(1),
            map: "arena.tmx".into(),
            kind,
            config: json!({ "maxPlayers": 4 }),
        })
        .unwrap();
    directory
}

fn issue(directory: &MemoryDirectory, user: u64) -> GameCredential {
    directory
        .issue_credential(GAME, UserId(user), &format!("player{}", user), &format!("key-{}", user))
        .unwrap()
}

/// SESSION LIFECYCLE SCENARIOS
mod scenario_tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn command(credential: &GameCredential, id: Uuid, data: MessageData) -> Vec<u8> {
        OutgoingMessage::command(data)
            .key(credential.encode())
            .message_id(id)
            .build()
            .encode()
            .unwrap()
    }

    /// Connect, heartbeat, then fall silent until the timeout evicts the session
    #[test]
    fn test_connect_heartbeat_timeout() {
        let directory = directory_with_game(GameKind::Exploration);
        let alice = issue(&directory, 2);
        let mut dispatcher = Dispatcher::new(directory.clone(), directory.clone()).unwrap();
        let t0 = Instant::now();

        let connect_id = Uuid::new_v4();
        let outcome = dispatcher.handle(
            &command(&alice, connect_id, MessageData::CommandConnect(ConnectRequest::default())),
            peer(),
            t0,
        );
        assert_eq!(outcome.sends.len(), 1);
        let (to, reply) = &outcome.sends[0];
        assert_eq!(*to, peer());
        assert_eq!(reply.kind(), MessageKind::RespConnect);
        assert_eq!(reply.ack_message_id, Some(connect_id));
        assert_eq!(reply.success, Some(true));

        let heartbeat_id = Uuid::new_v4();
        let outcome = dispatcher.handle(
            &command(&alice, heartbeat_id, MessageData::CommandHeartbeat),
            peer(),
            t0 + Duration::from_secs(5),
        );
        let (_, reply) = &outcome.sends[0];
        assert_eq!(reply.kind(), MessageKind::Empty);
        assert_eq!(reply.ack_message_id, Some(heartbeat_id));
        assert_eq!(reply.success, Some(true));

        // Deadline is heartbeat + 10s; nothing happens before it
        dispatcher.tick(t0 + Duration::from_secs(14));
        assert!(dispatcher.games().get(&GAME).unwrap().session(&UserId(2)).is_some());

        dispatcher.tick(t0 + Duration::from_secs(16));
        assert!(dispatcher.games().get(&GAME).unwrap().session(&UserId(2)).is_none());

        let play_time = directory.play_time(GAME, UserId(2)).unwrap();
        assert!(play_time >= Duration::from_secs(15));
        assert!(play_time <= Duration::from_secs(16));
    }

    /// A heartbeat before any connect is refused
    #[test]
    fn test_heartbeat_without_connect() {
        let directory = directory_with_game(GameKind::Bomber);
        let bob = issue(&directory, 3);
        let mut dispatcher = Dispatcher::new(directory.clone(), directory).unwrap();

        let outcome = dispatcher.handle(
            &command(&bob, Uuid::new_v4(), MessageData::CommandHeartbeat),
            peer(),
            Instant::now(),
        );
        let (_, reply) = &outcome.sends[0];
        assert_eq!(reply.kind(), MessageKind::IllegalStateException);
        assert_eq!(reply.success, Some(false));
    }

    /// A forged key never reaches the game
    #[test]
    fn test_forged_credential() {
        let directory = directory_with_game(GameKind::Exploration);
        issue(&directory, 2);
        let forged = GameCredential::new(GAME, UserId(2), "guess");
        let mut dispatcher = Dispatcher::new(directory.clone(), directory).unwrap();

        let outcome = dispatcher.handle(
            &command(&forged, Uuid::new_v4(), MessageData::CommandConnect(ConnectRequest::default())),
            peer(),
            Instant::now(),
        );
        let (_, reply) = &outcome.sends[0];
        assert_eq!(reply.kind(), MessageKind::AuthenticationFailure);
    }
}

/// REAL NETWORK TESTS
mod network_tests {
    use super::*;
    use client::network::{Client, ClientConfig};
    use server::network::{Server, ServerConfig, ServerMessage};
    use assert_approx_eq::assert_approx_eq;
    use shared::ProtocolError;
    use tokio::time::sleep;
    use tokio_test::assert_ok;

    async fn start_server(
        directory: Arc<MemoryDirectory>,
    ) -> (SocketAddr, tokio::sync::mpsc::UnboundedSender<ServerMessage>) {
        let config = ServerConfig {
            port: 0,
            ..ServerConfig::default()
        };
        let mut server = Server::new(&config, directory.clone(), directory)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let handle = server.handle();
        tokio::spawn(async move { server.run().await });
        (addr, handle)
    }

    async fn client_for(addr: SocketAddr, credential: GameCredential) -> Client {
        let config = ClientConfig {
            server: addr.to_string(),
            bind: "127.0.0.1:0".to_string(),
            ..ClientConfig::default()
        };
        Client::new(&config, credential, GameKind::Exploration)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_client_connects_over_udp() {
        let directory = directory_with_game(GameKind::Exploration);
        let credential = issue(&directory, 2);
        let (addr, shutdown) = start_server(directory).await;

        let client = client_for(addr, credential).await;
        let _tasks = client.start();

        assert!(matches!(client.say("too early").await, Err(ProtocolError::NotReady)));

        let accepted = assert_ok!(client.connect().await);
        assert_eq!(accepted.game_id, GAME);
        assert_eq!(accepted.game_kind, GameKind::Exploration);
        assert!(client.is_ready().await);

        let rtt = client.ping().await.unwrap();
        assert!(rtt < Duration::from_secs(1));

        client.disconnect().await.unwrap();
        assert!(!client.is_ready().await);

        shutdown.send(ServerMessage::Shutdown).unwrap();
    }

    #[tokio::test]
    async fn test_chat_is_relayed_between_clients() {
        let directory = directory_with_game(GameKind::Exploration);
        let alice_credential = issue(&directory, 2);
        let bob_credential = issue(&directory, 3);
        let (addr, shutdown) = start_server(directory).await;

        let alice = client_for(addr, alice_credential).await;
        let bob = client_for(addr, bob_credential).await;
        let _alice_tasks = alice.start();
        let _bob_tasks = bob.start();

        alice.connect().await.unwrap();
        let joined = bob.connect().await.unwrap();
        assert_eq!(joined.players, vec![UserId(2)]);

        alice.say("hello bob").await.unwrap();

        let mut received = Vec::new();
        for _ in 0..50 {
            received = bob.inspect(|state| state.chat_log.clone()).await;
            if !received.is_empty() {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(received.len(), 1);
        assert_eq!(received[0].text, "hello bob");
        assert_eq!(received[0].from, Some(UserId(2)));
        // Sender does not get its own line back
        assert!(alice.inspect(|state| state.chat_log.is_empty()).await);

        shutdown.send(ServerMessage::Shutdown).unwrap();
    }

    #[tokio::test]
    async fn test_player_state_reaches_other_players() {
        let directory = directory_with_game(GameKind::Exploration);
        let alice_credential = issue(&directory, 2);
        let bob_credential = issue(&directory, 3);
        let (addr, shutdown) = start_server(directory).await;

        let alice = client_for(addr, alice_credential).await;
        let bob = client_for(addr, bob_credential).await;
        let _alice_tasks = alice.start();
        let _bob_tasks = bob.start();
        assert_ok!(alice.connect().await);
        assert_ok!(bob.connect().await);

        // Unacked: resend until one copy makes it through
        let mut seen = None;
        for _ in 0..50 {
            assert_ok!(alice.send_player_state(5.5, 2.25, 1.0, 0.0).await);
            sleep(Duration::from_millis(20)).await;
            seen = bob
                .inspect(|state| state.players.get(&UserId(2)).cloned())
                .await;
            if seen.is_some() {
                break;
            }
        }

        let position = seen.unwrap();
        assert_approx_eq!(position.x, 5.5);
        assert_approx_eq!(position.y, 2.25);
        assert_approx_eq!(position.vel_x, 1.0);

        shutdown.send(ServerMessage::Shutdown).unwrap();
    }

    #[tokio::test]
    async fn test_unknown_credential_is_rejected() {
        let directory = directory_with_game(GameKind::Exploration);
        let (addr, shutdown) = start_server(directory).await;

        let client = client_for(addr, GameCredential::new(GAME, UserId(9), "nope")).await;
        let _tasks = client.start();

        let result = client.connect().await;
        assert!(matches!(result, Err(ProtocolError::Authentication(_))));
        assert!(!client.is_ready().await);

        shutdown.send(ServerMessage::Shutdown).unwrap();
    }
}
