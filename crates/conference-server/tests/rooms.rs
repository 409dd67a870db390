//! Room lifecycle and relay through the registry.
//!
//! Uses the mock engine provisioner and registered in-memory sockets to
//! verify:
//! - Empty rooms close after their window and release both engines
//! - Member and engine messages are routed with stamped senders
//! - Architecture switches requested by members reach members and engines
//! - Engine provisioning failures leave nothing behind

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use conference_server::actors::{ActorMetrics, RegistryConfig, RoomRegistryHandle};
use conference_server::engine::EngineKind;
use conference_server::errors::ConferenceError;
use conference_server::signaling::{Address, Message, MessageType};
use conference_test_utils::{connect_socket, participant, MockEngineProvisioner, TestRoom};
use serde_json::json;
use tokio::sync::mpsc;

// ============================================================================
// Helpers
// ============================================================================

fn registry(engines: &MockEngineProvisioner) -> RoomRegistryHandle {
    RoomRegistryHandle::new(
        RegistryConfig {
            max_rooms: 10,
            default_max_members: None,
            default_max_empty_minutes: 0,
        },
        Arc::new(engines.clone()),
        ActorMetrics::new(),
    )
}

/// Next message of `kind`, skipping others.
async fn next_of(rx: &mut mpsc::UnboundedReceiver<Message>, kind: MessageType) -> Message {
    tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            let message = rx.recv().await.expect("channel closed");
            if message.kind == kind {
                return message;
            }
        }
    })
    .await
    .expect("message never arrived")
}

// ============================================================================
// Auto-close
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_empty_room_closes_after_window_and_releases_engines() {
    let engines = MockEngineProvisioner::new();
    let registry = registry(&engines);
    let alice = participant("alice");

    let room = registry
        .create(alice.clone(), TestRoom::new("standup").with_max_empty_minutes(1).build())
        .await
        .unwrap();
    let _socket = connect_socket(&registry, &alice).await;
    registry.join(room.id, alice.clone(), None).await.unwrap();
    registry.leave(room.id, alice.id).await.unwrap();

    tokio::time::advance(Duration::from_secs(59)).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(registry.find_by_id(room.id).await.unwrap().is_some());

    tokio::time::advance(Duration::from_secs(2)).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(registry.find_by_id(room.id).await.unwrap().is_none());
    assert!(registry.find_by_name("standup").await.unwrap().is_none());

    assert_eq!(
        engines.released(),
        vec![(room.id, EngineKind::Sfu), (room.id, EngineKind::Mcu)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_rejoin_keeps_room_open() {
    let engines = MockEngineProvisioner::new();
    let registry = registry(&engines);
    let alice = participant("alice");

    let room = registry
        .create(alice.clone(), TestRoom::new("standup").with_max_empty_minutes(1).build())
        .await
        .unwrap();
    let _socket = connect_socket(&registry, &alice).await;
    registry.join(room.id, alice.clone(), None).await.unwrap();
    registry.leave(room.id, alice.id).await.unwrap();

    tokio::time::advance(Duration::from_secs(30)).await;
    registry.join(room.id, alice.clone(), None).await.unwrap();

    tokio::time::advance(Duration::from_secs(120)).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(registry.find_by_id(room.id).await.unwrap().is_some());
    assert!(engines.released().is_empty());
}

// ============================================================================
// Relay
// ============================================================================

#[tokio::test]
async fn test_member_messages_are_routed_with_stamped_sender() {
    let engines = MockEngineProvisioner::new();
    let registry = registry(&engines);
    let alice = participant("alice");
    let bob = participant("bob");

    let room = registry
        .create(alice.clone(), TestRoom::new("standup").build())
        .await
        .unwrap();
    let (alice_socket, mut alice_rx) = connect_socket(&registry, &alice).await;
    let (_bob_socket, mut bob_rx) = connect_socket(&registry, &bob).await;
    registry.join(room.id, alice.clone(), None).await.unwrap();
    registry.join(room.id, bob.clone(), None).await.unwrap();

    let joined = next_of(&mut alice_rx, MessageType::UserConnected).await;
    assert_eq!(joined.data, json!("bob"));
    let roster = next_of(&mut bob_rx, MessageType::UserList).await;
    assert_eq!(roster.data, json!(["alice"]));

    // A forged sender is overwritten.
    alice_socket
        .deliver(
            Message::new(MessageType::from("chat"), json!("hi"))
                .to(Address::peer("bob"))
                .sent_by(Address::peer("mallory")),
        )
        .unwrap();

    let chat = next_of(&mut bob_rx, MessageType::from("chat")).await;
    assert_eq!(chat.sender, Address::peer("alice"));
    assert_eq!(chat.data, json!("hi"));

    // Unknown receivers bounce back as a disconnect notice.
    alice_socket
        .deliver(Message::new(MessageType::from("chat"), json!("hi")).to(Address::peer("carol")))
        .unwrap();
    let bounce = next_of(&mut alice_rx, MessageType::UserDisconnected).await;
    assert_eq!(bounce.data, json!("carol"));
    assert_eq!(bounce.sender, Address::Server);
}

#[tokio::test]
async fn test_engine_receives_roster_and_reaches_members() {
    let engines = MockEngineProvisioner::new();
    let registry = registry(&engines);
    let alice = participant("alice");

    let room = registry
        .create(alice.clone(), TestRoom::new("standup").build())
        .await
        .unwrap();
    let (_alice_socket, mut alice_rx) = connect_socket(&registry, &alice).await;
    registry.join(room.id, alice.clone(), None).await.unwrap();

    // The leg queued everything until the engine attached.
    let sfu = engines.signaler(room.id, EngineKind::Sfu).unwrap();
    let (tx, mut sfu_rx) = mpsc::unbounded_channel();
    sfu.open(tx).unwrap();
    let connected = next_of(&mut sfu_rx, MessageType::UserConnected).await;
    assert_eq!(connected.data, json!("alice"));

    sfu.deliver(Message::new(MessageType::from("stats"), json!({ "fps": 30 })).to(Address::peer("alice")))
        .unwrap();
    let stats = next_of(&mut alice_rx, MessageType::from("stats")).await;
    assert_eq!(stats.sender, Address::Sfu);
}

#[tokio::test]
async fn test_member_requested_switch_reaches_members_and_engines() {
    let engines = MockEngineProvisioner::new();
    let registry = registry(&engines);
    let alice = participant("alice");
    let bob = participant("bob");

    let room = registry
        .create(alice.clone(), TestRoom::new("standup").build())
        .await
        .unwrap();
    let (alice_socket, mut alice_rx) = connect_socket(&registry, &alice).await;
    let (_bob_socket, mut bob_rx) = connect_socket(&registry, &bob).await;
    registry.join(room.id, alice.clone(), None).await.unwrap();
    registry.join(room.id, bob.clone(), None).await.unwrap();

    let sfu = engines.signaler(room.id, EngineKind::Sfu).unwrap();
    let (tx, mut sfu_rx) = mpsc::unbounded_channel();
    sfu.open(tx).unwrap();

    alice_socket
        .deliver(Message::new(MessageType::ArchitectureSwitch, json!("sfu")).to(Address::Server))
        .unwrap();

    for rx in [&mut alice_rx, &mut bob_rx] {
        let switch = next_of(rx, MessageType::ArchitectureSwitch).await;
        assert_eq!(switch.data, json!("sfu"));
        assert_eq!(switch.sender, Address::Server);
    }
    let activate = next_of(&mut sfu_rx, MessageType::EngineActivate).await;
    assert_eq!(activate.data, json!({ "members": 2 }));

    let info = registry.info(room.id, None).await.unwrap();
    assert_eq!(info.architecture.as_str(), "sfu");

    // Asking again for the active architecture changes nothing.
    alice_socket
        .deliver(Message::new(MessageType::ArchitectureSwitch, json!("sfu")).to(Address::Server))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    while let Ok(message) = bob_rx.try_recv() {
        assert_ne!(message.kind, MessageType::ArchitectureSwitch);
    }
}

// ============================================================================
// Admission and provisioning
// ============================================================================

#[tokio::test]
async fn test_admission_checks() {
    let engines = MockEngineProvisioner::new();
    let registry = registry(&engines);
    let alice = participant("alice");
    let bob = participant("bob");
    let carol = participant("carol");

    let room = registry
        .create(
            alice.clone(),
            TestRoom::new("board").with_password("pw").with_max_members(2).build(),
        )
        .await
        .unwrap();

    // No socket yet.
    assert!(matches!(
        registry.join(room.id, alice.clone(), Some("pw".to_string().into())).await,
        Err(ConferenceError::NoTransport)
    ));

    let _a = connect_socket(&registry, &alice).await;
    let _b = connect_socket(&registry, &bob).await;
    let _c = connect_socket(&registry, &carol).await;

    assert!(matches!(
        registry.join(room.id, alice.clone(), Some("nope".to_string().into())).await,
        Err(ConferenceError::WrongPassword)
    ));
    registry
        .join(room.id, alice.clone(), Some("pw".to_string().into()))
        .await
        .unwrap();
    assert!(matches!(
        registry.join(room.id, alice.clone(), Some("pw".to_string().into())).await,
        Err(ConferenceError::AlreadyMember)
    ));
    registry
        .join(room.id, bob.clone(), Some("pw".to_string().into()))
        .await
        .unwrap();
    assert!(matches!(
        registry.join(room.id, carol.clone(), Some("pw".to_string().into())).await,
        Err(ConferenceError::RoomFull)
    ));

    let status = registry.status().await.unwrap();
    assert_eq!(status.room_count, 1);
    assert_eq!(status.member_count, 2);
    assert_eq!(status.socket_count, 3);
}

#[tokio::test]
async fn test_failed_engine_provisioning_releases_the_other_leg() {
    let engines = MockEngineProvisioner::builder()
        .fail_provision(EngineKind::Mcu)
        .build();
    let registry = registry(&engines);

    let result = registry
        .create(participant("alice"), TestRoom::new("standup").build())
        .await;

    assert!(matches!(result, Err(ConferenceError::Engine(_))));
    assert!(registry.find_by_name("standup").await.unwrap().is_none());
    let released = engines.released();
    assert_eq!(released.len(), 1);
    assert_eq!(released.first().unwrap().1, EngineKind::Sfu);
    assert_eq!(engines.leg_count(), 0);
}

#[tokio::test]
async fn test_close_tolerates_release_failure() {
    let engines = MockEngineProvisioner::builder()
        .fail_release(EngineKind::Sfu)
        .build();
    let registry = registry(&engines);
    let alice = participant("alice");

    let room = registry
        .create(alice.clone(), TestRoom::new("standup").build())
        .await
        .unwrap();
    registry.close(room.id, alice.id).await.unwrap();

    assert!(registry.find_by_id(room.id).await.unwrap().is_none());
    assert_eq!(
        engines.released(),
        vec![(room.id, EngineKind::Sfu), (room.id, EngineKind::Mcu)]
    );
}
