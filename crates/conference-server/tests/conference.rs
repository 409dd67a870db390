//! Participant-side architecture switching.
//!
//! A `ConferenceActor` runs next to an engine-side connection manager on a
//! [`Switchboard`]. Verifies that published media follows the architecture
//! the server announces, keeps its mute state, and leaves the old handler.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use conference_server::actors::{
    ActorMetrics, ConferenceActor, ConferenceEvent, ConferenceHandle, ConnectionManagerActor,
    ConnectionManagerHandle, ManagerConfig,
};
use conference_server::architecture::{Architecture, Switch};
use conference_server::media::MediaSelector;
use conference_server::negotiation::YieldPolicy;
use conference_server::relay::{architecture_switch, user_connected, user_list};
use conference_server::signaling::{Address, MessageType};
use conference_server::transport::TransportFactory;
use conference_test_utils::{fast_timings, video_track, MockTransportFactory, Switchboard};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Helpers
// ============================================================================

struct Setup {
    board: Switchboard,
    factory: MockTransportFactory,
    alice: ConferenceHandle,
    sfu: ConnectionManagerHandle,
}

async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn setup() -> Setup {
    let board = Switchboard::new();
    let factory = MockTransportFactory::new();
    let shared: Arc<dyn TransportFactory> = Arc::new(factory.clone());

    let (alice, _task) = ConferenceActor::spawn(
        "alice",
        board.join("alice"),
        Arc::clone(&shared),
        fast_timings(),
        ActorMetrics::new(),
        CancellationToken::new(),
    )
    .unwrap();

    let (sfu, _task) = ConnectionManagerActor::spawn(
        ManagerConfig {
            name: "@sfu".to_string(),
            policy: YieldPolicy::Always,
            timings: fast_timings(),
        },
        board.join("@sfu"),
        shared,
        CancellationToken::new(),
        ActorMetrics::new(),
    );
    tokio::time::sleep(Duration::from_millis(10)).await;

    board.notify("@sfu", user_connected("alice"));
    assert!(eventually(|| async { sfu.users().await.unwrap().len() == 1 }).await);

    Setup {
        board,
        factory,
        alice,
        sfu,
    }
}

async fn engine_receives(sfu: &ConnectionManagerHandle, track_id: &str) -> bool {
    let Ok(Some(link)) = sfu.get("alice").await else {
        return false;
    };
    link.snapshot()
        .await
        .is_ok_and(|s| s.received_tracks.iter().any(|t| t.id == track_id))
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_media_moves_to_engine_on_switch() {
    let Setup {
        board,
        factory,
        alice,
        sfu,
    } = setup().await;
    let mut events = alice.subscribe();

    alice
        .add_media(vec![video_track("cam", "alice")])
        .await
        .unwrap();
    assert!(!engine_receives(&sfu, "cam").await);

    board.notify("alice", architecture_switch(Architecture::Sfu));

    assert_eq!(
        tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap(),
        ConferenceEvent::ArchitectureSwitched(Switch {
            current: Architecture::Sfu,
            previous: Architecture::Mesh,
        })
    );
    assert_eq!(alice.architecture().await.unwrap(), Architecture::Sfu);
    assert!(eventually(|| engine_receives(&sfu, "cam")).await);

    let link = factory.handle("alice", "@sfu").unwrap();
    assert_eq!(link.sending(), vec!["cam".to_string()]);
    // The engine-side link is the polite one.
    let engine_link = sfu.get("alice").await.unwrap().unwrap();
    assert!(engine_link.snapshot().await.unwrap().is_yielding);
}

#[tokio::test]
async fn test_switch_back_to_mesh_stops_engine_media() {
    let Setup {
        board, alice, sfu, ..
    } = setup().await;

    alice
        .add_media(vec![video_track("cam", "alice")])
        .await
        .unwrap();
    board.notify("alice", architecture_switch(Architecture::Sfu));
    assert!(eventually(|| engine_receives(&sfu, "cam")).await);

    board.notify("alice", architecture_switch(Architecture::Mesh));
    assert!(eventually(|| async { !engine_receives(&sfu, "cam").await }).await);
    assert_eq!(alice.architecture().await.unwrap(), Architecture::Mesh);
    assert!(!board.log_of("receiver:stop").is_empty());
}

#[tokio::test]
async fn test_mesh_peers_get_media_back_after_engine_round_trip() {
    let Setup {
        board,
        factory,
        alice,
        ..
    } = setup().await;
    let _bob_signaler = board.join("bob");
    board.notify("alice", user_list(&["bob".to_string()]));
    assert!(eventually(|| async { alice.mesh().users().await.unwrap().len() == 1 }).await);

    alice
        .add_media(vec![video_track("cam", "alice")])
        .await
        .unwrap();
    let mesh_link = factory.handle("alice", "bob").unwrap();
    assert!(eventually(|| async { mesh_link.sending() == vec!["cam".to_string()] }).await);

    board.notify("alice", architecture_switch(Architecture::Sfu));
    assert!(eventually(|| async { mesh_link.sending().is_empty() }).await);

    board.notify("alice", architecture_switch(Architecture::Mesh));
    assert!(eventually(|| async { mesh_link.sending() == vec!["cam".to_string()] }).await);
}

#[tokio::test]
async fn test_mute_survives_switch() {
    let Setup {
        board,
        factory,
        alice,
        ..
    } = setup().await;

    alice
        .add_media(vec![video_track("cam", "alice")])
        .await
        .unwrap();
    alice
        .mute_media(MediaSelector::Track("cam".to_string()), true)
        .await
        .unwrap();

    board.notify("alice", architecture_switch(Architecture::Mcu));

    assert!(
        eventually(|| async {
            factory
                .handle("alice", "@mcu")
                .is_some_and(|link| link.muted() == vec!["cam".to_string()])
        })
        .await
    );
}

#[tokio::test]
async fn test_switch_request_goes_to_server() {
    let Setup { board, alice, .. } = setup().await;

    let target = alice.switch_architecture(None).await.unwrap();
    assert_eq!(target, Architecture::Sfu);
    // Nothing changes until the server announces it.
    assert_eq!(alice.architecture().await.unwrap(), Architecture::Mesh);

    assert!(
        eventually(|| async {
            board.log().iter().any(|m| {
                m.kind == MessageType::ArchitectureSwitch
                    && m.receiver == Address::Server
                    && m.sender == Address::peer("alice")
                    && m.data_str() == Some("sfu")
            })
        })
        .await
    );
}

#[tokio::test]
async fn test_repeated_announcement_is_ignored() {
    let Setup { board, alice, .. } = setup().await;
    let mut events = alice.subscribe();

    board.notify("alice", architecture_switch(Architecture::Sfu));
    events.recv().await.unwrap();

    board.notify("alice", architecture_switch(Architecture::Sfu));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err());
}
