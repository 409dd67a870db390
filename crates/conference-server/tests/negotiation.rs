//! End-to-end negotiation between connection managers.
//!
//! Two or more managers talk over an in-memory [`Switchboard`] with scripted
//! transports. Verifies:
//! - Media published on one side shows up on the other, with provenance
//! - Both sides publishing at once converge
//! - A jammed offer is rolled back and retried with an ICE restart
//! - ICE candidates wait for the remote description
//! - Roster notices and explicit closes tear links down on both sides

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use conference_server::actors::{
    ActorMetrics, ConnectionManagerActor, ConnectionManagerHandle, ConnectionSnapshot,
    ManagerConfig, ManagerEvent,
};
use conference_server::negotiation::{NegotiationState, YieldPolicy};
use conference_server::relay::{user_disconnected, user_list};
use conference_server::transport::TransportFactory;
use conference_test_utils::{fast_timings, video_track, MockTransportFactory, Switchboard};
use serde_json::json;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Helpers
// ============================================================================

fn spawn_manager(
    board: &Switchboard,
    factory: &MockTransportFactory,
    name: &str,
    policy: YieldPolicy,
) -> ConnectionManagerHandle {
    let factory: Arc<dyn TransportFactory> = Arc::new(factory.clone());
    let (handle, _task) = ConnectionManagerActor::spawn(
        ManagerConfig {
            name: name.to_string(),
            policy,
            timings: fast_timings(),
        },
        board.join(name),
        factory,
        CancellationToken::new(),
        ActorMetrics::new(),
    );
    handle
}

/// Poll `check` for up to two seconds.
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

async fn snapshot(manager: &ConnectionManagerHandle, peer: &str) -> Option<ConnectionSnapshot> {
    let connection = manager.get(peer).await.ok()??;
    connection.snapshot().await.ok()
}

async fn receives(manager: &ConnectionManagerHandle, peer: &str, track_id: &str) -> bool {
    snapshot(manager, peer)
        .await
        .is_some_and(|s| s.received_tracks.iter().any(|t| t.id == track_id))
}

async fn is_stable(manager: &ConnectionManagerHandle, peer: &str) -> bool {
    snapshot(manager, peer)
        .await
        .is_some_and(|s| s.state == NegotiationState::Stable && !s.offering)
}

/// Spawn `alice` and `bob` and introduce them to each other.
async fn pair(
    board: &Switchboard,
    factory: &MockTransportFactory,
) -> (ConnectionManagerHandle, ConnectionManagerHandle) {
    let alice = spawn_manager(board, factory, "alice", YieldPolicy::ByName);
    let bob = spawn_manager(board, factory, "bob", YieldPolicy::ByName);
    tokio::time::sleep(Duration::from_millis(10)).await;

    board.notify("alice", user_list(&["bob".to_string()]));
    board.notify("bob", user_list(&["alice".to_string()]));

    assert!(
        eventually(|| async {
            alice.users().await.unwrap() == vec!["bob".to_string()]
                && bob.users().await.unwrap() == vec!["alice".to_string()]
        })
        .await,
        "roster never applied"
    );
    (alice, bob)
}

// ============================================================================
// Media flow
// ============================================================================

#[tokio::test]
async fn test_published_media_reaches_peer_with_provenance() {
    let board = Switchboard::new();
    let factory = MockTransportFactory::new();
    let (alice, bob) = pair(&board, &factory).await;

    alice
        .add_media(vec![video_track("cam-a", "alice")])
        .await
        .unwrap();

    assert!(
        eventually(|| async {
            snapshot(&bob, "alice").await.is_some_and(|s| {
                s.received_tracks
                    .iter()
                    .any(|t| t.id == "cam-a" && t.meta == Some(json!({ "owner": "alice" })))
            })
        })
        .await,
        "bob never received tagged cam-a"
    );

    let bob_side = factory.handle("bob", "alice").unwrap();
    assert_eq!(bob_side.receiving(), vec!["cam-a".to_string()]);
    assert!(eventually(|| is_stable(&alice, "bob")).await);
}

#[tokio::test]
async fn test_media_added_before_peer_is_known_is_sent_on_connect() {
    let board = Switchboard::new();
    let factory = MockTransportFactory::new();
    let alice = spawn_manager(&board, &factory, "alice", YieldPolicy::ByName);
    let bob = spawn_manager(&board, &factory, "bob", YieldPolicy::ByName);

    alice
        .add_media(vec![video_track("cam-a", "alice")])
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    board.notify("bob", user_list(&["alice".to_string()]));
    assert!(eventually(|| async { bob.users().await.unwrap().len() == 1 }).await);
    board.notify("alice", user_list(&["bob".to_string()]));

    assert!(eventually(|| receives(&bob, "alice", "cam-a")).await);
}

#[tokio::test]
async fn test_removed_media_stops_on_peer() {
    let board = Switchboard::new();
    let factory = MockTransportFactory::new();
    let (alice, bob) = pair(&board, &factory).await;

    alice
        .add_media(vec![video_track("cam-a", "alice")])
        .await
        .unwrap();
    assert!(eventually(|| receives(&bob, "alice", "cam-a")).await);
    assert!(eventually(|| is_stable(&alice, "bob")).await);

    let mut events = bob.subscribe();
    alice
        .remove_media(conference_server::media::MediaSelector::ALL)
        .await
        .unwrap();

    assert!(eventually(|| async { !receives(&bob, "alice", "cam-a").await }).await);

    let mut removed = false;
    while let Ok(event) = events.try_recv() {
        if let ManagerEvent::Connection(conference_server::actors::ConnectionEvent::TrackRemoved {
            track,
            ..
        }) = event
        {
            removed |= track.id == "cam-a";
        }
    }
    assert!(removed);
}

// ============================================================================
// Collisions and recovery
// ============================================================================

#[tokio::test]
async fn test_concurrent_publishing_converges() {
    let board = Switchboard::new();
    let factory = MockTransportFactory::new();
    let (alice, bob) = pair(&board, &factory).await;

    let (a, b) = tokio::join!(
        alice.add_media(vec![video_track("cam-a", "alice")]),
        bob.add_media(vec![video_track("cam-b", "bob")]),
    );
    a.unwrap();
    b.unwrap();

    assert!(
        eventually(|| async {
            receives(&alice, "bob", "cam-b").await
                && receives(&bob, "alice", "cam-a").await
                && is_stable(&alice, "bob").await
                && is_stable(&bob, "alice").await
        })
        .await,
        "links never converged"
    );

    // "alice" < "bob": alice is the polite side.
    assert!(snapshot(&alice, "bob").await.unwrap().is_yielding);
    assert!(!snapshot(&bob, "alice").await.unwrap().is_yielding);
}

#[tokio::test]
async fn test_jammed_offer_is_rolled_back_and_retried() {
    let board = Switchboard::new();
    let factory = MockTransportFactory::new();
    let (alice, bob) = pair(&board, &factory).await;

    // Bob's answer gets lost.
    board.mute("bob");
    alice
        .add_media(vec![video_track("cam-a", "alice")])
        .await
        .unwrap();
    assert!(eventually(|| receives(&bob, "alice", "cam-a")).await);
    assert_eq!(
        snapshot(&alice, "bob").await.unwrap().state,
        NegotiationState::HaveLocalOffer
    );
    board.unmute("bob");

    assert!(eventually(|| is_stable(&alice, "bob")).await);

    let alice_side = factory.handle("alice", "bob").unwrap();
    assert_eq!(alice_side.count("rollback"), 1);
    assert_eq!(alice_side.count("restart_ice"), 1);
    assert_eq!(alice_side.count("create_offer"), 2);
}

#[tokio::test]
async fn test_candidates_wait_for_remote_description() {
    let board = Switchboard::new();
    let factory = MockTransportFactory::new();
    let (alice, bob) = pair(&board, &factory).await;

    let alice_side = factory.handle("alice", "bob").unwrap();
    alice_side.gather("candidate:1 1 udp 2122260223 10.0.0.1 50000 typ host");

    assert!(
        eventually(|| async {
            snapshot(&bob, "alice")
                .await
                .is_some_and(|s| s.pending_candidates == 1)
        })
        .await
    );
    let bob_side = factory.handle("bob", "alice").unwrap();
    assert_eq!(bob_side.count("add_ice_candidate"), 0);

    alice
        .add_media(vec![video_track("cam-a", "alice")])
        .await
        .unwrap();

    assert!(eventually(|| async { bob_side.count("add_ice_candidate") == 1 }).await);
    assert_eq!(snapshot(&bob, "alice").await.unwrap().pending_candidates, 0);
}

// ============================================================================
// Teardown
// ============================================================================

#[tokio::test]
async fn test_user_disconnected_drops_link() {
    let board = Switchboard::new();
    let factory = MockTransportFactory::new();
    let (alice, _bob) = pair(&board, &factory).await;

    let mut events = alice.subscribe();
    board.notify("alice", user_disconnected("bob"));

    assert!(eventually(|| async { alice.users().await.unwrap().is_empty() }).await);
    assert_eq!(
        events.recv().await.unwrap(),
        ManagerEvent::UserDisconnected {
            peer: "bob".to_string()
        }
    );
    let alice_side = factory.handle("alice", "bob").unwrap();
    assert!(eventually(|| async { alice_side.is_closed() }).await);
}

#[tokio::test]
async fn test_close_all_closes_peer_side() {
    let board = Switchboard::new();
    let factory = MockTransportFactory::new();
    let (alice, bob) = pair(&board, &factory).await;

    alice.close_all(true).await.unwrap();

    assert!(alice.users().await.unwrap().is_empty());
    assert!(eventually(|| async { bob.users().await.unwrap().is_empty() }).await);
    assert_eq!(board.log_of("connection:close").len(), 1);
}

#[tokio::test]
async fn test_engine_side_manager_yields_to_everyone() {
    let board = Switchboard::new();
    let factory = MockTransportFactory::new();
    let engine = spawn_manager(&board, &factory, "@sfu", YieldPolicy::Always);
    tokio::time::sleep(Duration::from_millis(10)).await;

    board.notify("@sfu", user_list(&["alice".to_string(), "zed".to_string()]));

    assert!(eventually(|| async { engine.users().await.unwrap().len() == 2 }).await);
    for peer in ["alice", "zed"] {
        assert!(snapshot(&engine, peer).await.unwrap().is_yielding);
    }
}
