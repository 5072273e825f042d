mod common;

use std::sync::Arc;
use std::time::Duration;

use common::fixtures::{paths, seeded_store};
use wardmill::ha::{HaCoordinator, LeaderEvent};
use wardmill::store::{MemoryStore, StateStore};

async fn expect_event(rx: &flume::Receiver<LeaderEvent>, expected: LeaderEvent) {
    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv_async())
        .await
        .unwrap_or_else(|_| panic!("no {expected:?} event within 5s"))
        .unwrap();
    assert_eq!(event, expected);
}

async fn expect_no_event(rx: &flume::Receiver<LeaderEvent>) {
    let outcome = tokio::time::timeout(Duration::from_millis(200), rx.recv_async()).await;
    assert!(outcome.is_err(), "unexpected event: {outcome:?}");
}

#[tokio::test]
async fn init_environment_creates_the_skeleton() {
    let store = MemoryStore::new();
    HaCoordinator::init_environment(&store, &paths()).await.unwrap();
    for path in [
        "/testg",
        "/testg/context",
        "/testg/alive_clients",
        "/testg/operations",
    ] {
        assert!(store.exists(path).await.unwrap(), "missing {path}");
    }
    // Idempotent on a second boot.
    HaCoordinator::init_environment(&store, &paths()).await.unwrap();
}

#[tokio::test]
async fn smallest_marker_wins_the_election() {
    let store = seeded_store().await;

    let (a_tx, a_rx) = flume::unbounded();
    HaCoordinator::new(
        Arc::clone(&store) as Arc<dyn StateStore>,
        paths(),
        "replica-a",
        a_tx,
    )
    .start()
    .await
    .unwrap();
    expect_event(&a_rx, LeaderEvent::Gained).await;

    let (b_tx, b_rx) = flume::unbounded();
    HaCoordinator::new(
        Arc::clone(&store) as Arc<dyn StateStore>,
        paths(),
        "replica-b",
        b_tx,
    )
    .start()
    .await
    .unwrap();

    // The later, larger-sequence replica stays a follower.
    expect_no_event(&b_rx).await;
    expect_no_event(&a_rx).await;
}

#[tokio::test]
async fn leadership_moves_when_the_leader_marker_disappears() {
    let store = seeded_store().await;

    let (a_tx, a_rx) = flume::unbounded();
    HaCoordinator::new(
        Arc::clone(&store) as Arc<dyn StateStore>,
        paths(),
        "replica-a",
        a_tx,
    )
    .start()
    .await
    .unwrap();
    expect_event(&a_rx, LeaderEvent::Gained).await;

    let (b_tx, b_rx) = flume::unbounded();
    HaCoordinator::new(
        Arc::clone(&store) as Arc<dyn StateStore>,
        paths(),
        "replica-b",
        b_tx,
    )
    .start()
    .await
    .unwrap();

    // Replica A's session dies: its marker vanishes, the child watch
    // fires, and B takes over deterministically (smallest survivor).
    store
        .delete("/testg/alive_clients/replica-a#000000000", false)
        .await
        .unwrap();

    expect_event(&b_rx, LeaderEvent::Gained).await;
    expect_event(&a_rx, LeaderEvent::Lost).await;
}

#[tokio::test]
async fn lost_session_reregisters_and_reelects() {
    let store = seeded_store().await;

    let (a_tx, a_rx) = flume::unbounded();
    HaCoordinator::new(
        Arc::clone(&store) as Arc<dyn StateStore>,
        paths(),
        "replica-a",
        a_tx,
    )
    .start()
    .await
    .unwrap();
    expect_event(&a_rx, LeaderEvent::Gained).await;

    // Session expiry wipes the ephemeral marker; the coordinator drops
    // leadership, re-registers, and wins again (it is alone).
    store.expire_session();

    expect_event(&a_rx, LeaderEvent::Lost).await;
    expect_event(&a_rx, LeaderEvent::Gained).await;

    let markers = store.children("/testg/alive_clients", None).await.unwrap();
    assert_eq!(markers.len(), 1);
    assert!(markers[0].starts_with("replica-a#"));
}
