//! Small-snap flooding: publish, direct receive, and store-and-forward
//! to peers that connect after the fact.

use std::time::Duration;

use bytes::Bytes;

use crate::infra::{connect, spawn_node, wait_until};

#[tokio::test]
async fn published_snap_reaches_a_connected_peer() {
    let a = spawn_node("ada").await;
    let b = spawn_node("brin").await;
    connect(&a, &b).await;

    let mut b_snaps = b.subscribe_snaps();
    let published = a
        .publish("text/plain", Bytes::from_static(b"hello mesh"))
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), b_snaps.recv())
        .await
        .expect("snap before timeout")
        .expect("cache events open");

    assert_eq!(received.id, published.id);
    assert_eq!(received.alias, "ada");
    assert_eq!(&received.content[..], b"hello mesh");
    assert!(b.cache().has(&published.id));

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn cached_snaps_are_offered_to_late_joiners() {
    let a = spawn_node("ada").await;
    let published = a
        .publish("text/plain", Bytes::from_static(b"for whoever shows up"))
        .unwrap();

    // B comes online after the publish; the offer happens on link-up.
    let b = spawn_node("brin").await;
    connect(&a, &b).await;

    wait_until("late joiner to receive the snap", || {
        b.cache().has(&published.id)
    })
    .await;

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn each_snap_is_stored_once_despite_multiple_paths() {
    // Triangle: every snap can arrive at each node over two paths.
    let a = spawn_node("ada").await;
    let b = spawn_node("brin").await;
    let c = spawn_node("cleo").await;
    connect(&a, &b).await;
    connect(&b, &c).await;
    connect(&c, &a).await;

    let published = a
        .publish("text/plain", Bytes::from_static(b"triangle"))
        .unwrap();

    wait_until("all nodes to hold the snap", || {
        b.cache().has(&published.id) && c.cache().has(&published.id)
    })
    .await;

    // Duplicates are dropped at ingress, never stored twice.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(a.cache().len(), 1);
    assert_eq!(b.cache().len(), 1);
    assert_eq!(c.cache().len(), 1);

    a.shutdown();
    b.shutdown();
    c.shutdown();
}
