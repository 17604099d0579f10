//! Multi-hop propagation: content reaches nodes with no direct link to
//! the publisher.

use bytes::Bytes;

use crate::infra::{connect, payload, spawn_node, wait_until, DIRECT_SEND_MAX};

#[tokio::test]
async fn small_snap_crosses_a_relay_hop() {
    // A — B — C, no A–C link.
    let a = spawn_node("ada").await;
    let b = spawn_node("brin").await;
    let c = spawn_node("cleo").await;
    connect(&a, &b).await;
    connect(&b, &c).await;

    let published = a
        .publish("text/plain", Bytes::from_static(b"two hops out"))
        .unwrap();

    wait_until("snap to cross the relay", || c.cache().has(&published.id)).await;
    let relayed = c.cache().get(&published.id).unwrap();
    assert_eq!(relayed.alias, "ada");
    assert_eq!(&relayed.content[..], b"two hops out");

    a.shutdown();
    b.shutdown();
    c.shutdown();
}

#[tokio::test]
async fn large_snap_crosses_a_relay_hop() {
    // The middle node must complete its own download before it can
    // seed and announce to the far side.
    let a = spawn_node("ada").await;
    let b = spawn_node("brin").await;
    let c = spawn_node("cleo").await;
    connect(&a, &b).await;
    connect(&b, &c).await;

    let content = payload(DIRECT_SEND_MAX * 3);
    let published = a
        .publish("application/octet-stream", Bytes::from(content.clone()))
        .unwrap();

    wait_until("relay to finish its download", || {
        b.cache().has(&published.id)
    })
    .await;
    wait_until("far node to finish its download", || {
        c.cache().has(&published.id)
    })
    .await;
    assert_eq!(&c.cache().get(&published.id).unwrap().content[..], &content[..]);

    a.shutdown();
    b.shutdown();
    c.shutdown();
}
