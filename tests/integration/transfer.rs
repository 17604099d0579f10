//! Piecewise transfer of content too large for a single snap packet.

use std::time::Duration;

use bytes::Bytes;

use crate::infra::{connect, payload, spawn_node, wait_until, DIRECT_SEND_MAX, PIECE_SIZE};

#[tokio::test]
async fn large_snap_is_fetched_piece_by_piece() {
    let a = spawn_node("ada").await;
    let b = spawn_node("brin").await;
    connect(&a, &b).await;

    let mut b_snaps = b.subscribe_snaps();

    // Well past the direct-send limit: many pieces, several rounds of
    // requests under the pending cap.
    let content = payload(DIRECT_SEND_MAX * 5);
    let published = a
        .publish("application/octet-stream", Bytes::from(content.clone()))
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(10), b_snaps.recv())
        .await
        .expect("download before timeout")
        .expect("cache events open");

    assert_eq!(received.id, published.id);
    assert_eq!(&received.content[..], &content[..]);

    // The completed download seeds on B too.
    wait_until("downloader to start seeding", || !b.seeds().is_empty()).await;

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn publishing_large_content_seeds_immediately() {
    // Even with nobody connected, a large publish is chunked and ready
    // to serve; the announcement goes out when links come up.
    let a = spawn_node("ada").await;
    a.publish(
        "application/octet-stream",
        Bytes::from(payload(PIECE_SIZE as usize * 10)),
    )
    .unwrap();
    assert_eq!(a.seeds().len(), 1);

    let b = spawn_node("brin").await;
    connect(&b, &a).await;
    wait_until("late joiner to complete the download", || {
        b.cache().len() == 1
    })
    .await;

    a.shutdown();
    b.shutdown();
}
