//! Shared harness: spawn nodes with fast transfer knobs and small
//! direct-send limits so the piece protocol is exercised with modest
//! payloads, and link them directly over loopback.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use snapmesh_core::crypto::Ed25519Verifier;
use snapmesh_services::DownloaderConfig;
use snapmeshd::link::LinkEvent;
use snapmeshd::node::{Node, NodeConfig};
use snapmeshd::DispatchConfig;

static NODE_SEQ: AtomicU64 = AtomicU64::new(0);

/// Content larger than this travels via the piece protocol in tests.
pub const DIRECT_SEND_MAX: usize = 4096;
pub const PIECE_SIZE: u32 = 1024;

pub async fn spawn_node(alias: &str) -> Node {
    let seq = NODE_SEQ.fetch_add(1, Ordering::Relaxed);
    let storage = std::env::temp_dir().join(format!(
        "snapmesh-it-{}-{}-{}",
        std::process::id(),
        alias,
        seq
    ));
    let _ = std::fs::remove_dir_all(&storage);

    Node::spawn(NodeConfig {
        alias: alias.to_string(),
        storage_path: storage,
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        cache_capacity: 50,
        sweep_interval: Duration::from_secs(60),
        default_ttl_millis: 60_000,
        downloader: DownloaderConfig {
            max_pending: 5,
            request_timeout: Duration::from_secs(10),
            tick: Duration::from_millis(25),
        },
        dispatch: DispatchConfig {
            direct_send_max_bytes: DIRECT_SEND_MAX,
            piece_size: PIECE_SIZE,
        },
        verifier: Arc::new(Ed25519Verifier),
    })
    .await
    .expect("node spawn")
}

/// Dial `b` from `a` and wait until both sides see the link.
pub async fn connect(a: &Node, b: &Node) {
    let mut b_events = b.subscribe_links();
    a.connect_to(b.peer_id(), b.listen_addr())
        .await
        .expect("connect");
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), b_events.recv())
            .await
            .expect("link event before timeout")
            .expect("link events open");
        if matches!(event, LinkEvent::Connected { .. }) {
            return;
        }
    }
}

/// Poll until `predicate` holds, or panic after five seconds.
pub async fn wait_until<F>(what: &str, mut predicate: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !predicate() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Deterministic payload of the given size.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 239) as u8).collect()
}
