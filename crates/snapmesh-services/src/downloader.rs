//! Download orchestration for chunked content.
//!
//! One download exists per content id. Each download owns a sparse
//! `ChunkedContent` (pieces verify in as they arrive) and a
//! `PieceManager` (who has what, what is in flight). A periodic tick
//! task turns rarest-first selections into `PieceRequest` packets on
//! the shared outbound queue; responses flow back in through
//! `handle_piece_response`. Completion reassembles the bytes and
//! broadcasts them to whoever subscribed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, Mutex};

use snapmesh_core::{ChunkedContent, ContentId, Packet, PeerId, PieceOutcome};

use crate::piece_manager::PieceManager;

/// Knobs for the request pipeline, normally taken from `TransferConfig`.
#[derive(Debug, Clone, Copy)]
pub struct DownloaderConfig {
    /// In-flight request ceiling per download.
    pub max_pending: usize,
    /// How long a request may stay unanswered before the slot frees up.
    pub request_timeout: Duration,
    /// Selection cadence.
    pub tick: Duration,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            max_pending: 5,
            request_timeout: Duration::from_secs(10),
            tick: Duration::from_millis(500),
        }
    }
}

/// Progress and completion notifications, broadcast per event.
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    Progress {
        content_id: ContentId,
        pieces_held: u32,
        piece_count: u32,
    },
    Completed {
        content_id: ContentId,
        bytes: Bytes,
    },
}

struct DownloadState {
    chunks: ChunkedContent,
    pieces: PieceManager,
}

struct DownloaderInner {
    active: DashMap<ContentId, Arc<Mutex<DownloadState>>>,
    outbound: mpsc::Sender<(PeerId, Packet)>,
    events: broadcast::Sender<DownloadEvent>,
    config: DownloaderConfig,
}

#[derive(Clone)]
pub struct Downloader {
    inner: Arc<DownloaderInner>,
}

impl Downloader {
    pub fn new(outbound: mpsc::Sender<(PeerId, Packet)>, config: DownloaderConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(DownloaderInner {
                active: DashMap::new(),
                outbound,
                events,
                config,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_downloading(&self, id: &ContentId) -> bool {
        self.inner.active.contains_key(id)
    }

    /// Begin fetching the content described by `chunks` (a receiver-side
    /// shell built from a validated manifest). A no-op if a download for
    /// the same content id is already active. Spawns the tick task that
    /// drives requests until the download completes or is cancelled.
    pub fn start_download(&self, chunks: ChunkedContent) {
        let id = chunks.content_id();
        let config = self.inner.config;
        let state = Arc::new(Mutex::new(DownloadState {
            pieces: PieceManager::new(
                chunks.piece_count(),
                config.max_pending,
                config.request_timeout,
            ),
            chunks,
        }));

        match self.inner.active.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                tracing::debug!(content = hex::encode(id), "download already active");
                return;
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(state);
            }
        }
        tracing::info!(content = hex::encode(id), "download started");

        let downloader = self.clone();
        tokio::spawn(async move {
            downloader.tick_loop(id).await;
        });
    }

    /// Drop a download and stop its tick task. Safe to call on an id
    /// that is not active.
    pub fn cancel_download(&self, id: &ContentId) {
        if self.inner.active.remove(id).is_some() {
            tracing::info!(content = hex::encode(id), "download cancelled");
        }
    }

    /// A peer announced (part of) its holdings for some content.
    pub async fn handle_peer_bitfield(&self, peer: PeerId, id: ContentId, bitfield: &[u8]) {
        let Some(state) = self.state_for(&id) else {
            return;
        };
        let mut state = state.lock().await;
        let piece_count = state.pieces.piece_count();
        let indices = snapmesh_core::chunker::indices_from_bitfield(bitfield, piece_count);
        state.pieces.update_peer_bitfield(peer, indices);
    }

    /// A peer announced a single newly held piece.
    pub async fn handle_peer_has_piece(&self, peer: PeerId, id: ContentId, piece_index: u32) {
        let Some(state) = self.state_for(&id) else {
            return;
        };
        state.lock().await.pieces.mark_peer_has_piece(peer, piece_index);
    }

    /// A piece arrived from a peer. Verifies it into the chunk store,
    /// emits progress, and on the final piece reassembles and broadcasts
    /// the completed bytes.
    pub async fn handle_piece_response(
        &self,
        peer: PeerId,
        id: ContentId,
        piece_index: u32,
        data: Bytes,
    ) {
        let Some(state) = self.state_for(&id) else {
            return;
        };
        let mut state = state.lock().await;

        match state.chunks.add_piece(piece_index, data) {
            PieceOutcome::Accepted => {
                state.pieces.mark_piece_held(piece_index);
                let _ = self.inner.events.send(DownloadEvent::Progress {
                    content_id: id,
                    pieces_held: state.pieces.held_count(),
                    piece_count: state.chunks.piece_count(),
                });
            }
            PieceOutcome::Duplicate => {
                // Late answer to a request we already satisfied elsewhere.
                state.pieces.mark_piece_held(piece_index);
                return;
            }
            PieceOutcome::HashMismatch | PieceOutcome::WrongLength => {
                tracing::warn!(
                    content = hex::encode(id),
                    piece = piece_index,
                    peer = hex::encode(&peer[..8]),
                    "bad piece rejected, retrying elsewhere"
                );
                state.pieces.mark_request_failed(piece_index, &peer);
                return;
            }
            PieceOutcome::OutOfRange => {
                tracing::warn!(
                    content = hex::encode(id),
                    piece = piece_index,
                    "piece index out of range, ignored"
                );
                return;
            }
        }

        if state.chunks.is_complete() {
            let Some(bytes) = state.chunks.reassemble() else {
                tracing::error!(
                    content = hex::encode(id),
                    "complete download failed to reassemble"
                );
                return;
            };
            drop(state);
            self.inner.active.remove(&id);
            tracing::info!(
                content = hex::encode(id),
                size = bytes.len(),
                "download complete"
            );
            let _ = self
                .inner
                .events
                .send(DownloadEvent::Completed {
                    content_id: id,
                    bytes,
                });
        }
    }

    /// A peer's link went down: release its pending requests everywhere
    /// so its pieces get reassigned.
    pub async fn remove_peer(&self, peer: &PeerId) {
        let states: Vec<_> = self
            .inner
            .active
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for state in states {
            state.lock().await.pieces.remove_peer(peer);
        }
    }

    fn state_for(&self, id: &ContentId) -> Option<Arc<Mutex<DownloadState>>> {
        self.inner.active.get(id).map(|entry| Arc::clone(entry.value()))
    }

    async fn tick_loop(self, id: ContentId) {
        let mut interval = tokio::time::interval(self.inner.config.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            // Completion and cancellation both remove the entry.
            let Some(state) = self.state_for(&id) else {
                return;
            };
            let selections = state.lock().await.pieces.select_next_pieces(Instant::now());
            for selection in selections {
                let packet = Packet::PieceRequest {
                    content_id: id,
                    piece_index: selection.piece_index,
                };
                if self
                    .inner
                    .outbound
                    .send((selection.peer, packet))
                    .await
                    .is_err()
                {
                    // Outbound queue gone: the node is shutting down.
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snapmesh_core::ChunkManifest;

    fn fast_config() -> DownloaderConfig {
        DownloaderConfig {
            max_pending: 5,
            request_timeout: Duration::from_secs(10),
            tick: Duration::from_millis(10),
        }
    }

    fn peer(n: u8) -> PeerId {
        [n; 32]
    }

    fn swarm_content(len: usize) -> (ChunkedContent, ChunkManifest) {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let sender = ChunkedContent::from_bytes(&data, 16_384).unwrap();
        let manifest = sender.manifest().clone();
        (sender, manifest)
    }

    async fn next_request(
        rx: &mut mpsc::Receiver<(PeerId, Packet)>,
    ) -> (PeerId, ContentId, u32) {
        let (peer, packet) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("request before timeout")
            .expect("outbound channel open");
        match packet {
            Packet::PieceRequest {
                content_id,
                piece_index,
            } => (peer, content_id, piece_index),
            other => panic!("expected a piece request, got {:?}", other.packet_type()),
        }
    }

    #[tokio::test]
    async fn full_download_completes_and_broadcasts() {
        let (tx, mut rx) = mpsc::channel(64);
        let downloader = Downloader::new(tx, fast_config());
        let mut events = downloader.subscribe();

        let (sender, manifest) = swarm_content(50_000);
        let id = manifest.merkle_root;
        let shell = ChunkedContent::from_manifest(manifest).unwrap();
        let expected = sender.reassemble().unwrap();

        downloader.start_download(shell);
        downloader
            .handle_peer_bitfield(peer(1), id, &sender.bitfield())
            .await;

        // Serve every request until completion.
        let completed = loop {
            tokio::select! {
                req = next_request(&mut rx) => {
                    let (to, content, index) = req;
                    assert_eq!(to, peer(1));
                    assert_eq!(content, id);
                    downloader
                        .handle_piece_response(peer(1), id, index, sender.piece(index).unwrap())
                        .await;
                }
                event = events.recv() => {
                    if let Ok(DownloadEvent::Completed { content_id, bytes }) = event {
                        break (content_id, bytes);
                    }
                }
            }
        };

        assert_eq!(completed.0, id);
        assert_eq!(completed.1, expected);
        assert!(!downloader.is_downloading(&id));
    }

    #[tokio::test]
    async fn corrupt_piece_is_refetched_from_another_peer() {
        let (tx, mut rx) = mpsc::channel(64);
        let downloader = Downloader::new(tx, fast_config());

        let (sender, manifest) = swarm_content(1000); // single piece
        let id = manifest.merkle_root;
        downloader.start_download(ChunkedContent::from_manifest(manifest).unwrap());
        downloader
            .handle_peer_bitfield(peer(1), id, &sender.bitfield())
            .await;
        downloader
            .handle_peer_bitfield(peer(2), id, &sender.bitfield())
            .await;

        let (first_peer, _, index) = next_request(&mut rx).await;
        let mut corrupt = sender.piece(index).unwrap().to_vec();
        corrupt[0] ^= 0x01;
        downloader
            .handle_piece_response(first_peer, id, index, Bytes::from(corrupt))
            .await;
        assert!(downloader.is_downloading(&id));

        // The retry goes to the other peer, and the genuine piece finishes it.
        let (second_peer, _, index) = next_request(&mut rx).await;
        assert_ne!(second_peer, first_peer);
        downloader
            .handle_piece_response(second_peer, id, index, sender.piece(index).unwrap())
            .await;
        assert!(!downloader.is_downloading(&id));
    }

    #[tokio::test]
    async fn start_is_idempotent_and_cancel_stops_requests() {
        let (tx, mut rx) = mpsc::channel(64);
        let downloader = Downloader::new(tx, fast_config());

        let (sender, manifest) = swarm_content(50_000);
        let id = manifest.merkle_root;
        let shell = ChunkedContent::from_manifest(manifest).unwrap();
        downloader.start_download(shell.clone());
        downloader.start_download(shell);
        downloader
            .handle_peer_bitfield(peer(1), id, &sender.bitfield())
            .await;

        // One tick task: at most max_pending requests in flight, not double.
        let _ = next_request(&mut rx).await;

        downloader.cancel_download(&id);
        assert!(!downloader.is_downloading(&id));

        // Drain anything selected before the cancel, then expect silence.
        tokio::time::sleep(Duration::from_millis(50)).await;
        while rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn responses_for_unknown_content_are_ignored() {
        let (tx, _rx) = mpsc::channel(64);
        let downloader = Downloader::new(tx, fast_config());
        downloader
            .handle_piece_response(peer(1), [9; 32], 0, Bytes::from_static(b"stray"))
            .await;
        assert!(!downloader.is_downloading(&[9; 32]));
    }
}
