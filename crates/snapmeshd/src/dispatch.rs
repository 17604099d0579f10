//! Packet and event dispatch — the daemon's central switchboard.
//!
//! One task owns every inbound queue: packets off the links, link
//! lifecycle events, and download completions. Each arrival is routed
//! to the service that owns it (ingress, seed store, downloader), and
//! anything newly stored is relayed onward exactly once.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};

use snapmesh_core::snap::now_millis;
use snapmesh_core::wire::{decode_snap_body, snap_to_bytes};
use snapmesh_core::{ChunkManifest, ChunkedContent, ContentId, Packet, PeerId, Snap};
use snapmesh_services::{
    DownloadEvent, Downloader, IngressOutcome, SeedStore, SnapCache, SnapIngress,
};

use crate::link::{LinkEvent, PeerLinkManager};

/// Transfer knobs the dispatcher needs, normally from `TransferConfig`.
#[derive(Debug, Clone, Copy)]
pub struct DispatchConfig {
    /// Encoded snaps up to this size travel whole inside a `Snap`
    /// packet; larger ones are chunked and fetched piecewise.
    pub direct_send_max_bytes: usize,
    pub piece_size: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            direct_send_max_bytes: 65_536,
            piece_size: 16_384,
        }
    }
}

/// Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Dispatcher {
    links: PeerLinkManager,
    cache: SnapCache,
    seeds: SeedStore,
    downloader: Downloader,
    ingress: Arc<SnapIngress>,
    /// Transfer id → id of the snap the seeded bytes encode. Lets a
    /// piece request check whether the snap is still cached before
    /// serving, so eviction eventually stops the seeding too.
    seed_origin: Arc<DashMap<ContentId, ContentId>>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        links: PeerLinkManager,
        cache: SnapCache,
        seeds: SeedStore,
        downloader: Downloader,
        ingress: Arc<SnapIngress>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            links,
            cache,
            seeds,
            downloader,
            ingress,
            seed_origin: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Route packets and events until shutdown or the inbound queue
    /// closes.
    pub async fn run(
        self,
        mut inbound: mpsc::Receiver<(PeerId, Packet)>,
        mut link_events: broadcast::Receiver<LinkEvent>,
        mut download_events: broadcast::Receiver<DownloadEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                packet = inbound.recv() => {
                    let Some((peer, packet)) = packet else {
                        tracing::info!("inbound queue closed, dispatcher exiting");
                        return;
                    };
                    self.handle_packet(peer, packet).await;
                }
                event = link_events.recv() => {
                    match event {
                        Ok(event) => self.handle_link_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(missed = n, "link events lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
                event = download_events.recv() => {
                    match event {
                        Ok(event) => self.handle_download_event(event),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(missed = n, "download events lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("dispatcher shutting down");
                    return;
                }
            }
        }
    }

    /// Offer a locally created snap to the mesh: cache it, then push it
    /// whole to every connected peer or announce it for piecewise fetch,
    /// depending on its encoded size.
    pub fn publish_snap(&self, snap: Snap) -> IngressOutcome {
        let outcome = self.ingress.handle_snap(snap.clone(), now_millis());
        if outcome != IngressOutcome::Stored {
            return outcome;
        }
        self.offer_to(None, &snap);
        outcome
    }

    async fn handle_packet(&self, peer: PeerId, packet: Packet) {
        match packet {
            Packet::Snap(snap) => self.handle_snap_packet(peer, snap),
            Packet::PieceRequest {
                content_id,
                piece_index,
            } => self.handle_piece_request(peer, content_id, piece_index),
            Packet::PieceResponse {
                content_id,
                piece_index,
                data,
            } => {
                self.downloader
                    .handle_piece_response(peer, content_id, piece_index, data)
                    .await;
            }
            Packet::PieceHave {
                content_id,
                bitfield,
                ..
            } => {
                self.downloader
                    .handle_peer_bitfield(peer, content_id, &bitfield)
                    .await;
            }
            Packet::ChunkManifest(manifest) => self.handle_manifest(peer, manifest),
        }
    }

    fn handle_snap_packet(&self, peer: PeerId, snap: Snap) {
        match self.ingress.handle_snap(snap.clone(), now_millis()) {
            IngressOutcome::Stored => {
                tracing::info!(
                    id = hex::encode(snap.id),
                    from = hex::encode(&peer[..8]),
                    "snap received, relaying"
                );
                // First sighting relays; duplicates never do, so the
                // flood terminates.
                self.links
                    .broadcast_except(&Packet::Snap(snap), Some(&peer));
            }
            outcome => {
                tracing::trace!(id = hex::encode(snap.id), ?outcome, "snap not relayed");
            }
        }
    }

    fn handle_piece_request(&self, peer: PeerId, content_id: ContentId, piece_index: u32) {
        // Seeding outlives the snap cache only until the next request:
        // once the snap is evicted or expired the seed goes too.
        if let Some(origin) = self.seed_origin.get(&content_id).map(|entry| *entry.value()) {
            if !self.cache.has(&origin) {
                tracing::debug!(
                    content = hex::encode(content_id),
                    "seeded snap no longer cached, seed dropped"
                );
                self.seeds.remove(&content_id);
                self.seed_origin.remove(&content_id);
                return;
            }
        }

        let Some(data) = self.seeds.piece(&content_id, piece_index) else {
            tracing::debug!(
                content = hex::encode(content_id),
                piece = piece_index,
                "piece request for content we do not seed"
            );
            return;
        };
        let response = Packet::PieceResponse {
            content_id,
            piece_index,
            data,
        };
        let _ = self.links.send(&peer, &response);
    }

    fn handle_manifest(&self, peer: PeerId, manifest: ChunkManifest) {
        let id = manifest.merkle_root;
        if self.seeds.contains(&id) || self.downloader.is_downloading(&id) {
            return;
        }
        match ChunkedContent::from_manifest(manifest) {
            Ok(shell) => {
                tracing::info!(
                    content = hex::encode(id),
                    from = hex::encode(&peer[..8]),
                    pieces = shell.piece_count(),
                    "manifest received, download starting"
                );
                self.downloader.start_download(shell);
            }
            Err(e) => {
                tracing::warn!(content = hex::encode(id), error = %e, "bad manifest ignored");
            }
        }
    }

    async fn handle_link_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::Connected { peer } => {
                // Store-and-forward: a freshly linked peer gets offered
                // everything still active in the cache.
                let snaps = self.cache.all_active();
                if snaps.is_empty() {
                    return;
                }
                tracing::info!(
                    peer = hex::encode(&peer[..8]),
                    count = snaps.len(),
                    "offering cached snaps to new link"
                );
                for snap in snaps {
                    self.offer_to(Some(&peer), &snap);
                }
            }
            LinkEvent::Disconnected { peer } => {
                self.downloader.remove_peer(&peer).await;
            }
        }
    }

    fn handle_download_event(&self, event: DownloadEvent) {
        match event {
            DownloadEvent::Progress {
                content_id,
                pieces_held,
                piece_count,
            } => {
                tracing::debug!(
                    content = hex::encode(content_id),
                    held = pieces_held,
                    total = piece_count,
                    "download progress"
                );
            }
            DownloadEvent::Completed { content_id, bytes } => {
                let snap = match decode_snap_body(&bytes) {
                    Ok(snap) => snap,
                    Err(e) => {
                        tracing::warn!(
                            content = hex::encode(content_id),
                            error = %e,
                            "completed download does not decode as a snap, discarded"
                        );
                        return;
                    }
                };
                if self.ingress.handle_snap(snap.clone(), now_millis()) == IngressOutcome::Stored {
                    tracing::info!(
                        id = hex::encode(snap.id),
                        "downloaded snap stored, announcing"
                    );
                    // Relay the announcement; peers already seeding or
                    // fetching it ignore the manifest.
                    self.seed_bytes(snap.id, &bytes);
                }
            }
        }
    }

    /// Offer one snap to a single peer, or to every connected peer when
    /// `to` is `None`. Small snaps travel whole; large ones are seeded
    /// and announced via manifest plus bitfield.
    fn offer_to(&self, to: Option<&PeerId>, snap: &Snap) {
        let body = match snap_to_bytes(snap) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(id = hex::encode(snap.id), error = %e, "snap failed to encode");
                return;
            }
        };

        if body.len() <= self.config.direct_send_max_bytes {
            let packet = Packet::Snap(snap.clone());
            match to {
                Some(peer) => {
                    let _ = self.links.send(peer, &packet);
                }
                None => self.links.broadcast(&packet),
            }
            return;
        }

        let Some((manifest, have)) = self.ensure_seeded(snap.id, &body) else {
            return;
        };
        // Manifest first, then the bitfield, on the same link so the
        // receiver knows the piece count before the holdings.
        match to {
            Some(peer) => {
                let _ = self.links.send(peer, &manifest);
                let _ = self.links.send(peer, &have);
            }
            None => {
                self.links.broadcast(&manifest);
                self.links.broadcast(&have);
            }
        }
    }

    /// Seed already-encoded snap bytes and announce them mesh-wide.
    fn seed_bytes(&self, snap_id: ContentId, body: &[u8]) {
        let Some((manifest, have)) = self.ensure_seeded(snap_id, body) else {
            return;
        };
        self.links.broadcast(&manifest);
        self.links.broadcast(&have);
    }

    /// Chunk `body` into the seed store and return the manifest and
    /// bitfield announcement packets for it.
    fn ensure_seeded(&self, snap_id: ContentId, body: &[u8]) -> Option<(Packet, Packet)> {
        match ChunkedContent::from_bytes(body, self.config.piece_size) {
            Ok(chunks) => {
                let content_id = chunks.content_id();
                let manifest = chunks.manifest().clone();
                let bitfield = chunks.bitfield();
                self.seeds.insert(chunks);
                self.seed_origin.insert(content_id, snap_id);
                Some((
                    Packet::ChunkManifest(manifest.clone()),
                    Packet::PieceHave {
                        content_id,
                        piece_count: manifest.piece_count(),
                        bitfield,
                    },
                ))
            }
            Err(e) => {
                tracing::error!(id = hex::encode(snap_id), error = %e, "chunking failed");
                None
            }
        }
    }
}

/// Poll-free convenience for tests and the daemon: forward downloader
/// requests onto their target links until the queue closes.
pub async fn outbound_pump(
    mut outbound: mpsc::Receiver<(PeerId, Packet)>,
    links: PeerLinkManager,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            item = outbound.recv() => {
                let Some((peer, packet)) = item else { return };
                let _ = links.send(&peer, &packet);
            }
            _ = shutdown.recv() => return,
        }
    }
}
