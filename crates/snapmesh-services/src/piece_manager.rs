//! Piece availability tracking and rarest-first selection.
//!
//! One `PieceManager` exists per content item being downloaded. It knows
//! which remote peers hold which pieces, which requests are in flight,
//! and which pieces are already held locally. Selection prefers the
//! rarest pieces so the swarm keeps every piece alive, and picks the
//! serving peer uniformly at random so no single peer is hammered.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use rand::seq::IteratorRandom;

use snapmesh_core::PeerId;

/// One selected request: fetch `piece_index` from `peer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub piece_index: u32,
    pub peer: PeerId,
}

#[derive(Debug, Clone, Copy)]
struct PendingRequest {
    peer: PeerId,
    requested_at: Instant,
}

pub struct PieceManager {
    piece_count: u32,
    /// Piece index → peers announcing they hold it.
    availability: HashMap<u32, HashSet<PeerId>>,
    /// In-flight requests, keyed by piece index.
    pending: HashMap<u32, PendingRequest>,
    /// Pieces held locally (verified into the chunk store).
    held: HashSet<u32>,
    max_pending: usize,
    request_timeout: Duration,
}

impl PieceManager {
    pub fn new(piece_count: u32, max_pending: usize, request_timeout: Duration) -> Self {
        Self {
            piece_count,
            availability: HashMap::new(),
            pending: HashMap::new(),
            held: HashSet::new(),
            max_pending,
            request_timeout,
        }
    }

    /// Record a full bitfield announcement from a peer.
    pub fn update_peer_bitfield(&mut self, peer: PeerId, indices: impl IntoIterator<Item = u32>) {
        for index in indices {
            self.mark_peer_has_piece(peer, index);
        }
    }

    /// Record a single-piece announcement. Out-of-range indices are ignored.
    pub fn mark_peer_has_piece(&mut self, peer: PeerId, index: u32) {
        if index >= self.piece_count {
            return;
        }
        self.availability.entry(index).or_default().insert(peer);
    }

    /// Forget a disconnected peer: every availability set and any pending
    /// request against it, so those pieces can be reassigned elsewhere.
    pub fn remove_peer(&mut self, peer: &PeerId) {
        for peers in self.availability.values_mut() {
            peers.remove(peer);
        }
        self.pending.retain(|_, req| req.peer != *peer);
    }

    /// A piece arrived and verified. Clears any pending request for it.
    pub fn mark_piece_held(&mut self, index: u32) {
        if index >= self.piece_count {
            return;
        }
        self.held.insert(index);
        self.pending.remove(&index);
    }

    /// A request failed (hash mismatch or refusal). The pending slot is
    /// released and the peer is dropped from that piece's availability so
    /// the next selection asks someone else.
    pub fn mark_request_failed(&mut self, index: u32, peer: &PeerId) {
        if let Some(req) = self.pending.get(&index) {
            if req.peer == *peer {
                self.pending.remove(&index);
            }
        }
        if let Some(peers) = self.availability.get_mut(&index) {
            peers.remove(peer);
        }
    }

    /// Rarest-first selection.
    ///
    /// Purges timed-out pending entries, then fills the free request slots
    /// with the needed pieces held by the fewest peers, choosing one holder
    /// uniformly at random per piece. Pieces nobody holds are skipped.
    pub fn select_next_pieces(&mut self, now: Instant) -> Vec<Selection> {
        let timeout = self.request_timeout;
        self.pending
            .retain(|_, req| now.duration_since(req.requested_at) < timeout);

        let free_slots = self.max_pending.saturating_sub(self.pending.len());
        if free_slots == 0 {
            return Vec::new();
        }

        let mut needed: Vec<u32> = (0..self.piece_count)
            .filter(|index| !self.held.contains(index) && !self.pending.contains_key(index))
            .filter(|index| {
                self.availability
                    .get(index)
                    .is_some_and(|peers| !peers.is_empty())
            })
            .collect();
        needed.sort_by_key(|index| self.availability[index].len());

        let mut rng = rand::thread_rng();
        let mut selections = Vec::new();
        for index in needed.into_iter().take(free_slots) {
            let peer = self.availability[&index]
                .iter()
                .choose(&mut rng)
                .copied()
                .expect("availability set is non-empty");
            self.pending.insert(
                index,
                PendingRequest {
                    peer,
                    requested_at: now,
                },
            );
            selections.push(Selection {
                piece_index: index,
                peer,
            });
        }
        selections
    }

    pub fn piece_count(&self) -> u32 {
        self.piece_count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn held_count(&self) -> u32 {
        self.held.len() as u32
    }

    pub fn is_complete(&self) -> bool {
        self.held.len() as u32 == self.piece_count
    }

    /// Fraction of pieces held locally, in `0.0..=1.0`.
    pub fn progress(&self) -> f64 {
        if self.piece_count == 0 {
            return 1.0;
        }
        self.held.len() as f64 / self.piece_count as f64
    }
}
