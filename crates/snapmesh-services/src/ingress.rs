//! Snap ingress — validation and dedup for content arriving off the mesh.
//!
//! Every snap, whether it came in whole or was reassembled from pieces,
//! passes through here exactly once. The outcome tells the caller
//! whether to relay: only a first-time store is flooded onward, so each
//! item crosses each link at most once (the relay bound).

use std::sync::Arc;

use snapmesh_core::crypto::SignatureVerifier;
use snapmesh_core::Snap;

use crate::cache::{SnapCache, StoreOutcome};

/// Outcome of offering a snap to the ingress path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressOutcome {
    /// New, valid, cached. Relay it.
    Stored,
    /// Already cached. Drop silently.
    Duplicate,
    /// Past expiry. Drop silently.
    Expired,
    /// Declared id does not match the content. Drop.
    BadId,
    /// Signature did not verify under the sender's key. Drop.
    BadSignature,
}

pub struct SnapIngress {
    cache: SnapCache,
    verifier: Arc<dyn SignatureVerifier>,
}

impl SnapIngress {
    pub fn new(cache: SnapCache, verifier: Arc<dyn SignatureVerifier>) -> Self {
        Self { cache, verifier }
    }

    /// Validate and store one snap: expiry, dedup, id integrity, then
    /// signature — cheapest checks first, the signature last.
    pub fn handle_snap(&self, snap: Snap, now: u64) -> IngressOutcome {
        if snap.is_expired(now) {
            tracing::trace!(id = hex::encode(snap.id), "expired snap dropped at ingress");
            return IngressOutcome::Expired;
        }
        if self.cache.has(&snap.id) {
            tracing::trace!(id = hex::encode(snap.id), "duplicate snap dropped at ingress");
            return IngressOutcome::Duplicate;
        }
        if Snap::compute_id(&snap.content, &snap.sender, snap.created_at) != snap.id {
            tracing::warn!(id = hex::encode(snap.id), "snap id does not match content, dropped");
            return IngressOutcome::BadId;
        }
        if !self
            .verifier
            .verify(&snap.signable_bytes(), &snap.signature, &snap.sender)
        {
            tracing::warn!(
                id = hex::encode(snap.id),
                sender = hex::encode(&snap.sender[..8]),
                "snap signature failed verification, dropped"
            );
            return IngressOutcome::BadSignature;
        }

        match self.cache.store(snap) {
            StoreOutcome::Stored => IngressOutcome::Stored,
            StoreOutcome::Duplicate => IngressOutcome::Duplicate,
            StoreOutcome::Expired => IngressOutcome::Expired,
        }
    }
}
