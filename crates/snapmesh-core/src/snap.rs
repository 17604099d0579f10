//! Snap — the ephemeral content object flooded across the mesh.
//!
//! A snap is immutable once created: its id is a deterministic hash of
//! (content, sender key, created-at) and every field is fixed at creation.
//! Expiry is a property of the object itself, not of any store holding it.

use bytes::Bytes;

use crate::crypto::sha256;

/// Content identifier — 32-byte SHA-256 digest.
pub type ContentId = [u8; 32];

/// Peer identifier — 32 bytes, derived from the peer's public key.
pub type PeerId = [u8; 32];

/// Maximum sender alias length in bytes (UTF-8).
pub const MAX_ALIAS_LEN: usize = 64;

/// An ephemeral, TTL-bound content item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snap {
    /// Deterministic id: SHA-256 over content ‖ sender ‖ created_at (BE).
    pub id: ContentId,

    /// Ed25519 public key of the sender.
    pub sender: [u8; 32],

    /// Sender's display alias. At most `MAX_ALIAS_LEN` bytes of UTF-8.
    pub alias: String,

    /// MIME type of the content, e.g. "image/jpeg".
    pub mime: String,

    /// Raw content bytes.
    pub content: Bytes,

    /// Creation time, epoch milliseconds.
    pub created_at: u64,

    /// Expiry time, epoch milliseconds. The snap is dead once `now > expires_at`.
    pub expires_at: u64,

    /// Ed25519 signature over `signable_bytes()`.
    pub signature: [u8; 64],
}

impl Snap {
    /// Build a snap, computing its id from the identity-bearing fields.
    ///
    /// The alias is truncated to `MAX_ALIAS_LEN` bytes on a char boundary
    /// so the result always encodes within the wire limit.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sender: [u8; 32],
        alias: impl Into<String>,
        mime: impl Into<String>,
        content: Bytes,
        created_at: u64,
        expires_at: u64,
        signature: [u8; 64],
    ) -> Self {
        let mut alias = alias.into();
        if alias.len() > MAX_ALIAS_LEN {
            let mut cut = MAX_ALIAS_LEN;
            while !alias.is_char_boundary(cut) {
                cut -= 1;
            }
            alias.truncate(cut);
        }

        let id = Self::compute_id(&content, &sender, created_at);
        Self {
            id,
            sender,
            alias,
            mime: mime.into(),
            content,
            created_at,
            expires_at,
            signature,
        }
    }

    /// Deterministic content id: SHA-256 over content ‖ sender ‖ created_at.
    pub fn compute_id(content: &[u8], sender: &[u8; 32], created_at: u64) -> ContentId {
        let mut input = Vec::with_capacity(content.len() + 40);
        input.extend_from_slice(content);
        input.extend_from_slice(sender);
        input.extend_from_slice(&created_at.to_be_bytes());
        sha256(&input)
    }

    /// The bytes the sender signs: id ‖ created_at ‖ expires_at (both BE).
    ///
    /// The id already binds content, sender key, and creation time, so the
    /// signature covers the full identity of the snap plus its lifetime.
    pub fn signable_bytes(&self) -> [u8; 48] {
        let mut out = [0u8; 48];
        out[..32].copy_from_slice(&self.id);
        out[32..40].copy_from_slice(&self.created_at.to_be_bytes());
        out[40..48].copy_from_slice(&self.expires_at.to_be_bytes());
        out
    }

    /// True iff the snap is past its expiry at `now` (epoch millis).
    pub fn is_expired(&self, now: u64) -> bool {
        now > self.expires_at
    }
}

/// Current time as epoch milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(created_at: u64, expires_at: u64) -> Snap {
        Snap::new(
            [0x11; 32],
            "ada",
            "text/plain",
            Bytes::from_static(b"hello mesh"),
            created_at,
            expires_at,
            [0x42; 64],
        )
    }

    #[test]
    fn id_is_deterministic() {
        let a = sample(1000, 2000);
        let b = sample(1000, 9999); // expiry does not affect the id
        assert_eq!(a.id, b.id);

        let c = sample(1001, 2000); // created_at does
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn id_depends_on_sender_and_content() {
        let a = Snap::compute_id(b"x", &[1; 32], 5);
        let b = Snap::compute_id(b"x", &[2; 32], 5);
        let c = Snap::compute_id(b"y", &[1; 32], 5);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn expiry_boundary_is_strict() {
        let snap = sample(0, 1000);
        assert!(!snap.is_expired(999));
        assert!(!snap.is_expired(1000)); // expires strictly after expires_at
        assert!(snap.is_expired(1001));
    }

    #[test]
    fn oversized_alias_is_truncated() {
        let snap = Snap::new(
            [0; 32],
            "x".repeat(100),
            "text/plain",
            Bytes::new(),
            0,
            1,
            [0; 64],
        );
        assert_eq!(snap.alias.len(), MAX_ALIAS_LEN);
    }

    #[test]
    fn signable_bytes_binds_lifetime() {
        let a = sample(1000, 2000);
        let b = sample(1000, 3000);
        assert_ne!(a.signable_bytes(), b.signable_bytes());
    }
}
