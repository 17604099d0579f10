//! Hashing and the cryptographic collaborator seams.
//!
//! Signing and key storage live outside this layer. The core consumes
//! signature verification and the username directory through traits so
//! the transport never depends on a concrete identity implementation.

use std::collections::HashMap;
use std::sync::Mutex;

use sha2::{Digest, Sha256};

/// SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

// ── Signature verification ───────────────────────────────────────────────────

/// Verification capability injected into the packet ingress path.
pub trait SignatureVerifier: Send + Sync {
    /// True iff `signature` is a valid signature of `data` under `public_key`.
    fn verify(&self, data: &[u8], signature: &[u8; 64], public_key: &[u8; 32]) -> bool;
}

/// Real Ed25519 verification.
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, data: &[u8], signature: &[u8; 64], public_key: &[u8; 32]) -> bool {
        let key = match ed25519_dalek::VerifyingKey::from_bytes(public_key) {
            Ok(k) => k,
            Err(_) => return false,
        };
        let sig = ed25519_dalek::Signature::from_bytes(signature);
        key.verify_strict(data, &sig).is_ok()
    }
}

/// Accepts every signature. For tests and local-only setups.
pub struct AcceptAllVerifier;

impl SignatureVerifier for AcceptAllVerifier {
    fn verify(&self, _data: &[u8], _signature: &[u8; 64], _public_key: &[u8; 32]) -> bool {
        true
    }
}

// ── Username directory ───────────────────────────────────────────────────────

/// One published name → key binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name: String,
    pub public_key: [u8; 32],
}

/// The decentralized username directory, as seen from the transport core.
pub trait Directory: Send + Sync {
    fn lookup(&self, name: &str) -> Option<[u8; 32]>;
    fn publish(&self, entry: DirectoryEntry);
}

/// Process-local directory. Stands in for the real decentralized service
/// in tests and single-node runs.
#[derive(Default)]
pub struct InMemoryDirectory {
    entries: Mutex<HashMap<String, [u8; 32]>>,
}

impl Directory for InMemoryDirectory {
    fn lookup(&self, name: &str) -> Option<[u8; 32]> {
        self.entries.lock().expect("directory lock poisoned").get(name).copied()
    }

    fn publish(&self, entry: DirectoryEntry) {
        self.entries
            .lock()
            .expect("directory lock poisoned")
            .insert(entry.name, entry.public_key);
    }
}
