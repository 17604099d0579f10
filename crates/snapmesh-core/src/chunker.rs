//! Content chunking and Merkle verification.
//!
//! Content is split into fixed-size pieces, each hashed with SHA-256.
//! The piece hashes fold pairwise bottom-up into a Merkle root, which is
//! the identifier the swarm uses for the content. A receiver that holds
//! only the manifest can verify every piece independently and in any
//! order, so pieces may arrive from many peers at once.

use std::collections::HashMap;

use bytes::Bytes;

use crate::crypto::sha256;
use crate::snap::ContentId;

/// Default piece size in bytes.
pub const DEFAULT_PIECE_SIZE: u32 = 16_384;

/// The manifest a receiver needs before it can fetch pieces: sizes plus
/// the full ordered hash list. The Merkle root doubles as the content id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkManifest {
    pub merkle_root: ContentId,
    pub piece_size: u32,
    pub total_size: u64,
    pub piece_hashes: Vec<[u8; 32]>,
}

impl ChunkManifest {
    pub fn piece_count(&self) -> u32 {
        self.piece_hashes.len() as u32
    }
}

/// Outcome of offering a piece to `add_piece`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceOutcome {
    /// Hash verified, piece stored.
    Accepted,
    /// Piece already held; stored state unchanged.
    Duplicate,
    /// SHA-256 of the bytes does not match the declared hash. Rejected.
    HashMismatch,
    /// Byte length does not match what the manifest implies for this index.
    WrongLength,
    /// Index is outside `0..piece_count`.
    OutOfRange,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkError {
    #[error("piece size must be non-zero")]
    ZeroPieceSize,

    #[error("manifest declares {declared} hashes but total size implies {implied} pieces")]
    PieceCountMismatch { declared: u32, implied: u32 },

    #[error("manifest root does not match its piece hashes")]
    RootMismatch,
}

/// A content item split for distributed transfer.
///
/// Complete on the sender side (every piece present from construction),
/// sparse on the receiver side (pieces verified in as they arrive).
#[derive(Debug, Clone)]
pub struct ChunkedContent {
    manifest: ChunkManifest,
    pieces: HashMap<u32, Bytes>,
}

impl ChunkedContent {
    /// Chunk `content` for distribution. Every piece is held locally.
    pub fn from_bytes(content: &[u8], piece_size: u32) -> Result<Self, ChunkError> {
        if piece_size == 0 {
            return Err(ChunkError::ZeroPieceSize);
        }

        let mut pieces = HashMap::new();
        let mut piece_hashes = Vec::new();
        for (index, piece) in content.chunks(piece_size as usize).enumerate() {
            piece_hashes.push(sha256(piece));
            pieces.insert(index as u32, Bytes::copy_from_slice(piece));
        }

        let manifest = ChunkManifest {
            merkle_root: merkle_root(&piece_hashes),
            piece_size,
            total_size: content.len() as u64,
            piece_hashes,
        };
        Ok(Self { manifest, pieces })
    }

    /// Reconstruct an empty shell from a manifest. The receiver side:
    /// no pieces are held until `add_piece` verifies them in.
    pub fn from_manifest(manifest: ChunkManifest) -> Result<Self, ChunkError> {
        if manifest.piece_size == 0 {
            return Err(ChunkError::ZeroPieceSize);
        }
        let implied = manifest.total_size.div_ceil(manifest.piece_size as u64) as u32;
        if implied != manifest.piece_count() {
            return Err(ChunkError::PieceCountMismatch {
                declared: manifest.piece_count(),
                implied,
            });
        }
        if merkle_root(&manifest.piece_hashes) != manifest.merkle_root {
            return Err(ChunkError::RootMismatch);
        }
        Ok(Self {
            manifest,
            pieces: HashMap::new(),
        })
    }

    pub fn manifest(&self) -> &ChunkManifest {
        &self.manifest
    }

    pub fn content_id(&self) -> ContentId {
        self.manifest.merkle_root
    }

    pub fn piece_count(&self) -> u32 {
        self.manifest.piece_count()
    }

    /// Expected byte length of piece `index`: `piece_size` for all but the
    /// last piece, which carries the remainder.
    pub fn piece_len(&self, index: u32) -> Option<usize> {
        let count = self.piece_count();
        if index >= count {
            return None;
        }
        let size = self.manifest.piece_size as u64;
        if index + 1 == count {
            let rem = self.manifest.total_size - size * (count as u64 - 1);
            Some(rem as usize)
        } else {
            Some(size as usize)
        }
    }

    /// Verify and store a piece. Rejection never alters stored state.
    pub fn add_piece(&mut self, index: u32, data: Bytes) -> PieceOutcome {
        let Some(expected_len) = self.piece_len(index) else {
            return PieceOutcome::OutOfRange;
        };
        if self.pieces.contains_key(&index) {
            return PieceOutcome::Duplicate;
        }
        if data.len() != expected_len {
            return PieceOutcome::WrongLength;
        }
        if sha256(&data) != self.manifest.piece_hashes[index as usize] {
            return PieceOutcome::HashMismatch;
        }
        self.pieces.insert(index, data);
        PieceOutcome::Accepted
    }

    /// A locally-held piece, for serving requests.
    pub fn piece(&self, index: u32) -> Option<Bytes> {
        self.pieces.get(&index).cloned()
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.pieces.contains_key(&index)
    }

    pub fn is_complete(&self) -> bool {
        self.pieces.len() as u32 == self.piece_count()
    }

    /// Fraction of pieces held, in `0.0..=1.0`.
    pub fn progress(&self) -> f64 {
        if self.piece_count() == 0 {
            return 1.0;
        }
        self.pieces.len() as f64 / self.piece_count() as f64
    }

    /// Concatenate pieces in index order. `None` while incomplete — a
    /// partial reassembly is never exposed.
    pub fn reassemble(&self) -> Option<Bytes> {
        if !self.is_complete() {
            return None;
        }
        let mut out = Vec::with_capacity(self.manifest.total_size as usize);
        for index in 0..self.piece_count() {
            out.extend_from_slice(&self.pieces[&index]);
        }
        Some(Bytes::from(out))
    }

    /// Packed bit-vector of held pieces. Bit `i` lives at byte `i / 8`,
    /// position `7 - i % 8` (MSB-first).
    pub fn bitfield(&self) -> Bytes {
        let count = self.piece_count() as usize;
        let mut bits = vec![0u8; count.div_ceil(8)];
        for index in self.pieces.keys() {
            bits[(*index / 8) as usize] |= 1 << (7 - index % 8);
        }
        Bytes::from(bits)
    }
}

/// Indices set in a packed bitfield, bounded by `piece_count`.
pub fn indices_from_bitfield(bitfield: &[u8], piece_count: u32) -> Vec<u32> {
    let mut indices = Vec::new();
    for index in 0..piece_count {
        let byte = (index / 8) as usize;
        if byte >= bitfield.len() {
            break;
        }
        if bitfield[byte] & (1 << (7 - index % 8)) != 0 {
            indices.push(index);
        }
    }
    indices
}

/// Fold piece hashes pairwise bottom-up into a single root. A level with
/// an odd node count duplicates its last node; a single leaf is its own
/// root; zero leaves hash the empty input.
pub fn merkle_root(piece_hashes: &[[u8; 32]]) -> ContentId {
    if piece_hashes.is_empty() {
        return sha256(&[]);
    }
    let mut level: Vec<[u8; 32]> = piece_hashes.to_vec();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            level.push(*level.last().expect("level is non-empty"));
        }
        level = level
            .chunks(2)
            .map(|pair| {
                let mut input = [0u8; 64];
                input[..32].copy_from_slice(&pair[0]);
                input[32..].copy_from_slice(&pair[1]);
                sha256(&input)
            })
            .collect();
    }
    level[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn chunking_is_deterministic() {
        let data = content(100_000);
        let a = ChunkedContent::from_bytes(&data, DEFAULT_PIECE_SIZE).unwrap();
        let b = ChunkedContent::from_bytes(&data, DEFAULT_PIECE_SIZE).unwrap();
        assert_eq!(a.content_id(), b.content_id());
        assert_eq!(a.manifest().piece_hashes, b.manifest().piece_hashes);
    }

    #[test]
    fn forty_kb_makes_three_pieces() {
        // 40,000 bytes at 16,384 per piece: 16384 + 16384 + 7232.
        let data = content(40_000);
        let chunks = ChunkedContent::from_bytes(&data, 16_384).unwrap();
        assert_eq!(chunks.piece_count(), 3);
        assert_eq!(chunks.piece_len(0), Some(16_384));
        assert_eq!(chunks.piece_len(1), Some(16_384));
        assert_eq!(chunks.piece_len(2), Some(7_232));

        // Root folds three leaves: pair the first two, duplicate the third.
        let hashes = &chunks.manifest().piece_hashes;
        let h01 = {
            let mut input = [0u8; 64];
            input[..32].copy_from_slice(&hashes[0]);
            input[32..].copy_from_slice(&hashes[1]);
            sha256(&input)
        };
        let h22 = {
            let mut input = [0u8; 64];
            input[..32].copy_from_slice(&hashes[2]);
            input[32..].copy_from_slice(&hashes[2]);
            sha256(&input)
        };
        let mut top = [0u8; 64];
        top[..32].copy_from_slice(&h01);
        top[32..].copy_from_slice(&h22);
        assert_eq!(chunks.content_id(), sha256(&top));
    }

    #[test]
    fn single_leaf_is_its_own_root() {
        let data = content(100);
        let chunks = ChunkedContent::from_bytes(&data, 16_384).unwrap();
        assert_eq!(chunks.piece_count(), 1);
        assert_eq!(chunks.content_id(), chunks.manifest().piece_hashes[0]);
    }

    #[test]
    fn receiver_completes_and_reassembles_exactly() {
        let data = content(50_000);
        let sender = ChunkedContent::from_bytes(&data, 16_384).unwrap();
        let mut receiver = ChunkedContent::from_manifest(sender.manifest().clone()).unwrap();

        assert!(!receiver.is_complete());
        assert_eq!(receiver.reassemble(), None);

        // Out-of-order arrival is fine.
        for index in [3, 0, 2, 1] {
            let outcome = receiver.add_piece(index, sender.piece(index).unwrap());
            assert_eq!(outcome, PieceOutcome::Accepted);
        }

        assert!(receiver.is_complete());
        assert_eq!(&receiver.reassemble().unwrap()[..], &data[..]);
    }

    #[test]
    fn tampered_piece_is_rejected_without_state_change() {
        let data = content(40_000);
        let sender = ChunkedContent::from_bytes(&data, 16_384).unwrap();
        let mut receiver = ChunkedContent::from_manifest(sender.manifest().clone()).unwrap();

        let mut tampered = sender.piece(1).unwrap().to_vec();
        tampered[100] ^= 0x01;
        assert_eq!(
            receiver.add_piece(1, Bytes::from(tampered)),
            PieceOutcome::HashMismatch
        );
        assert!(!receiver.has_piece(1));
        assert_eq!(receiver.progress(), 0.0);

        // The genuine piece still goes in afterwards.
        assert_eq!(
            receiver.add_piece(1, sender.piece(1).unwrap()),
            PieceOutcome::Accepted
        );
    }

    #[test]
    fn wrong_length_and_out_of_range_are_rejected() {
        let data = content(40_000);
        let sender = ChunkedContent::from_bytes(&data, 16_384).unwrap();
        let mut receiver = ChunkedContent::from_manifest(sender.manifest().clone()).unwrap();

        assert_eq!(
            receiver.add_piece(0, Bytes::from_static(b"short")),
            PieceOutcome::WrongLength
        );
        assert_eq!(
            receiver.add_piece(99, sender.piece(0).unwrap()),
            PieceOutcome::OutOfRange
        );
    }

    #[test]
    fn duplicate_piece_is_a_no_op() {
        let data = content(1000);
        let sender = ChunkedContent::from_bytes(&data, 16_384).unwrap();
        let mut receiver = ChunkedContent::from_manifest(sender.manifest().clone()).unwrap();

        assert_eq!(
            receiver.add_piece(0, sender.piece(0).unwrap()),
            PieceOutcome::Accepted
        );
        assert_eq!(
            receiver.add_piece(0, sender.piece(0).unwrap()),
            PieceOutcome::Duplicate
        );
    }

    #[test]
    fn bitfield_round_trip() {
        let data = content(10 * 16_384);
        let sender = ChunkedContent::from_bytes(&data, 16_384).unwrap();
        let mut receiver = ChunkedContent::from_manifest(sender.manifest().clone()).unwrap();

        for index in [0u32, 3, 9] {
            receiver.add_piece(index, sender.piece(index).unwrap());
        }

        let bits = receiver.bitfield();
        assert_eq!(bits.len(), 2); // ceil(10 / 8)
        assert_eq!(indices_from_bitfield(&bits, 10), vec![0, 3, 9]);
    }

    #[test]
    fn bad_manifests_are_rejected() {
        let data = content(40_000);
        let good = ChunkedContent::from_bytes(&data, 16_384)
            .unwrap()
            .manifest()
            .clone();

        let mut wrong_count = good.clone();
        wrong_count.piece_hashes.pop();
        assert!(matches!(
            ChunkedContent::from_manifest(wrong_count),
            Err(ChunkError::PieceCountMismatch { .. })
        ));

        let mut wrong_root = good;
        wrong_root.merkle_root[0] ^= 0x01;
        assert!(matches!(
            ChunkedContent::from_manifest(wrong_root),
            Err(ChunkError::RootMismatch)
        ));
    }

    #[test]
    fn empty_content_is_trivially_complete() {
        let chunks = ChunkedContent::from_bytes(&[], 16_384).unwrap();
        assert_eq!(chunks.piece_count(), 0);
        assert!(chunks.is_complete());
        assert_eq!(chunks.reassemble().unwrap().len(), 0);
    }
}
