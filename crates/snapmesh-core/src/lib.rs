//! snapmesh-core — shared types, wire format, chunking, and crypto seams.
//! All other snapmesh crates depend on this one.

pub mod chunker;
pub mod config;
pub mod crypto;
pub mod snap;
pub mod wire;

pub use chunker::{ChunkManifest, ChunkedContent, PieceOutcome};
pub use snap::{ContentId, PeerId, Snap};
pub use wire::{Packet, PacketType, WireError, MAX_FRAME};
