//! snapmesh-services — shared state between the daemon's tasks: piece
//! tracking, the ephemeral snap cache, download orchestration, ingress
//! filtering, and the discovered-peer registry.

pub mod cache;
pub mod downloader;
pub mod ingress;
pub mod peer;
pub mod piece_manager;
pub mod seed;

pub use cache::{sweep_loop, CacheEntry, SnapCache, StoreOutcome};
pub use downloader::{DownloadEvent, Downloader, DownloaderConfig};
pub use ingress::{IngressOutcome, SnapIngress};
pub use peer::{new_registry, DiscoveredPeer, PeerRegistry};
pub use piece_manager::{PieceManager, Selection};
pub use seed::SeedStore;
