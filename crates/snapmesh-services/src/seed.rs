//! Seed store — chunked content this node can serve to the swarm.
//!
//! Whenever a snap is cached (published locally or completed as a
//! download), its encoded form is chunked and kept here so piece
//! requests from other peers can be answered.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;

use snapmesh_core::{ChunkManifest, ChunkedContent, ContentId};

#[derive(Clone, Default)]
pub struct SeedStore {
    inner: Arc<DashMap<ContentId, ChunkedContent>>,
}

impl SeedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start seeding. A no-op if the content is already seeded.
    pub fn insert(&self, chunks: ChunkedContent) {
        self.inner.entry(chunks.content_id()).or_insert(chunks);
    }

    pub fn contains(&self, id: &ContentId) -> bool {
        self.inner.contains_key(id)
    }

    pub fn remove(&self, id: &ContentId) {
        self.inner.remove(id);
    }

    /// A piece of seeded content, for answering a request.
    pub fn piece(&self, id: &ContentId, index: u32) -> Option<Bytes> {
        self.inner.get(id).and_then(|chunks| chunks.piece(index))
    }

    pub fn manifest(&self, id: &ContentId) -> Option<ChunkManifest> {
        self.inner.get(id).map(|chunks| chunks.manifest().clone())
    }

    pub fn bitfield(&self, id: &ContentId) -> Option<Bytes> {
        self.inner.get(id).map(|chunks| chunks.bitfield())
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
