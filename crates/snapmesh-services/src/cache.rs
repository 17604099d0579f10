//! Local ephemeral snap cache.
//!
//! Snaps are deduplicated by content id and live in memory with a durable
//! copy on disk, one TLV-encoded file per snap named by hex id. The cache
//! enforces a hard in-memory capacity (oldest-stored evicted first) and a
//! periodic sweep removes expired snaps from both memory and disk. Files
//! are written atomically: temp file, then rename.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashMap;
use memmap2::Mmap;
use tokio::sync::broadcast;

use snapmesh_core::snap::now_millis;
use snapmesh_core::wire::{decode_snap_body, snap_to_bytes};
use snapmesh_core::{ContentId, Snap};

/// A stored snap with its lifecycle metadata.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub snap: Snap,
    /// Epoch millis at which this entry entered the cache.
    pub stored_at: u64,
}

/// Outcome of a `store` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// New snap accepted. This is the signal to relay it.
    Stored,
    /// Same content id already present. No-op.
    Duplicate,
    /// Already past its expiry. Never stored.
    Expired,
}

struct CacheInner {
    entries: DashMap<ContentId, CacheEntry>,
    root: PathBuf,
    capacity: usize,
    events: broadcast::Sender<Snap>,
}

/// The ephemeral snap cache. Cheap to clone, shared between tasks.
#[derive(Clone)]
pub struct SnapCache {
    inner: Arc<CacheInner>,
}

impl SnapCache {
    /// Create a cache rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>, capacity: usize) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create cache root: {}", root.display()))?;
        let (events, _) = broadcast::channel(64);
        Ok(Self {
            inner: Arc::new(CacheInner {
                entries: DashMap::new(),
                root,
                capacity,
                events,
            }),
        })
    }

    /// Load all durable snaps. Files that fail to decode or are already
    /// expired are deleted on the spot. Returns how many were loaded.
    pub fn load(&self) -> Result<usize> {
        let now = now_millis();
        let mut loaded = 0usize;

        let entries = fs::read_dir(&self.inner.root)
            .with_context(|| format!("failed to read cache dir: {}", self.inner.root.display()))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }

            let snap = match read_snap_file(&path) {
                Ok(snap) => snap,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "undecodable snap file, deleting");
                    let _ = fs::remove_file(&path);
                    continue;
                }
            };
            if snap.is_expired(now) {
                tracing::debug!(id = hex::encode(snap.id), "expired snap on disk, deleting");
                let _ = fs::remove_file(&path);
                continue;
            }

            self.inner.entries.insert(
                snap.id,
                CacheEntry {
                    snap,
                    stored_at: now,
                },
            );
            loaded += 1;
        }

        self.evict_over_capacity();
        Ok(loaded)
    }

    /// Store a snap: reject expired, dedup by id, persist, notify, evict.
    pub fn store(&self, snap: Snap) -> StoreOutcome {
        let now = now_millis();
        if snap.is_expired(now) {
            return StoreOutcome::Expired;
        }

        match self.inner.entries.entry(snap.id) {
            dashmap::mapref::entry::Entry::Occupied(_) => return StoreOutcome::Duplicate,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(CacheEntry {
                    snap: snap.clone(),
                    stored_at: now,
                });
            }
        }

        self.schedule_durable_write(&snap);
        let _ = self.inner.events.send(snap);
        self.evict_over_capacity();
        StoreOutcome::Stored
    }

    /// Subscribe to newly cached snaps.
    pub fn subscribe(&self) -> broadcast::Receiver<Snap> {
        self.inner.events.subscribe()
    }

    pub fn has(&self, id: &ContentId) -> bool {
        self.inner.entries.contains_key(id)
    }

    /// A cached, non-expired snap.
    pub fn get(&self, id: &ContentId) -> Option<Snap> {
        let now = now_millis();
        self.inner
            .entries
            .get(id)
            .filter(|entry| !entry.snap.is_expired(now))
            .map(|entry| entry.snap.clone())
    }

    /// All cached snaps that have not expired.
    pub fn all_active(&self) -> Vec<Snap> {
        let now = now_millis();
        self.inner
            .entries
            .iter()
            .filter(|entry| !entry.snap.is_expired(now))
            .map(|entry| entry.snap.clone())
            .collect()
    }

    /// Active snaps from one sender.
    pub fn from_sender(&self, sender: &[u8; 32]) -> Vec<Snap> {
        self.all_active()
            .into_iter()
            .filter(|snap| snap.sender == *sender)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Remove expired snaps from memory and disk. Returns how many went.
    pub fn sweep(&self) -> usize {
        let now = now_millis();
        let expired: Vec<ContentId> = self
            .inner
            .entries
            .iter()
            .filter(|entry| entry.snap.is_expired(now))
            .map(|entry| *entry.key())
            .collect();

        for id in &expired {
            self.inner.entries.remove(id);
            let _ = fs::remove_file(self.snap_path(id));
        }
        if !expired.is_empty() {
            tracing::debug!(removed = expired.len(), "swept expired snaps");
        }
        expired.len()
    }

    /// Evict oldest-stored entries until the in-memory count fits.
    fn evict_over_capacity(&self) {
        while self.inner.entries.len() > self.inner.capacity {
            let oldest = self
                .inner
                .entries
                .iter()
                .min_by_key(|entry| (entry.stored_at, *entry.key()))
                .map(|entry| *entry.key());
            let Some(id) = oldest else { break };
            if self.inner.entries.remove(&id).is_some() {
                let _ = fs::remove_file(self.snap_path(&id));
                tracing::debug!(id = hex::encode(id), "evicted snap over capacity");
            }
        }
    }

    /// Queue the durable write off the hot path when a runtime is present;
    /// otherwise write inline.
    fn schedule_durable_write(&self, snap: &Snap) {
        let path = self.snap_path(&snap.id);
        let bytes = match snap_to_bytes(snap) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(id = hex::encode(snap.id), error = %e, "snap failed to encode for storage");
                return;
            }
        };

        let write = move || {
            if let Err(e) = write_atomic(&path, &bytes) {
                tracing::warn!(path = %path.display(), error = %e, "durable snap write failed");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(write);
            }
            Err(_) => write(),
        }
    }

    fn snap_path(&self, id: &ContentId) -> PathBuf {
        self.inner.root.join(hex::encode(id))
    }
}

fn read_snap_file(path: &std::path::Path) -> Result<Snap> {
    let file = fs::File::open(path)
        .with_context(|| format!("failed to open snap file: {}", path.display()))?;
    // Safety: file is opened read-only and the mmap is not mutated
    let mmap = unsafe {
        Mmap::map(&file).with_context(|| format!("failed to mmap snap file: {}", path.display()))?
    };
    decode_snap_body(&mmap).map_err(anyhow::Error::from)
}

fn write_atomic(path: &std::path::Path, data: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp_path)
            .with_context(|| format!("failed to create temp file: {}", tmp_path.display()))?;
        file.write_all(data).context("failed to write snap data")?;
        file.sync_all().context("failed to sync snap to disk")?;
    }
    fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename into place: {}", path.display()))?;
    Ok(())
}

/// Periodic expiry sweep. Runs until shutdown.
pub async fn sweep_loop(
    cache: SnapCache,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("cache sweep shutting down");
                return;
            }
            _ = ticker.tick() => {
                cache.sweep();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_cache(capacity: usize) -> (SnapCache, PathBuf) {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!(
            "snapmesh-cache-test-{}-{}",
            std::process::id(),
            id
        ));
        let _ = fs::remove_dir_all(&dir);
        (SnapCache::new(&dir, capacity).unwrap(), dir)
    }

    fn snap_with(content: &[u8], created_at: u64, ttl: u64) -> Snap {
        Snap::new(
            [0x11; 32],
            "ada",
            "text/plain",
            Bytes::copy_from_slice(content),
            created_at,
            now_millis() + ttl,
            [0; 64],
        )
    }

    fn live_snap(n: u64) -> Snap {
        snap_with(&n.to_be_bytes(), n, 60_000)
    }

    #[test]
    fn store_and_get_round_trip() {
        let (cache, dir) = temp_cache(50);
        let snap = live_snap(1);

        assert_eq!(cache.store(snap.clone()), StoreOutcome::Stored);
        assert!(cache.has(&snap.id));
        assert_eq!(cache.get(&snap.id).unwrap(), snap);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn duplicate_store_is_a_no_op() {
        let (cache, dir) = temp_cache(50);
        let snap = live_snap(2);

        assert_eq!(cache.store(snap.clone()), StoreOutcome::Stored);
        assert_eq!(cache.store(snap), StoreOutcome::Duplicate);
        assert_eq!(cache.len(), 1);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn expired_snap_is_rejected() {
        let (cache, dir) = temp_cache(50);
        let dead = Snap::new(
            [0x11; 32],
            "ada",
            "text/plain",
            Bytes::from_static(b"too late"),
            0,
            1, // expired long ago
            [0; 64],
        );

        assert_eq!(cache.store(dead), StoreOutcome::Expired);
        assert!(cache.is_empty());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn eviction_keeps_the_newest_entries() {
        let (cache, dir) = temp_cache(3);
        // Five entries with strictly increasing stored_at, oldest first,
        // planted directly so the timestamps are distinct.
        let snaps: Vec<Snap> = (0..5u64).map(live_snap).collect();
        for (n, snap) in snaps.iter().enumerate() {
            cache.inner.entries.insert(
                snap.id,
                CacheEntry {
                    snap: snap.clone(),
                    stored_at: 1_000 + n as u64,
                },
            );
        }
        cache.evict_over_capacity();

        assert_eq!(cache.len(), 3);
        assert!(!cache.has(&snaps[0].id));
        assert!(!cache.has(&snaps[1].id));
        for snap in &snaps[2..] {
            assert!(cache.has(&snap.id));
        }

        // The store path enforces the same bound: the next store evicts
        // the oldest survivor.
        let newest = live_snap(9);
        assert_eq!(cache.store(newest.clone()), StoreOutcome::Stored);
        assert_eq!(cache.len(), 3);
        assert!(!cache.has(&snaps[2].id));
        assert!(cache.has(&newest.id));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn sweep_removes_expired_entries() {
        let (cache, dir) = temp_cache(50);
        let short = snap_with(b"short-lived", 1, 0); // expires immediately
        let long = live_snap(9);

        // expires_at == now is not yet expired at store time, so it goes in.
        cache.store(short.clone());
        cache.store(long.clone());

        std::thread::sleep(Duration::from_millis(5));
        cache.sweep();
        assert!(!cache.has(&short.id));
        assert!(cache.has(&long.id));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn load_restores_persisted_snaps_and_deletes_garbage() {
        let (cache, dir) = temp_cache(50);
        let snap = live_snap(7);
        cache.store(snap.clone()); // no runtime: write happens inline

        // Plant a corrupt file next to the real one.
        fs::write(dir.join("not-a-snap"), b"garbage").unwrap();

        let restored = SnapCache::new(&dir, 50).unwrap();
        let loaded = restored.load().unwrap();
        assert_eq!(loaded, 1);
        assert_eq!(restored.get(&snap.id).unwrap(), snap);
        assert!(!dir.join("not-a-snap").exists());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn from_sender_filters_by_key() {
        let (cache, dir) = temp_cache(50);
        let mine = live_snap(1);
        let mut other = live_snap(2);
        other.sender = [0x99; 32];
        other.id = Snap::compute_id(&other.content, &other.sender, other.created_at);

        cache.store(mine.clone());
        cache.store(other.clone());

        let from_mine = cache.from_sender(&mine.sender);
        assert_eq!(from_mine.len(), 1);
        assert_eq!(from_mine[0].id, mine.id);

        let _ = fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn subscribers_see_new_snaps() {
        let (cache, dir) = temp_cache(50);
        let mut events = cache.subscribe();

        let snap = live_snap(3);
        cache.store(snap.clone());

        let seen = events.recv().await.unwrap();
        assert_eq!(seen.id, snap.id);

        let _ = fs::remove_dir_all(&dir);
    }
}
