//! Node assembly — everything a running mesh participant needs, wired
//! together behind one handle.
//!
//! The daemon builds exactly one `Node`; integration tests build
//! several on loopback and connect them to each other directly instead
//! of going through multicast discovery.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use ed25519_dalek::Signer;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};

use snapmesh_core::config::SnapmeshConfig;
use snapmesh_core::crypto::{Ed25519Verifier, SignatureVerifier};
use snapmesh_core::snap::now_millis;
use snapmesh_core::{PeerId, Snap};
use snapmesh_services::{
    sweep_loop, DownloadEvent, Downloader, DownloaderConfig, IngressOutcome, SeedStore, SnapCache,
    SnapIngress,
};

use crate::dispatch::{outbound_pump, DispatchConfig, Dispatcher};
use crate::link::{accept_loop, LinkEvent, PeerLinkManager};

pub struct NodeConfig {
    pub alias: String,
    pub storage_path: PathBuf,
    /// Bind address for inbound links. Port 0 picks a free port.
    pub listen_addr: SocketAddr,
    pub cache_capacity: usize,
    pub sweep_interval: Duration,
    /// Lifetime granted to locally published snaps.
    pub default_ttl_millis: u64,
    pub downloader: DownloaderConfig,
    pub dispatch: DispatchConfig,
    pub verifier: Arc<dyn SignatureVerifier>,
}

impl NodeConfig {
    /// Daemon settings from the resolved config file.
    pub fn from_config(config: &SnapmeshConfig) -> Self {
        Self {
            alias: config.identity.alias.clone(),
            storage_path: config.cache.storage_path.clone(),
            listen_addr: SocketAddr::from((std::net::Ipv6Addr::UNSPECIFIED, config.network.listen_port)),
            cache_capacity: config.cache.capacity,
            sweep_interval: Duration::from_secs(config.cache.sweep_interval_secs),
            default_ttl_millis: config.cache.default_ttl_secs * 1000,
            downloader: DownloaderConfig {
                max_pending: config.transfer.max_pending_requests,
                request_timeout: Duration::from_secs(config.transfer.request_timeout_secs),
                tick: Duration::from_millis(config.transfer.tick_millis),
            },
            dispatch: DispatchConfig {
                direct_send_max_bytes: config.transfer.direct_send_max_bytes,
                piece_size: config.transfer.piece_size,
            },
            verifier: Arc::new(Ed25519Verifier),
        }
    }
}

/// A running mesh participant. Dropping the handle does not stop the
/// spawned tasks; call `shutdown` for that.
pub struct Node {
    peer_id: PeerId,
    alias: String,
    signing_key: ed25519_dalek::SigningKey,
    default_ttl_millis: u64,
    listen_addr: SocketAddr,
    links: PeerLinkManager,
    cache: SnapCache,
    seeds: SeedStore,
    downloader: Downloader,
    dispatcher: Dispatcher,
    shutdown: broadcast::Sender<()>,
}

impl Node {
    /// Bring up a full node: cache (restored from disk), link manager
    /// and accept loop, downloader, dispatcher, and the sweep task.
    pub async fn spawn(config: NodeConfig) -> Result<Self> {
        let signing_key = ed25519_dalek::SigningKey::from_bytes(&rand::random::<[u8; 32]>());
        let peer_id: PeerId = signing_key.verifying_key().to_bytes();

        let (shutdown, _) = broadcast::channel::<()>(1);

        let cache = SnapCache::new(&config.storage_path, config.cache_capacity)
            .context("cache init failed")?;
        let restored = cache.load().context("cache load failed")?;
        if restored > 0 {
            tracing::info!(count = restored, "snaps restored from disk");
        }
        tokio::spawn(sweep_loop(
            cache.clone(),
            config.sweep_interval,
            shutdown.subscribe(),
        ));

        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let links = PeerLinkManager::new(inbound_tx);

        let (outbound_tx, outbound_rx) = mpsc::channel(256);
        let downloader = Downloader::new(outbound_tx, config.downloader);
        tokio::spawn(outbound_pump(
            outbound_rx,
            links.clone(),
            shutdown.subscribe(),
        ));

        let seeds = SeedStore::new();
        let ingress = Arc::new(SnapIngress::new(cache.clone(), config.verifier));
        let dispatcher = Dispatcher::new(
            links.clone(),
            cache.clone(),
            seeds.clone(),
            downloader.clone(),
            ingress,
            config.dispatch,
        );
        tokio::spawn(dispatcher.clone().run(
            inbound_rx,
            links.subscribe_events(),
            downloader.subscribe(),
            shutdown.subscribe(),
        ));

        let listener = TcpListener::bind(config.listen_addr)
            .await
            .with_context(|| format!("bind {} failed", config.listen_addr))?;
        let listen_addr = listener.local_addr().context("local_addr failed")?;
        tokio::spawn(accept_loop(listener, links.clone()));

        tracing::info!(
            peer = hex::encode(&peer_id[..8]),
            alias = %config.alias,
            addr = %listen_addr,
            "node up"
        );

        Ok(Self {
            peer_id,
            alias: config.alias,
            signing_key,
            default_ttl_millis: config.default_ttl_millis,
            listen_addr,
            links,
            cache,
            seeds,
            downloader,
            dispatcher,
            shutdown,
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn cache(&self) -> &SnapCache {
        &self.cache
    }

    pub fn links(&self) -> &PeerLinkManager {
        &self.links
    }

    pub fn seeds(&self) -> &SeedStore {
        &self.seeds
    }

    /// Snaps entering the cache, whether published, received whole, or
    /// reassembled from pieces.
    pub fn subscribe_snaps(&self) -> broadcast::Receiver<Snap> {
        self.cache.subscribe()
    }

    pub fn subscribe_downloads(&self) -> broadcast::Receiver<DownloadEvent> {
        self.downloader.subscribe()
    }

    pub fn subscribe_links(&self) -> broadcast::Receiver<LinkEvent> {
        self.links.subscribe_events()
    }

    /// Create, sign, cache, and offer a snap to the mesh.
    pub fn publish(&self, mime: &str, content: Bytes) -> Result<Snap> {
        let now = now_millis();
        let mut snap = Snap::new(
            self.peer_id,
            &self.alias,
            mime,
            content,
            now,
            now + self.default_ttl_millis,
            [0; 64],
        );
        snap.signature = self.signing_key.sign(&snap.signable_bytes()).to_bytes();

        match self.dispatcher.publish_snap(snap.clone()) {
            IngressOutcome::Stored => Ok(snap),
            outcome => anyhow::bail!("publish rejected: {outcome:?}"),
        }
    }

    /// Dial another node directly, bypassing discovery.
    pub async fn connect_to(&self, peer: PeerId, addr: SocketAddr) -> Result<()> {
        self.links.connect(peer, addr).await
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }
}
