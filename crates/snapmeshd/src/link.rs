//! Peer links — length-framed packet streams over TCP.
//!
//! One link per connected peer. Each link owns a writer task draining
//! its own bounded outbound queue (so a stalled peer never blocks
//! sends to the others) and a reader task that decodes frames into
//! the shared inbound queue. Teardown is idempotent: whichever side
//! notices the failure first removes the link and broadcasts
//! `Disconnected` exactly once.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

use snapmesh_core::crypto::sha256;
use snapmesh_core::{Packet, PeerId, MAX_FRAME};

/// How long a dial may take before the attempt is abandoned.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A link with no inbound frames for this long is considered dead.
pub const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Frames queued per link before the peer counts as stalled and the
/// link is torn down.
pub const SEND_QUEUE_DEPTH: usize = 64;

/// Link lifecycle notifications, broadcast per event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Connected { peer: PeerId },
    Disconnected { peer: PeerId },
}

/// What carries the link. Anything that can hand over an async byte
/// stream attaches the same way; only logging tells them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Lan,
    Radio,
}

struct PeerLink {
    kind: TransportKind,
    outbound: mpsc::Sender<Bytes>,
}

struct LinkManagerInner {
    links: DashMap<PeerId, PeerLink>,
    inbound: mpsc::Sender<(PeerId, Packet)>,
    events: broadcast::Sender<LinkEvent>,
}

/// The set of live peer links. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct PeerLinkManager {
    inner: Arc<LinkManagerInner>,
}

impl PeerLinkManager {
    pub fn new(inbound: mpsc::Sender<(PeerId, Packet)>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(LinkManagerInner {
                links: DashMap::new(),
                inbound,
                events,
            }),
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.inner.links.contains_key(peer)
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.inner.links.iter().map(|entry| *entry.key()).collect()
    }

    pub fn link_count(&self) -> usize {
        self.inner.links.len()
    }

    pub fn transport(&self, peer: &PeerId) -> Option<TransportKind> {
        self.inner.links.get(peer).map(|link| link.kind)
    }

    /// Dial a discovered peer and attach the resulting link under its
    /// announced id. A no-op if a link to that peer already exists.
    pub async fn connect(&self, peer: PeerId, addr: SocketAddr) -> Result<()> {
        if self.is_connected(&peer) {
            return Ok(());
        }
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .context("connect timed out")?
            .with_context(|| format!("connect to {addr} failed"))?;
        tracing::info!(peer = hex::encode(&peer[..8]), addr = %addr, "link established (outbound)");
        self.attach(peer, TransportKind::Lan, stream);
        Ok(())
    }

    /// Register a connected stream as the link for `peer`: spawn the
    /// writer and reader tasks, announce `Connected`. If a link for
    /// that peer already exists the new stream is dropped.
    pub fn attach<S>(&self, peer: PeerId, kind: TransportKind, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (outbound_tx, outbound_rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        let link = PeerLink {
            kind,
            outbound: outbound_tx,
        };
        match self.inner.links.entry(peer) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                tracing::debug!(peer = hex::encode(&peer[..8]), "duplicate link dropped");
                return;
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(link);
            }
        }
        let _ = self.inner.events.send(LinkEvent::Connected { peer });

        let manager = self.clone();
        tokio::spawn(async move {
            manager.read_loop(peer, reader).await;
            manager.remove_peer(&peer);
        });
        let manager = self.clone();
        tokio::spawn(async move {
            write_loop(peer, writer, outbound_rx).await;
            manager.remove_peer(&peer);
        });
    }

    /// Queue one packet for one peer; the link's writer task frames it
    /// with a 4-byte big-endian length prefix. Errors if the peer has
    /// no link or its queue is full — a full queue means the peer has
    /// stopped draining, so the link is torn down too.
    pub fn send(&self, peer: &PeerId, packet: &Packet) -> Result<()> {
        let outbound = self
            .inner
            .links
            .get(peer)
            .map(|link| link.outbound.clone())
            .with_context(|| format!("no link to peer {}", hex::encode(&peer[..8])))?;

        let payload = packet.encode().context("packet encode failed")?;
        match outbound.try_send(payload) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(peer = hex::encode(&peer[..8]), "send queue full, closing link");
                self.remove_peer(peer);
                Err(anyhow::anyhow!(
                    "send queue to peer {} full",
                    hex::encode(&peer[..8])
                ))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.remove_peer(peer);
                Err(anyhow::anyhow!(
                    "link to peer {} closed",
                    hex::encode(&peer[..8])
                ))
            }
        }
    }

    /// Queue a packet for every connected peer. Per-link failures are
    /// logged (and tear that link down) but do not stop the fan-out.
    pub fn broadcast(&self, packet: &Packet) {
        self.broadcast_except(packet, None);
    }

    /// Fan out to every connected peer except `except` — the link the
    /// packet arrived on, when relaying.
    pub fn broadcast_except(&self, packet: &Packet, except: Option<&PeerId>) {
        for peer in self.connected_peers() {
            if Some(&peer) == except {
                continue;
            }
            let _ = self.send(&peer, packet);
        }
    }

    /// Drop the link to `peer`. Idempotent; announces `Disconnected`
    /// only when a link was actually present.
    pub fn remove_peer(&self, peer: &PeerId) {
        if self.inner.links.remove(peer).is_some() {
            tracing::info!(peer = hex::encode(&peer[..8]), "link closed");
            let _ = self.inner.events.send(LinkEvent::Disconnected { peer: *peer });
        }
    }

    async fn read_loop<R>(&self, peer: PeerId, mut reader: R)
    where
        R: AsyncRead + Send + Unpin,
    {
        let mut len_buf = [0u8; 4];
        loop {
            match tokio::time::timeout(READ_IDLE_TIMEOUT, reader.read_exact(&mut len_buf)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    tracing::debug!(peer = hex::encode(&peer[..8]), error = %e, "link read ended");
                    return;
                }
                Err(_) => {
                    tracing::info!(peer = hex::encode(&peer[..8]), "link idle timeout");
                    return;
                }
            }

            let len = u32::from_be_bytes(len_buf) as usize;
            if len == 0 || len > MAX_FRAME {
                tracing::warn!(peer = hex::encode(&peer[..8]), len, "bad frame length, closing link");
                return;
            }

            let mut payload = vec![0u8; len];
            match tokio::time::timeout(READ_IDLE_TIMEOUT, reader.read_exact(&mut payload)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    tracing::debug!(peer = hex::encode(&peer[..8]), error = %e, "link read ended mid-frame");
                    return;
                }
                Err(_) => {
                    tracing::info!(peer = hex::encode(&peer[..8]), "link idle timeout mid-frame");
                    return;
                }
            }

            // A malformed payload is the sender's problem, not the link's:
            // discard the frame and keep reading.
            match Packet::decode(&payload) {
                Ok(packet) => {
                    if self.inner.inbound.send((peer, packet)).await.is_err() {
                        // Inbound queue gone: the node is shutting down.
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!(peer = hex::encode(&peer[..8]), error = %e, "undecodable frame discarded");
                }
            }
        }
    }
}

/// Drain one link's outbound queue onto its stream. Exits when the
/// queue closes (link removed) or a write fails; the caller tears the
/// link down either way.
async fn write_loop<W>(peer: PeerId, mut writer: W, mut outbound: mpsc::Receiver<Bytes>)
where
    W: AsyncWrite + Send + Unpin,
{
    while let Some(payload) = outbound.recv().await {
        let result: std::io::Result<()> = async {
            writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
            writer.write_all(&payload).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(peer = hex::encode(&peer[..8]), error = %e, "link write failed");
            return;
        }
    }
}

/// Accept inbound links forever. The remote's real id is unknown until
/// discovery catches up, so inbound links run under an id derived from
/// the remote address. Cancel by dropping the task handle.
pub async fn accept_loop(listener: TcpListener, links: PeerLinkManager) -> Result<()> {
    loop {
        let (stream, addr) = listener.accept().await.context("accept failed")?;
        let peer = inbound_peer_id(&addr);
        tracing::info!(addr = %addr, peer = hex::encode(&peer[..8]), "link established (inbound)");
        links.attach(peer, TransportKind::Lan, stream);
    }
}

/// Stand-in id for an inbound link whose remote has not been matched to
/// a discovery announcement.
pub fn inbound_peer_id(addr: &SocketAddr) -> PeerId {
    sha256(addr.to_string().as_bytes())
}
