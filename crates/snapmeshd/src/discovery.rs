//! Peer discovery over link-local multicast.
//!
//! Each node periodically sends a `PresenceAnnouncement` datagram to
//! ff02::1 naming its peer id and TCP listen port. A listener task
//! upserts announcements into the peer registry, an expiry task drops
//! entries that stop refreshing, and a connector task dials newly
//! discovered peers. To avoid crossed dials, only the side with the
//! lexicographically smaller peer id initiates.

use std::net::{IpAddr, Ipv6Addr, SocketAddr, SocketAddrV6};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use zerocopy::byteorder::{BigEndian, U16};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use snapmesh_core::PeerId;
use snapmesh_services::{DiscoveredPeer, PeerRegistry};

use crate::link::PeerLinkManager;

/// Link-local all-nodes multicast group.
pub const MULTICAST_ADDR: &str = "ff02::1";

/// UDP port on which presence announcements are received.
pub const ANNOUNCE_PORT: u16 = 38400;

/// First bytes of every announcement, so unrelated datagrams on the
/// port are cheap to reject.
pub const SERVICE_TAG: [u8; 8] = *b"SNAPMESH";

/// Presence announcement datagram. Fixed-size, big-endian.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct PresenceAnnouncement {
    pub service_tag: [u8; 8],
    pub peer_id: [u8; 32],
    /// TCP port the announcing node accepts links on.
    pub listen_port: U16<BigEndian>,
}

static_assertions::assert_eq_size!(PresenceAnnouncement, [u8; 42]);

impl PresenceAnnouncement {
    pub fn new(peer_id: PeerId, listen_port: u16) -> Self {
        Self {
            service_tag: SERVICE_TAG,
            peer_id,
            listen_port: U16::new(listen_port),
        }
    }
}

/// Broadcast this node's presence on a regular interval.
///
/// Runs forever — cancel by dropping the task handle.
pub async fn announce_loop(
    local_id: PeerId,
    listen_port: u16,
    interface_index: u32,
    interval: Duration,
) -> Result<()> {
    let socket = make_announce_socket(interface_index)
        .context("failed to create multicast announce socket")?;

    let multicast: Ipv6Addr = MULTICAST_ADDR.parse().expect("valid multicast literal");
    let dest = SocketAddrV6::new(multicast, ANNOUNCE_PORT, 0, interface_index);
    let announcement = PresenceAnnouncement::new(local_id, listen_port);

    let mut ticker = tokio::time::interval(interval);
    tracing::info!(
        interface_index,
        listen_port,
        interval_secs = interval.as_secs(),
        "presence announcements starting"
    );

    loop {
        ticker.tick().await;
        match socket.send_to(announcement.as_bytes(), &dest.into()) {
            Ok(n) => tracing::trace!(bytes = n, "announcement sent"),
            Err(e) => tracing::warn!(error = %e, "announcement send failed"),
        }
    }
}

/// Listen for presence announcements and populate the peer registry.
///
/// Runs forever — cancel by dropping the task handle.
pub async fn listener_loop(
    registry: PeerRegistry,
    interface_index: u32,
    local_id: PeerId,
) -> Result<()> {
    let socket = make_listener_socket(interface_index)
        .context("failed to create multicast listener socket")?;
    let socket = UdpSocket::from_std(socket).context("failed to convert to tokio UdpSocket")?;

    let mut buf = vec![0u8; 256];
    tracing::info!(port = ANNOUNCE_PORT, "presence listener starting");

    loop {
        let (len, remote) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "recv_from failed");
                continue;
            }
        };

        let Some(announcement) = PresenceAnnouncement::read_from_prefix(&buf[..len]) else {
            tracing::trace!(len, "short datagram ignored");
            continue;
        };
        if announcement.service_tag != SERVICE_TAG {
            tracing::trace!("foreign datagram ignored");
            continue;
        }
        if announcement.peer_id == local_id {
            continue;
        }

        let port = announcement.listen_port.get();
        tracing::debug!(
            peer = hex::encode(&announcement.peer_id[..8]),
            addr = %remote,
            port,
            "peer discovered"
        );
        registry.insert(
            announcement.peer_id,
            DiscoveredPeer {
                peer_id: announcement.peer_id,
                addr: remote.ip(),
                port,
                last_seen: Instant::now(),
            },
        );
    }
}

/// Remove registry entries that have not been refreshed within the TTL.
///
/// Runs forever — cancel by dropping the task handle.
pub async fn expiry_loop(registry: PeerRegistry, ttl: Duration) -> Result<()> {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        interval.tick().await;

        let before = registry.len();
        registry.retain(|_, entry| entry.last_seen.elapsed() < ttl);
        let after = registry.len();
        if before != after {
            tracing::debug!(removed = before - after, "expired peer registry entries");
        }
    }
}

/// Dial discovered peers that have no link yet.
///
/// Runs forever — cancel by dropping the task handle.
pub async fn connector_loop(
    registry: PeerRegistry,
    links: PeerLinkManager,
    local_id: PeerId,
) -> Result<()> {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        interval.tick().await;

        let candidates: Vec<DiscoveredPeer> = registry
            .iter()
            .filter(|entry| should_initiate(&local_id, entry.key()))
            .filter(|entry| !links.is_connected(entry.key()))
            .map(|entry| entry.value().clone())
            .collect();

        for peer in candidates {
            let addr = link_addr(&peer);
            if let Err(e) = links.connect(peer.peer_id, addr).await {
                tracing::debug!(
                    peer = hex::encode(&peer.peer_id[..8]),
                    addr = %addr,
                    error = %e,
                    "dial failed"
                );
            }
        }
    }
}

/// Crossed-dial tie-break: the lexicographically smaller id initiates.
pub fn should_initiate(local_id: &PeerId, remote_id: &PeerId) -> bool {
    local_id < remote_id
}

fn link_addr(peer: &DiscoveredPeer) -> SocketAddr {
    match peer.addr {
        IpAddr::V6(v6) => SocketAddr::V6(SocketAddrV6::new(v6, peer.port, 0, 0)),
        IpAddr::V4(v4) => SocketAddr::new(IpAddr::V4(v4), peer.port),
    }
}

/// Get the OS interface index for a named network interface.
pub fn if_index(name: &str) -> Result<u32> {
    let name_cstr = std::ffi::CString::new(name).context("interface name contains null byte")?;
    let index = unsafe { libc::if_nametoindex(name_cstr.as_ptr()) };
    if index == 0 {
        anyhow::bail!("interface '{}' not found", name);
    }
    Ok(index)
}

/// Create a UDP socket suitable for sending IPv6 multicast.
fn make_announce_socket(interface_index: u32) -> Result<Socket> {
    let socket =
        Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;

    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket
        .set_multicast_if_v6(interface_index)
        .context("IPV6_MULTICAST_IF")?;
    // Hop limit 1 — link-local only, never routed beyond this link.
    socket
        .set_multicast_hops_v6(1)
        .context("IPV6_MULTICAST_HOPS")?;

    Ok(socket)
}

/// Create a UDP socket joined to the ff02::1 multicast group.
fn make_listener_socket(interface_index: u32) -> Result<std::net::UdpSocket> {
    let socket =
        Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;

    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_only_v6(true).context("IPV6_V6ONLY")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;

    let bind_addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, ANNOUNCE_PORT, 0, 0);
    socket.bind(&bind_addr.into()).context("bind()")?;

    let multicast: Ipv6Addr = MULTICAST_ADDR.parse().expect("valid multicast literal");
    socket
        .join_multicast_v6(&multicast, interface_index)
        .context("IPV6_JOIN_GROUP")?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announcement_round_trips_through_wire_bytes() {
        let announcement = PresenceAnnouncement::new([7; 32], 38401);
        let bytes = announcement.as_bytes();
        assert_eq!(bytes.len(), 42);
        assert_eq!(&bytes[..8], b"SNAPMESH");

        let parsed = PresenceAnnouncement::read_from_prefix(bytes).unwrap();
        assert_eq!(parsed.peer_id, [7; 32]);
        assert_eq!(parsed.listen_port.get(), 38401);
    }

    #[test]
    fn short_datagrams_do_not_parse() {
        assert!(PresenceAnnouncement::read_from_prefix(&[0u8; 41]).is_none());
    }

    #[test]
    fn smaller_id_initiates() {
        let small = [1u8; 32];
        let large = [2u8; 32];
        assert!(should_initiate(&small, &large));
        assert!(!should_initiate(&large, &small));
        assert!(!should_initiate(&small, &small));
    }
}
