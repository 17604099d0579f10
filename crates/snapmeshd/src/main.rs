//! snapmeshd — snapmesh peer-to-peer content daemon.

use anyhow::Result;
use std::time::Duration;

use snapmesh_core::config::SnapmeshConfig;
use snapmesh_core::crypto::{Directory, DirectoryEntry, InMemoryDirectory};
use snapmesh_services::new_registry;

use snapmeshd::node::{Node, NodeConfig};
use snapmeshd::{discovery, link};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = SnapmeshConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = SnapmeshConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        SnapmeshConfig::default()
    });

    let node = Node::spawn(NodeConfig::from_config(&config)).await?;
    let local_id = node.peer_id();
    let listen_port = node.listen_addr().port();

    // Local alias → key binding. Stands in for the decentralized
    // directory until one is wired up.
    let directory = InMemoryDirectory::default();
    directory.publish(DirectoryEntry {
        name: config.identity.alias.clone(),
        public_key: local_id,
    });

    // ── Discovery ────────────────────────────────────────────────────────────
    let registry = new_registry();
    let mut discovery_tasks = Vec::new();
    if config.network.interface.is_empty() {
        tracing::info!("no interface configured, discovery disabled");
    } else {
        let interface_index = discovery::if_index(&config.network.interface)?;
        tracing::info!(
            interface = %config.network.interface,
            interface_index,
            "discovery starting"
        );

        discovery_tasks.push(tokio::spawn(discovery::announce_loop(
            local_id,
            listen_port,
            interface_index,
            Duration::from_secs(config.network.announce_interval_secs),
        )));
        discovery_tasks.push(tokio::spawn(discovery::listener_loop(
            registry.clone(),
            interface_index,
            local_id,
        )));
        discovery_tasks.push(tokio::spawn(discovery::expiry_loop(
            registry.clone(),
            Duration::from_secs(config.network.peer_ttl_secs),
        )));
        discovery_tasks.push(tokio::spawn(discovery::connector_loop(
            registry.clone(),
            node.links().clone(),
            local_id,
        )));
    }

    // Periodic link snapshot, mirrors what the registry and link
    // manager currently see.
    let snapshot_task = {
        let links: link::PeerLinkManager = node.links().clone();
        let registry = registry.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                interval.tick().await;
                tracing::info!(
                    discovered = registry.len(),
                    linked = links.link_count(),
                    "mesh snapshot"
                );
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────
    tokio::signal::ctrl_c().await.ok();
    tracing::info!("shutdown signal received");
    node.shutdown();
    snapshot_task.abort();
    for task in discovery_tasks {
        task.abort();
    }

    Ok(())
}
