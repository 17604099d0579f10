//! snapmeshd — the mesh daemon's building blocks: peer links and
//! framing, multicast discovery, packet dispatch, and node assembly.
//! The binary in `main.rs` wires one node to the local network;
//! integration tests assemble several nodes in-process.

pub mod discovery;
pub mod dispatch;
pub mod link;
pub mod node;

pub use dispatch::{DispatchConfig, Dispatcher};
pub use link::{accept_loop, LinkEvent, PeerLinkManager};
pub use node::{Node, NodeConfig};
