//! Multi-node tests: whole nodes assembled in-process, linked over
//! loopback TCP instead of multicast discovery.

mod infra;
mod mesh;
mod snaps;
mod transfer;
