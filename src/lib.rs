//! A peer-to-peer distribution agent for large, content-addressed blobs.
//!
//! Each blob is sliced into fixed-size pieces identified by a single
//! info-hash. Agents simultaneously download missing pieces from, and upload
//! owned pieces to, other agents in a swarm whose peer lists are handed out by
//! a central tracker. Seed ("origin") peers are always complete; agent peers
//! start empty and transition to complete.
//!
//! The crate provides the per-torrent piece exchange engine:
//!
//! - [`wire`]: the length-prefixed message codec shared by both ends,
//! - [`conn`]: the handshake and the per-socket connection loops,
//! - [`bandwidth`]: the process-wide ingress/egress token buckets,
//! - [`dispatch`]: the per-torrent dispatcher, piece request book and
//!   selection policies,
//! - [`disk`]: the on-disk torrent store and the torrent archive.
//!
//! Tracker announcing, CLI wrapping and process bootstrap live outside this
//! crate; they drive the engine through the [`events::Events`] surface.

pub mod bandwidth;
pub mod bitfield;
pub mod clock;
pub mod conf;
pub mod conn;
pub mod disk;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod metainfo;
pub mod wire;

mod define;
pub use define::*;
