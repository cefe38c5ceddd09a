//! netres-core — peer-to-peer resource distribution for game sessions
//!
//! Every participant of a session holds a catalog of named resources
//! (scenarios, player files, definitions, material sets, system data,
//! dynamic state). This crate converges all peers toward complete,
//! checksum-verified possession of every resource before the game consumes
//! it:
//!
//! - [`ResList`] — the catalog: id allocation, packet dispatch, the
//!   periodic discover/status tick, and the reaper.
//! - [`Resource`] — one entity: its on-disk artifact, chunk map, per-peer
//!   availability, and outstanding chunk requests.
//! - [`ChunkMap`] — which byte windows of an artifact a holder possesses.
//! - [`ResPacket`] — the five-packet transfer protocol (Discover, Status,
//!   Derive, Request, Data).
//! - [`transport::NetIo`] — the contract the embedding I/O layer supplies.
//!
//! The enclosing game drives the subsystem: it installs local resources
//! via [`ResList::add_by_file`], feeds remote announcements to
//! [`ResList::add_by_core`], pumps inbound packets into
//! [`ResList::handle_packet`], and calls [`ResList::on_timer`] from its
//! main loop. Completion is reported through [`ResDelegate`].

pub mod archive;
pub mod chunks;
pub mod config;
pub mod protocol;
pub mod resource;
pub mod transport;
pub mod wire;

pub use chunks::{ChunkMap, ChunkRange};
pub use config::{Config, NetConfig, Tunables, DEFAULT_CHUNK_SIZE};
pub use protocol::{PktDiscover, PktKind, PktRequest, PktStatus, ResChunk, ResPacket};
pub use resource::{ResCore, ResDelegate, ResError, ResId, ResList, ResType, Resource};
pub use transport::{Connection, LoopbackHub, NetIo, TransportError};
pub use wire::WireError;
