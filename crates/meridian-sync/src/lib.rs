//! # meridian-sync
//!
//! Replicates the synced local tables to other devices. One [`SyncBackend`]
//! is active per [`SyncSession`]: either the peer CRDT backend, which shares a
//! last-writer-wins document over a room transport, or the hosted backend,
//! which mirrors tables into the shared maps of a hosted room.

pub mod awareness;
pub mod backend;
pub mod config;
pub mod hosted;
pub mod peer;
pub mod session;
pub mod status;

mod error;

pub use awareness::AwarenessTracker;
pub use backend::{ConnectionParams, HostedParams, PeerParams, RemoteChanges, SyncBackend};
pub use config::SyncConfig;
pub use error::{Result, SyncError};
pub use hosted::{HostedSyncBackend, MemoryHostedService};
pub use peer::PeerSyncBackend;
pub use session::{SessionRegistry, SyncSession};
pub use status::StatusReporter;
