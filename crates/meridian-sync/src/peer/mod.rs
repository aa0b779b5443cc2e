//! Peer CRDT sync: a last-writer-wins document shared over a room transport.

pub mod backend;
pub mod doc;

pub use backend::PeerSyncBackend;
pub use doc::SyncDoc;
