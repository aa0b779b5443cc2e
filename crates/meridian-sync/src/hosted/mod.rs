//! Hosted shared-storage backend.

pub mod auth;
pub mod backend;
pub mod client;
pub mod memory;

pub use backend::HostedSyncBackend;
pub use client::{
    ConnectionState, HostedClient, HostedEvent, HostedRoom, RoomCredentials, RoomState, StorageState,
};
pub use memory::MemoryHostedService;
