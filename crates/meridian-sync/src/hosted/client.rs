//! What the hosted backend needs from a realtime storage service.

use std::collections::BTreeMap;

use async_trait::async_trait;
use meridian_shared::{TableName, UserIdentity};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomCredentials {
    PublicKey(String),
    /// Token issued by the auth endpoint.
    Token(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Lost,
    Restored,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageState {
    NotLoaded,
    Loading,
    Synchronizing,
    Synchronized,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostedEvent {
    Connection(ConnectionState),
    Room(RoomState),
    Storage(StorageState),
    /// Another connection wrote to the map of `table`.
    MapChanged { table: TableName },
    /// The set or presence of the other connections changed.
    OthersChanged,
}

#[async_trait]
pub trait HostedClient: Send + Sync {
    async fn enter_room(
        &self,
        room_id: &str,
        credentials: RoomCredentials,
        presence: Option<UserIdentity>,
    ) -> Result<Box<dyn HostedRoom>>;
}

/// One entered room. Each synced table maps to a shared map of the same name.
#[async_trait]
pub trait HostedRoom: Send + Sync {
    fn connection_id(&self) -> String;

    fn events(&self) -> broadcast::Receiver<HostedEvent>;

    /// Resolves once the room storage is available.
    async fn storage_loaded(&self) -> Result<()>;

    async fn map_snapshot(&self, table: TableName) -> Result<BTreeMap<String, Value>>;

    async fn set_entries(&self, table: TableName, entries: Vec<(String, Value)>) -> Result<()>;

    async fn delete_entry(&self, table: TableName, id: &str) -> Result<()>;

    fn update_presence(&self, identity: UserIdentity);

    /// Other connections with published presence.
    fn others(&self) -> Vec<(String, UserIdentity)>;

    async fn leave(&self);
}
