use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The fixed set of local tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TableName {
    Sessions,
    Messages,
    Topics,
    Plugins,
    SessionGroups,
    Files,
    Users,
}

impl TableName {
    pub const ALL: [TableName; 7] = [
        TableName::Sessions,
        TableName::Messages,
        TableName::Topics,
        TableName::Plugins,
        TableName::SessionGroups,
        TableName::Files,
        TableName::Users,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TableName::Sessions => "sessions",
            TableName::Messages => "messages",
            TableName::Topics => "topics",
            TableName::Plugins => "plugins",
            TableName::SessionGroups => "sessionGroups",
            TableName::Files => "files",
            TableName::Users => "users",
        }
    }

    /// Whether the table is mirrored into sync sessions. `files` and `users`
    /// stay on the device.
    pub fn is_synced(&self) -> bool {
        !matches!(self, TableName::Files | TableName::Users)
    }

    /// Iterate over the tables that participate in sync.
    pub fn synced() -> impl Iterator<Item = TableName> {
        Self::ALL.into_iter().filter(TableName::is_synced)
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownTable(pub String);

impl fmt::Display for UnknownTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown table: {}", self.0)
    }
}

impl std::error::Error for UnknownTable {}

impl FromStr for TableName {
    type Err = UnknownTable;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownTable(s.to_string()))
    }
}

/// Connection state of a sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Unconnected,
    Connecting,
    Ready,
    Syncing,
    Synced,
}

impl SyncStatus {
    /// `Ready`, `Syncing` and `Synced` all mean the transport is up.
    pub fn is_connected(&self) -> bool {
        matches!(self, SyncStatus::Ready | SyncStatus::Syncing | SyncStatus::Synced)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncStatus::Unconnected => "unconnected",
            SyncStatus::Connecting => "connecting",
            SyncStatus::Ready => "ready",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Synced => "synced",
        };
        f.write_str(s)
    }
}

/// Which side produced a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Origin {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChangeKind {
    /// Full record after the write.
    Upsert(Value),
    /// Tombstone.
    Delete,
}

/// A single record mutation flowing between the table store and a sync backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub origin: Origin,
    pub table: TableName,
    pub id: String,
    pub kind: ChangeKind,
}

impl ChangeEvent {
    pub fn upsert(origin: Origin, table: TableName, id: impl Into<String>, record: Value) -> Self {
        Self {
            origin,
            table,
            id: id.into(),
            kind: ChangeKind::Upsert(record),
        }
    }

    pub fn delete(origin: Origin, table: TableName, id: impl Into<String>) -> Self {
        Self {
            origin,
            table,
            id: id.into(),
            kind: ChangeKind::Delete,
        }
    }

    pub fn is_remote(&self) -> bool {
        self.origin == Origin::Remote
    }
}

/// The identity a user publishes into a room's presence channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: String,
    pub name: String,
    pub avatar: Option<String>,
    pub color: Option<String>,
}

impl UserIdentity {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            avatar: None,
            color: None,
        }
    }
}

/// One entry of the aggregated presence list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerPresence {
    pub identity: UserIdentity,
    pub connection_id: String,
    pub is_current_user: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_round_trip_through_str() {
        for table in TableName::ALL {
            assert_eq!(table.as_str().parse::<TableName>().unwrap(), table);
        }
        assert!("chats".parse::<TableName>().is_err());
    }

    #[test]
    fn local_tables_are_excluded_from_sync() {
        let synced: Vec<_> = TableName::synced().collect();
        assert!(!synced.contains(&TableName::Files));
        assert!(!synced.contains(&TableName::Users));
        assert_eq!(synced.len(), 5);
    }

    #[test]
    fn status_serializes_lowercase() {
        let json = serde_json::to_string(&SyncStatus::Synced).unwrap();
        assert_eq!(json, "\"synced\"");
        assert!(SyncStatus::Syncing.is_connected());
        assert!(!SyncStatus::Connecting.is_connected());
    }
}
