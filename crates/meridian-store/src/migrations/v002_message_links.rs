//! v002 -- Messages and topics learn which session (and topic, parent, quoted
//! message) they belong to. Index-only change.

use super::SchemaVersion;

pub const VERSION: u32 = 2;

pub const TABLES: &[(&str, &str)] = &[
    ("files", "&id, name, fileType, saveMode"),
    ("plugins", "&id, type, manifest.type, createdAt, updatedAt"),
    ("sessions", "&id, type, group, meta.title, createdAt, updatedAt"),
    (
        "messages",
        "&id, role, content, fromModel, favorite, plugin.identifier, sessionId, topicId, parentId, quotaId, createdAt, updatedAt",
    ),
    ("topics", "&id, title, favorite, sessionId, createdAt, updatedAt"),
];

pub fn schema() -> SchemaVersion {
    SchemaVersion::new(VERSION, TABLES)
}
