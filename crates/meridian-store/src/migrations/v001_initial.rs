//! v001 -- Initial layout.
//!
//! Creates the five original tables: `sessions`, `messages`, `topics`,
//! `plugins` and `files`.

use super::SchemaVersion;

pub const VERSION: u32 = 1;

pub const TABLES: &[(&str, &str)] = &[
    ("files", "&id, name, fileType, saveMode"),
    ("plugins", "&id, type, manifest.type, createdAt, updatedAt"),
    ("sessions", "&id, type, group, meta.title, createdAt, updatedAt"),
    (
        "messages",
        "&id, role, content, fromModel, favorite, plugin.identifier, createdAt, updatedAt",
    ),
    ("topics", "&id, title, favorite, createdAt, updatedAt"),
];

pub fn schema() -> SchemaVersion {
    SchemaVersion::new(VERSION, TABLES)
}
