//! v003 -- Session groups.
//!
//! Adds the `sessionGroups` table. The old `group = "pinned"` pseudo group is
//! folded into a `pinned` flag and the session moves back to the default
//! group.

use serde_json::{json, Value};

use super::{SchemaVersion, UpgradeContext};
use crate::error::Result;

pub const VERSION: u32 = 3;

pub const TABLES: &[(&str, &str)] = &[
    ("files", "&id, name, fileType, saveMode"),
    ("plugins", "&id, type, manifest.type, createdAt, updatedAt"),
    ("sessionGroups", "&id, name, sort, createdAt, updatedAt"),
    ("sessions", "&id, type, group, pinned, meta.title, createdAt, updatedAt"),
    (
        "messages",
        "&id, role, content, fromModel, favorite, plugin.identifier, sessionId, topicId, parentId, quotaId, createdAt, updatedAt",
    ),
    ("topics", "&id, title, favorite, sessionId, createdAt, updatedAt"),
];

pub const DEFAULT_GROUP: &str = "default";

pub fn schema() -> SchemaVersion {
    SchemaVersion::new(VERSION, TABLES).with_upgrade(upgrade)
}

fn upgrade(ctx: &UpgradeContext<'_>) -> Result<()> {
    let changed = ctx.table("sessions").modify(|session| {
        if session.get("group").and_then(Value::as_str) != Some("pinned") {
            return false;
        }
        session.insert("pinned".into(), json!(true));
        session.insert("group".into(), json!(DEFAULT_GROUP));
        true
    })?;

    tracing::info!(sessions = changed, "converted pinned group into pinned flag");
    Ok(())
}
