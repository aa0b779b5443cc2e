//! v005 -- Every user row gets a stable `uuid`.

use serde_json::json;
use uuid::Uuid;

use super::{SchemaVersion, UpgradeContext};
use crate::error::Result;

pub const VERSION: u32 = 5;

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
    ("users", "++id, uuid, createdAt, updatedAt"),
];

pub fn schema() -> SchemaVersion {
    SchemaVersion::new(VERSION, TABLES).with_upgrade(upgrade)
}

fn upgrade(ctx: &UpgradeContext<'_>) -> Result<()> {
    ctx.table("users").modify(|user| {
        if user.get("uuid").is_some_and(|v| v.is_string()) {
            return false;
        }
        user.insert("uuid".into(), json!(Uuid::new_v4().to_string()));
        true
    })?;
    Ok(())
}
