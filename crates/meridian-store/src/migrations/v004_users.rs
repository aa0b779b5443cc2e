//! v004 -- Users table.
//!
//! Settings used to live outside the database. When the caller hands them to
//! `open`, they become the first row of the new `users` table.

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use super::{SchemaVersion, UpgradeContext};
use crate::error::Result;

pub const VERSION: u32 = 4;

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
    ("users", "++id, createdAt, updatedAt"),
];

pub fn schema() -> SchemaVersion {
    SchemaVersion::new(VERSION, TABLES).with_upgrade(upgrade)
}

fn upgrade(ctx: &UpgradeContext<'_>) -> Result<()> {
    let Some(settings) = ctx.legacy_settings() else {
        return Ok(());
    };

    let users = ctx.table("users");
    if users.count()? > 0 {
        return Ok(());
    }

    let now = Utc::now().timestamp_millis();
    users.add(&json!({
        "id": Uuid::new_v4().to_string(),
        "settings": settings,
        "createdAt": now,
        "updatedAt": now,
    }))?;

    tracing::info!("imported legacy settings into users table");
    Ok(())
}
