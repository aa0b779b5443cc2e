//! v006 -- Function-call messages become assistant/tool pairs.
//!
//! A legacy `role = "function"` message carried both the model's call
//! (`plugin`) and the plugin's output (`content`). It is split into a new
//! assistant message holding the call in `tools`, and the original row turned
//! into a `tool` message answering it.

use serde_json::{json, Map, Value};
use uuid::Uuid;

use super::{SchemaVersion, UpgradeContext};
use crate::error::Result;

pub const VERSION: u32 = 6;

pub const TABLES: &[(&str, &str)] = &[
    ("files", "&id, name, fileType, saveMode"),
    ("plugins", "&id, type, manifest.type, createdAt, updatedAt"),
    ("sessionGroups", "&id, name, sort, createdAt, updatedAt"),
    ("sessions", "&id, type, group, pinned, meta.title, createdAt, updatedAt"),
    (
        "messages",
        "&id, role, content, fromModel, favorite, tool_call_id, plugin.identifier, sessionId, topicId, parentId, quotaId, [sessionId+topicId], createdAt, updatedAt",
    ),
    ("topics", "&id, title, favorite, sessionId, createdAt, updatedAt"),
    ("users", "++id, uuid, createdAt, updatedAt"),
];

/// Fields copied verbatim from the function message onto its assistant half.
const SHARED_FIELDS: [&str; 6] = ["sessionId", "topicId", "parentId", "fromModel", "createdAt", "updatedAt"];

pub fn schema() -> SchemaVersion {
    SchemaVersion::new(VERSION, TABLES).with_upgrade(upgrade)
}

fn upgrade(ctx: &UpgradeContext<'_>) -> Result<()> {
    let messages = ctx.table("messages");
    let mut assistants = Vec::new();

    let converted = messages.modify(|message| {
        if message.get("role").and_then(Value::as_str) != Some("function") {
            return false;
        }

        let plugin = message.get("plugin").cloned().unwrap_or(Value::Null);
        let tool_call_id = plugin
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("tool_{}", Uuid::new_v4().simple()));

        let assistant = split_assistant(message, &plugin, &tool_call_id);
        let assistant_id = assistant["id"].clone();
        assistants.push(assistant);

        message.insert("role".into(), json!("tool"));
        message.insert("tool_call_id".into(), json!(tool_call_id));
        message.insert("parentId".into(), assistant_id);
        true
    })?;

    messages.bulk_add(&assistants)?;

    tracing::info!(messages = converted, "split function messages into assistant and tool pairs");
    Ok(())
}

fn split_assistant(message: &Map<String, Value>, plugin: &Value, tool_call_id: &str) -> Value {
    let mut assistant = Map::new();
    assistant.insert("id".into(), json!(Uuid::new_v4().to_string()));
    assistant.insert("role".into(), json!("assistant"));
    assistant.insert("content".into(), json!(""));

    for field in SHARED_FIELDS {
        if let Some(value) = message.get(field) {
            assistant.insert(field.into(), value.clone());
        }
    }

    assistant.insert(
        "tools".into(),
        json!([{
            "id": tool_call_id,
            "identifier": plugin.get("identifier").cloned().unwrap_or(Value::Null),
            "apiName": plugin.get("apiName").cloned().unwrap_or(Value::Null),
            "arguments": plugin.get("arguments").cloned().unwrap_or(Value::Null),
            "type": plugin.get("type").cloned().unwrap_or(Value::Null),
        }]),
    );

    Value::Object(assistant)
}
