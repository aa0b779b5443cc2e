//! Structural schemas of the local tables.
//!
//! Every write through a [`RecordModel`](crate::RecordModel) is checked here
//! first. Schemas only describe domain fields; unknown fields are allowed so
//! records written by newer clients survive a round trip.

use jsonschema::Validator;
use meridian_shared::TableName;
use serde_json::{json, Value};

use crate::error::{Result, StoreError};

pub struct TableSchema {
    table: String,
    full: Validator,
    partial: Validator,
}

impl TableSchema {
    pub fn for_table(table: TableName) -> Result<Self> {
        Self::from_json(table.as_str(), schema_json(table))
    }

    /// Compile a schema. The partial variant used by updates is the same
    /// schema without its top-level `required` list.
    pub fn from_json(table: &str, schema: Value) -> Result<Self> {
        let compile = |schema: &Value| {
            jsonschema::validator_for(schema).map_err(|e| StoreError::InvalidSchema {
                table: table.to_string(),
                reason: e.to_string(),
            })
        };

        let full = compile(&schema)?;
        let mut relaxed = schema;
        if let Some(obj) = relaxed.as_object_mut() {
            obj.remove("required");
        }
        let partial = compile(&relaxed)?;

        Ok(Self {
            table: table.to_string(),
            full,
            partial,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn validate(&self, data: &Value) -> Result<()> {
        self.check(&self.full, data)
    }

    /// Validate only the fields present in `data`.
    pub fn validate_partial(&self, data: &Value) -> Result<()> {
        self.check(&self.partial, data)
    }

    fn check(&self, validator: &Validator, data: &Value) -> Result<()> {
        let problems: Vec<String> = validator
            .iter_errors(data)
            .map(|err| {
                let path = err.instance_path.to_string();
                if path.is_empty() {
                    err.to_string()
                } else {
                    format!("{path}: {err}")
                }
            })
            .collect();

        if problems.is_empty() {
            return Ok(());
        }
        Err(StoreError::Validation {
            table: self.table.clone(),
            diagnostic: problems.join("; "),
        })
    }
}

fn timestamps() -> Value {
    json!({ "type": "number" })
}

fn schema_json(table: TableName) -> Value {
    match table {
        TableName::Messages => json!({
            "type": "object",
            "required": ["content", "role", "sessionId"],
            "properties": {
                "id": { "type": "string" },
                "content": { "type": "string" },
                "role": { "enum": ["user", "system", "assistant", "function", "tool"] },
                "sessionId": { "type": ["string", "null"] },
                "topicId": { "type": ["string", "null"] },
                "parentId": { "type": ["string", "null"] },
                "quotaId": { "type": ["string", "null"] },
                "fromModel": { "type": "string" },
                "favorite": { "type": "boolean" },
                "tool_call_id": { "type": "string" },
                "tools": { "type": "array" },
                "plugin": {
                    "type": "object",
                    "properties": {
                        "identifier": { "type": "string" },
                        "apiName": { "type": "string" },
                        "arguments": { "type": "string" },
                        "type": { "type": "string" }
                    }
                },
                "createdAt": timestamps(),
                "updatedAt": timestamps()
            }
        }),
        TableName::Sessions => json!({
            "type": "object",
            "properties": {
                "id": { "type": "string" },
                "type": { "enum": ["agent", "group"] },
                "group": { "type": "string" },
                "pinned": { "type": "boolean" },
                "meta": { "type": "object" },
                "config": { "type": "object" },
                "createdAt": timestamps(),
                "updatedAt": timestamps()
            }
        }),
        TableName::Topics => json!({
            "type": "object",
            "required": ["title"],
            "properties": {
                "id": { "type": "string" },
                "title": { "type": "string" },
                "favorite": { "type": "boolean" },
                "sessionId": { "type": ["string", "null"] },
                "createdAt": timestamps(),
                "updatedAt": timestamps()
            }
        }),
        TableName::Plugins => json!({
            "type": "object",
            "required": ["identifier", "type", "manifest"],
            "properties": {
                "id": { "type": "string" },
                "identifier": { "type": "string" },
                "type": { "enum": ["plugin", "customPlugin"] },
                "manifest": { "type": "object" },
                "settings": {},
                "createdAt": timestamps(),
                "updatedAt": timestamps()
            }
        }),
        TableName::SessionGroups => json!({
            "type": "object",
            "required": ["name"],
            "properties": {
                "id": { "type": "string" },
                "name": { "type": "string" },
                "sort": { "type": ["number", "null"] },
                "createdAt": timestamps(),
                "updatedAt": timestamps()
            }
        }),
        TableName::Files => json!({
            "type": "object",
            "required": ["name", "fileType", "size", "saveMode"],
            "properties": {
                "id": { "type": "string" },
                "name": { "type": "string" },
                "fileType": { "type": "string" },
                "size": { "type": "number", "minimum": 0 },
                "saveMode": { "enum": ["local", "url"] },
                "url": { "type": "string" },
                "createdAt": timestamps(),
                "updatedAt": timestamps()
            }
        }),
        TableName::Users => json!({
            "type": "object",
            "properties": {
                "id": { "type": "string" },
                "uuid": { "type": "string" },
                "settings": { "type": "object" },
                "avatar": { "type": "string" },
                "createdAt": timestamps(),
                "updatedAt": timestamps()
            }
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_table_schema_compiles() {
        for table in TableName::ALL {
            assert!(TableSchema::for_table(table).is_ok(), "{table}");
        }
    }

    #[test]
    fn diagnostic_names_table_and_field() {
        let schema = TableSchema::for_table(TableName::Messages).unwrap();
        let err = schema
            .validate(&json!({ "content": "hi", "role": "robot", "sessionId": "s" }))
            .unwrap_err();

        let StoreError::Validation { table, diagnostic } = err else {
            panic!("expected a validation error");
        };
        assert_eq!(table, "messages");
        assert!(diagnostic.contains("/role"), "{diagnostic}");
    }

    #[test]
    fn partial_validation_ignores_missing_required_fields() {
        let schema = TableSchema::for_table(TableName::Messages).unwrap();
        assert!(schema.validate(&json!({ "favorite": true })).is_err());
        assert!(schema.validate_partial(&json!({ "favorite": true })).is_ok());
        assert!(schema.validate_partial(&json!({ "favorite": "yes" })).is_err());
    }
}
