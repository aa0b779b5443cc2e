use std::collections::BTreeMap;

use meridian_shared::TableName;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::database::{lock, Database, SharedDatabase};
use crate::error::{Result, StoreError};
use crate::model::RecordModel;
use crate::models::BatchCreateOptions;

/// Full export of the local tables, serialized to JSON by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupPayload {
    /// ISO 8601 timestamp of when the backup was created
    pub created_at: String,
    /// App version that produced the backup
    pub version: String,
    /// Schema version of the exporting database
    pub schema_version: u32,
    pub tables: BTreeMap<TableName, Vec<Value>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableImportStats {
    pub imported: usize,
    pub skipped: usize,
    pub invalid: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportStats {
    pub tables: BTreeMap<TableName, TableImportStats>,
}

impl ImportStats {
    pub fn imported(&self) -> usize {
        self.tables.values().map(|t| t.imported).sum()
    }
}

impl Database {
    /// Export every table into a serializable struct.
    pub fn export_backup(&self) -> Result<BackupPayload> {
        let mut tables = BTreeMap::new();
        for table in TableName::ALL {
            tables.insert(table, self.table(table).all()?);
        }

        Ok(BackupPayload {
            created_at: chrono::Utc::now().to_rfc3339(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            schema_version: self.version(),
            tables,
        })
    }
}

/// Merge a backup into the database. Existing ids are kept as they are and
/// records failing validation are counted, not raised.
pub fn import_backup(db: &SharedDatabase, payload: &BackupPayload) -> Result<ImportStats> {
    let current = lock(db)?.version();
    if payload.schema_version > current {
        return Err(StoreError::Downgrade {
            stored: payload.schema_version,
            latest: current,
        });
    }

    let mut stats = ImportStats::default();
    for (table, records) in &payload.tables {
        let model = RecordModel::new(db.clone(), *table)?;
        let result = model.batch_create(records.clone(), &BatchCreateOptions::default())?;

        stats.tables.insert(
            *table,
            TableImportStats {
                imported: result.added,
                skipped: result.skips.len(),
                invalid: result.errors.len(),
            },
        );
    }

    tracing::info!(
        imported = stats.imported(),
        from_version = %payload.version,
        "backup imported"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::database::OpenOptions;

    #[test]
    fn export_then_import_into_fresh_database() {
        let source = Database::open_in_memory(&OpenOptions::default()).unwrap();
        source
            .upsert_records(
                TableName::Topics,
                &[json!({ "id": "t1", "title": "a", "createdAt": 5, "updatedAt": 9 })],
            )
            .unwrap();
        source
            .upsert_records(TableName::Messages, &[json!({ "id": "broken", "role": "user" })])
            .unwrap();

        let payload = source.export_backup().unwrap();
        let encoded = serde_json::to_string(&payload).unwrap();
        let payload: BackupPayload = serde_json::from_str(&encoded).unwrap();

        let target = Database::open_in_memory(&OpenOptions::default())
            .unwrap()
            .into_shared();
        let stats = import_backup(&target, &payload).unwrap();

        assert_eq!(stats.tables[&TableName::Topics].imported, 1);
        assert_eq!(stats.tables[&TableName::Messages].invalid, 1);

        let again = import_backup(&target, &payload).unwrap();
        assert_eq!(again.tables[&TableName::Topics].skipped, 1);

        let topic = lock(&target).unwrap().table(TableName::Topics).get("t1").unwrap().unwrap();
        assert_eq!(topic["updatedAt"], 9);
    }
}
