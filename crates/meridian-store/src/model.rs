//! Validated CRUD over one table.
//!
//! [`RecordModel`] validates payloads, stamps `id`/`createdAt`/`updatedAt`,
//! writes through the shared [`Database`](crate::Database) and, once the
//! local write has committed, hands the result to the attached
//! [`ChangeSink`] (the active sync session) if the table is synced.

use std::collections::HashSet;
use std::sync::Arc;

use meridian_shared::{ChangeEvent, Origin, TableName};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::clock::{Clock, IdGenerator, SystemClock, UuidGenerator};
use crate::database::{lock, SharedDatabase};
use crate::error::{Result, StoreError};
use crate::models::{BatchCreateOptions, BatchCreateResult, BatchItemError, CreatedRecord, QueryOptions};
use crate::schemas::TableSchema;
use crate::table::record_id;

/// Receives committed local writes. Implementations must not block; the
/// caller's write has already returned by the time propagation happens.
pub trait ChangeSink: Send + Sync {
    fn push(&self, change: ChangeEvent);
}

/// Fields owned by the model rather than by callers of `update`.
const SYSTEM_FIELDS: [&str; 3] = ["id", "createdAt", "updatedAt"];

#[derive(Clone)]
pub struct RecordModel {
    db: SharedDatabase,
    table: TableName,
    schema: Arc<TableSchema>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    sink: Option<Arc<dyn ChangeSink>>,
}

impl RecordModel {
    pub fn new(db: SharedDatabase, table: TableName) -> Result<Self> {
        Ok(Self {
            db,
            table,
            schema: Arc::new(TableSchema::for_table(table)?),
            clock: Arc::new(SystemClock),
            ids: Arc::new(UuidGenerator),
            sink: None,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ChangeSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Attach or detach the active sync session.
    pub fn set_sink(&mut self, sink: Option<Arc<dyn ChangeSink>>) {
        self.sink = sink;
    }

    pub fn table(&self) -> TableName {
        self.table
    }

    pub fn create(&self, data: Value, id: Option<&str>) -> Result<CreatedRecord> {
        self.validate(&data)?;

        let id = id.map(str::to_string).unwrap_or_else(|| self.ids.generate());
        let now = self.clock.now_millis();
        let record = stamp(data, &id, now, now);

        {
            let db = lock(&self.db)?;
            db.table(self.table).add(&record)?;
        }

        debug!(table = %self.table, id = %id, "record created");
        self.push(ChangeEvent::upsert(Origin::Local, self.table, id.clone(), record));
        Ok(CreatedRecord { id })
    }

    /// Insert many records at once. Invalid items and ids that already exist
    /// are reported, not raised.
    pub fn batch_create(&self, items: Vec<Value>, opts: &BatchCreateOptions<'_>) -> Result<BatchCreateResult> {
        let total = items.len();
        let ids: &dyn IdGenerator = match opts.id_generator {
            Some(generator) => generator,
            None => self.ids.as_ref(),
        };
        let now = self.clock.now_millis();

        let mut result = BatchCreateResult::default();
        let mut pending = Vec::new();
        let mut seen = HashSet::new();

        let db = lock(&self.db)?;
        let table = db.table(self.table);

        for (index, item) in items.into_iter().enumerate() {
            if let Err(err) = self.schema.validate(&item) {
                result.errors.push(BatchItemError {
                    index,
                    diagnostic: diagnostic_of(err),
                });
                continue;
            }

            let carried = item.get("id").and_then(Value::as_str).filter(|id| !id.is_empty());
            let id = match carried {
                Some(id) if !opts.create_with_new_id => id.to_string(),
                _ => ids.generate(),
            };

            if !seen.insert(id.clone()) || table.exists(&id)? {
                result.skips.push(id);
                continue;
            }

            let created_at = item.get("createdAt").and_then(Value::as_i64).unwrap_or(now);
            let updated_at = item
                .get("updatedAt")
                .and_then(Value::as_i64)
                .unwrap_or(now)
                .max(created_at);

            pending.push(stamp(item, &id, created_at, updated_at));
            result.ids.push(id);
        }

        table.bulk_add(&pending)?;
        drop(db);

        result.added = pending.len();
        result.success = result.added == total;

        if !result.errors.is_empty() || !result.skips.is_empty() {
            warn!(
                table = %self.table,
                added = result.added,
                skipped = result.skips.len(),
                invalid = result.errors.len(),
                "batch create was partial"
            );
        }

        for record in pending {
            if let Ok(id) = record_id(self.table.as_str(), &record) {
                self.push(ChangeEvent::upsert(Origin::Local, self.table, id, record));
            }
        }

        Ok(result)
    }

    /// Merge `partial` into the record. Returns `false` when it does not exist.
    pub fn update(&self, id: &str, partial: Value) -> Result<bool> {
        let Value::Object(mut fields) = partial else {
            return Err(self.validation_failed("update payload must be an object".into()));
        };
        for field in SYSTEM_FIELDS {
            fields.remove(field);
        }
        let fields = Value::Object(fields);
        self.validate_partial(&fields)?;

        let now = self.clock.now_millis();
        let patched = lock(&self.db)?.table(self.table).patch(id, |current| {
            if let Value::Object(fields) = fields {
                current.extend(fields);
            }
            let created_at = current.get("createdAt").and_then(Value::as_i64).unwrap_or(0);
            current.insert("updatedAt".into(), now.max(created_at).into());
        });
        let record = match patched {
            Ok(record) => record,
            Err(StoreError::NotFound { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };

        self.push(ChangeEvent::upsert(Origin::Local, self.table, id, record));
        Ok(true)
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let removed = lock(&self.db)?.table(self.table).delete(id)?;
        if removed {
            self.push(ChangeEvent::delete(Origin::Local, self.table, id));
        }
        Ok(removed)
    }

    /// Ids that were not stored are ignored and produce no tombstone.
    pub fn bulk_delete(&self, ids: &[String]) -> Result<usize> {
        let removed: Vec<String> = {
            let db = lock(&self.db)?;
            let table = db.table(self.table);
            let mut present = Vec::new();
            for id in ids {
                if table.exists(id)? && !present.contains(id) {
                    present.push(id.clone());
                }
            }
            table.bulk_delete(&present)?;
            present
        };
        for id in &removed {
            self.push(ChangeEvent::delete(Origin::Local, self.table, id.clone()));
        }
        Ok(removed.len())
    }

    pub fn clear(&self) -> Result<usize> {
        let ids = {
            let db = lock(&self.db)?;
            let table = db.table(self.table);
            let ids = table.ids()?;
            table.clear()?;
            ids
        };
        for id in &ids {
            self.push(ChangeEvent::delete(Origin::Local, self.table, id.clone()));
        }
        Ok(ids.len())
    }

    pub fn find_by_id(&self, id: &str) -> Result<Option<Value>> {
        lock(&self.db)?.table(self.table).get(id)
    }

    pub fn exists(&self, id: &str) -> Result<bool> {
        lock(&self.db)?.table(self.table).exists(id)
    }

    pub fn all(&self) -> Result<Vec<Value>> {
        lock(&self.db)?.table(self.table).all()
    }

    pub fn count(&self) -> Result<u64> {
        lock(&self.db)?.table(self.table).count()
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.count()? == 0)
    }

    pub fn query(&self, options: &QueryOptions) -> Result<Vec<Value>> {
        lock(&self.db)?
            .table(self.table)
            .query(&options.filters, options.page_size, options.offset())
    }

    fn validate(&self, data: &Value) -> Result<()> {
        self.schema.validate(data).map_err(|err| {
            self.log_rejection(&err);
            err
        })
    }

    fn validate_partial(&self, data: &Value) -> Result<()> {
        self.schema.validate_partial(data).map_err(|err| {
            self.log_rejection(&err);
            err
        })
    }

    fn validation_failed(&self, diagnostic: String) -> StoreError {
        let err = StoreError::Validation {
            table: self.table.to_string(),
            diagnostic,
        };
        self.log_rejection(&err);
        err
    }

    fn log_rejection(&self, err: &StoreError) {
        if let StoreError::Validation { diagnostic, .. } = err {
            warn!(table = %self.table, diagnostic = %diagnostic, "rejected invalid record");
        }
    }

    fn push(&self, change: ChangeEvent) {
        if !self.table.is_synced() {
            return;
        }
        if let Some(sink) = &self.sink {
            sink.push(change);
        }
    }
}

/// Set the model-owned fields on a validated payload.
fn stamp(data: Value, id: &str, created_at: i64, updated_at: i64) -> Value {
    let mut record = match data {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    record.insert("id".into(), Value::String(id.to_string()));
    record.insert("createdAt".into(), created_at.into());
    record.insert("updatedAt".into(), updated_at.into());
    Value::Object(record)
}

fn diagnostic_of(err: StoreError) -> String {
    match err {
        StoreError::Validation { diagnostic, .. } => diagnostic,
        other => other.to_string(),
    }
}
