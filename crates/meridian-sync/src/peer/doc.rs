//! The replicated document.
//!
//! One last-writer-wins map per synced table, keyed by record id. Every entry
//! carries the hybrid logical clock timestamp of its last write; deletions are
//! kept as tombstones so they win against older writes that arrive late.

use std::collections::{BTreeMap, HashMap};

use meridian_shared::protocol::CrdtOp;
use meridian_shared::{ChangeEvent, Origin, TableName};
use serde_json::Value;
use uhlc::{Timestamp, HLC};
use tracing::warn;

#[derive(Debug, Clone)]
struct Entry {
    value: Option<Value>,
    stamp: Timestamp,
}

pub struct SyncDoc {
    clock: HLC,
    maps: HashMap<TableName, BTreeMap<String, Entry>>,
}

impl Default for SyncDoc {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncDoc {
    pub fn new() -> Self {
        Self {
            clock: uhlc::HLCBuilder::new().build(),
            maps: HashMap::new(),
        }
    }

    /// Local write.
    pub fn put(&mut self, table: TableName, id: &str, value: &Value) -> CrdtOp {
        let stamp = self.clock.new_timestamp();
        self.map_mut(table).insert(
            id.to_string(),
            Entry {
                value: Some(value.clone()),
                stamp,
            },
        );
        CrdtOp::put(table, id, value, stamp)
    }

    /// Local writes of many rows in one go; rows whose value is already in the
    /// document are left alone.
    pub fn put_many(&mut self, table: TableName, rows: &[(String, Value)]) -> Vec<CrdtOp> {
        let mut ops = Vec::new();
        for (id, value) in rows {
            if self.get(table, id) != Some(value) {
                ops.push(self.put(table, id, value));
            }
        }
        ops
    }

    /// Local deletion.
    pub fn remove(&mut self, table: TableName, id: &str) -> CrdtOp {
        let stamp = self.clock.new_timestamp();
        self.map_mut(table)
            .insert(id.to_string(), Entry { value: None, stamp });
        CrdtOp::remove(table, id, stamp)
    }

    /// Merge remote ops. Returns the changes that altered the document.
    pub fn apply(&mut self, ops: &[CrdtOp]) -> Vec<ChangeEvent> {
        let mut changes = Vec::new();

        for op in ops {
            if let Err(e) = self.clock.update_with_timestamp(&op.stamp) {
                warn!(error = %e, "remote clock is ahead of local clock");
            }

            let value = match op.decode_value() {
                Ok(value) => value,
                Err(e) => {
                    warn!(table = %op.table, id = %op.id, error = %e, "dropping undecodable op");
                    continue;
                }
            };

            let map = self.map_mut(op.table);
            let previous = map.get(&op.id);
            if previous.is_some_and(|entry| entry.stamp >= op.stamp) {
                continue;
            }
            let was_live = previous.map(|entry| entry.value.clone());

            let change = match (&value, was_live) {
                (Some(new), Some(Some(old))) if *new == old => None,
                (Some(new), _) => Some(ChangeEvent::upsert(Origin::Remote, op.table, op.id.clone(), new.clone())),
                (None, Some(None)) => None,
                (None, _) => Some(ChangeEvent::delete(Origin::Remote, op.table, op.id.clone())),
            };

            map.insert(
                op.id.clone(),
                Entry {
                    value,
                    stamp: op.stamp,
                },
            );
            changes.extend(change);
        }

        changes
    }

    pub fn get(&self, table: TableName, id: &str) -> Option<&Value> {
        self.maps.get(&table)?.get(id)?.value.as_ref()
    }

    /// Live entries of one table.
    pub fn map(&self, table: TableName) -> BTreeMap<String, Value> {
        self.maps
            .get(&table)
            .map(|map| {
                map.iter()
                    .filter_map(|(id, entry)| Some((id.clone(), entry.value.clone()?)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every entry, tombstones included, as ops that rebuild this document.
    pub fn snapshot(&self) -> Vec<CrdtOp> {
        let mut ops = Vec::new();
        for (table, map) in &self.maps {
            for (id, entry) in map {
                ops.push(match &entry.value {
                    Some(value) => CrdtOp::put(*table, id.as_str(), value, entry.stamp),
                    None => CrdtOp::remove(*table, id.as_str(), entry.stamp),
                });
            }
        }
        ops
    }

    fn map_mut(&mut self, table: TableName) -> &mut BTreeMap<String, Entry> {
        self.maps.entry(table).or_default()
    }
}

#[cfg(test)]
mod tests {
    use meridian_shared::ChangeKind;
    use serde_json::json;

    use super::*;

    #[test]
    fn later_write_wins_regardless_of_arrival_order() {
        let mut a = SyncDoc::new();
        let mut b = SyncDoc::new();

        let first = a.put(TableName::Topics, "t1", &json!({ "title": "first" }));
        let second = b.put(TableName::Topics, "t1", &json!({ "title": "second" }));
        let (older, newer) = if first.stamp < second.stamp { (first, second) } else { (second, first) };

        let mut x = SyncDoc::new();
        x.apply(&[newer.clone()]);
        assert!(x.apply(&[older.clone()]).is_empty());

        let mut y = SyncDoc::new();
        y.apply(&[older]);
        y.apply(&[newer]);

        assert_eq!(x.map(TableName::Topics), y.map(TableName::Topics));
    }

    #[test]
    fn tombstones_beat_older_writes() {
        let mut a = SyncDoc::new();
        let put = a.put(TableName::Messages, "m1", &json!({ "content": "x" }));
        let remove = a.remove(TableName::Messages, "m1");

        let mut b = SyncDoc::new();
        let changes = b.apply(&[remove, put]);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Delete);
        assert!(b.map(TableName::Messages).is_empty());
        assert_eq!(b.snapshot().len(), 1);
    }

    #[test]
    fn reapplying_a_snapshot_reports_nothing() {
        let mut a = SyncDoc::new();
        let ops = a.put_many(
            TableName::Sessions,
            &[("s1".into(), json!({ "id": "s1" })), ("s2".into(), json!({ "id": "s2" }))],
        );
        assert_eq!(ops.len(), 2);
        assert!(a.put_many(TableName::Sessions, &[("s1".into(), json!({ "id": "s1" }))]).is_empty());

        let mut b = SyncDoc::new();
        assert_eq!(b.apply(&a.snapshot()).len(), 2);
        assert!(b.apply(&a.snapshot()).is_empty());
        assert!(b.get(TableName::Sessions, "s1").is_some());
    }
}
