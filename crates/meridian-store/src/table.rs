//! Untyped access to one table.
//!
//! Rows are `(id TEXT PRIMARY KEY, data TEXT)` where `data` is the full JSON
//! record, `id` included. A [`TableView`] borrows a connection, so the same
//! code works on a plain connection and inside a migration transaction.

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::{Map, Value};

use crate::error::{Result, StoreError};
use crate::migrations::index_spec::{is_valid_path, json_path_expr};

pub struct TableView<'c> {
    conn: &'c Connection,
    name: String,
}

impl<'c> TableView<'c> {
    pub fn new(conn: &'c Connection, name: impl Into<String>) -> Self {
        Self {
            conn,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, id: &str) -> Result<Option<Value>> {
        let data: Option<String> = self
            .conn
            .query_row(
                &format!("SELECT data FROM \"{}\" WHERE id = ?1", self.name),
                params![id],
                |row| row.get(0),
            )
            .optional()?;

        data.map(|d| self.decode(&d)).transpose()
    }

    pub fn exists(&self, id: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                &format!("SELECT 1 FROM \"{}\" WHERE id = ?1", self.name),
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Insert a new record. Fails with [`StoreError::AlreadyExists`] when the
    /// id is taken.
    pub fn add(&self, record: &Value) -> Result<String> {
        let id = record_id(&self.name, record)?;
        self.conn
            .execute(
                &format!("INSERT INTO \"{}\" (id, data) VALUES (?1, ?2)", self.name),
                params![id, serde_json::to_string(record)?],
            )
            .map_err(|e| self.map_conflict(e, &id))?;
        Ok(id)
    }

    /// Insert or replace.
    pub fn put(&self, record: &Value) -> Result<String> {
        let id = record_id(&self.name, record)?;
        self.conn.execute(
            &format!(
                "INSERT INTO \"{}\" (id, data) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET data = excluded.data",
                self.name
            ),
            params![id, serde_json::to_string(record)?],
        )?;
        Ok(id)
    }

    /// Insert all records or none of them.
    pub fn bulk_add(&self, records: &[Value]) -> Result<usize> {
        self.atomically(|| {
            for record in records {
                self.add(record)?;
            }
            Ok(records.len())
        })
    }

    pub fn bulk_put(&self, records: &[Value]) -> Result<usize> {
        self.atomically(|| {
            for record in records {
                self.put(record)?;
            }
            Ok(records.len())
        })
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let affected = self.conn.execute(
            &format!("DELETE FROM \"{}\" WHERE id = ?1", self.name),
            params![id],
        )?;
        Ok(affected > 0)
    }

    /// Returns how many of `ids` were present.
    pub fn bulk_delete(&self, ids: &[String]) -> Result<usize> {
        self.atomically(|| {
            let mut removed = 0;
            for id in ids {
                if self.delete(id)? {
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }

    pub fn clear(&self) -> Result<usize> {
        Ok(self
            .conn
            .execute(&format!("DELETE FROM \"{}\"", self.name), [])?)
    }

    pub fn count(&self) -> Result<u64> {
        let n: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM \"{}\"", self.name),
            [],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    /// Every record, oldest first.
    pub fn all(&self) -> Result<Vec<Value>> {
        self.query(&[], None, 0)
    }

    pub fn ids(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT id FROM \"{}\" ORDER BY id", self.name))?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    pub fn where_eq(&self, path: &str, value: &Value) -> Result<Vec<Value>> {
        self.query(&[(path.to_string(), value.clone())], None, 0)
    }

    /// Records matching every `(field path, value)` filter, oldest first.
    pub fn query(&self, filters: &[(String, Value)], limit: Option<u64>, offset: u64) -> Result<Vec<Value>> {
        let mut sql = format!("SELECT data FROM \"{}\"", self.name);
        let mut args: Vec<SqlValue> = Vec::new();

        for (i, (path, value)) in filters.iter().enumerate() {
            if !is_valid_path(path) {
                return Err(StoreError::InvalidPath(path.clone()));
            }
            sql.push_str(if i == 0 { " WHERE " } else { " AND " });
            match to_sql_value(value) {
                Some(arg) => {
                    args.push(arg);
                    sql.push_str(&format!("{} = ?{}", json_path_expr(path), args.len()));
                }
                None => sql.push_str(&format!("{} IS NULL", json_path_expr(path))),
            }
        }

        sql.push_str(" ORDER BY json_extract(data, '$.createdAt'), id");
        // SQLite only accepts OFFSET after a LIMIT; -1 means unbounded.
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}"));

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), |row| row.get::<_, String>(0))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(self.decode(&row?)?);
        }
        Ok(records)
    }

    /// Rewrite rows in place. `f` returns `true` when it changed the row.
    /// Returns the number of rows written back. The id cannot be changed.
    pub fn modify<F>(&self, mut f: F) -> Result<usize>
    where
        F: FnMut(&mut Map<String, Value>) -> bool,
    {
        let rows: Vec<(String, String)> = {
            let mut stmt = self
                .conn
                .prepare(&format!("SELECT id, data FROM \"{}\" ORDER BY id", self.name))?;
            let mapped = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            mapped.collect::<rusqlite::Result<_>>()?
        };

        self.atomically(|| {
            let mut changed = 0;
            for (id, data) in &rows {
                let Value::Object(mut record) = self.decode(data)? else {
                    continue;
                };
                if !f(&mut record) {
                    continue;
                }
                record.insert("id".into(), Value::String(id.clone()));
                self.conn.execute(
                    &format!("UPDATE \"{}\" SET data = ?2 WHERE id = ?1", self.name),
                    params![id, serde_json::to_string(&record)?],
                )?;
                changed += 1;
            }
            Ok(changed)
        })
    }

    /// Rewrite one row. Fails with [`StoreError::NotFound`] when `id` is
    /// absent. Returns the stored record.
    pub fn patch<F>(&self, id: &str, f: F) -> Result<Value>
    where
        F: FnOnce(&mut Map<String, Value>),
    {
        let Some(Value::Object(mut record)) = self.get(id)? else {
            return Err(StoreError::NotFound {
                table: self.name.clone(),
                id: id.to_string(),
            });
        };
        f(&mut record);
        record.insert("id".into(), Value::String(id.to_string()));

        let record = Value::Object(record);
        self.conn.execute(
            &format!("UPDATE \"{}\" SET data = ?2 WHERE id = ?1", self.name),
            params![id, serde_json::to_string(&record)?],
        )?;
        Ok(record)
    }

    fn decode(&self, data: &str) -> Result<Value> {
        serde_json::from_str(data).map_err(|e| StoreError::InvalidRecord {
            table: self.name.clone(),
            reason: e.to_string(),
        })
    }

    fn map_conflict(&self, err: rusqlite::Error, id: &str) -> StoreError {
        match err {
            rusqlite::Error::SqliteFailure(e, _)
                if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
            {
                StoreError::AlreadyExists {
                    table: self.name.clone(),
                    id: id.to_string(),
                }
            }
            other => StoreError::Sqlite(other),
        }
    }

    /// Run `f` in a transaction unless one is already open on the connection.
    fn atomically<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        if !self.conn.is_autocommit() {
            return f();
        }
        let tx = self.conn.unchecked_transaction()?;
        let out = f()?;
        tx.commit()?;
        Ok(out)
    }
}

/// The string `id` of a record body.
pub fn record_id(table: &str, record: &Value) -> Result<String> {
    let invalid = |reason: &str| StoreError::InvalidRecord {
        table: table.to_string(),
        reason: reason.to_string(),
    };

    match record {
        Value::Object(map) => match map.get("id") {
            Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
            Some(_) => Err(invalid("`id` must be a non-empty string")),
            None => Err(invalid("missing `id`")),
        },
        _ => Err(invalid("record must be a JSON object")),
    }
}

/// What `json_extract` yields for a JSON value. `None` for null.
fn to_sql_value(value: &Value) -> Option<SqlValue> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(SqlValue::Integer(i64::from(*b))),
        Value::Number(n) => Some(match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        }),
        Value::String(s) => Some(SqlValue::Text(s.clone())),
        other => Some(SqlValue::Text(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn notes(conn: &Connection) -> TableView<'_> {
        conn.execute_batch("CREATE TABLE notes (id TEXT PRIMARY KEY NOT NULL, data TEXT NOT NULL)")
            .unwrap();
        TableView::new(conn, "notes")
    }

    #[test]
    fn add_refuses_existing_id_but_put_replaces() {
        let conn = Connection::open_in_memory().unwrap();
        let notes = notes(&conn);

        notes.add(&json!({ "id": "a", "v": 1 })).unwrap();
        let err = notes.add(&json!({ "id": "a", "v": 2 })).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
        assert_eq!(notes.get("a").unwrap().unwrap()["v"], 1);

        notes.put(&json!({ "id": "a", "v": 3 })).unwrap();
        assert_eq!(notes.get("a").unwrap().unwrap()["v"], 3);
        assert_eq!(notes.count().unwrap(), 1);
    }

    #[test]
    fn bulk_add_is_all_or_nothing() {
        let conn = Connection::open_in_memory().unwrap();
        let notes = notes(&conn);
        notes.add(&json!({ "id": "b" })).unwrap();

        let batch = vec![json!({ "id": "a" }), json!({ "id": "b" })];
        assert!(notes.bulk_add(&batch).is_err());
        assert!(!notes.exists("a").unwrap());
    }

    #[test]
    fn query_filters_on_json_fields() {
        let conn = Connection::open_in_memory().unwrap();
        let notes = notes(&conn);
        notes
            .bulk_add(&[
                json!({ "id": "1", "folder": "x", "pinned": true, "createdAt": 3 }),
                json!({ "id": "2", "folder": "x", "pinned": false, "createdAt": 1 }),
                json!({ "id": "3", "folder": "y", "createdAt": 2 }),
                json!({ "id": "4", "folder": "x", "meta": { "tag": "t" }, "createdAt": 4 }),
            ])
            .unwrap();

        let in_x = notes.where_eq("folder", &json!("x")).unwrap();
        let ids: Vec<_> = in_x.iter().map(|r| r["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["2", "1", "4"]);

        assert_eq!(notes.where_eq("pinned", &json!(true)).unwrap().len(), 1);
        assert_eq!(notes.where_eq("pinned", &Value::Null).unwrap().len(), 2);
        assert_eq!(notes.where_eq("meta.tag", &json!("t")).unwrap().len(), 1);

        let page = notes.query(&[], Some(2), 1).unwrap();
        assert_eq!(page[0]["id"], "3");
        assert_eq!(page[1]["id"], "1");

        assert!(matches!(
            notes.where_eq("x') OR 1=1 --", &json!(1)),
            Err(StoreError::InvalidPath(_))
        ));
    }

    #[test]
    fn modify_keeps_ids_and_counts_changes() {
        let conn = Connection::open_in_memory().unwrap();
        let notes = notes(&conn);
        notes
            .bulk_add(&[json!({ "id": "a", "n": 1 }), json!({ "id": "b", "n": 2 })])
            .unwrap();

        let changed = notes
            .modify(|row| {
                if row["n"] != 1 {
                    return false;
                }
                row.insert("n".into(), json!(10));
                row.insert("id".into(), json!("hijack"));
                true
            })
            .unwrap();

        assert_eq!(changed, 1);
        assert_eq!(notes.get("a").unwrap().unwrap()["n"], 10);
        assert!(!notes.exists("hijack").unwrap());
    }

    #[test]
    fn patch_rewrites_one_row_and_reports_missing_ids() {
        let conn = Connection::open_in_memory().unwrap();
        let notes = notes(&conn);
        notes.add(&json!({ "id": "n1", "title": "draft" })).unwrap();

        let patched = notes
            .patch("n1", |row| {
                row.insert("title".into(), json!("final"));
                row.insert("id".into(), json!("hijacked"));
            })
            .unwrap();
        assert_eq!(patched, json!({ "id": "n1", "title": "final" }));
        assert_eq!(notes.get("n1").unwrap(), Some(patched));

        let missing = notes.patch("ghost", |_| {}).unwrap_err();
        assert!(matches!(missing, StoreError::NotFound { ref id, .. } if id == "ghost"));
        assert!(!notes.exists("ghost").unwrap());
    }

    #[test]
    fn records_without_string_ids_are_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        let notes = notes(&conn);
        assert!(notes.add(&json!({ "id": 5 })).is_err());
        assert!(notes.add(&json!([1, 2])).is_err());
        assert_eq!(notes.bulk_delete(&["missing".to_string()]).unwrap(), 0);
    }
}
