//! Database connection management.
//!
//! The [`Database`] struct owns a [`rusqlite::Connection`] and guarantees that
//! pending schema versions are applied before any other operation.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use directories::ProjectDirs;
use meridian_shared::TableName;
use rusqlite::Connection;
use serde_json::Value;

use crate::error::{Result, StoreError};
use crate::migrations::{self, SchemaRegistry};
use crate::table::TableView;

/// Handle shared between the record models and the sync backends.
pub type SharedDatabase = Arc<Mutex<Database>>;

/// Lock a shared database, mapping poisoning to [`StoreError::LockPoisoned`].
pub fn lock(db: &SharedDatabase) -> Result<MutexGuard<'_, Database>> {
    db.lock().map_err(|_| StoreError::LockPoisoned)
}

/// What to open a database with.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub registry: SchemaRegistry,
    /// Settings kept outside the database by older clients, imported once
    /// when the `users` table is introduced.
    pub legacy_settings: Option<Value>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            registry: SchemaRegistry::chat(),
            legacy_settings: None,
        }
    }
}

/// Wrapper around a [`rusqlite::Connection`].
pub struct Database {
    conn: Connection,
    version: u32,
}

impl Database {
    /// Open (or create) the default application database.
    ///
    /// The database file is placed in the platform-appropriate data directory:
    /// - Linux:   `~/.local/share/meridian/meridian.db`
    /// - macOS:   `~/Library/Application Support/com.meridian.meridian/meridian.db`
    /// - Windows: `{FOLDERID_RoamingAppData}\meridian\meridian\data\meridian.db`
    pub fn new() -> Result<Self> {
        let project_dirs =
            ProjectDirs::from("com", "meridian", "meridian").ok_or(StoreError::NoDataDir)?;

        let data_dir = project_dirs.data_dir();
        std::fs::create_dir_all(data_dir)?;

        let db_path = data_dir.join("meridian.db");

        tracing::info!(path = %db_path.display(), "opening database");

        Self::open_at(&db_path)
    }

    /// Open (or create) a database at an explicit path with the chat registry.
    pub fn open_at(path: &Path) -> Result<Self> {
        Self::open_with(path, &OpenOptions::default())
    }

    pub fn open_with(path: &Path, options: &OpenOptions) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::migrate(conn, options)
    }

    /// A throwaway database, mostly for tests.
    pub fn open_in_memory(options: &OpenOptions) -> Result<Self> {
        Self::migrate(Connection::open_in_memory()?, options)
    }

    fn migrate(mut conn: Connection, options: &OpenOptions) -> Result<Self> {
        let version = migrations::run_migrations(
            &mut conn,
            &options.registry,
            options.legacy_settings.as_ref(),
        )?;
        Ok(Self { conn, version })
    }

    /// Return a reference to the underlying `rusqlite::Connection`.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Return the filesystem path of the open database (if any).
    pub fn path(&self) -> Option<PathBuf> {
        self.conn.path().map(PathBuf::from)
    }

    /// Schema version the database was brought to on open.
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn table(&self, table: TableName) -> TableView<'_> {
        TableView::new(&self.conn, table.as_str())
    }

    pub fn into_shared(self) -> SharedDatabase {
        Arc::new(Mutex::new(self))
    }

    /// Write records received from a sync backend. No validation, no
    /// timestamps, nothing is echoed back to a sync sink.
    pub fn upsert_records(&self, table: TableName, records: &[Value]) -> Result<usize> {
        self.table(table).bulk_put(records)
    }

    /// Remove records deleted by a remote peer.
    pub fn delete_records(&self, table: TableName, ids: &[String]) -> Result<usize> {
        self.table(table).bulk_delete(ids)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn open_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");

        let db = Database::open_at(&path).expect("should open");
        assert!(db.path().is_some());
        assert_eq!(db.version(), SchemaRegistry::chat().latest_version());
    }

    #[test]
    fn reopen_keeps_rows_and_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");

        {
            let db = Database::open_at(&path).unwrap();
            db.upsert_records(TableName::Topics, &[json!({ "id": "t1", "title": "a" })])
                .unwrap();
        }

        let db = Database::open_at(&path).unwrap();
        assert_eq!(db.table(TableName::Topics).count().unwrap(), 1);
        assert_eq!(db.delete_records(TableName::Topics, &["t1".into()]).unwrap(), 1);
    }
}
