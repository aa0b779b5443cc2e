//! Schema registry and migration engine.
//!
//! A [`SchemaRegistry`] is an ordered list of [`SchemaVersion`]s, each
//! carrying the complete index specification of every table at that version
//! plus an optional upgrade callback. [`run_migrations`] reads
//! `PRAGMA user_version`, then applies every newer version in ascending order,
//! one transaction per version: table/index changes, the upgrade callback,
//! and the version bump commit together or not at all.

pub mod index_spec;
pub mod v001_initial;
pub mod v002_message_links;
pub mod v003_session_groups;
pub mod v004_users;
pub mod v005_user_uuid;
pub mod v006_tool_messages;

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use rusqlite::{params, Connection};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::table::TableView;

use self::index_spec::TableSpec;

/// Upgrade callback of a schema version.
pub type UpgradeFn = Arc<dyn Fn(&UpgradeContext<'_>) -> Result<()> + Send + Sync>;

/// One snapshot of the on-device table layout.
#[derive(Clone)]
pub struct SchemaVersion {
    pub version: u32,
    /// `(table, index specification)` for every table present at this version.
    pub tables: Vec<(String, String)>,
    pub upgrade: Option<UpgradeFn>,
}

impl SchemaVersion {
    pub fn new(version: u32, tables: &[(&str, &str)]) -> Self {
        Self {
            version,
            tables: tables
                .iter()
                .map(|(t, s)| (t.to_string(), s.to_string()))
                .collect(),
            upgrade: None,
        }
    }

    pub fn with_upgrade<F>(mut self, upgrade: F) -> Self
    where
        F: Fn(&UpgradeContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.upgrade = Some(Arc::new(upgrade));
        self
    }
}

impl fmt::Debug for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaVersion")
            .field("version", &self.version)
            .field("tables", &self.tables)
            .field("upgrade", &self.upgrade.is_some())
            .finish()
    }
}

/// Ordered list of schema versions.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    versions: Vec<SchemaVersion>,
}

impl SchemaRegistry {
    /// An empty registry; versions are appended with [`SchemaRegistry::version`].
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry of the chat client's local tables.
    pub fn chat() -> Self {
        Self::new()
            .version(v001_initial::schema())
            .version(v002_message_links::schema())
            .version(v003_session_groups::schema())
            .version(v004_users::schema())
            .version(v005_user_uuid::schema())
            .version(v006_tool_messages::schema())
    }

    /// Append a version. Versions must be appended in ascending order.
    pub fn version(mut self, version: SchemaVersion) -> Self {
        self.versions.push(version);
        self
    }

    pub fn versions(&self) -> &[SchemaVersion] {
        &self.versions
    }

    pub fn latest_version(&self) -> u32 {
        self.versions.last().map(|v| v.version).unwrap_or(0)
    }

    fn check_order(&self) -> Result<()> {
        for pair in self.versions.windows(2) {
            if pair[1].version <= pair[0].version {
                return Err(StoreError::Migration {
                    version: pair[1].version,
                    reason: format!(
                        "versions must be strictly ascending ({} follows {})",
                        pair[1].version, pair[0].version
                    ),
                });
            }
        }
        Ok(())
    }
}

/// What an upgrade callback sees: the tables of the in-flight transaction and
/// anything handed over by the caller of `open`.
pub struct UpgradeContext<'a> {
    conn: &'a Connection,
    version: u32,
    legacy_settings: Option<&'a Value>,
}

impl<'a> UpgradeContext<'a> {
    pub fn table(&self, name: &str) -> TableView<'a> {
        TableView::new(self.conn, name)
    }

    /// Version being applied.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Settings that lived outside the database before it had a `users` table.
    pub fn legacy_settings(&self) -> Option<&'a Value> {
        self.legacy_settings
    }
}

/// Run all pending migrations against the open connection.
///
/// Returns the version the database is at afterwards. Upgrade failures are
/// surfaced unchanged in kind: the failing version's transaction is rolled
/// back and the database stays at the last committed version.
pub fn run_migrations(
    conn: &mut Connection,
    registry: &SchemaRegistry,
    legacy_settings: Option<&Value>,
) -> Result<u32> {
    registry.check_order()?;

    let current: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    let latest = registry.latest_version();

    info!(
        current_version = current,
        target_version = latest,
        "checking database migrations"
    );

    if current > latest {
        return Err(StoreError::Downgrade {
            stored: current,
            latest,
        });
    }

    for step in registry.versions().iter().filter(|v| v.version > current) {
        info!(version = step.version, "applying schema version");

        let tx = conn.transaction()?;

        apply_layout(&tx, step).map_err(|e| as_migration_error(step.version, e))?;

        if let Some(upgrade) = &step.upgrade {
            let ctx = UpgradeContext {
                conn: &tx,
                version: step.version,
                legacy_settings,
            };
            upgrade(&ctx).map_err(|e| as_migration_error(step.version, e))?;
            info!(version = step.version, "upgrade callback applied");
        }

        tx.pragma_update(None, "user_version", step.version)?;
        tx.commit()?;
    }

    Ok(latest)
}

fn as_migration_error(version: u32, err: StoreError) -> StoreError {
    match err {
        StoreError::Migration { .. } => err,
        other => StoreError::Migration {
            version,
            reason: other.to_string(),
        },
    }
}

/// Bring tables and indexes in line with `step`'s specification.
fn apply_layout(conn: &Connection, step: &SchemaVersion) -> Result<()> {
    let specs = step
        .tables
        .iter()
        .map(|(table, spec)| index_spec::parse(table, spec))
        .collect::<Result<Vec<TableSpec>>>()?;

    let wanted: HashSet<&str> = specs.iter().map(|s| s.table.as_str()).collect();
    for table in existing_tables(conn)? {
        if !wanted.contains(table.as_str()) {
            info!(table = %table, version = step.version, "dropping table");
            conn.execute_batch(&format!("DROP TABLE \"{table}\""))?;
        }
    }

    for spec in &specs {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" (
                id   TEXT PRIMARY KEY NOT NULL,
                data TEXT NOT NULL
            )",
            spec.table
        ))?;

        let desired: HashSet<String> = spec
            .indexes
            .iter()
            .map(|i| i.sql_name(&spec.table))
            .collect();

        for name in existing_indexes(conn, &spec.table)? {
            if !desired.contains(&name) {
                debug!(table = %spec.table, index = %name, "dropping index");
                conn.execute_batch(&format!("DROP INDEX \"{name}\""))?;
            }
        }

        for index in &spec.indexes {
            conn.execute_batch(&index.create_sql(&spec.table))?;
        }
    }

    Ok(())
}

fn existing_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
    )?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

    let mut tables = Vec::new();
    for row in rows {
        tables.push(row?);
    }
    Ok(tables)
}

fn existing_indexes(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master
         WHERE type = 'index' AND tbl_name = ?1 AND name LIKE 'idx\\_%' ESCAPE '\\'",
    )?;
    let rows = stmt.query_map(params![table], |row| row.get::<_, String>(0))?;

    let mut indexes = Vec::new();
    for row in rows {
        indexes.push(row?);
    }
    Ok(indexes)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;

    fn version_of(conn: &Connection) -> u32 {
        conn.pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap()
    }

    fn index_names(conn: &Connection, table: &str) -> Vec<String> {
        let mut names = existing_indexes(conn, table).unwrap();
        names.sort();
        names
    }

    #[test]
    fn fresh_database_reaches_latest_version() {
        let mut conn = Connection::open_in_memory().unwrap();
        let registry = SchemaRegistry::chat();

        let version = run_migrations(&mut conn, &registry, None).unwrap();

        assert_eq!(version, registry.latest_version());
        assert_eq!(version_of(&conn), registry.latest_version());
        let mut tables = existing_tables(&conn).unwrap();
        tables.sort();
        assert_eq!(
            tables,
            vec!["files", "messages", "plugins", "sessionGroups", "sessions", "topics", "users"]
        );
        assert!(index_names(&conn, "messages").contains(&"idx_messages_sessionId_topicId".to_string()));
    }

    #[test]
    fn upgrades_run_once_in_ascending_order() {
        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));
        let registry = {
            let (c1, c2) = (calls.clone(), calls.clone());
            SchemaRegistry::new()
                .version(SchemaVersion::new(1, &[("notes", "&id")]).with_upgrade(move |ctx| {
                    c1.lock().unwrap().push(ctx.version());
                    Ok(())
                }))
                .version(SchemaVersion::new(2, &[("notes", "&id, title")]).with_upgrade(move |ctx| {
                    c2.lock().unwrap().push(ctx.version());
                    Ok(())
                }))
        };

        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn, &registry, None).unwrap();
        run_migrations(&mut conn, &registry, None).unwrap();

        assert_eq!(*calls.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn failing_upgrade_leaves_prior_version_committed() {
        let mut conn = Connection::open_in_memory().unwrap();
        let base = SchemaRegistry::new().version(SchemaVersion::new(1, &[("notes", "&id")]));
        run_migrations(&mut conn, &base, None).unwrap();
        TableView::new(&conn, "notes")
            .add(&json!({ "id": "n1", "title": "keep" }))
            .unwrap();

        let broken = base.clone().version(
            SchemaVersion::new(2, &[("notes", "&id, title"), ("tags", "&id")]).with_upgrade(|ctx| {
                ctx.table("notes").modify(|row| {
                    row.insert("title".into(), json!("changed"));
                    true
                })?;
                Err(StoreError::Migration {
                    version: ctx.version(),
                    reason: "boom".into(),
                })
            }),
        );

        let err = run_migrations(&mut conn, &broken, None).unwrap_err();
        assert!(matches!(err, StoreError::Migration { version: 2, .. }));

        assert_eq!(version_of(&conn), 1);
        assert!(!existing_tables(&conn).unwrap().contains(&"tags".to_string()));
        assert!(index_names(&conn, "notes").is_empty());
        let row = TableView::new(&conn, "notes").get("n1").unwrap().unwrap();
        assert_eq!(row["title"], "keep");
    }

    #[test]
    fn index_changes_follow_each_version() {
        let registry = SchemaRegistry::new()
            .version(SchemaVersion::new(1, &[("notes", "&id, title, folder")]))
            .version(SchemaVersion::new(2, &[("notes", "&id, &slug, folder")]));

        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn, &registry, None).unwrap();

        assert_eq!(
            index_names(&conn, "notes"),
            vec!["idx_notes_folder".to_string(), "idx_notes_slug_unique".to_string()]
        );
    }

    #[test]
    fn tables_absent_from_a_version_are_dropped() {
        let registry = SchemaRegistry::new()
            .version(SchemaVersion::new(1, &[("notes", "&id"), ("drafts", "&id")]))
            .version(SchemaVersion::new(2, &[("notes", "&id")]));

        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn, &registry, None).unwrap();

        assert_eq!(existing_tables(&conn).unwrap(), vec!["notes".to_string()]);
    }

    #[test]
    fn refuses_to_downgrade() {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn, &SchemaRegistry::chat(), None).unwrap();

        let older = SchemaRegistry::new().version(SchemaVersion::new(1, &[("notes", "&id")]));
        let err = run_migrations(&mut conn, &older, None).unwrap_err();
        assert!(matches!(err, StoreError::Downgrade { stored: 6, latest: 1 }));
    }

    #[test]
    fn rejects_unordered_registry() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let registry = SchemaRegistry::new()
            .version(SchemaVersion::new(2, &[("notes", "&id")]).with_upgrade(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .version(SchemaVersion::new(1, &[("notes", "&id")]));

        let mut conn = Connection::open_in_memory().unwrap();
        assert!(run_migrations(&mut conn, &registry, None).is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(version_of(&conn), 0);
    }
}
