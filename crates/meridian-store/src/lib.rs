//! # meridian-store
//!
//! Local-first storage for Meridian, backed by SQLite.
//!
//! Every table keeps its records as JSON documents keyed by a string `id`.
//! The layout of the tables is described by a [`SchemaRegistry`] of ordered
//! versions; [`Database`] applies pending versions on open. [`RecordModel`]
//! is the validated CRUD façade used by application code and mirrors every
//! committed write into an optional [`ChangeSink`].

pub mod backup;
pub mod clock;
pub mod database;
pub mod migrations;
pub mod model;
pub mod models;
pub mod schemas;
pub mod table;

mod error;

pub use backup::{import_backup, BackupPayload, ImportStats, TableImportStats};
pub use clock::{Clock, IdGenerator, SystemClock, UuidGenerator};
pub use database::{lock, Database, OpenOptions, SharedDatabase};
pub use error::{Result, StoreError};
pub use migrations::{SchemaRegistry, SchemaVersion};
pub use model::{ChangeSink, RecordModel};
pub use models::*;
pub use schemas::TableSchema;
pub use table::TableView;
