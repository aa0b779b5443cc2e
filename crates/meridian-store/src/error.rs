use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A record body could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A single-row write addressed an id that does not exist.
    #[error("Record `{id}` not found in table `{table}`")]
    NotFound { table: String, id: String },

    /// A payload failed the table's structural schema.
    #[error("Validation failed for table `{table}`: {diagnostic}")]
    Validation { table: String, diagnostic: String },

    /// An insert collided with an existing primary key.
    #[error("Record `{id}` already exists in table `{table}`")]
    AlreadyExists { table: String, id: String },

    /// A stored row is not a JSON object with a string id.
    #[error("Invalid record in table `{table}`: {reason}")]
    InvalidRecord { table: String, reason: String },

    /// An upgrade callback or index change failed.
    #[error("Migration to version {version} failed: {reason}")]
    Migration { version: u32, reason: String },

    /// The on-disk database is newer than this build knows about.
    #[error("Database is at version {stored}, newer than the latest known version {latest}")]
    Downgrade { stored: u32, latest: u32 },

    /// A query filter names a field path that cannot be addressed safely.
    #[error("Invalid field path `{0}`")]
    InvalidPath(String),

    /// Another thread panicked while holding the database lock.
    #[error("Database lock poisoned")]
    LockPoisoned,

    /// A table schema could not be compiled.
    #[error("Invalid schema for table `{table}`: {reason}")]
    InvalidSchema { table: String, reason: String },

    /// A malformed index specification in the schema registry.
    #[error("Invalid index specification `{spec}`: {reason}")]
    IndexSpec { spec: String, reason: String },
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
