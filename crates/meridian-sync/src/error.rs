use meridian_shared::ProtocolError;
use meridian_store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// `reconnect` before any `start_sync`.
    #[error("Sync has not been started")]
    NotStarted,

    /// Connection parameters meant for the other backend.
    #[error("Unsupported connection parameters: expected {expected}")]
    UnsupportedParams { expected: &'static str },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The hosted service refused or failed a request.
    #[error("Hosted service error: {0}")]
    Hosted(String),

    /// The auth endpoint did not hand out a room token.
    #[error("Authentication failed: {0}")]
    Auth(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;
