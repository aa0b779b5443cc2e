//! # meridian-shared
//!
//! Types shared by every Meridian crate: table names, change events, sync
//! status and presence types, the peer wire protocol and room crypto.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::{CryptoError, ProtocolError};
pub use types::*;
