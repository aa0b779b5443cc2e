/// Protocol version string for libp2p identify
pub const PROTOCOL_VERSION: &str = "/meridian/1.0.0";

/// Application name
pub const APP_NAME: &str = "Meridian";

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Symmetric key size in bytes (for XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Maximum sealed frame size in bytes (1 MiB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// GossipSub heartbeat interval in seconds
pub const GOSSIPSUB_HEARTBEAT_SECS: u64 = 1;

/// Default QUIC listen port
pub const DEFAULT_QUIC_PORT: u16 = 4101;

/// Prefix of the gossipsub topic a room is published on
pub const ROOM_TOPIC_PREFIX: &str = "meridian/room/";

/// Key derivation contexts (BLAKE3)
pub const KDF_CONTEXT_ROOM_KEY: &str = "meridian-room-key-v1";
pub const KDF_CONTEXT_ROOM_ID: &str = "meridian-room-id-v1";

/// Rows written into the shared document per bulk-load transaction
pub const DEFAULT_SYNC_BATCH_SIZE: usize = 100;

/// Minimum spacing between two "table changed" events for one table
pub const DEFAULT_THROTTLE_MS: u64 = 1_000;

/// Quiet period after the last change before a session reports `synced`
pub const DEFAULT_DEBOUNCE_MS: u64 = 2_000;

/// Connectivity polls after joining a room before giving up
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 5;

/// Spacing between two connectivity polls
pub const DEFAULT_CONNECT_INTERVAL_MS: u64 = 2_000;
