use serde::{Deserialize, Serialize};
use serde_json::Value;
use uhlc::Timestamp;

use crate::crypto::{decrypt, encrypt, SymmetricKey};
use crate::error::ProtocolError;
use crate::types::{TableName, UserIdentity};

/// One entry write inside the shared document.
///
/// The record body travels as JSON text so that the outer frame can stay
/// `bincode`, which cannot carry self-describing values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrdtOp {
    pub table: TableName,
    pub id: String,
    /// `None` is a tombstone.
    pub value: Option<String>,
    pub stamp: Timestamp,
}

impl CrdtOp {
    pub fn put(table: TableName, id: impl Into<String>, value: &Value, stamp: Timestamp) -> Self {
        Self {
            table,
            id: id.into(),
            value: Some(value.to_string()),
            stamp,
        }
    }

    pub fn remove(table: TableName, id: impl Into<String>, stamp: Timestamp) -> Self {
        Self {
            table,
            id: id.into(),
            value: None,
            stamp,
        }
    }

    pub fn decode_value(&self) -> Result<Option<Value>, ProtocolError> {
        self.value
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(ProtocolError::from)
    }
}

/// All frames exchanged between peers of a room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Incremental document changes.
    Update { ops: Vec<CrdtOp> },

    /// Part of a full document state, sent to peers that just joined.
    Snapshot { ops: Vec<CrdtOp> },

    /// Presence of one connection; `None` announces departure.
    Awareness {
        connection_id: String,
        identity: Option<UserIdentity>,
    },
}

impl SyncMessage {
    /// Serialize to binary (bincode)
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }

    /// Serialize and encrypt with the room key.
    pub fn seal(&self, key: &SymmetricKey) -> Result<Vec<u8>, ProtocolError> {
        let plaintext = self.to_bytes()?;
        Ok(encrypt(key, &plaintext)?)
    }

    /// Decrypt with the room key and deserialize.
    pub fn open(key: &SymmetricKey, data: &[u8]) -> Result<Self, ProtocolError> {
        let plaintext = decrypt(key, data)?;
        Ok(Self::from_bytes(&plaintext)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::derive_room_key;
    use serde_json::json;

    #[test]
    fn test_sealed_update_opens_with_same_key() {
        let clock = uhlc::HLCBuilder::new().build();
        let record = json!({ "id": "m1", "content": "hi", "createdAt": 1, "updatedAt": 1 });
        let msg = SyncMessage::Update {
            ops: vec![
                CrdtOp::put(TableName::Messages, "m1", &record, clock.new_timestamp()),
                CrdtOp::remove(TableName::Topics, "t1", clock.new_timestamp()),
            ],
        };

        let key = derive_room_key("room", Some("pw"));
        let sealed = msg.seal(&key).unwrap();
        let opened = SyncMessage::open(&key, &sealed).unwrap();

        let SyncMessage::Update { ops } = opened else {
            panic!("Message type mismatch");
        };
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].decode_value().unwrap(), Some(record));
        assert_eq!(ops[1].decode_value().unwrap(), None);
        assert!(ops[0].stamp < ops[1].stamp);
    }

    #[test]
    fn test_foreign_room_frames_are_rejected() {
        let msg = SyncMessage::Awareness {
            connection_id: "c1".into(),
            identity: None,
        };
        let sealed = msg.seal(&derive_room_key("a", None)).unwrap();
        assert!(SyncMessage::open(&derive_room_key("b", None), &sealed).is_err());
    }
}
