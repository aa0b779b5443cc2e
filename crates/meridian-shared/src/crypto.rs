use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

use crate::constants::{KDF_CONTEXT_ROOM_ID, KDF_CONTEXT_ROOM_KEY, NONCE_SIZE, ROOM_TOPIC_PREFIX};
use crate::error::CryptoError;

pub type SymmetricKey = [u8; 32];

pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

// Returns nonce || ciphertext (24 bytes nonce prepended)
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce_bytes = generate_nonce();
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

pub fn decrypt(key: &SymmetricKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce = XNonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Key every frame of a room is sealed with. Peers only understand each other
/// when they agree on both the room name and the password.
pub fn derive_room_key(room_name: &str, password: Option<&str>) -> SymmetricKey {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_ROOM_KEY);
    hasher.update(room_name.as_bytes());
    hasher.update(&[0]);
    hasher.update(password.unwrap_or_default().as_bytes());
    *hasher.finalize().as_bytes()
}

/// Opaque room identifier handed to signaling and hosted services in place of
/// the human-chosen room name.
pub fn hash_room_name(room_name: &str) -> String {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_ROOM_ID);
    hasher.update(room_name.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Room identifier for services that cannot see the payload key. A password
/// places the room in its own namespace; without one this equals
/// [`hash_room_name`].
pub fn hash_room_id(room_name: &str, password: Option<&str>) -> String {
    match password.filter(|p| !p.is_empty()) {
        None => hash_room_name(room_name),
        Some(password) => {
            let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_ROOM_ID);
            hasher.update(room_name.as_bytes());
            hasher.update(&[0]);
            hasher.update(password.as_bytes());
            hasher.finalize().to_hex().to_string()
        }
    }
}

/// Gossip topic of a room.
pub fn room_topic(room_name: &str) -> String {
    format!("{ROOM_TOPIC_PREFIX}{}", hash_room_name(room_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = derive_room_key("room", Some("secret"));
        let plaintext = b"local-first all the way";

        let encrypted = encrypt(&key, plaintext).unwrap();
        let decrypted = decrypt(&key, &encrypted).unwrap();

        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_wrong_password_fails() {
        let key1 = derive_room_key("room", Some("one"));
        let key2 = derive_room_key("room", Some("two"));

        let encrypted = encrypt(&key1, b"Secret row").unwrap();
        assert!(decrypt(&key2, &encrypted).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = derive_room_key("room", None);
        let mut encrypted = encrypt(&key, b"Important data").unwrap();
        let len = encrypted.len();
        encrypted[len - 1] ^= 0xFF;

        assert!(decrypt(&key, &encrypted).is_err());
    }

    #[test]
    fn test_empty_data_fails() {
        let key = derive_room_key("room", None);
        assert!(decrypt(&key, &[]).is_err());
    }

    #[test]
    fn test_room_hash_is_stable_and_opaque() {
        let a = hash_room_name("family");
        assert_eq!(a, hash_room_name("family"));
        assert_ne!(a, hash_room_name("Family"));
        assert!(!a.contains("family"));
        assert_eq!(a.len(), 64);
        assert!(room_topic("family").ends_with(&a));
    }

    #[test]
    fn test_password_separates_keys() {
        assert_ne!(derive_room_key("ab", Some("c")), derive_room_key("a", Some("bc")));
        assert_ne!(derive_room_key("room", None), derive_room_key("room", Some("x")));
    }

    #[test]
    fn test_password_namespaces_room_id() {
        assert_eq!(hash_room_id("room", None), hash_room_name("room"));
        assert_eq!(hash_room_id("room", Some("")), hash_room_name("room"));
        assert_ne!(hash_room_id("room", Some("x")), hash_room_name("room"));
        assert_ne!(hash_room_id("room", Some("x")), hash_room_id("room", Some("y")));
        assert_ne!(hash_room_id("ab", Some("c")), hash_room_id("a", Some("bc")));
        assert!(!hash_room_id("room", Some("secret")).contains("secret"));
    }
}
