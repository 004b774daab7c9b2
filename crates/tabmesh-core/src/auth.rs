//! Handshake authentication.
//!
//! Each node holds a symmetric AES-256-GCM key, created lazily on first use.
//! A sealed message binds a correlation id and timestamp to the key through a
//! SHA-256 validation hash, and carries the payload encrypted under the key:
//!
//! ```text
//! hash = hex(SHA256(correlationId ":" timestamp ":" base64(rawKey)))
//! ciphertext = base64(nonce || AES-256-GCM(payload) || tag)
//! ```
//!
//! Keys are per node unless a group key is supplied with [`KeyStore::shared`].
//! There is no in-band key exchange, so with per-node keys a node can only
//! verify payloads it sealed itself.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::Aes256Gcm;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::protocol::envelope::now_ms;

/// AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;
/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;
/// AES-GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Validation hash mismatch")]
    HashMismatch,
    #[error("Invalid ciphertext encoding: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("Ciphertext too short ({0} bytes)")]
    Truncated(usize),
    #[error("Encryption failed")]
    Encrypt,
    #[error("Decryption failed")]
    Decrypt,
    #[error("Plaintext is not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

pub type Result<T> = std::result::Result<T, AuthError>;

/// Symmetric key material.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey([u8; KEY_LEN]);

impl SecretKey {
    /// Generate a fresh random key.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; KEY_LEN];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw key export, base64 encoded.
    pub fn export_raw(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.0)
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(GenericArray::from_slice(&self.0))
    }
}

// Never print key material
impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// An authenticated, encrypted payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealedMessage {
    pub correlation_id: Uuid,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
    /// Hex-encoded SHA-256 validation hash
    pub hash: String,
    /// Base64 of nonce || ciphertext || tag
    pub ciphertext: String,
}

/// Compute the validation hash binding a correlation id and timestamp to a key.
pub fn validation_hash(key: &SecretKey, correlation_id: &Uuid, timestamp: u64) -> String {
    let validation = format!("{}:{}:{}", correlation_id, timestamp, key.export_raw());
    let mut hasher = Sha256::new();
    hasher.update(validation.as_bytes());
    hex::encode(hasher.finalize())
}

/// Seal a payload: fresh correlation id and timestamp, hash, and ciphertext.
pub fn create_message(payload: &str, key: &SecretKey) -> Result<SealedMessage> {
    let correlation_id = Uuid::new_v4();
    let timestamp = now_ms();
    let hash = validation_hash(key, &correlation_id, timestamp);
    let ciphertext = encrypt(payload.as_bytes(), key)?;

    Ok(SealedMessage {
        correlation_id,
        timestamp,
        hash,
        ciphertext: base64::engine::general_purpose::STANDARD.encode(ciphertext),
    })
}

/// Recompute the expected hash with the verifier's key, then decrypt.
pub fn verify_and_decrypt(msg: &SealedMessage, key: &SecretKey) -> Result<String> {
    let expected = validation_hash(key, &msg.correlation_id, msg.timestamp);
    if expected != msg.hash {
        return Err(AuthError::HashMismatch);
    }

    let data = base64::engine::general_purpose::STANDARD.decode(&msg.ciphertext)?;
    let plaintext = decrypt(&data, key)?;
    Ok(String::from_utf8(plaintext)?)
}

fn encrypt(plaintext: &[u8], key: &SecretKey) -> Result<Vec<u8>> {
    use rand::RngCore;

    let mut nonce = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce);

    let ciphertext = key
        .cipher()
        .encrypt(GenericArray::from_slice(&nonce), plaintext)
        .map_err(|_| AuthError::Encrypt)?;

    // Prepend nonce to ciphertext
    let mut result = nonce.to_vec();
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

fn decrypt(data: &[u8], key: &SecretKey) -> Result<Vec<u8>> {
    if data.len() < NONCE_LEN + TAG_LEN {
        return Err(AuthError::Truncated(data.len()));
    }

    let (nonce, ciphertext) = data.split_at(NONCE_LEN);
    key.cipher()
        .decrypt(GenericArray::from_slice(nonce), ciphertext)
        .map_err(|_| AuthError::Decrypt)
}

/// Lazily-created key holder owned by one node.
///
/// Concurrent callers of [`KeyStore::use_secret_key`] always observe the same
/// key instance.
#[derive(Debug, Default)]
pub struct KeyStore {
    key: Mutex<Option<Arc<SecretKey>>>,
    /// Cleared on discard: a regenerated key is private to this node
    shared: AtomicBool,
}

impl KeyStore {
    /// A store that generates its own key on first use.
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-seeded with a group key known to every node.
    pub fn shared(key: SecretKey) -> Self {
        Self {
            key: Mutex::new(Some(Arc::new(key))),
            shared: AtomicBool::new(true),
        }
    }

    /// Whether peers hold the same key, so their payloads are verifiable.
    pub fn is_shared(&self) -> bool {
        self.shared.load(Ordering::Acquire)
    }

    /// Get the node's key, creating it on first use.
    pub async fn use_secret_key(&self) -> Arc<SecretKey> {
        let mut guard = self.key.lock().await;
        if let Some(key) = guard.as_ref() {
            return Arc::clone(key);
        }

        let key = Arc::new(SecretKey::generate());
        *guard = Some(Arc::clone(&key));
        debug!("Generated node secret key");
        key
    }

    /// Drop the key. Returns true if one was held.
    ///
    /// A group key is forgotten too; the store falls back to per-node keys.
    pub async fn discard(&self) -> bool {
        let mut guard = self.key.lock().await;
        self.shared.store(false, Ordering::Release);
        guard.take().is_some()
    }
}
