//! Crypto Module
//!
//! At-rest encryption of entry payloads with AES-256-GCM.
//!
//! ## Key lifecycle
//! 1. Look for persisted key material in the most durable backend
//! 2. Absent: generate a fresh 256-bit key and persist it (unencrypted)
//! 3. Present: import it
//!
//! Every `encrypt` call draws a fresh random 96-bit nonce from the OS.
//! A nonce is never reused under the same key.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entry::{base64_bytes, now_millis, EntryMetadata, StoredEntry, StoredValue};
use crate::error::{Result, StashError};

/// AES-256 key length in bytes
pub const KEY_LEN: usize = 32;

/// AES-GCM nonce length in bytes
pub const NONCE_LEN: usize = 12;

/// Output of one encryption
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBox {
    #[serde(with = "base64_bytes")]
    pub iv: Vec<u8>,

    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
}

/// Raw key bytes, wiped on drop
pub struct KeyMaterial {
    bytes: [u8; KEY_LEN],
}

impl KeyMaterial {
    /// Draw a fresh random key
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(key.as_slice());
        Self { bytes }
    }

    /// Import a key from its exported (base64) form
    pub fn import(exported: &str) -> Result<Self> {
        let decoded = STANDARD
            .decode(exported.trim())
            .map_err(|e| StashError::Crypto(format!("malformed key material: {}", e)))?;
        if decoded.len() != KEY_LEN {
            return Err(StashError::Crypto(format!(
                "key material has {} bytes, expected {}",
                decoded.len(),
                KEY_LEN
            )));
        }
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(&decoded);
        Ok(Self { bytes })
    }

    /// Export form persisted under the reserved key
    pub fn export(&self) -> String {
        STANDARD.encode(self.bytes)
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.bytes.iter_mut().for_each(|b| *b = 0);
    }
}

/// Symmetric cipher bound to one key
pub struct Cipher {
    aead: Aes256Gcm,
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Cipher(AES-256-GCM)")
    }
}

impl Cipher {
    /// Build a cipher from key material
    pub fn new(key: &KeyMaterial) -> Result<Self> {
        let aead = Aes256Gcm::new_from_slice(&key.bytes)
            .map_err(|e| StashError::Crypto(format!("failed to create AES-GCM cipher: {}", e)))?;
        Ok(Self { aead })
    }

    /// Encrypt a payload under a fresh random nonce
    pub fn encrypt(&self, plain: &[u8]) -> Result<SealedBox> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .aead
            .encrypt(&nonce, plain)
            .map_err(|e| StashError::Crypto(format!("AES-GCM encryption failed: {}", e)))?;

        Ok(SealedBox {
            iv: nonce.to_vec(),
            ciphertext,
        })
    }

    /// Decrypt a sealed payload
    ///
    /// Fails on a wrong key, tampered ciphertext or malformed nonce.
    pub fn decrypt(&self, sealed: &SealedBox) -> Result<Vec<u8>> {
        if sealed.iv.len() != NONCE_LEN {
            return Err(StashError::Crypto(format!(
                "nonce has {} bytes, expected {}",
                sealed.iv.len(),
                NONCE_LEN
            )));
        }
        let nonce = Nonce::from_slice(&sealed.iv);
        self.aead
            .decrypt(nonce, sealed.ciphertext.as_slice())
            .map_err(|_| {
                StashError::Crypto("AES-GCM decryption failed (wrong key or tampered data)".to_string())
            })
    }
}

/// Reserved-slot record holding exported key material
///
/// The record is never encrypted: it is the key.
pub fn key_record(key: &KeyMaterial, physical_key: &str, schema: &str) -> StoredEntry {
    StoredEntry {
        key: physical_key.to_string(),
        value: StoredValue::Plain(Value::String(key.export())),
        timestamp: now_millis(),
        value_type: "key".to_string(),
        metadata: EntryMetadata::new(schema),
        encrypted: false,
        compressed: false,
        original_size: None,
        compressed_size: None,
    }
}

/// Recover key material from a record written by [`key_record`]
pub fn key_from_record(entry: &StoredEntry) -> Result<KeyMaterial> {
    match &entry.value {
        StoredValue::Plain(Value::String(exported)) if !entry.encrypted => {
            KeyMaterial::import(exported)
        }
        _ => Err(StashError::Crypto(
            "persisted key material has an unexpected shape".to_string(),
        )),
    }
}
