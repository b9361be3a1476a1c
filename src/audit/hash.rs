//! Hash Engine
//!
//! Keyed HMAC-SHA256 digests over the canonical entry string, with the key
//! selected by version so rotated keys keep verifying historical entries.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::audit::entry::{AuditLogEntry, EntryFields};
use crate::error::AuditError;

type HmacSha256 = Hmac<Sha256>;

/// Bytes of entropy per nonce
pub const NONCE_BYTES: usize = 16;

/// Supplies digest keys by version
pub trait KeyProvider: Send + Sync {
    /// Version used for new entries
    fn current_version(&self) -> u32;

    /// Key material for a version, if still held
    fn key(&self, version: u32) -> Option<&[u8]>;
}

/// In-memory keyring built from configuration
#[derive(Clone)]
pub struct StaticKeyring {
    current: u32,
    keys: BTreeMap<u32, Vec<u8>>,
}

impl StaticKeyring {
    pub fn new(current: u32) -> Self {
        Self {
            current,
            keys: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, version: u32, key: impl Into<Vec<u8>>) {
        self.keys.insert(version, key.into());
    }

    pub fn with_key(mut self, version: u32, key: impl Into<Vec<u8>>) -> Self {
        self.insert(version, key);
        self
    }

    pub fn versions(&self) -> Vec<u32> {
        self.keys.keys().copied().collect()
    }
}

impl fmt::Debug for StaticKeyring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticKeyring")
            .field("current", &self.current)
            .field("versions", &self.versions())
            .finish()
    }
}

impl KeyProvider for StaticKeyring {
    fn current_version(&self) -> u32 {
        self.current
    }

    fn key(&self, version: u32) -> Option<&[u8]> {
        self.keys.get(&version).map(Vec::as_slice)
    }
}

#[derive(Clone)]
pub struct HashEngine {
    keys: Arc<dyn KeyProvider>,
}

impl HashEngine {
    pub fn new(keys: Arc<dyn KeyProvider>) -> Self {
        Self { keys }
    }

    pub fn current_key_version(&self) -> u32 {
        self.keys.current_version()
    }

    /// Fresh random token, hex encoded
    pub fn nonce() -> String {
        let mut bytes = [0u8; NONCE_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Hex HMAC-SHA256 of the canonical entry string under the given key version
    pub fn digest(
        &self,
        fields: &EntryFields<'_>,
        previous_hash: Option<&str>,
        nonce: &str,
        key_version: u32,
    ) -> Result<String, AuditError> {
        let mac = self.mac(fields, previous_hash, nonce, key_version)?;
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Recompute the digest from the entry's own fields and nonce, using the
    /// key version it was written with, against a supplied previous hash.
    pub fn verify_entry(
        &self,
        entry: &AuditLogEntry,
        expected_previous_hash: Option<&str>,
    ) -> Result<bool, AuditError> {
        let mac = self.mac(
            &entry.fields(),
            expected_previous_hash,
            &entry.nonce,
            entry.key_version,
        )?;

        let stored = match hex::decode(&entry.entry_hash) {
            Ok(bytes) => bytes,
            Err(_) => return Ok(false),
        };
        Ok(mac.verify_slice(&stored).is_ok())
    }

    fn mac(
        &self,
        fields: &EntryFields<'_>,
        previous_hash: Option<&str>,
        nonce: &str,
        key_version: u32,
    ) -> Result<HmacSha256, AuditError> {
        let key = self
            .keys
            .key(key_version)
            .ok_or(AuditError::UnknownKeyVersion(key_version))?;

        let mut mac = HmacSha256::new_from_slice(key)
            .map_err(|e| AuditError::CryptoError(format!("Invalid HMAC key: {}", e)))?;
        mac.update(fields.canonical_string(previous_hash, nonce).as_bytes());
        Ok(mac)
    }
}
