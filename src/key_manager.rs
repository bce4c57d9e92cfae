use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::envelope::{EncryptedEnvelope, Operation};
use crate::error::{ReplicatorError, Result};
use crate::hybrid::{generate_key_pair, HybridDecryptor, HybridEncryptor, DEFAULT_RSA_BITS};
use crate::storage::{KeyStore, StoredKeyPair, CURRENT_MARKER};

/// Public metadata about a loaded key pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyInfo {
    pub key_id: String,
    pub created_at: DateTime<Utc>,
    pub is_active: bool,
    pub has_public: bool,
    pub has_private: bool,
}

/// What a loaded key can do
#[derive(Debug)]
enum KeyMaterial {
    /// Online deployment: encrypt only
    PublicOnly(HybridEncryptor),
    /// Offline recovery: both halves present and matching
    Full(HybridEncryptor, HybridDecryptor),
}

impl KeyMaterial {
    fn encryptor(&self) -> &HybridEncryptor {
        match self {
            KeyMaterial::PublicOnly(enc) | KeyMaterial::Full(enc, _) => enc,
        }
    }

    fn decryptor(&self) -> Option<&HybridDecryptor> {
        match self {
            KeyMaterial::PublicOnly(_) => None,
            KeyMaterial::Full(_, dec) => Some(dec),
        }
    }
}

#[derive(Debug)]
struct KeyRecord {
    created_at: DateTime<Utc>,
    material: KeyMaterial,
}

/// Key Rotation Manager: many RSA key pairs, one active for encryption,
/// any of them resolvable by id for decryption.
///
/// Rotation only ever adds keys. Envelopes carry the `key_id` that wrapped
/// them, so history stays decryptable after any number of rotations.
pub struct KeyRotationManager<S: KeyStore> {
    store: Arc<S>,
    keys: BTreeMap<String, KeyRecord>,
    current_key_id: Option<String>,
    active_override: Option<String>,
}

impl<S: KeyStore> KeyRotationManager<S> {
    /// Create an empty manager over `store`. Call [`load`](Self::load) next.
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            keys: BTreeMap::new(),
            current_key_id: None,
            active_override: None,
        }
    }

    /// Pin the active key regardless of the store marker.
    pub fn with_active_key_id(mut self, key_id: Option<String>) -> Self {
        self.active_override = key_id;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn current_key_id(&self) -> Option<&str> {
        self.current_key_id.as_deref()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// (Re)load every key pair from the store and select the active key.
    pub fn load(&mut self) -> Result<()> {
        let mut keys = BTreeMap::new();
        for pair in self.store.list_key_pairs()? {
            let key_id = pair.key_id.clone();
            let record = Self::load_record(pair)?;
            info!(
                key_id = %key_id,
                has_private = record.material.decryptor().is_some(),
                "Loaded key"
            );
            keys.insert(key_id, record);
        }

        let current = match &self.active_override {
            Some(key_id) => Some(key_id.clone()),
            None => self.store.current_key_id()?,
        };

        let current = match current {
            Some(key_id) if keys.contains_key(&key_id) => Some(key_id),
            Some(key_id) => return Err(ReplicatorError::UnknownKey(key_id)),
            None => {
                let selected = Self::most_recent(&keys);
                if let Some(key_id) = &selected {
                    info!(key_id = %key_id, "Auto-selected most recent key as current");
                    // read-only key directories are normal for the online side
                    if let Err(e) = self.store.set_current_key_id(key_id) {
                        warn!(key_id = %key_id, error = %e, "Could not record current key marker");
                    }
                }
                selected
            }
        };

        self.keys = keys;
        self.current_key_id = current;
        Ok(())
    }

    fn load_record(pair: StoredKeyPair) -> Result<KeyRecord> {
        let encryptor = HybridEncryptor::from_public_pem(pair.key_id.as_str(), &pair.public_pem)?;

        let material = match &pair.private_pem {
            Some(pem) => match HybridDecryptor::from_private_pem(pem) {
                Ok(decryptor) if decryptor.matches(&encryptor) => KeyMaterial::Full(encryptor, decryptor),
                Ok(_) => {
                    warn!(key_id = %pair.key_id, "Private key does not match public key, ignoring it");
                    KeyMaterial::PublicOnly(encryptor)
                }
                Err(e) => {
                    warn!(key_id = %pair.key_id, error = %e, "Unreadable private key, ignoring it");
                    KeyMaterial::PublicOnly(encryptor)
                }
            },
            None => KeyMaterial::PublicOnly(encryptor),
        };

        Ok(KeyRecord {
            created_at: pair.created_at,
            material,
        })
    }

    /// Latest `created_at`; equal timestamps fall back to the greatest key id.
    fn most_recent(keys: &BTreeMap<String, KeyRecord>) -> Option<String> {
        keys.iter()
            .max_by(|(a_id, a), (b_id, b)| a.created_at.cmp(&b.created_at).then_with(|| a_id.cmp(b_id)))
            .map(|(key_id, _)| key_id.clone())
    }

    /// Encryptor for the current key.
    pub fn active_encryptor(&self) -> Result<&HybridEncryptor> {
        let key_id = self.current_key_id.as_ref().ok_or(ReplicatorError::NoActiveKey)?;
        self.keys
            .get(key_id)
            .map(|record| record.material.encryptor())
            .ok_or(ReplicatorError::NoActiveKey)
    }

    /// Decryptor for a specific key, active or not.
    pub fn decryptor_for(&self, key_id: &str) -> Result<&HybridDecryptor> {
        let record = self
            .keys
            .get(key_id)
            .ok_or_else(|| ReplicatorError::UnknownKey(key_id.to_string()))?;
        record
            .material
            .decryptor()
            .ok_or_else(|| ReplicatorError::NoPrivateKey(key_id.to_string()))
    }

    /// Encrypt with the current key.
    pub fn encrypt(&self, record: &Value, table: &str, operation: Operation) -> Result<EncryptedEnvelope> {
        self.active_encryptor()?.encrypt(record, table, operation)
    }

    /// Decrypt with whichever key the envelope names.
    pub fn decrypt(&self, envelope: &EncryptedEnvelope) -> Result<Value> {
        self.decryptor_for(&envelope.key_id)?.decrypt(envelope)
    }

    /// Generate a new key pair, persist it, and make it the current key.
    ///
    /// Returns the new key id. Existing keys are left untouched.
    pub fn rotate(&mut self, new_key_id: Option<&str>) -> Result<String> {
        let created_at = Utc::now();
        let key_id = match new_key_id {
            Some(key_id) => key_id.to_string(),
            None => self.unused_key_id(default_key_id(created_at)),
        };
        validate_key_id(&key_id)?;
        if self.keys.contains_key(&key_id) {
            return Err(ReplicatorError::KeyRotation(format!("key {} already exists", key_id)));
        }

        let pem = generate_key_pair(DEFAULT_RSA_BITS)?;
        self.store.store_key_pair(&StoredKeyPair {
            key_id: key_id.clone(),
            created_at,
            public_pem: pem.public_pem,
            private_pem: Some(pem.private_pem),
        })?;
        self.store.set_current_key_id(&key_id)?;

        let previous = self.current_key_id.clone();
        // an explicit rotation supersedes any pinned key
        self.active_override = None;
        self.load()?;

        info!(
            key_id = %key_id,
            previous = previous.as_deref().unwrap_or("none"),
            total_keys = self.keys.len(),
            "Rotated to new key"
        );
        Ok(key_id)
    }

    /// `base`, or `base-2`, `base-3`, ... if already taken.
    fn unused_key_id(&self, base: String) -> String {
        if !self.keys.contains_key(&base) {
            return base;
        }
        let mut n = 2;
        loop {
            let candidate = format!("{}-{}", base, n);
            if !self.keys.contains_key(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    /// All loaded keys, oldest first.
    pub fn list_keys(&self) -> Vec<KeyInfo> {
        let mut infos: Vec<KeyInfo> = self
            .keys
            .iter()
            .map(|(key_id, record)| KeyInfo {
                key_id: key_id.clone(),
                created_at: record.created_at,
                is_active: self.current_key_id.as_deref() == Some(key_id.as_str()),
                has_public: true,
                has_private: record.material.decryptor().is_some(),
            })
            .collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.key_id.cmp(&b.key_id)));
        infos
    }
}

fn default_key_id(now: DateTime<Utc>) -> String {
    format!("key-{}", now.format("%Y%m%dT%H%M%SZ"))
}

/// Key ids become directory names, so keep them to a safe alphabet.
pub fn validate_key_id(key_id: &str) -> Result<()> {
    let valid_chars = key_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if key_id.is_empty() || !valid_chars || key_id == CURRENT_MARKER || key_id.starts_with('.') {
        return Err(ReplicatorError::KeyRotation(format!("invalid key id: {:?}", key_id)));
    }
    Ok(())
}
