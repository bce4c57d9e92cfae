//! Storage abstraction for RSA key pairs
//!
//! This module provides a trait-based storage interface with two backends:
//! the on-disk key directory used in deployments and an in-memory store.
//!
//! On-disk layout:
//!
//! ```text
//! keys/
//! ├── key-20240101T000000Z/
//! │   ├── public.pem
//! │   └── private.pem   (optional, offline recovery only)
//! ├── key-20240201T000000Z/
//! │   └── public.pem
//! └── current           (text file holding the active key id)
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::warn;
use zeroize::Zeroizing;

use crate::error::{ReplicatorError, Result};

/// Name of the active-key marker inside the key directory
pub const CURRENT_MARKER: &str = "current";
/// Public key file name inside a key pair directory
pub const PUBLIC_KEY_FILE: &str = "public.pem";
/// Private key file name inside a key pair directory
pub const PRIVATE_KEY_FILE: &str = "private.pem";

/// A key pair as held by a store
#[derive(Clone)]
pub struct StoredKeyPair {
    /// Unique identifier, also the directory name on disk
    pub key_id: String,
    /// When the pair was created
    pub created_at: DateTime<Utc>,
    /// SPKI public key PEM
    pub public_pem: String,
    /// PKCS#8 private key PEM, absent in the online deployment
    pub private_pem: Option<Zeroizing<String>>,
}

impl std::fmt::Debug for StoredKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredKeyPair")
            .field("key_id", &self.key_id)
            .field("created_at", &self.created_at)
            .field("has_private", &self.private_pem.is_some())
            .finish()
    }
}

/// Storage trait for key pair backends
pub trait KeyStore: Send + Sync {
    /// List every stored key pair
    fn list_key_pairs(&self) -> Result<Vec<StoredKeyPair>>;

    /// Persist a new key pair. Fails if `key_id` already exists; stored
    /// keys are never overwritten.
    fn store_key_pair(&self, pair: &StoredKeyPair) -> Result<()>;

    /// Read the active-key marker
    fn current_key_id(&self) -> Result<Option<String>>;

    /// Point the active-key marker at `key_id`
    fn set_current_key_id(&self, key_id: &str) -> Result<()>;
}

/// Key directory on the local filesystem
#[derive(Debug, Clone)]
pub struct FsKeyStore {
    root: PathBuf,
}

impl FsKeyStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read_pair(&self, key_id: &str, dir: &Path) -> Result<Option<StoredKeyPair>> {
        let public_path = dir.join(PUBLIC_KEY_FILE);
        if !public_path.is_file() {
            warn!(key_id, dir = %dir.display(), "No public key in key directory, skipping");
            return Ok(None);
        }

        let public_pem = fs::read_to_string(&public_path)?;
        let created_at = DateTime::<Utc>::from(fs::metadata(&public_path)?.modified()?);

        let private_path = dir.join(PRIVATE_KEY_FILE);
        let private_pem = if private_path.is_file() {
            Some(Zeroizing::new(fs::read_to_string(&private_path)?))
        } else {
            None
        };

        Ok(Some(StoredKeyPair {
            key_id: key_id.to_string(),
            created_at,
            public_pem,
            private_pem,
        }))
    }
}

impl KeyStore for FsKeyStore {
    fn list_key_pairs(&self) -> Result<Vec<StoredKeyPair>> {
        if !self.root.exists() {
            warn!(dir = %self.root.display(), "Key directory not found");
            return Ok(Vec::new());
        }

        let mut pairs = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(key_id) = name.to_str() else {
                continue;
            };
            // file_type() does not follow symlinks, so a legacy `current`
            // link is never mistaken for a key pair
            if key_id == CURRENT_MARKER || !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(pair) = self.read_pair(key_id, &entry.path())? {
                pairs.push(pair);
            }
        }
        Ok(pairs)
    }

    fn store_key_pair(&self, pair: &StoredKeyPair) -> Result<()> {
        fs::create_dir_all(&self.root)?;

        let dir = self.root.join(&pair.key_id);
        fs::create_dir(&dir).map_err(|e| match e.kind() {
            std::io::ErrorKind::AlreadyExists => {
                ReplicatorError::KeyRotation(format!("key {} already exists", pair.key_id))
            }
            _ => ReplicatorError::from(e),
        })?;

        if let Some(private_pem) = &pair.private_pem {
            let mut file = private_file_options().open(dir.join(PRIVATE_KEY_FILE))?;
            file.write_all(private_pem.as_bytes())?;
            file.sync_all()?;
        }

        let public_path = dir.join(PUBLIC_KEY_FILE);
        fs::write(&public_path, pair.public_pem.as_bytes())?;
        // the public key mtime doubles as the creation timestamp
        let file = fs::OpenOptions::new().write(true).open(&public_path)?;
        file.set_modified(SystemTime::from(pair.created_at))?;
        file.sync_all()?;

        Ok(())
    }

    fn current_key_id(&self) -> Result<Option<String>> {
        let marker = self.root.join(CURRENT_MARKER);
        let meta = match fs::symlink_metadata(&marker) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if meta.file_type().is_symlink() {
            let target = fs::read_link(&marker)?;
            return Ok(target
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string));
        }
        if meta.is_file() {
            let key_id = fs::read_to_string(&marker)?.trim().to_string();
            return Ok((!key_id.is_empty()).then_some(key_id));
        }

        warn!(path = %marker.display(), "Unrecognized current-key marker, ignoring");
        Ok(None)
    }

    fn set_current_key_id(&self, key_id: &str) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        let tmp = self.root.join(format!(".{CURRENT_MARKER}.tmp"));
        fs::write(&tmp, format!("{key_id}\n"))?;
        // rename replaces a legacy symlink rather than following it
        fs::rename(&tmp, self.root.join(CURRENT_MARKER))?;
        Ok(())
    }
}

#[cfg(unix)]
fn private_file_options() -> fs::OpenOptions {
    use std::os::unix::fs::OpenOptionsExt;
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true).mode(0o600);
    options
}

#[cfg(not(unix))]
fn private_file_options() -> fs::OpenOptions {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    options
}

/// In-memory implementation of KeyStore
///
/// Suitable for tests and the explicit demo mode.
/// Keys are lost when the process terminates.
pub struct InMemoryKeyStore {
    pairs: RwLock<BTreeMap<String, StoredKeyPair>>,
    current: RwLock<Option<String>>,
}

impl InMemoryKeyStore {
    /// Create a new in-memory store instance
    pub fn new() -> Self {
        Self {
            pairs: RwLock::new(BTreeMap::new()),
            current: RwLock::new(None),
        }
    }
}

impl Default for InMemoryKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyStore for InMemoryKeyStore {
    fn list_key_pairs(&self) -> Result<Vec<StoredKeyPair>> {
        Ok(self.pairs.read().values().cloned().collect())
    }

    fn store_key_pair(&self, pair: &StoredKeyPair) -> Result<()> {
        let mut pairs = self.pairs.write();
        if pairs.contains_key(&pair.key_id) {
            return Err(ReplicatorError::KeyRotation(format!(
                "key {} already exists",
                pair.key_id
            )));
        }
        pairs.insert(pair.key_id.clone(), pair.clone());
        Ok(())
    }

    fn current_key_id(&self) -> Result<Option<String>> {
        Ok(self.current.read().clone())
    }

    fn set_current_key_id(&self, key_id: &str) -> Result<()> {
        *self.current.write() = Some(key_id.to_string());
        Ok(())
    }
}
