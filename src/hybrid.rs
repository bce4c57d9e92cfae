//! Hybrid (digital envelope) encryption
//!
//! Each record is sealed with a fresh AES-256-GCM session key, and the
//! session key is wrapped with RSA-OAEP (SHA-256, MGF1-SHA-256) under the
//! recipient public key. Only the holder of the matching private key can
//! unwrap it, so the online side of the pipeline never needs a private key.

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde_json::Value;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::crypto::{AesGcmCipher, SealedData, SecureKey, AES_256_KEY_SIZE};
use crate::envelope::{EncryptedEnvelope, Operation, ENVELOPE_VERSION};
use crate::error::{ReplicatorError, Result};

/// Default RSA modulus size for generated key pairs
pub const DEFAULT_RSA_BITS: usize = 2048;

/// Encrypt `record` for the holder of `public_key`.
pub fn encrypt(
    record: &Value,
    table: &str,
    operation: Operation,
    key_id: &str,
    public_key: &RsaPublicKey,
) -> Result<EncryptedEnvelope> {
    encrypt_at(record, table, operation, key_id, public_key, Utc::now())
}

/// Same as [`encrypt`] with an explicit envelope timestamp.
pub fn encrypt_at(
    record: &Value,
    table: &str,
    operation: Operation,
    key_id: &str,
    public_key: &RsaPublicKey,
    timestamp: DateTime<Utc>,
) -> Result<EncryptedEnvelope> {
    let plaintext = Zeroizing::new(serde_json::to_vec(record)?);

    let session_key = SecureKey::generate();
    let sealed = AesGcmCipher::seal(&session_key, &plaintext)?;

    let encrypted_key = public_key
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), session_key.as_bytes())
        .map_err(|e| ReplicatorError::Crypto(format!("Key wrap error: {}", e)))?;

    Ok(EncryptedEnvelope {
        version: ENVELOPE_VERSION.to_string(),
        timestamp,
        table: table.to_string(),
        operation,
        encrypted_data: sealed.ciphertext,
        encrypted_key,
        iv: sealed.iv,
        tag: sealed.tag,
        key_id: key_id.to_string(),
    })
}

/// Recover the plaintext record from `envelope`.
///
/// Fails with `Decryption` on an unsupported version, a key that did not
/// wrap this envelope, or any tampering with the wrapped key, nonce,
/// ciphertext or tag.
pub fn decrypt(envelope: &EncryptedEnvelope, private_key: &RsaPrivateKey) -> Result<Value> {
    if envelope.version != ENVELOPE_VERSION {
        return Err(ReplicatorError::Decryption(format!(
            "unsupported envelope version: {}",
            envelope.version
        )));
    }

    let unwrapped = private_key
        .decrypt(Oaep::new::<Sha256>(), &envelope.encrypted_key)
        .map_err(|_| ReplicatorError::Decryption("session key unwrap failed".into()))?;
    if unwrapped.len() != AES_256_KEY_SIZE {
        return Err(ReplicatorError::Decryption(format!(
            "unwrapped session key has {} bytes",
            unwrapped.len()
        )));
    }
    let session_key = SecureKey::new(unwrapped);

    let sealed = SealedData {
        iv: envelope.iv,
        ciphertext: envelope.encrypted_data.clone(),
        tag: envelope.tag,
    };
    let plaintext = Zeroizing::new(AesGcmCipher::open(&session_key, &sealed)?);

    serde_json::from_slice(&plaintext)
        .map_err(|e| ReplicatorError::Decryption(format!("plaintext is not a JSON record: {}", e)))
}

/// Encrypt-capable half of a key pair, bound to its key id.
#[derive(Debug, Clone)]
pub struct HybridEncryptor {
    key_id: String,
    public_key: RsaPublicKey,
}

impl HybridEncryptor {
    pub fn new(key_id: impl Into<String>, public_key: RsaPublicKey) -> Self {
        Self {
            key_id: key_id.into(),
            public_key,
        }
    }

    /// Build from an SPKI (`BEGIN PUBLIC KEY`) PEM document.
    pub fn from_public_pem(key_id: impl Into<String>, pem: &str) -> Result<Self> {
        let public_key = RsaPublicKey::from_public_key_pem(pem)
            .map_err(|e| ReplicatorError::Crypto(format!("Invalid public key PEM: {}", e)))?;
        Ok(Self::new(key_id, public_key))
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    pub fn encrypt(&self, record: &Value, table: &str, operation: Operation) -> Result<EncryptedEnvelope> {
        encrypt(record, table, operation, &self.key_id, &self.public_key)
    }
}

/// Decrypt-capable half of a key pair. Lives only in the offline recovery
/// deployment.
#[derive(Clone)]
pub struct HybridDecryptor {
    private_key: RsaPrivateKey,
}

impl HybridDecryptor {
    pub fn new(private_key: RsaPrivateKey) -> Self {
        Self { private_key }
    }

    /// Build from a PKCS#8 (`BEGIN PRIVATE KEY`) or PKCS#1
    /// (`BEGIN RSA PRIVATE KEY`) PEM document.
    pub fn from_private_pem(pem: &str) -> Result<Self> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| ReplicatorError::Crypto(format!("Invalid private key PEM: {}", e)))?;
        Ok(Self::new(private_key))
    }

    /// Whether this private key is the other half of `encryptor`'s public key.
    pub fn matches(&self, encryptor: &HybridEncryptor) -> bool {
        RsaPublicKey::from(&self.private_key) == encryptor.public_key
    }

    pub fn decrypt(&self, envelope: &EncryptedEnvelope) -> Result<Value> {
        decrypt(envelope, &self.private_key)
    }
}

impl std::fmt::Debug for HybridDecryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HybridDecryptor([REDACTED])")
    }
}

/// PEM-encoded RSA key pair as written to a key directory
pub struct KeyPairPem {
    /// PKCS#8 private key
    pub private_pem: Zeroizing<String>,
    /// SPKI public key
    pub public_pem: String,
}

/// Generate a new RSA key pair of `bits` modulus size.
pub fn generate_key_pair(bits: usize) -> Result<KeyPairPem> {
    let private_key = RsaPrivateKey::new(&mut OsRng, bits)
        .map_err(|e| ReplicatorError::Crypto(format!("Key generation error: {}", e)))?;
    let public_key = RsaPublicKey::from(&private_key);

    let private_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| ReplicatorError::Crypto(format!("Private key encoding error: {}", e)))?;
    let public_pem = public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| ReplicatorError::Crypto(format!("Public key encoding error: {}", e)))?;

    Ok(KeyPairPem {
        private_pem,
        public_pem,
    })
}
