pub mod config;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod hybrid;
pub mod key_manager;
pub mod listener;
pub mod provision;
pub mod replicator;
pub mod sender;
pub mod shutdown;
pub mod storage;

pub use config::Config;
pub use crypto::{AesGcmCipher, SealedData, SecureKey, AES_256_KEY_SIZE, NONCE_SIZE, TAG_SIZE};
pub use envelope::{EncryptedEnvelope, Operation, ENVELOPE_VERSION};
pub use error::{ReplicatorError, Result};
pub use hybrid::{generate_key_pair, HybridDecryptor, HybridEncryptor, KeyPairPem, DEFAULT_RSA_BITS};
pub use key_manager::{KeyInfo, KeyRotationManager};
pub use listener::{
    parse_notification, ChangeEvent, ChangeHandler, ChangeListener, ChannelSource, ListenStats,
    NotificationSource, PgNotificationSource,
};
pub use provision::{install_trigger, trigger_sql};
pub use replicator::{Replicator, ReplicatorState, RunSummary};
pub use sender::{DeliverySender, DeliveryStats, RetryPolicy, SendResult, SenderConfig};
pub use shutdown::ShutdownToken;
pub use storage::{FsKeyStore, InMemoryKeyStore, KeyStore, StoredKeyPair};
