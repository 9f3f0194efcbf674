//! Cryptographic group engine trait

use crate::core_mls::errors::MlsResult;
use crate::core_mls::types::GroupConfig;
use async_trait::async_trait;
use zeroize::Zeroizing;

/// Freshly generated key package
pub struct KeyPackageBundle {
    /// Serialized public key package, uploaded to the server
    pub key_package: Vec<u8>,
    /// Stable reference to the package (hash of its contents)
    pub hash_ref: Vec<u8>,
    /// Init private key; must be kept until the package is consumed
    pub hpke_private_key: Zeroizing<Vec<u8>>,
}

/// A commit that has been created but not yet merged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedCommit {
    pub commit: Vec<u8>,
    pub welcome: Option<Vec<u8>>,
    /// Epoch the group moves to once the commit is merged
    pub new_epoch: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedMessage {
    pub plaintext: Vec<u8>,
    /// Epoch the ciphertext was produced in
    pub epoch: u64,
}

/// MLS group operations
///
/// Commit-producing operations only *stage* their commit. The caller merges
/// it with [`CryptoEngine::merge_pending_commit`] after the server accepted
/// it, or drops it with [`CryptoEngine::clear_pending_commit`].
#[async_trait]
pub trait CryptoEngine: Send + Sync {
    /// Create a new group at epoch 0 and return its id
    async fn create_group(
        &self,
        identity: &[u8],
        group_id: Option<&[u8]>,
        config: &GroupConfig,
    ) -> MlsResult<Vec<u8>>;

    async fn create_key_package(&self, identity: &[u8]) -> MlsResult<KeyPackageBundle>;

    /// Stage a commit adding the owners of `key_packages`
    async fn add_members(&self, group_id: &[u8], key_packages: &[Vec<u8>])
        -> MlsResult<StagedCommit>;

    /// Apply the staged commit and return the new epoch
    async fn merge_pending_commit(&self, group_id: &[u8]) -> MlsResult<u64>;

    async fn clear_pending_commit(&self, group_id: &[u8]) -> MlsResult<()>;

    /// Join a group from a Welcome and return its id
    async fn process_welcome(
        &self,
        welcome: &[u8],
        identity: &[u8],
        config: &GroupConfig,
    ) -> MlsResult<Vec<u8>>;

    /// Apply a commit produced by another member and return the new epoch
    async fn process_commit(&self, group_id: &[u8], commit: &[u8]) -> MlsResult<u64>;

    async fn encrypt_message(&self, group_id: &[u8], plaintext: &[u8]) -> MlsResult<Vec<u8>>;

    async fn decrypt_message(&self, group_id: &[u8], ciphertext: &[u8])
        -> MlsResult<DecryptedMessage>;

    /// Export a secret bound to the current epoch
    async fn export_secret(
        &self,
        group_id: &[u8],
        label: &str,
        context: &[u8],
        length: usize,
    ) -> MlsResult<Zeroizing<Vec<u8>>>;

    async fn epoch(&self, group_id: &[u8]) -> MlsResult<u64>;

    async fn group_exists(&self, group_id: &[u8]) -> bool;

    async fn delete_group(&self, group_id: &[u8]) -> MlsResult<()>;

    /// Serialize the full group state for persistence
    async fn export_group_state(&self, group_id: &[u8]) -> MlsResult<Zeroizing<Vec<u8>>>;

    /// Load a group state produced by [`CryptoEngine::export_group_state`]
    async fn import_group_state(&self, state: &[u8]) -> MlsResult<Vec<u8>>;
}
