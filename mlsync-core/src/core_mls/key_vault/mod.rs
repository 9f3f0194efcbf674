//! Key vault
//!
//! Namespaced storage for per-conversation and per-key-package secrets.
//!
//! Namespaces are built from hex-encoded components, so ids containing the
//! separator can never make two namespaces collide:
//!
//! ```text
//! convo:<hex conversation id>:<hex user did>
//! keypackage:<hex key package id>
//! ```
//!
//! Epoch-indexed items carry a zero-padded epoch so that lexicographic order
//! matches numeric order.

mod memory_backend;
mod sql_backend;

pub use memory_backend::MemoryVaultBackend;
pub use sql_backend::SqlVaultBackend;

use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use tracing::debug;
use zeroize::Zeroizing;

use crate::core_mls::errors::{MlsError, MlsResult};

const ITEM_GROUP_STATE: &str = "groupState";
const ITEM_SIGNATURE_KEY: &str = "signatureKey";
const ITEM_ENCRYPTION_KEY: &str = "encryptionKey";
const ITEM_CURRENT_EPOCH: &str = "currentEpoch";
const ITEM_HPKE_PRIVATE_KEY: &str = "hpkePrivateKey";
const PREFIX_PRIVATE_KEY: &str = "privateKey.";
const PREFIX_EPOCH_SECRET: &str = "epochSecret.";
const PREFIX_ARCHIVE: &str = "archive.";

/// Raw storage used by [`KeyVault`]
///
/// `get` on a missing item returns `Ok(None)`; `put` overwrites.
#[async_trait]
pub trait VaultBackend: Send + Sync {
    async fn put(&self, namespace: &str, item: &str, value: &[u8]) -> MlsResult<()>;

    async fn get(&self, namespace: &str, item: &str) -> MlsResult<Option<Zeroizing<Vec<u8>>>>;

    async fn delete(&self, namespace: &str, item: &str) -> MlsResult<bool>;

    /// Item names in `namespace` starting with `prefix`
    async fn list_items(&self, namespace: &str, prefix: &str) -> MlsResult<Vec<String>>;

    /// Remove every item of every namespace starting with `prefix`
    async fn delete_namespaces_with_prefix(&self, prefix: &str) -> MlsResult<usize>;
}

/// Snapshot of a key retired by an epoch transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedKey {
    pub key_type: String,
    pub conversation_id: String,
    pub epoch: u64,
    pub material: Zeroizing<Vec<u8>>,
}

pub struct KeyVault {
    backend: Arc<dyn VaultBackend>,
}

impl KeyVault {
    pub fn new(backend: Arc<dyn VaultBackend>) -> Self {
        Self { backend }
    }

    /// Vault over a fresh in-memory backend
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryVaultBackend::new()))
    }

    // Group state

    pub async fn store_group_state(
        &self,
        conversation_id: &str,
        user_did: &str,
        state: &[u8],
    ) -> MlsResult<()> {
        self.put_convo(conversation_id, user_did, ITEM_GROUP_STATE, state).await
    }

    pub async fn retrieve_group_state(
        &self,
        conversation_id: &str,
        user_did: &str,
    ) -> MlsResult<Option<Zeroizing<Vec<u8>>>> {
        self.get_convo(conversation_id, user_did, ITEM_GROUP_STATE).await
    }

    pub async fn delete_group_state(
        &self,
        conversation_id: &str,
        user_did: &str,
    ) -> MlsResult<bool> {
        self.delete_convo(conversation_id, user_did, ITEM_GROUP_STATE).await
    }

    // Per-epoch private keys

    pub async fn store_private_key(
        &self,
        conversation_id: &str,
        user_did: &str,
        epoch: u64,
        key: &[u8],
    ) -> MlsResult<()> {
        self.put_convo(conversation_id, user_did, &epoch_item(PREFIX_PRIVATE_KEY, epoch), key)
            .await
    }

    pub async fn retrieve_private_key(
        &self,
        conversation_id: &str,
        user_did: &str,
        epoch: u64,
    ) -> MlsResult<Option<Zeroizing<Vec<u8>>>> {
        self.get_convo(conversation_id, user_did, &epoch_item(PREFIX_PRIVATE_KEY, epoch))
            .await
    }

    pub async fn delete_private_key(
        &self,
        conversation_id: &str,
        user_did: &str,
        epoch: u64,
    ) -> MlsResult<bool> {
        self.delete_convo(conversation_id, user_did, &epoch_item(PREFIX_PRIVATE_KEY, epoch))
            .await
    }

    /// Delete private keys of every epoch strictly below `epoch`
    pub async fn delete_private_keys_before(
        &self,
        conversation_id: &str,
        user_did: &str,
        epoch: u64,
    ) -> MlsResult<usize> {
        self.delete_epochs_before(conversation_id, user_did, PREFIX_PRIVATE_KEY, epoch)
            .await
    }

    // Long-lived keys

    pub async fn store_signature_key(
        &self,
        conversation_id: &str,
        user_did: &str,
        key: &[u8],
    ) -> MlsResult<()> {
        self.put_convo(conversation_id, user_did, ITEM_SIGNATURE_KEY, key).await
    }

    pub async fn retrieve_signature_key(
        &self,
        conversation_id: &str,
        user_did: &str,
    ) -> MlsResult<Option<Zeroizing<Vec<u8>>>> {
        self.get_convo(conversation_id, user_did, ITEM_SIGNATURE_KEY).await
    }

    pub async fn delete_signature_key(
        &self,
        conversation_id: &str,
        user_did: &str,
    ) -> MlsResult<bool> {
        self.delete_convo(conversation_id, user_did, ITEM_SIGNATURE_KEY).await
    }

    pub async fn store_encryption_key(
        &self,
        conversation_id: &str,
        user_did: &str,
        key: &[u8],
    ) -> MlsResult<()> {
        self.put_convo(conversation_id, user_did, ITEM_ENCRYPTION_KEY, key).await
    }

    pub async fn retrieve_encryption_key(
        &self,
        conversation_id: &str,
        user_did: &str,
    ) -> MlsResult<Option<Zeroizing<Vec<u8>>>> {
        self.get_convo(conversation_id, user_did, ITEM_ENCRYPTION_KEY).await
    }

    pub async fn delete_encryption_key(
        &self,
        conversation_id: &str,
        user_did: &str,
    ) -> MlsResult<bool> {
        self.delete_convo(conversation_id, user_did, ITEM_ENCRYPTION_KEY).await
    }

    // Epoch secrets

    pub async fn store_epoch_secret(
        &self,
        conversation_id: &str,
        user_did: &str,
        epoch: u64,
        secret: &[u8],
    ) -> MlsResult<()> {
        self.put_convo(conversation_id, user_did, &epoch_item(PREFIX_EPOCH_SECRET, epoch), secret)
            .await
    }

    pub async fn retrieve_epoch_secret(
        &self,
        conversation_id: &str,
        user_did: &str,
        epoch: u64,
    ) -> MlsResult<Option<Zeroizing<Vec<u8>>>> {
        self.get_convo(conversation_id, user_did, &epoch_item(PREFIX_EPOCH_SECRET, epoch))
            .await
    }

    pub async fn delete_epoch_secret(
        &self,
        conversation_id: &str,
        user_did: &str,
        epoch: u64,
    ) -> MlsResult<bool> {
        self.delete_convo(conversation_id, user_did, &epoch_item(PREFIX_EPOCH_SECRET, epoch))
            .await
    }

    pub async fn delete_epoch_secrets_before(
        &self,
        conversation_id: &str,
        user_did: &str,
        epoch: u64,
    ) -> MlsResult<usize> {
        self.delete_epochs_before(conversation_id, user_did, PREFIX_EPOCH_SECRET, epoch)
            .await
    }

    // Current epoch marker

    pub async fn set_current_epoch(
        &self,
        conversation_id: &str,
        user_did: &str,
        epoch: u64,
    ) -> MlsResult<()> {
        self.put_convo(conversation_id, user_did, ITEM_CURRENT_EPOCH, &epoch.to_be_bytes())
            .await
    }

    pub async fn current_epoch(
        &self,
        conversation_id: &str,
        user_did: &str,
    ) -> MlsResult<Option<u64>> {
        let Some(raw) = self.get_convo(conversation_id, user_did, ITEM_CURRENT_EPOCH).await? else {
            return Ok(None);
        };
        let bytes: [u8; 8] = raw
            .as_slice()
            .try_into()
            .map_err(|_| MlsError::Storage("corrupt currentEpoch item".to_string()))?;
        Ok(Some(u64::from_be_bytes(bytes)))
    }

    pub async fn delete_current_epoch(
        &self,
        conversation_id: &str,
        user_did: &str,
    ) -> MlsResult<bool> {
        self.delete_convo(conversation_id, user_did, ITEM_CURRENT_EPOCH).await
    }

    // HPKE init keys, scoped by key package

    pub async fn store_hpke_private_key(&self, key_package_id: &str, key: &[u8]) -> MlsResult<()> {
        self.backend
            .put(&key_package_namespace(key_package_id), ITEM_HPKE_PRIVATE_KEY, key)
            .await
    }

    pub async fn retrieve_hpke_private_key(
        &self,
        key_package_id: &str,
    ) -> MlsResult<Option<Zeroizing<Vec<u8>>>> {
        self.backend
            .get(&key_package_namespace(key_package_id), ITEM_HPKE_PRIVATE_KEY)
            .await
    }

    pub async fn delete_hpke_private_key(&self, key_package_id: &str) -> MlsResult<bool> {
        self.backend
            .delete(&key_package_namespace(key_package_id), ITEM_HPKE_PRIVATE_KEY)
            .await
    }

    // Archived snapshots

    pub async fn archive_key(&self, user_did: &str, archived: &ArchivedKey) -> MlsResult<()> {
        let item = archive_item(&archived.key_type, archived.epoch);
        self.put_convo(&archived.conversation_id, user_did, &item, &archived.material)
            .await
    }

    pub async fn retrieve_archived_key(
        &self,
        conversation_id: &str,
        user_did: &str,
        key_type: &str,
        epoch: u64,
    ) -> MlsResult<Option<ArchivedKey>> {
        let item = archive_item(key_type, epoch);
        Ok(self
            .get_convo(conversation_id, user_did, &item)
            .await?
            .map(|material| ArchivedKey {
                key_type: key_type.to_string(),
                conversation_id: conversation_id.to_string(),
                epoch,
                material,
            }))
    }

    /// Archived epochs of one key type, ascending
    pub async fn archived_epochs(
        &self,
        conversation_id: &str,
        user_did: &str,
        key_type: &str,
    ) -> MlsResult<Vec<u64>> {
        let prefix = format!("{}{}.", PREFIX_ARCHIVE, key_type);
        let items = self
            .backend
            .list_items(&convo_namespace(conversation_id, user_did), &prefix)
            .await?;
        Ok(items
            .iter()
            .filter_map(|item| parse_epoch(item, &prefix))
            .collect())
    }

    /// Remove everything stored for a conversation, for every user
    pub async fn delete_all_keys(&self, conversation_id: &str) -> MlsResult<usize> {
        let deleted = self
            .backend
            .delete_namespaces_with_prefix(&convo_namespace_prefix(conversation_id))
            .await?;
        debug!(conversation_id = %conversation_id, deleted, "Deleted conversation keys");
        Ok(deleted)
    }

    /// `length` bytes from the thread-local CSPRNG
    pub fn generate_secure_random_key(length: usize) -> Zeroizing<Vec<u8>> {
        let mut key = Zeroizing::new(vec![0u8; length]);
        rand::rng().fill(key.as_mut_slice());
        key
    }

    async fn put_convo(
        &self,
        conversation_id: &str,
        user_did: &str,
        item: &str,
        value: &[u8],
    ) -> MlsResult<()> {
        self.backend
            .put(&convo_namespace(conversation_id, user_did), item, value)
            .await
    }

    async fn get_convo(
        &self,
        conversation_id: &str,
        user_did: &str,
        item: &str,
    ) -> MlsResult<Option<Zeroizing<Vec<u8>>>> {
        self.backend
            .get(&convo_namespace(conversation_id, user_did), item)
            .await
    }

    async fn delete_convo(
        &self,
        conversation_id: &str,
        user_did: &str,
        item: &str,
    ) -> MlsResult<bool> {
        self.backend
            .delete(&convo_namespace(conversation_id, user_did), item)
            .await
    }

    async fn delete_epochs_before(
        &self,
        conversation_id: &str,
        user_did: &str,
        prefix: &str,
        epoch: u64,
    ) -> MlsResult<usize> {
        let namespace = convo_namespace(conversation_id, user_did);
        let mut deleted = 0;
        for item in self.backend.list_items(&namespace, prefix).await? {
            if parse_epoch(&item, prefix).is_some_and(|e| e < epoch)
                && self.backend.delete(&namespace, &item).await?
            {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

fn convo_namespace_prefix(conversation_id: &str) -> String {
    format!("convo:{}:", hex::encode(conversation_id))
}

fn convo_namespace(conversation_id: &str, user_did: &str) -> String {
    format!("{}{}", convo_namespace_prefix(conversation_id), hex::encode(user_did))
}

fn key_package_namespace(key_package_id: &str) -> String {
    format!("keypackage:{}", hex::encode(key_package_id))
}

fn epoch_item(prefix: &str, epoch: u64) -> String {
    format!("{}{:020}", prefix, epoch)
}

fn archive_item(key_type: &str, epoch: u64) -> String {
    format!("{}{}.{:020}", PREFIX_ARCHIVE, key_type, epoch)
}

fn parse_epoch(item: &str, prefix: &str) -> Option<u64> {
    item.strip_prefix(prefix)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::core_mls::storage::SqlStateStore;
    use std::collections::HashSet;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_missing_items_are_none() {
        let vault = KeyVault::in_memory();
        assert!(vault.retrieve_group_state("c1", "u").await.unwrap().is_none());
        assert!(vault.retrieve_private_key("c1", "u", 3).await.unwrap().is_none());
        assert!(vault.current_epoch("c1", "u").await.unwrap().is_none());
        assert!(vault.retrieve_hpke_private_key("kp").await.unwrap().is_none());
        assert!(!vault.delete_signature_key("c1", "u").await.unwrap());
    }

    #[tokio::test]
    async fn test_store_is_upsert() {
        let vault = KeyVault::in_memory();
        vault.store_signature_key("c1", "u", b"first").await.unwrap();
        vault.store_signature_key("c1", "u", b"second").await.unwrap();
        let key = vault.retrieve_signature_key("c1", "u").await.unwrap().unwrap();
        assert_eq!(key.as_slice(), b"second");
    }

    #[tokio::test]
    async fn test_delete_private_keys_before() {
        let vault = KeyVault::in_memory();
        for epoch in [1, 2, 9, 10, 11] {
            vault
                .store_private_key("c1", "u", epoch, &[epoch as u8])
                .await
                .unwrap();
        }

        assert_eq!(vault.delete_private_keys_before("c1", "u", 10).await.unwrap(), 3);
        assert!(vault.retrieve_private_key("c1", "u", 9).await.unwrap().is_none());
        assert!(vault.retrieve_private_key("c1", "u", 10).await.unwrap().is_some());
        assert!(vault.retrieve_private_key("c1", "u", 11).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_all_keys_is_isolated_per_conversation() {
        let vault = KeyVault::in_memory();
        vault.store_encryption_key("A", "u", b"a-key").await.unwrap();
        vault.set_current_epoch("A", "u", 4).await.unwrap();
        vault.store_epoch_secret("A", "other", 1, b"s").await.unwrap();
        vault.store_encryption_key("B", "u", b"b-key").await.unwrap();
        // Shares a textual prefix with "A"
        vault.store_encryption_key("AB", "u", b"ab-key").await.unwrap();

        assert_eq!(vault.delete_all_keys("A").await.unwrap(), 3);
        assert!(vault.retrieve_encryption_key("A", "u").await.unwrap().is_none());
        assert!(vault.current_epoch("A", "u").await.unwrap().is_none());
        assert_eq!(
            vault.retrieve_encryption_key("B", "u").await.unwrap().unwrap().as_slice(),
            b"b-key"
        );
        assert!(vault.retrieve_encryption_key("AB", "u").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_separator_in_ids_cannot_collide() {
        let vault = KeyVault::in_memory();
        vault.store_signature_key("a:b", "c", b"one").await.unwrap();
        vault.store_signature_key("a", "b:c", b"two").await.unwrap();

        assert_eq!(
            vault.retrieve_signature_key("a:b", "c").await.unwrap().unwrap().as_slice(),
            b"one"
        );
        assert_eq!(
            vault.retrieve_signature_key("a", "b:c").await.unwrap().unwrap().as_slice(),
            b"two"
        );
    }

    #[tokio::test]
    async fn test_archive_and_current_epoch() {
        let vault = KeyVault::in_memory();
        for epoch in [3, 1, 2] {
            vault
                .archive_key(
                    "u",
                    &ArchivedKey {
                        key_type: "epochSecret".into(),
                        conversation_id: "c1".into(),
                        epoch,
                        material: Zeroizing::new(vec![epoch as u8; 4]),
                    },
                )
                .await
                .unwrap();
        }
        assert_eq!(
            vault.archived_epochs("c1", "u", "epochSecret").await.unwrap(),
            vec![1, 2, 3]
        );
        let archived = vault
            .retrieve_archived_key("c1", "u", "epochSecret", 2)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(archived.material.as_slice(), &[2, 2, 2, 2]);

        vault.set_current_epoch("c1", "u", 12).await.unwrap();
        assert_eq!(vault.current_epoch("c1", "u").await.unwrap(), Some(12));
    }

    #[test]
    fn test_random_keys_do_not_repeat() {
        let keys: HashSet<Vec<u8>> = (0..256)
            .map(|_| KeyVault::generate_secure_random_key(32).to_vec())
            .collect();
        assert_eq!(keys.len(), 256);
        assert_eq!(KeyVault::generate_secure_random_key(17).len(), 17);
    }

    #[tokio::test]
    async fn test_sql_backend_isolation() {
        let dir = tempdir().unwrap();
        let store = Arc::new(
            SqlStateStore::open(dir.path().join("vault.db"), &StoreConfig::default()).unwrap(),
        );
        let vault = KeyVault::new(Arc::new(SqlVaultBackend::new(store, [3u8; 32])));

        vault.store_group_state("A", "u", b"state-a").await.unwrap();
        vault.store_group_state("B", "u", b"state-b").await.unwrap();
        vault.store_hpke_private_key("kp1", b"hpke").await.unwrap();

        vault.delete_all_keys("A").await.unwrap();
        assert!(vault.retrieve_group_state("A", "u").await.unwrap().is_none());
        assert_eq!(
            vault.retrieve_group_state("B", "u").await.unwrap().unwrap().as_slice(),
            b"state-b"
        );
        assert!(vault.retrieve_hpke_private_key("kp1").await.unwrap().is_some());
    }
}
