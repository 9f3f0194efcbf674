//! In-memory vault backend for tests and ephemeral sessions

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use zeroize::Zeroizing;

use super::VaultBackend;
use crate::core_mls::errors::MlsResult;

#[derive(Default)]
pub struct MemoryVaultBackend {
    items: RwLock<BTreeMap<(String, String), Zeroizing<Vec<u8>>>>,
}

impl MemoryVaultBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VaultBackend for MemoryVaultBackend {
    async fn put(&self, namespace: &str, item: &str, value: &[u8]) -> MlsResult<()> {
        self.items.write().await.insert(
            (namespace.to_string(), item.to_string()),
            Zeroizing::new(value.to_vec()),
        );
        Ok(())
    }

    async fn get(&self, namespace: &str, item: &str) -> MlsResult<Option<Zeroizing<Vec<u8>>>> {
        Ok(self
            .items
            .read()
            .await
            .get(&(namespace.to_string(), item.to_string()))
            .cloned())
    }

    async fn delete(&self, namespace: &str, item: &str) -> MlsResult<bool> {
        Ok(self
            .items
            .write()
            .await
            .remove(&(namespace.to_string(), item.to_string()))
            .is_some())
    }

    async fn list_items(&self, namespace: &str, prefix: &str) -> MlsResult<Vec<String>> {
        Ok(self
            .items
            .read()
            .await
            .keys()
            .filter(|(ns, item)| ns == namespace && item.starts_with(prefix))
            .map(|(_, item)| item.clone())
            .collect())
    }

    async fn delete_namespaces_with_prefix(&self, prefix: &str) -> MlsResult<usize> {
        let mut items = self.items.write().await;
        let before = items.len();
        items.retain(|(ns, _), _| !ns.starts_with(prefix));
        Ok(before - items.len())
    }
}
