//! Key package publication and refresh

use tracing::{debug, info};

use super::GroupStateManager;
use crate::core_mls::clock::duration_millis;
use crate::core_mls::errors::{MlsError, MlsResult};
use crate::core_mls::events::GroupEvent;

/// A key package the server accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedKeyPackage {
    pub key_package_ref: String,
    pub expires_at: i64,
}

impl GroupStateManager {
    /// Create and publish a key package
    ///
    /// Expiry defaults to now plus the configured lifetime. The HPKE private
    /// key goes to the vault under the package's hash reference before the
    /// package is published, and is removed again if publishing fails.
    pub async fn publish_key_package(
        &self,
        expires_at: Option<i64>,
    ) -> MlsResult<PublishedKeyPackage> {
        let identity = self.identity()?;
        let now = self.clock.now_millis();
        let expires_at =
            expires_at.unwrap_or_else(|| now + duration_millis(self.config.key_packages.lifetime));
        if expires_at <= now {
            return Err(MlsError::InvalidMessage(format!(
                "key package expiry {} is not in the future",
                expires_at
            )));
        }

        let bundle = self.engine.create_key_package(identity).await?;
        let key_package_id = hex::encode(&bundle.hash_ref);
        self.vault
            .store_hpke_private_key(&key_package_id, &bundle.hpke_private_key)
            .await?;

        let cipher_suite = &self.config.key_packages.cipher_suite;
        let published = self
            .api
            .publish_key_package(&self.user_did, bundle.key_package, cipher_suite, Some(expires_at))
            .await;
        let key_package_ref = match published {
            Ok(r) => r,
            Err(e) => {
                self.vault.delete_hpke_private_key(&key_package_id).await?;
                return Err(e);
            }
        };

        self.store
            .insert_key_package(&key_package_ref, &self.user_did, cipher_suite, now, expires_at)
            .await?;

        self.emit(GroupEvent::KeyPackagePublished {
            key_package_ref: key_package_ref.clone(),
            expires_at,
        });
        info!(key_package_ref = %key_package_ref, expires_at, "Key package published");

        Ok(PublishedKeyPackage {
            key_package_ref,
            expires_at,
        })
    }

    /// Publish a fresh key package when none exists or the newest one
    /// expires within the refresh window
    pub async fn refresh_key_packages_if_needed(&self) -> MlsResult<Option<PublishedKeyPackage>> {
        let now = self.clock.now_millis();
        let window = duration_millis(self.config.key_packages.refresh_window);

        match self.store.latest_key_package_expiry(&self.user_did).await? {
            Some(expires_at) if expires_at - now > window => {
                debug!(expires_at, "Key package still fresh");
                Ok(None)
            }
            latest => {
                info!(latest_expiry = ?latest, "Refreshing key package");
                self.publish_key_package(None).await.map(Some)
            }
        }
    }
}
