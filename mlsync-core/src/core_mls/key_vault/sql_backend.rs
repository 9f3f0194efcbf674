//! Encrypted vault backend on the shared SQLite store
//!
//! Values are sealed with ChaCha20Poly1305 before they reach disk. Each
//! namespace gets its own key, derived from the master key with HKDF-SHA256,
//! and the item name is bound as associated data so a value cannot be moved
//! to another slot.
//!
//! Stored layout: nonce (12 bytes) || ciphertext.

use async_trait::async_trait;
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rusqlite::params;
use sha2::Sha256;
use std::sync::Arc;
use zeroize::Zeroizing;

use super::VaultBackend;
use crate::core_mls::clock::{Clock, SystemClock};
use crate::core_mls::errors::{MlsError, MlsResult};
use crate::core_mls::storage::SqlStateStore;

const VAULT_KEY_DOMAIN: &[u8] = b"mlsync-vault-item-key-v1";
const NONCE_LEN: usize = 12;

pub struct SqlVaultBackend {
    store: Arc<SqlStateStore>,
    master_key: Zeroizing<[u8; 32]>,
    clock: Arc<dyn Clock>,
}

impl SqlVaultBackend {
    pub fn new(store: Arc<SqlStateStore>, master_key: [u8; 32]) -> Self {
        Self {
            store,
            master_key: Zeroizing::new(master_key),
            clock: Arc::new(SystemClock),
        }
    }

    /// Timestamp items with `clock` instead of the system time
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn cipher_for(&self, namespace: &str) -> MlsResult<ChaCha20Poly1305> {
        let hkdf = Hkdf::<Sha256>::new(Some(namespace.as_bytes()), self.master_key.as_ref());
        let mut key = Zeroizing::new([0u8; 32]);
        hkdf.expand(VAULT_KEY_DOMAIN, key.as_mut())
            .map_err(|e| MlsError::Crypto(format!("Vault key derivation failed: {}", e)))?;
        Ok(ChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(
            key.as_ref(),
        )))
    }

    fn seal(&self, namespace: &str, item: &str, value: &[u8]) -> MlsResult<Vec<u8>> {
        let cipher = self.cipher_for(namespace)?;
        let nonce = ChaCha20Poly1305::generate_nonce(OsRng);
        let ciphertext = cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: value,
                    aad: item.as_bytes(),
                },
            )
            .map_err(|e| MlsError::Crypto(format!("Failed to seal vault item: {}", e)))?;

        let mut sealed = nonce.to_vec();
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn open(&self, namespace: &str, item: &str, sealed: &[u8]) -> MlsResult<Zeroizing<Vec<u8>>> {
        if sealed.len() < NONCE_LEN {
            return Err(MlsError::Crypto("Vault item too short".to_string()));
        }
        let cipher = self.cipher_for(namespace)?;
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: item.as_bytes(),
                },
            )
            .map_err(|e| MlsError::Crypto(format!("Failed to open vault item: {}", e)))?;
        Ok(Zeroizing::new(plaintext))
    }
}

#[async_trait]
impl VaultBackend for SqlVaultBackend {
    async fn put(&self, namespace: &str, item: &str, value: &[u8]) -> MlsResult<()> {
        let sealed = self.seal(namespace, item, value)?;
        let ns = namespace.to_string();
        let item = item.to_string();
        let now = self.clock.now_millis();

        self.store
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT INTO vault_items (namespace, item, value, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?4)
                     ON CONFLICT(namespace, item) DO UPDATE
                        SET value = excluded.value, updated_at = excluded.updated_at",
                    params![ns, item, sealed, now],
                )?;
                Ok(())
            })
            .await
    }

    async fn get(&self, namespace: &str, item: &str) -> MlsResult<Option<Zeroizing<Vec<u8>>>> {
        let ns = namespace.to_string();
        let it = item.to_string();

        let sealed = self
            .store
            .with_conn(move |conn| {
                use rusqlite::OptionalExtension;
                let value = conn
                    .query_row(
                        "SELECT value FROM vault_items WHERE namespace = ?1 AND item = ?2",
                        params![ns, it],
                        |row| row.get::<_, Vec<u8>>(0),
                    )
                    .optional()?;
                Ok(value)
            })
            .await?;

        sealed
            .map(|sealed| self.open(namespace, item, &sealed))
            .transpose()
    }

    async fn delete(&self, namespace: &str, item: &str) -> MlsResult<bool> {
        let ns = namespace.to_string();
        let item = item.to_string();

        self.store
            .with_conn(move |conn| {
                let deleted = conn.execute(
                    "DELETE FROM vault_items WHERE namespace = ?1 AND item = ?2",
                    params![ns, item],
                )?;
                Ok(deleted == 1)
            })
            .await
    }

    async fn list_items(&self, namespace: &str, prefix: &str) -> MlsResult<Vec<String>> {
        let ns = namespace.to_string();
        let prefix = prefix.to_string();

        self.store
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT item FROM vault_items
                     WHERE namespace = ?1 AND substr(item, 1, length(?2)) = ?2
                     ORDER BY item ASC",
                )?;
                let items = stmt
                    .query_map(params![ns, prefix], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(items)
            })
            .await
    }

    async fn delete_namespaces_with_prefix(&self, prefix: &str) -> MlsResult<usize> {
        let prefix = prefix.to_string();

        self.store
            .with_conn(move |conn| {
                let deleted = conn.execute(
                    "DELETE FROM vault_items WHERE substr(namespace, 1, length(?1)) = ?1",
                    params![prefix],
                )?;
                Ok(deleted)
            })
            .await
    }
}
