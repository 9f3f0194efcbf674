//! Group state manager
//!
//! Owns conversation records and drives every operation that changes them:
//! create, join, add members, leave, send, receive and server sync. It ties
//! the other subsystems together:
//!
//! - inbound traffic passes the [`SequenceCoordinator`] gate before it is
//!   decrypted, and failures go to the [`RecoveryCoordinator`];
//! - every epoch transition archives the outgoing epoch secret, records the
//!   new one in the [`KeyVault`] and prunes keys that fell out of the
//!   retention window;
//! - observers are notified through an [`ObserverRegistry`].
//!
//! Mutating operations on one conversation are serialized within a process
//! by a per-conversation async mutex. Across processes the store's
//! conditional writes are the only guarantee.

mod key_packages;
mod lifecycle;
mod messaging;
mod sync;

pub use key_packages::PublishedKeyPackage;
pub use messaging::InboundOutcome;
pub use sync::SyncOutcome;

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::config::Config;
use crate::core_mls::clock::{Clock, SystemClock};
use crate::core_mls::errors::{MlsError, MlsResult};
use crate::core_mls::events::{GroupEvent, ObserverRegistry, ObserverToken, Subscription};
use crate::core_mls::key_vault::{ArchivedKey, KeyVault, SqlVaultBackend};
use crate::core_mls::recovery::RecoveryCoordinator;
use crate::core_mls::sequencer::SequenceCoordinator;
use crate::core_mls::storage::SqlStateStore;
use crate::core_mls::traits::{ApiClient, CryptoEngine};
use crate::core_mls::types::{Conversation, ConversationState};
use crate::metrics::{record_counter, COMMITS_DISCARDED};

/// Exporter label for the per-epoch secret kept in the vault
const EPOCH_SECRET_LABEL: &str = "mlsync epoch secret";
const EPOCH_SECRET_LEN: usize = 32;
const ARCHIVE_EPOCH_SECRET: &str = "epochSecret";

/// Collaborators injected into a [`GroupStateManager`]
#[derive(Clone)]
pub struct ManagerDeps {
    pub store: Arc<SqlStateStore>,
    pub vault: Arc<KeyVault>,
    pub engine: Arc<dyn CryptoEngine>,
    pub api: Arc<dyn ApiClient>,
    pub clock: Arc<dyn Clock>,
}

pub struct GroupStateManager {
    user_did: String,
    config: Config,
    store: Arc<SqlStateStore>,
    vault: Arc<KeyVault>,
    engine: Arc<dyn CryptoEngine>,
    api: Arc<dyn ApiClient>,
    clock: Arc<dyn Clock>,
    sequencer: SequenceCoordinator,
    recovery: RecoveryCoordinator,
    observers: ObserverRegistry,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    sync_in_flight: AtomicBool,
    cancel: CancellationToken,
}

impl GroupStateManager {
    pub fn new(user_did: impl Into<String>, config: Config, deps: ManagerDeps) -> Self {
        let user_did = user_did.into();
        let sequencer =
            SequenceCoordinator::new(deps.store.clone(), deps.clock.clone(), &config.sequencing);
        let recovery = RecoveryCoordinator::new(
            deps.store.clone(),
            deps.api.clone(),
            deps.clock.clone(),
            config.recovery.clone(),
            user_did.clone(),
        );

        Self {
            user_did,
            config,
            store: deps.store,
            vault: deps.vault,
            engine: deps.engine,
            api: deps.api,
            clock: deps.clock,
            sequencer,
            recovery,
            observers: ObserverRegistry::new(),
            locks: Mutex::new(HashMap::new()),
            sync_in_flight: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    /// Open the configured database and an encrypted vault on top of it
    pub fn open(
        user_did: impl Into<String>,
        config: Config,
        engine: Arc<dyn CryptoEngine>,
        api: Arc<dyn ApiClient>,
        vault_key: [u8; 32],
    ) -> MlsResult<Self> {
        let store = Arc::new(SqlStateStore::open_with_config(&config.store)?);
        let vault = Arc::new(KeyVault::new(Arc::new(SqlVaultBackend::new(
            store.clone(),
            vault_key,
        ))));

        Ok(Self::new(
            user_did,
            config,
            ManagerDeps {
                store,
                vault,
                engine,
                api,
                clock: Arc::new(SystemClock),
            },
        ))
    }

    pub fn user_did(&self) -> &str {
        &self.user_did
    }

    pub fn sequencer(&self) -> &SequenceCoordinator {
        &self.sequencer
    }

    pub fn recovery(&self) -> &RecoveryCoordinator {
        &self.recovery
    }

    pub fn vault(&self) -> &KeyVault {
        &self.vault
    }

    pub fn subscribe(&self) -> Subscription {
        self.observers.subscribe()
    }

    pub fn unsubscribe(&self, token: ObserverToken) -> bool {
        self.observers.unsubscribe(token)
    }

    /// Share a cancellation token owned by the host application
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that stops long-running operations at their next checkpoint
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn conversation(&self, conversation_id: &str) -> MlsResult<Option<Conversation>> {
        self.store
            .get_conversation(conversation_id, &self.user_did)
            .await
    }

    pub async fn conversations(&self) -> MlsResult<Vec<Conversation>> {
        self.store.list_conversations(&self.user_did).await
    }

    pub async fn get_epoch(&self, conversation_id: &str) -> MlsResult<u64> {
        Ok(self.require_conversation(conversation_id).await?.epoch)
    }

    fn identity(&self) -> MlsResult<&[u8]> {
        if self.user_did.is_empty() {
            return Err(MlsError::NoAuthentication);
        }
        Ok(self.user_did.as_bytes())
    }

    fn check_cancelled(&self) -> MlsResult<()> {
        if self.cancel.is_cancelled() {
            return Err(MlsError::Cancelled);
        }
        Ok(())
    }

    fn emit(&self, event: GroupEvent) {
        let delivered = self.observers.emit(event);
        debug!(observers = delivered, "Event emitted");
    }

    async fn lock_conversation(&self, conversation_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(conversation_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    async fn forget_lock(&self, conversation_id: &str) {
        self.locks.lock().await.remove(conversation_id);
    }

    async fn require_conversation(&self, conversation_id: &str) -> MlsResult<Conversation> {
        self.store
            .get_conversation(conversation_id, &self.user_did)
            .await?
            .ok_or_else(|| MlsError::ConversationNotFound(conversation_id.to_string()))
    }

    /// Make sure the engine holds this conversation's group at least at the
    /// stored epoch, importing the vault snapshot a sibling process wrote
    async fn ensure_group_loaded(&self, conversation: &Conversation) -> MlsResult<Vec<u8>> {
        let group_id = conversation.group_id_bytes()?;

        let needs_import = if self.engine.group_exists(&group_id).await {
            self.engine.epoch(&group_id).await? < conversation.epoch
        } else {
            true
        };
        if !needs_import {
            return Ok(group_id);
        }

        match self
            .vault
            .retrieve_group_state(&conversation.conversation_id, &self.user_did)
            .await?
        {
            Some(snapshot) => {
                self.engine.import_group_state(&snapshot).await?;
                debug!(
                    conversation_id = %conversation.conversation_id,
                    "Loaded group state from vault"
                );
                Ok(group_id)
            }
            None if self.engine.group_exists(&group_id).await => Ok(group_id),
            None => Err(MlsError::GroupStateNotFound(
                conversation.conversation_id.clone(),
            )),
        }
    }

    async fn snapshot_group(&self, conversation_id: &str, group_id: &[u8]) -> MlsResult<()> {
        let blob = self.engine.export_group_state(group_id).await?;
        self.vault
            .store_group_state(conversation_id, &self.user_did, &blob)
            .await
    }

    /// Archive the secret of the epoch the engine is about to leave
    async fn archive_outgoing_epoch(
        &self,
        conversation_id: &str,
        group_id: &[u8],
    ) -> MlsResult<()> {
        let epoch = self.engine.epoch(group_id).await?;
        let secret = self
            .engine
            .export_secret(group_id, EPOCH_SECRET_LABEL, &[], EPOCH_SECRET_LEN)
            .await?;
        self.vault
            .archive_key(
                &self.user_did,
                &ArchivedKey {
                    key_type: ARCHIVE_EPOCH_SECRET.to_string(),
                    conversation_id: conversation_id.to_string(),
                    epoch,
                    material: secret,
                },
            )
            .await
    }

    /// Persist an epoch the engine already moved to
    ///
    /// The stored epoch moves `old_epoch → new_epoch` by compare-and-set. If
    /// a sibling process got there first the stored value is only raised,
    /// never lowered.
    async fn commit_epoch(
        &self,
        conversation_id: &str,
        group_id: &[u8],
        old_epoch: u64,
        new_epoch: u64,
    ) -> MlsResult<()> {
        let now = self.clock.now_millis();
        let won = self
            .store
            .compare_and_set_epoch(conversation_id, &self.user_did, old_epoch, new_epoch, now)
            .await?;
        if !won {
            let raised = self
                .store
                .advance_epoch(conversation_id, &self.user_did, new_epoch, now)
                .await?;
            debug!(
                conversation_id = %conversation_id,
                new_epoch,
                raised,
                "Epoch changed concurrently"
            );
        }

        self.record_epoch_keys(conversation_id, group_id, new_epoch)
            .await?;

        self.emit(GroupEvent::EpochUpdated {
            conversation_id: conversation_id.to_string(),
            old_epoch,
            new_epoch,
        });
        Ok(())
    }

    /// Vault bookkeeping for the epoch the engine is now at: its secret,
    /// `currentEpoch`, pruning below the retention window and a fresh
    /// group state snapshot
    async fn record_epoch_keys(
        &self,
        conversation_id: &str,
        group_id: &[u8],
        epoch: u64,
    ) -> MlsResult<()> {
        let secret: Zeroizing<Vec<u8>> = self
            .engine
            .export_secret(group_id, EPOCH_SECRET_LABEL, &[], EPOCH_SECRET_LEN)
            .await?;
        self.vault
            .store_epoch_secret(conversation_id, &self.user_did, epoch, &secret)
            .await?;
        self.vault
            .set_current_epoch(conversation_id, &self.user_did, epoch)
            .await?;

        let floor = epoch.saturating_sub(self.config.recovery.max_past_epochs);
        let pruned_keys = self
            .vault
            .delete_private_keys_before(conversation_id, &self.user_did, floor)
            .await?;
        let pruned_secrets = self
            .vault
            .delete_epoch_secrets_before(conversation_id, &self.user_did, floor)
            .await?;
        if pruned_keys + pruned_secrets > 0 {
            debug!(
                conversation_id = %conversation_id,
                floor,
                pruned_keys,
                pruned_secrets,
                "Pruned expired epoch keys"
            );
        }

        self.snapshot_group(conversation_id, group_id).await?;
        Ok(())
    }

    /// Drop a staged commit after the server refused it
    async fn discard_pending_commit(
        &self,
        conversation_id: &str,
        group_id: &[u8],
        cause: &MlsError,
    ) {
        record_counter(COMMITS_DISCARDED, 1);
        warn!(
            conversation_id = %conversation_id,
            error = %cause,
            retryable = cause.is_retryable(),
            "Discarding pending commit"
        );
        if let Err(e) = self.engine.clear_pending_commit(group_id).await {
            warn!(conversation_id = %conversation_id, error = %e, "Failed to clear pending commit");
        }
    }

    /// Initializing → Failed, tolerating a concurrent transition
    async fn mark_failed(&self, conversation_id: &str) -> MlsResult<()> {
        let moved = self
            .store
            .compare_and_set_state(
                conversation_id,
                &self.user_did,
                ConversationState::Initializing,
                ConversationState::Failed,
                self.clock.now_millis(),
            )
            .await?;
        if moved {
            warn!(conversation_id = %conversation_id, "Conversation initialization failed");
        }
        Ok(())
    }

    /// Remove every local trace of a conversation
    async fn remove_local_conversation(&self, conversation: &Conversation) -> MlsResult<()> {
        let id = &conversation.conversation_id;
        if conversation.state.can_transition_to(ConversationState::Removed) {
            self.store
                .compare_and_set_state(
                    id,
                    &self.user_did,
                    conversation.state,
                    ConversationState::Removed,
                    self.clock.now_millis(),
                )
                .await?;
        }

        self.store.delete_conversation(id, &self.user_did).await?;
        self.vault.delete_all_keys(id).await?;

        if let Ok(group_id) = conversation.group_id_bytes() {
            if self.engine.group_exists(&group_id).await {
                if let Err(e) = self.engine.delete_group(&group_id).await {
                    warn!(conversation_id = %id, error = %e, "Failed to delete engine group");
                }
            }
        }
        Ok(())
    }
}
