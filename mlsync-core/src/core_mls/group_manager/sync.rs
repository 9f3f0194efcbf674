//! Server synchronization: the conversation list and epoch catch-up

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, warn};

use super::GroupStateManager;
use crate::core_mls::errors::{MlsError, MlsResult};
use crate::core_mls::events::GroupEvent;
use crate::core_mls::traits::{ConversationView, SortField, SortOrder};
use crate::core_mls::types::{Conversation, ConversationState};
use crate::metrics::{record_counter, Timer, COMMITS_APPLIED, SYNC_COMPLETED, SYNC_DURATION};

/// Result of [`GroupStateManager::sync_with_server`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed { conversations: usize },
    /// Another sync was running; nothing was requested
    AlreadyInProgress,
}

/// Clears the in-flight flag however the sync ends
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl GroupStateManager {
    /// Fetch the server's conversation list and merge it into the store
    ///
    /// With `full_sync`, local conversations the server no longer lists are
    /// removed. A call made while another sync runs returns
    /// [`SyncOutcome::AlreadyInProgress`] without touching the network.
    pub async fn sync_with_server(&self, full_sync: bool) -> MlsResult<SyncOutcome> {
        if self
            .sync_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Sync already in progress");
            return Ok(SyncOutcome::AlreadyInProgress);
        }
        let _in_flight = InFlight(&self.sync_in_flight);

        let timer = Timer::new(SYNC_DURATION);
        let result = self.sync_conversations(full_sync).await;
        timer.stop();

        match result {
            Ok(count) => {
                record_counter(SYNC_COMPLETED, 1);
                self.emit(GroupEvent::SyncCompleted { count });
                info!(conversations = count, full_sync, "Sync completed");
                Ok(SyncOutcome::Completed {
                    conversations: count,
                })
            }
            Err(e) => {
                warn!(error = %e, full_sync, "Sync failed");
                self.emit(GroupEvent::SyncFailed {
                    error: e.to_string(),
                });
                Err(match e {
                    MlsError::Cancelled | MlsError::SyncFailed(_) => e,
                    other => MlsError::SyncFailed(other.to_string()),
                })
            }
        }
    }

    async fn sync_conversations(&self, full_sync: bool) -> MlsResult<usize> {
        let mut seen = HashSet::new();
        let mut cursor = None;

        loop {
            self.check_cancelled()?;
            let page = self
                .api
                .get_conversations(
                    self.config.sync.page_size,
                    cursor,
                    SortField::LastMessageAt,
                    SortOrder::Desc,
                )
                .await?;
            debug!(
                page_len = page.conversations.len(),
                more = page.cursor.is_some(),
                "Fetched conversation page"
            );

            for view in page.conversations {
                seen.insert(view.id.clone());
                self.merge_server_conversation(view).await?;
            }

            match page.cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        if full_sync {
            self.remove_unlisted(&seen).await?;
        }
        Ok(seen.len())
    }

    async fn merge_server_conversation(&self, view: ConversationView) -> MlsResult<()> {
        let _guard = self.lock_conversation(&view.id).await;
        let now = self.clock.now_millis();

        let existing = self.store.get_conversation(&view.id, &self.user_did).await?;
        let Some(existing) = existing else {
            // No group state yet; the Welcome brings it in
            let record = Conversation {
                conversation_id: view.id.clone(),
                group_id: view.group_id,
                creator_did: view.creator_did,
                members: view.members,
                epoch: 0,
                cipher_suite: view.cipher_suite,
                created_at: view.created_at,
                updated_at: now,
                last_message_at: view.last_message_at,
                metadata: view.metadata,
                state: ConversationState::Uninitialized,
                consecutive_failures: 0,
                last_recovery_attempt: None,
            };
            self.store.insert_conversation(&self.user_did, &record).await?;
            debug!(conversation_id = %view.id, "Discovered conversation");
            return Ok(());
        };

        self.store
            .update_membership(
                &view.id,
                &self.user_did,
                &view.members,
                &view.metadata,
                now,
            )
            .await?;
        if let Some(at) = view.last_message_at {
            self.store
                .touch_last_message(&view.id, &self.user_did, at)
                .await?;
        }

        if existing.is_active() && existing.epoch < view.epoch {
            let caught_up = async {
                let group_id = self.ensure_group_loaded(&existing).await?;
                self.catch_up_to(&view.id, &group_id, view.epoch).await
            }
            .await;
            match caught_up {
                Ok(epoch) => debug!(conversation_id = %view.id, epoch, "Caught up during sync"),
                Err(MlsError::Cancelled) => return Err(MlsError::Cancelled),
                // The conversation stays usable at its last good epoch
                Err(e) => warn!(
                    conversation_id = %view.id,
                    server_epoch = view.epoch,
                    error = %e,
                    "Catch-up during sync failed"
                ),
            }
        }
        Ok(())
    }

    /// Drop local conversations missing from a full listing
    async fn remove_unlisted(&self, listed: &HashSet<String>) -> MlsResult<()> {
        for conversation in self.store.list_conversations(&self.user_did).await? {
            if listed.contains(&conversation.conversation_id)
                || conversation.state == ConversationState::Initializing
            {
                continue;
            }

            let guard = self.lock_conversation(&conversation.conversation_id).await;
            self.remove_local_conversation(&conversation).await?;
            drop(guard);
            self.forget_lock(&conversation.conversation_id).await;

            info!(
                conversation_id = %conversation.conversation_id,
                "Removed conversation no longer listed by server"
            );
            self.emit(GroupEvent::ConversationLeft {
                conversation_id: conversation.conversation_id,
            });
        }
        Ok(())
    }

    /// React to an out-of-band hint that a conversation moved to `new_epoch`
    ///
    /// Unknown conversations and stale hints are ignored.
    pub async fn handle_epoch_update(
        &self,
        conversation_id: &str,
        new_epoch: u64,
    ) -> MlsResult<()> {
        let Some(conversation) = self
            .store
            .get_conversation(conversation_id, &self.user_did)
            .await?
        else {
            debug!(
                conversation_id = %conversation_id,
                new_epoch,
                "Epoch hint for unknown conversation"
            );
            return Ok(());
        };

        if !conversation.is_active() || new_epoch <= conversation.epoch {
            return Ok(());
        }

        info!(
            conversation_id = %conversation_id,
            local_epoch = conversation.epoch,
            new_epoch,
            "Epoch hint ahead of local state"
        );
        self.sync_group_state(conversation_id).await.map(|_| ())
    }

    /// Bring a conversation's group up to the server epoch
    ///
    /// Commits are applied one at a time and each resulting epoch is
    /// persisted before the next commit is touched, so an interrupted
    /// catch-up resumes from the last good epoch.
    pub async fn sync_group_state(&self, conversation_id: &str) -> MlsResult<u64> {
        let _guard = self.lock_conversation(conversation_id).await;

        let conversation = self.require_conversation(conversation_id).await?;
        let group_id = self.ensure_group_loaded(&conversation).await?;
        self.catch_up_locked(conversation_id, &group_id).await
    }

    /// Catch up to whatever epoch the server reports; caller holds the lock
    pub(super) async fn catch_up_locked(
        &self,
        conversation_id: &str,
        group_id: &[u8],
    ) -> MlsResult<u64> {
        let server_epoch = self.api.get_epoch(&hex::encode(group_id)).await?;
        self.catch_up_to(conversation_id, group_id, server_epoch)
            .await
    }

    pub(super) async fn catch_up_to(
        &self,
        conversation_id: &str,
        group_id: &[u8],
        target_epoch: u64,
    ) -> MlsResult<u64> {
        let mut local = self.engine.epoch(group_id).await?;
        if local >= target_epoch {
            return Ok(local);
        }

        let commits = self
            .api
            .get_commits(&hex::encode(group_id), local + 1, target_epoch)
            .await?;
        debug!(
            conversation_id = %conversation_id,
            from = local,
            to = target_epoch,
            commits = commits.len(),
            "Applying server commits"
        );

        for envelope in commits {
            self.check_cancelled()?;
            if envelope.epoch <= local {
                continue;
            }
            if envelope.epoch != local + 1 {
                return Err(MlsError::SyncFailed(format!(
                    "missing commit for epoch {} (next available: {})",
                    local + 1,
                    envelope.epoch
                )));
            }

            self.archive_outgoing_epoch(conversation_id, group_id).await?;
            let new_epoch = match self.engine.process_commit(group_id, &envelope.commit).await {
                Ok(epoch) => epoch,
                Err(e) => {
                    warn!(
                        conversation_id = %conversation_id,
                        epoch = local,
                        error = %e,
                        "Commit rejected, catch-up stopped"
                    );
                    return Err(e);
                }
            };
            self.commit_epoch(conversation_id, group_id, local, new_epoch)
                .await?;
            record_counter(COMMITS_APPLIED, 1);
            local = new_epoch;
        }

        if local < target_epoch {
            return Err(MlsError::SyncFailed(format!(
                "reached epoch {} of {}",
                local, target_epoch
            )));
        }
        Ok(local)
    }
}
