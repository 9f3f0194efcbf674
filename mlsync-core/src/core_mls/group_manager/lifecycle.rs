//! Conversation lifecycle: create, join, add members, leave

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::GroupStateManager;
use crate::core_mls::errors::{MlsError, MlsResult};
use crate::core_mls::events::GroupEvent;
use crate::core_mls::traits::{
    ApiError, ConversationView, CreateConversationRequest, MessageQuery, SortField, SortOrder,
    StagedCommit,
};
use crate::core_mls::types::{
    Conversation, ConversationMetadata, ConversationState, Member, NO_SEQUENCE,
};

impl GroupStateManager {
    /// Create a conversation with this user as the only member, then add
    /// `initial_members` in the same server round trip
    ///
    /// Key packages for every invitee are fetched before anything is
    /// created, so a missing one leaves no trace. The conversation becomes
    /// active once the server reports the same epoch as the local group.
    pub async fn create_group(
        &self,
        initial_members: &[String],
        metadata: Option<ConversationMetadata>,
    ) -> MlsResult<Conversation> {
        let identity = self.identity()?;
        let invited = self.invitees(initial_members);
        let key_packages = self.fetch_key_packages(&invited).await?;

        let conversation_id = Uuid::new_v4().to_string();
        let _guard = self.lock_conversation(&conversation_id).await;

        let group_id = self
            .engine
            .create_group(identity, None, &self.config.group_config())
            .await?;
        let now = self.clock.now_millis();
        let metadata = metadata.unwrap_or_default();

        let record = Conversation {
            conversation_id: conversation_id.clone(),
            group_id: hex::encode(&group_id),
            creator_did: self.user_did.clone(),
            members: vec![Member {
                did: self.user_did.clone(),
                joined_at: now,
                leaf_index: 0,
                credential: None,
            }],
            epoch: 0,
            cipher_suite: self.config.key_packages.cipher_suite.clone(),
            created_at: now,
            updated_at: now,
            last_message_at: None,
            metadata: metadata.clone(),
            state: ConversationState::Initializing,
            consecutive_failures: 0,
            last_recovery_attempt: None,
        };
        self.store.insert_conversation(&self.user_did, &record).await?;
        self.record_epoch_keys(&conversation_id, &group_id, 0).await?;

        info!(
            conversation_id = %conversation_id,
            group_id = %record.group_id,
            invited = invited.len(),
            "Creating conversation"
        );

        let view = match self
            .register_with_server(&record, &group_id, &invited, &key_packages, metadata)
            .await
        {
            Ok(view) => view,
            Err(e) => {
                self.mark_failed(&conversation_id).await?;
                return Err(e);
            }
        };

        self.store
            .update_membership(
                &conversation_id,
                &self.user_did,
                &view.members,
                &view.metadata,
                self.clock.now_millis(),
            )
            .await?;

        let epoch = self.finish_initialization(&conversation_id, &group_id).await?;
        self.emit(GroupEvent::ConversationCreated {
            conversation_id: conversation_id.clone(),
            epoch,
        });
        info!(conversation_id = %conversation_id, epoch, "Conversation created");

        self.require_conversation(&conversation_id).await
    }

    /// Stage the initial add (if any), submit to the server, merge on success
    async fn register_with_server(
        &self,
        record: &Conversation,
        group_id: &[u8],
        invited: &[String],
        key_packages: &[Vec<u8>],
        metadata: ConversationMetadata,
    ) -> MlsResult<ConversationView> {
        let staged = if key_packages.is_empty() {
            None
        } else {
            Some(self.engine.add_members(group_id, key_packages).await?)
        };

        let request = CreateConversationRequest {
            conversation_id: record.conversation_id.clone(),
            group_id: record.group_id.clone(),
            cipher_suite: record.cipher_suite.clone(),
            creator_did: self.user_did.clone(),
            initial_members: (!invited.is_empty()).then(|| invited.to_vec()),
            metadata: Some(metadata),
            commit: staged.as_ref().map(|s| s.commit.clone()),
            welcome: staged.as_ref().and_then(|s| s.welcome.clone()),
        };

        let created = match self.api.create_conversation(request).await {
            Ok(created) => created,
            Err(e) => {
                if staged.is_some() {
                    self.discard_pending_commit(&record.conversation_id, group_id, &e)
                        .await;
                }
                return Err(e);
            }
        };
        debug!(
            conversation_id = %record.conversation_id,
            welcomes = created.welcome_messages.len(),
            "Server accepted conversation"
        );

        if let Some(staged) = staged {
            self.apply_staged_commit(&record.conversation_id, group_id, record.epoch, &staged)
                .await?;
        }
        Ok(created.conversation)
    }

    /// Join a conversation from a Welcome addressed to this user
    pub async fn join_group(&self, welcome: &[u8]) -> MlsResult<Conversation> {
        let identity = self.identity()?;
        let group_id = self
            .engine
            .process_welcome(welcome, identity, &self.config.group_config())
            .await?;
        let group_hex = hex::encode(&group_id);

        let view = match self.find_server_conversation(&group_hex).await {
            Ok(Some(view)) => view,
            Ok(None) => {
                self.drop_engine_group(&group_id).await;
                return Err(MlsError::ConversationNotFound(group_hex));
            }
            Err(e) => {
                self.drop_engine_group(&group_id).await;
                return Err(e);
            }
        };
        let conversation_id = view.id.clone();
        let _guard = self.lock_conversation(&conversation_id).await;

        let epoch = self.engine.epoch(&group_id).await?;
        let now = self.clock.now_millis();

        match self
            .store
            .get_conversation(&conversation_id, &self.user_did)
            .await?
        {
            None => {
                let record = Conversation {
                    conversation_id: conversation_id.clone(),
                    group_id: group_hex.clone(),
                    creator_did: view.creator_did.clone(),
                    members: view.members.clone(),
                    epoch,
                    cipher_suite: view.cipher_suite.clone(),
                    created_at: view.created_at,
                    updated_at: now,
                    last_message_at: view.last_message_at,
                    metadata: view.metadata.clone(),
                    state: ConversationState::Initializing,
                    consecutive_failures: 0,
                    last_recovery_attempt: None,
                };
                self.store.insert_conversation(&self.user_did, &record).await?;
            }
            Some(existing) => {
                // Known from an earlier sync or a rejoin after recovery
                if epoch > existing.epoch {
                    self.store
                        .advance_epoch(&conversation_id, &self.user_did, epoch, now)
                        .await?;
                } else if epoch < existing.epoch {
                    warn!(
                        conversation_id = %conversation_id,
                        stored_epoch = existing.epoch,
                        welcome_epoch = epoch,
                        "Welcome is older than the stored epoch"
                    );
                }
                self.store
                    .update_membership(
                        &conversation_id,
                        &self.user_did,
                        &view.members,
                        &view.metadata,
                        now,
                    )
                    .await?;
                if existing
                    .state
                    .can_transition_to(ConversationState::Initializing)
                {
                    self.store
                        .compare_and_set_state(
                            &conversation_id,
                            &self.user_did,
                            existing.state,
                            ConversationState::Initializing,
                            now,
                        )
                        .await?;
                }
                self.recovery.record_recovery_success(&conversation_id).await?;
            }
        }

        let position = self.join_position(&view, epoch).await;
        self.sequencer
            .start_after(&conversation_id, &self.user_did, position)
            .await?;

        self.record_epoch_keys(&conversation_id, &group_id, epoch).await?;
        let epoch = self.finish_initialization(&conversation_id, &group_id).await?;

        self.emit(GroupEvent::ConversationJoined {
            conversation_id: conversation_id.clone(),
            epoch,
        });
        info!(conversation_id = %conversation_id, epoch, "Joined conversation");

        self.require_conversation(&conversation_id).await
    }

    /// Add members to an active conversation
    ///
    /// Returns the new epoch. On any server failure the staged commit is
    /// discarded and the local epoch is unchanged.
    pub async fn add_members(
        &self,
        conversation_id: &str,
        member_dids: &[String],
    ) -> MlsResult<u64> {
        let _guard = self.lock_conversation(conversation_id).await;

        let conversation = self.require_conversation(conversation_id).await?;
        if !conversation.is_active() {
            return Err(MlsError::ConversationNotFound(conversation_id.to_string()));
        }

        let invited: Vec<String> = self
            .invitees(member_dids)
            .into_iter()
            .filter(|did| !conversation.members.iter().any(|m| &m.did == did))
            .collect();
        if invited.is_empty() {
            return Ok(conversation.epoch);
        }

        let key_packages = self.fetch_key_packages(&invited).await?;
        let group_id = self.ensure_group_loaded(&conversation).await?;
        let old_epoch = self.engine.epoch(&group_id).await?;

        let staged = self.engine.add_members(&group_id, &key_packages).await?;
        let response = self
            .api
            .add_members(
                conversation_id,
                &invited,
                Some(staged.commit.clone()),
                staged.welcome.clone(),
            )
            .await
            .and_then(|response| {
                if response.success {
                    Ok(response)
                } else {
                    Err(MlsError::ServerError(ApiError::http(
                        422,
                        "server rejected member addition",
                    )))
                }
            });

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                self.discard_pending_commit(conversation_id, &group_id, &e).await;
                return Err(e);
            }
        };

        let new_epoch = self
            .apply_staged_commit(conversation_id, &group_id, old_epoch, &staged)
            .await?;
        if response.new_epoch != new_epoch {
            warn!(
                conversation_id = %conversation_id,
                local_epoch = new_epoch,
                server_epoch = response.new_epoch,
                "Server reported a different epoch after add"
            );
        }

        // The server already holds the commit; from here on nothing may fail
        // the call, or a retry would add the same members twice
        self.refresh_membership_after_add(&conversation, &invited).await;

        self.emit(GroupEvent::MembersAdded {
            conversation_id: conversation_id.to_string(),
            member_dids: invited.clone(),
            epoch: new_epoch,
        });
        info!(
            conversation_id = %conversation_id,
            added = invited.len(),
            epoch = new_epoch,
            "Members added"
        );
        Ok(new_epoch)
    }

    /// Take the member list from the server, or append the invitees when
    /// the listing cannot be read
    async fn refresh_membership_after_add(
        &self,
        conversation: &Conversation,
        invited: &[String],
    ) {
        let conversation_id = &conversation.conversation_id;
        let now = self.clock.now_millis();

        let (members, metadata) = match self
            .find_server_conversation(&conversation.group_id)
            .await
        {
            Ok(Some(view)) => (view.members, view.metadata),
            outcome => {
                if let Err(e) = &outcome {
                    warn!(
                        conversation_id = %conversation_id,
                        error = %e,
                        "Member listing failed after add, updating members locally"
                    );
                }
                let mut members = conversation.members.clone();
                let mut next_leaf = members.iter().map(|m| m.leaf_index + 1).max().unwrap_or(0);
                for did in invited {
                    members.push(Member {
                        did: did.clone(),
                        joined_at: now,
                        leaf_index: next_leaf,
                        credential: None,
                    });
                    next_leaf += 1;
                }
                (members, conversation.metadata.clone())
            }
        };

        if let Err(e) = self
            .store
            .update_membership(conversation_id, &self.user_did, &members, &metadata, now)
            .await
        {
            warn!(
                conversation_id = %conversation_id,
                error = %e,
                "Could not store member list after add"
            );
        }
    }

    /// Leave a conversation and remove every local trace of it
    pub async fn leave_conversation(&self, conversation_id: &str) -> MlsResult<()> {
        let guard = self.lock_conversation(conversation_id).await;

        let conversation = self.require_conversation(conversation_id).await?;
        let response = self.api.leave_conversation(conversation_id).await?;
        debug!(
            conversation_id = %conversation_id,
            server_epoch = response.epoch,
            "Server acknowledged leave"
        );

        self.remove_local_conversation(&conversation).await?;
        drop(guard);
        self.forget_lock(conversation_id).await;

        self.emit(GroupEvent::ConversationLeft {
            conversation_id: conversation_id.to_string(),
        });
        info!(conversation_id = %conversation_id, "Left conversation");
        Ok(())
    }

    /// Merge a commit the server accepted and persist the resulting epoch
    async fn apply_staged_commit(
        &self,
        conversation_id: &str,
        group_id: &[u8],
        old_epoch: u64,
        staged: &StagedCommit,
    ) -> MlsResult<u64> {
        self.archive_outgoing_epoch(conversation_id, group_id).await?;
        let new_epoch = self.engine.merge_pending_commit(group_id).await?;
        if new_epoch != staged.new_epoch {
            warn!(
                conversation_id = %conversation_id,
                staged = staged.new_epoch,
                merged = new_epoch,
                "Merged epoch differs from staged epoch"
            );
        }
        self.commit_epoch(conversation_id, group_id, old_epoch, new_epoch)
            .await?;
        Ok(new_epoch)
    }

    /// Verify the local epoch against the server and activate
    ///
    /// Catches up first when the server is ahead. Any failure, including a
    /// remaining mismatch, leaves the conversation in `Failed`.
    async fn finish_initialization(
        &self,
        conversation_id: &str,
        group_id: &[u8],
    ) -> MlsResult<u64> {
        let verified = async {
            let server_epoch = self.api.get_epoch(&hex::encode(group_id)).await?;
            let local_epoch = self
                .catch_up_to(conversation_id, group_id, server_epoch)
                .await?;
            if local_epoch != server_epoch {
                return Err(MlsError::SyncFailed(format!(
                    "local epoch {} does not match server epoch {}",
                    local_epoch, server_epoch
                )));
            }
            Ok::<u64, MlsError>(local_epoch)
        }
        .await;

        match verified {
            Ok(epoch) => {
                self.store
                    .compare_and_set_state(
                        conversation_id,
                        &self.user_did,
                        ConversationState::Initializing,
                        ConversationState::Active,
                        self.clock.now_millis(),
                    )
                    .await?;
                Ok(epoch)
            }
            Err(e) => {
                self.mark_failed(conversation_id).await?;
                Err(e)
            }
        }
    }

    /// Fetch one key package per DID or fail listing every DID without one
    async fn fetch_key_packages(&self, dids: &[String]) -> MlsResult<Vec<Vec<u8>>> {
        if dids.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .api
            .get_key_packages(dids, Some(self.config.key_packages.cipher_suite.as_str()))
            .await?;

        let mut missing = response.missing;
        let mut key_packages = Vec::with_capacity(dids.len());
        for did in dids {
            match response.key_packages.iter().find(|kp| &kp.did == did) {
                Some(kp) => key_packages.push(kp.key_package.clone()),
                None if !missing.contains(did) => missing.push(did.clone()),
                None => {}
            }
        }

        if !missing.is_empty() {
            warn!(missing = ?missing, "Key packages unavailable");
            return Err(MlsError::MissingKeyPackages(missing));
        }
        Ok(key_packages)
    }

    /// Server view of the conversation owning `group_id_hex`
    /// Sequence number just before the first message this member can read
    ///
    /// That is the predecessor of the first message sent at the joined
    /// epoch, or the newest sequence the listing reported when nothing has
    /// been sent at that epoch yet.
    async fn join_position(&self, view: &ConversationView, epoch: u64) -> i64 {
        let listed = view.last_sequence_number.unwrap_or(NO_SEQUENCE);
        let query = MessageQuery {
            limit: Some(1),
            epoch: Some(epoch),
            ..MessageQuery::default()
        };

        match self.api.get_messages(&view.id, query).await {
            Ok(page) => page
                .messages
                .first()
                .map_or(listed, |first| first.sequence_number - 1),
            Err(e) => {
                warn!(
                    conversation_id = %view.id,
                    epoch,
                    error = %e,
                    "Message history unavailable, starting after the listed sequence"
                );
                listed
            }
        }
    }

    pub(super) async fn find_server_conversation(
        &self,
        group_id_hex: &str,
    ) -> MlsResult<Option<ConversationView>> {
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

            if let Some(view) = page
                .conversations
                .into_iter()
                .find(|view| view.group_id == group_id_hex)
            {
                return Ok(Some(view));
            }
            match page.cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(None),
            }
        }
    }

    /// Deduplicated DIDs other than this user's own
    fn invitees(&self, dids: &[String]) -> Vec<String> {
        let mut out: Vec<String> = Vec::with_capacity(dids.len());
        for did in dids {
            if did != &self.user_did && !out.contains(did) {
                out.push(did.clone());
            }
        }
        out
    }

    async fn drop_engine_group(&self, group_id: &[u8]) {
        if let Err(e) = self.engine.delete_group(group_id).await {
            warn!(group_id = %hex::encode(group_id), error = %e, "Failed to drop joined group");
        }
    }
}
