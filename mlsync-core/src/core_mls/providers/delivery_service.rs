//! In-memory delivery service
//!
//! A single [`InMemoryDeliveryService`] plays the server; each user talks to
//! it through an [`InMemoryApiClient`] bound to their DID. Tests can queue
//! failures per endpoint, add latency to conversation listing and inspect
//! what the clients sent.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use crate::core_mls::clock::{Clock, SystemClock};
use crate::core_mls::errors::{MlsError, MlsResult};
use crate::core_mls::traits::{
    AddMembersResponse, ApiClient, ApiError, CommitEnvelope, ConversationPage, ConversationView,
    CreateConversationRequest, CreatedConversation, KeyPackageView, KeyPackagesResponse,
    LeaveResponse, MessagePage, MessageQuery, SendMessageRequest, SentMessage, SortField,
    SortOrder, WelcomeDelivery,
};
use crate::core_mls::types::{InboundMessage, Member};

/// Rejoin request as received by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejoinRequest {
    pub requester_did: String,
    pub conversation_id: String,
    pub reason: String,
}

struct ServerConversation {
    view: ConversationView,
    commits: BTreeMap<u64, Vec<u8>>,
    messages: Vec<InboundMessage>,
}

#[derive(Default)]
struct ServerState {
    conversations: HashMap<String, ServerConversation>,
    key_packages: HashMap<String, VecDeque<KeyPackageView>>,
    welcomes: HashMap<String, Vec<Vec<u8>>>,
    rejoin_requests: Vec<RejoinRequest>,
    failures: HashMap<&'static str, VecDeque<ApiError>>,
    calls: HashMap<&'static str, usize>,
    listing_latency: Duration,
}

impl ServerState {
    /// Count the call and pop an injected failure, if any
    fn enter(&mut self, endpoint: &'static str) -> MlsResult<()> {
        *self.calls.entry(endpoint).or_default() += 1;
        match self.failures.get_mut(endpoint).and_then(VecDeque::pop_front) {
            Some(error) => Err(MlsError::ServerError(error)),
            None => Ok(()),
        }
    }

    fn conversation_mut(&mut self, conversation_id: &str) -> MlsResult<&mut ServerConversation> {
        self.conversations
            .get_mut(conversation_id)
            .ok_or_else(|| not_found(format!("conversation {}", conversation_id)))
    }

    fn conversation_by_group(&self, group_id: &str) -> MlsResult<&ServerConversation> {
        self.conversations
            .values()
            .find(|c| c.view.group_id == group_id)
            .ok_or_else(|| not_found(format!("group {}", group_id)))
    }
}

fn not_found(what: String) -> MlsError {
    MlsError::ServerError(ApiError::http(404, format!("{} not found", what)))
}

fn member(did: &str, leaf_index: usize, joined_at: i64) -> Member {
    Member {
        did: did.to_string(),
        joined_at,
        leaf_index: leaf_index as u32,
        credential: None,
    }
}

/// Shared in-memory server
#[derive(Clone, Default)]
pub struct InMemoryDeliveryService {
    state: Arc<Mutex<ServerState>>,
}

impl InMemoryDeliveryService {
    pub fn new() -> Self {
        Self::default()
    }

    /// API client acting as `did`
    pub fn client(&self, did: impl Into<String>) -> InMemoryApiClient {
        InMemoryApiClient {
            did: did.into(),
            server: self.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next call to `endpoint` fail with `error`
    pub fn fail_next(&self, endpoint: &'static str, error: ApiError) {
        self.lock()
            .failures
            .entry(endpoint)
            .or_default()
            .push_back(error);
    }

    pub fn set_listing_latency(&self, latency: Duration) {
        self.lock().listing_latency = latency;
    }

    pub fn call_count(&self, endpoint: &str) -> usize {
        self.lock().calls.get(endpoint).copied().unwrap_or(0)
    }

    pub fn rejoin_requests(&self) -> Vec<RejoinRequest> {
        self.lock().rejoin_requests.clone()
    }

    /// Welcomes waiting for `did`, oldest first
    pub fn take_welcomes(&self, did: &str) -> Vec<Vec<u8>> {
        self.lock().welcomes.remove(did).unwrap_or_default()
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<ConversationView> {
        self.lock()
            .conversations
            .get(conversation_id)
            .map(|c| c.view.clone())
    }

    /// Messages stored for a conversation, in sequence order
    pub fn messages(&self, conversation_id: &str) -> Vec<InboundMessage> {
        self.lock()
            .conversations
            .get(conversation_id)
            .map(|c| c.messages.clone())
            .unwrap_or_default()
    }

    /// Record a commit as if another device had submitted it
    pub fn push_commit(&self, conversation_id: &str, epoch: u64, commit: Vec<u8>) -> bool {
        let mut state = self.lock();
        let Some(convo) = state.conversations.get_mut(conversation_id) else {
            return false;
        };
        convo.commits.insert(epoch, commit);
        convo.view.epoch = convo.view.epoch.max(epoch);
        true
    }
}

/// [`ApiClient`] bound to one user of an [`InMemoryDeliveryService`]
#[derive(Clone)]
pub struct InMemoryApiClient {
    did: String,
    server: InMemoryDeliveryService,
}

impl InMemoryApiClient {
    pub fn did(&self) -> &str {
        &self.did
    }

    pub fn server(&self) -> &InMemoryDeliveryService {
        &self.server
    }
}

#[async_trait]
impl ApiClient for InMemoryApiClient {
    async fn get_conversations(
        &self,
        limit: u32,
        cursor: Option<String>,
        sort_by: SortField,
        sort_order: SortOrder,
    ) -> MlsResult<ConversationPage> {
        let latency = self.server.lock().listing_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.server.lock();
        state.enter("get_conversations")?;

        let mut views: Vec<ConversationView> = state
            .conversations
            .values()
            .filter(|c| c.view.members.iter().any(|m| m.did == self.did))
            .map(|c| c.view.clone())
            .collect();
        views.sort_by(|a, b| {
            let key = |v: &ConversationView| match sort_by {
                SortField::CreatedAt => v.created_at,
                SortField::LastMessageAt => v.last_message_at.unwrap_or(v.created_at),
            };
            key(a).cmp(&key(b)).then_with(|| a.id.cmp(&b.id))
        });
        if sort_order == SortOrder::Desc {
            views.reverse();
        }

        let offset = match cursor {
            Some(c) => c
                .parse::<usize>()
                .map_err(|_| MlsError::ServerError(ApiError::http(400, "invalid cursor")))?,
            None => 0,
        };
        let limit = limit.max(1) as usize;
        let page: Vec<ConversationView> = views.iter().skip(offset).take(limit).cloned().collect();
        let next = offset + page.len();
        let cursor = (next < views.len()).then(|| next.to_string());

        Ok(ConversationPage {
            conversations: page,
            cursor,
        })
    }

    async fn create_conversation(
        &self,
        request: CreateConversationRequest,
    ) -> MlsResult<CreatedConversation> {
        let mut state = self.server.lock();
        state.enter("create_conversation")?;

        if state.conversations.contains_key(&request.conversation_id) {
            return Err(MlsError::ServerError(ApiError::http(
                409,
                "conversation already exists",
            )));
        }

        let now = SystemClock.now_millis();
        let invited = request.initial_members.clone().unwrap_or_default();
        let mut members = vec![member(&request.creator_did, 0, now)];
        members.extend(
            invited
                .iter()
                .enumerate()
                .map(|(i, did)| member(did, i + 1, now)),
        );

        let mut commits = BTreeMap::new();
        let epoch = match request.commit {
            Some(commit) => {
                commits.insert(1, commit);
                1
            }
            None => 0,
        };

        let mut welcome_messages = Vec::new();
        if let Some(welcome) = &request.welcome {
            for did in &invited {
                state
                    .welcomes
                    .entry(did.clone())
                    .or_default()
                    .push(welcome.clone());
                welcome_messages.push(WelcomeDelivery {
                    recipient_did: did.clone(),
                    welcome: welcome.clone(),
                });
            }
        }

        let view = ConversationView {
            id: request.conversation_id.clone(),
            group_id: request.group_id,
            creator_did: request.creator_did,
            members,
            epoch,
            cipher_suite: request.cipher_suite,
            created_at: now,
            last_message_at: None,
            last_sequence_number: None,
            metadata: request.metadata.unwrap_or_default(),
        };
        state.conversations.insert(
            request.conversation_id,
            ServerConversation {
                view: view.clone(),
                commits,
                messages: Vec::new(),
            },
        );

        Ok(CreatedConversation {
            conversation: view,
            welcome_messages,
        })
    }

    async fn add_members(
        &self,
        conversation_id: &str,
        member_dids: &[String],
        commit: Option<Vec<u8>>,
        welcome: Option<Vec<u8>>,
    ) -> MlsResult<AddMembersResponse> {
        let mut state = self.server.lock();
        state.enter("add_members")?;

        let now = SystemClock.now_millis();
        let convo = state.conversation_mut(conversation_id)?;
        if let Some(commit) = commit {
            convo.view.epoch += 1;
            let epoch = convo.view.epoch;
            convo.commits.insert(epoch, commit);
        }
        for did in member_dids {
            if !convo.view.members.iter().any(|m| &m.did == did) {
                let leaf = convo.view.members.len();
                convo.view.members.push(member(did, leaf, now));
            }
        }
        let new_epoch = convo.view.epoch;

        if let Some(welcome) = welcome {
            for did in member_dids {
                state
                    .welcomes
                    .entry(did.clone())
                    .or_default()
                    .push(welcome.clone());
            }
        }

        Ok(AddMembersResponse {
            success: true,
            new_epoch,
        })
    }

    async fn leave_conversation(&self, conversation_id: &str) -> MlsResult<LeaveResponse> {
        let mut state = self.server.lock();
        state.enter("leave_conversation")?;

        let convo = state.conversation_mut(conversation_id)?;
        convo.view.members.retain(|m| m.did != self.did);
        Ok(LeaveResponse {
            commit: None,
            epoch: convo.view.epoch,
        })
    }

    async fn send_message(&self, request: SendMessageRequest) -> MlsResult<SentMessage> {
        let mut state = self.server.lock();
        state.enter("send_message")?;

        let now = SystemClock.now_millis();
        let convo = state.conversation_mut(&request.conversation_id)?;
        if request.epoch != convo.view.epoch {
            return Err(MlsError::ServerError(ApiError::http(
                409,
                format!(
                    "message epoch {} does not match group epoch {}",
                    request.epoch, convo.view.epoch
                ),
            )));
        }

        let message_id = Uuid::new_v4().to_string();
        let sequence_number = convo.messages.len() as i64;
        convo.messages.push(InboundMessage {
            id: message_id.clone(),
            conversation_id: request.conversation_id,
            sender_did: request.sender_did,
            ciphertext: request.ciphertext,
            epoch: request.epoch,
            sequence_number,
            created_at: now,
            content_type: request.content_type,
            attachments: Vec::new(),
        });
        convo.view.last_message_at = Some(now);
        convo.view.last_sequence_number = Some(sequence_number);

        Ok(SentMessage {
            message_id,
            received_at: now,
            sequence_number,
        })
    }

    async fn get_messages(
        &self,
        conversation_id: &str,
        query: MessageQuery,
    ) -> MlsResult<MessagePage> {
        let mut state = self.server.lock();
        state.enter("get_messages")?;

        let convo = state.conversation_mut(conversation_id)?;
        let matching: Vec<&InboundMessage> = convo
            .messages
            .iter()
            .filter(|m| query.since.map_or(true, |since| m.created_at >= since))
            .filter(|m| query.until.map_or(true, |until| m.created_at <= until))
            .filter(|m| query.epoch.map_or(true, |epoch| m.epoch == epoch))
            .collect();

        let offset = query
            .cursor
            .as_deref()
            .map(str::parse::<usize>)
            .transpose()
            .map_err(|_| MlsError::ServerError(ApiError::http(400, "invalid cursor")))?
            .unwrap_or(0);
        let limit = query.limit.unwrap_or(50).max(1) as usize;

        let messages: Vec<InboundMessage> = matching
            .iter()
            .skip(offset)
            .take(limit)
            .map(|m| (*m).clone())
            .collect();
        let next = offset + messages.len();
        let cursor = (next < matching.len()).then(|| next.to_string());

        Ok(MessagePage { messages, cursor })
    }

    async fn get_key_packages(
        &self,
        dids: &[String],
        cipher_suite: Option<&str>,
    ) -> MlsResult<KeyPackagesResponse> {
        let mut state = self.server.lock();
        state.enter("get_key_packages")?;

        let mut response = KeyPackagesResponse::default();
        for did in dids {
            let queue = state.key_packages.entry(did.clone()).or_default();
            let position = queue
                .iter()
                .position(|kp| cipher_suite.map_or(true, |suite| kp.cipher_suite == suite));
            // Key packages are single use
            match position.and_then(|i| queue.remove(i)) {
                Some(kp) => response.key_packages.push(kp),
                None => response.missing.push(did.clone()),
            }
        }
        Ok(response)
    }

    async fn publish_key_package(
        &self,
        owner_did: &str,
        key_package: Vec<u8>,
        cipher_suite: &str,
        _expires_at: Option<i64>,
    ) -> MlsResult<String> {
        let mut state = self.server.lock();
        state.enter("publish_key_package")?;

        let key_package_ref = hex::encode(Sha256::digest(&key_package));
        state
            .key_packages
            .entry(owner_did.to_string())
            .or_default()
            .push_back(KeyPackageView {
                did: owner_did.to_string(),
                key_package,
                cipher_suite: cipher_suite.to_string(),
            });
        Ok(key_package_ref)
    }

    async fn get_epoch(&self, group_id: &str) -> MlsResult<u64> {
        let mut state = self.server.lock();
        state.enter("get_epoch")?;
        Ok(state.conversation_by_group(group_id)?.view.epoch)
    }

    async fn get_commits(
        &self,
        group_id: &str,
        from_epoch: u64,
        to_epoch: u64,
    ) -> MlsResult<Vec<CommitEnvelope>> {
        let mut state = self.server.lock();
        state.enter("get_commits")?;

        if from_epoch > to_epoch {
            return Ok(Vec::new());
        }
        let convo = state.conversation_by_group(group_id)?;
        Ok(convo
            .commits
            .range(from_epoch..=to_epoch)
            .map(|(epoch, commit)| CommitEnvelope {
                epoch: *epoch,
                commit: commit.clone(),
            })
            .collect())
    }

    async fn request_rejoin(&self, conversation_id: &str, reason: &str) -> MlsResult<()> {
        let mut state = self.server.lock();
        state.enter("request_rejoin")?;

        if !state.conversations.contains_key(conversation_id) {
            return Err(not_found(format!("conversation {}", conversation_id)));
        }
        state.rejoin_requests.push(RejoinRequest {
            requester_did: self.did.clone(),
            conversation_id: conversation_id.to_string(),
            reason: reason.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_mls::types::ConversationMetadata;

    fn create_request(id: &str, creator: &str) -> CreateConversationRequest {
        CreateConversationRequest {
            conversation_id: id.to_string(),
            group_id: hex::encode(id),
            cipher_suite: "suite".into(),
            creator_did: creator.to_string(),
            initial_members: None,
            metadata: Some(ConversationMetadata::default()),
            commit: None,
            welcome: None,
        }
    }

    #[tokio::test]
    async fn test_listing_is_paginated_and_scoped() {
        let server = InMemoryDeliveryService::new();
        let alice = server.client("did:alice");
        let bob = server.client("did:bob");

        for i in 0..5 {
            alice
                .create_conversation(create_request(&format!("c{}", i), "did:alice"))
                .await
                .unwrap();
        }

        let first = alice
            .get_conversations(2, None, SortField::CreatedAt, SortOrder::Asc)
            .await
            .unwrap();
        assert_eq!(first.conversations.len(), 2);
        assert_eq!(first.cursor.as_deref(), Some("2"));

        let mut seen = first.conversations.len();
        let mut cursor = first.cursor;
        while let Some(c) = cursor {
            let page = alice
                .get_conversations(2, Some(c), SortField::CreatedAt, SortOrder::Asc)
                .await
                .unwrap();
            seen += page.conversations.len();
            cursor = page.cursor;
        }
        assert_eq!(seen, 5);

        let bobs = bob
            .get_conversations(10, None, SortField::CreatedAt, SortOrder::Desc)
            .await
            .unwrap();
        assert!(bobs.conversations.is_empty());
    }

    #[tokio::test]
    async fn test_injected_failure_is_consumed_once() {
        let server = InMemoryDeliveryService::new();
        let alice = server.client("did:alice");
        server.fail_next("create_conversation", ApiError::http(503, "down"));

        let err = alice
            .create_conversation(create_request("c1", "did:alice"))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(alice
            .create_conversation(create_request("c1", "did:alice"))
            .await
            .is_ok());
        assert_eq!(server.call_count("create_conversation"), 2);
    }

    #[tokio::test]
    async fn test_key_packages_are_single_use() {
        let server = InMemoryDeliveryService::new();
        let bob = server.client("did:bob");
        bob.publish_key_package("did:bob", vec![1, 2, 3], "suite", None)
            .await
            .unwrap();

        let dids = vec!["did:bob".to_string(), "did:carol".to_string()];
        let first = bob.get_key_packages(&dids, Some("suite")).await.unwrap();
        assert_eq!(first.key_packages.len(), 1);
        assert_eq!(first.missing, vec!["did:carol".to_string()]);

        let second = bob.get_key_packages(&dids, None).await.unwrap();
        assert_eq!(second.missing.len(), 2);
    }

    #[tokio::test]
    async fn test_commits_advance_epoch_and_are_ranged() {
        let server = InMemoryDeliveryService::new();
        let alice = server.client("did:alice");
        alice
            .create_conversation(create_request("c1", "did:alice"))
            .await
            .unwrap();

        for _ in 0..3 {
            alice
                .add_members("c1", &[], Some(b"commit".to_vec()), None)
                .await
                .unwrap();
        }
        let group_id = hex::encode("c1");
        assert_eq!(alice.get_epoch(&group_id).await.unwrap(), 3);

        let commits = alice.get_commits(&group_id, 2, 3).await.unwrap();
        let epochs: Vec<u64> = commits.iter().map(|c| c.epoch).collect();
        assert_eq!(epochs, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_send_assigns_sequence_numbers() {
        let server = InMemoryDeliveryService::new();
        let alice = server.client("did:alice");
        alice
            .create_conversation(create_request("c1", "did:alice"))
            .await
            .unwrap();

        for expected in 0..3 {
            let sent = alice
                .send_message(SendMessageRequest {
                    conversation_id: "c1".into(),
                    sender_did: "did:alice".into(),
                    ciphertext: vec![expected as u8],
                    epoch: 0,
                    content_type: "text/plain".into(),
                })
                .await
                .unwrap();
            assert_eq!(sent.sequence_number, expected);
        }

        let page = alice
            .get_messages(
                "c1",
                MessageQuery {
                    limit: Some(2),
                    ..MessageQuery::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(page.messages.len(), 2);
        assert_eq!(page.cursor.as_deref(), Some("2"));
    }
}
