//! Delivery service API trait and transfer objects

use crate::core_mls::errors::MlsResult;
use crate::core_mls::types::{ConversationMetadata, InboundMessage, Member};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Transport-level failure reported by an [`ApiClient`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Response decoding failed: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        ApiError::Http {
            status,
            message: message.into(),
        }
    }

    /// 5xx responses and network failures
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Http { status, .. } => *status >= 500,
            ApiError::Network(_) => true,
            ApiError::Decode(_) => false,
        }
    }

    /// Another device committed to the same epoch first
    pub fn is_epoch_conflict(&self) -> bool {
        matches!(self, ApiError::Http { status: 409, .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortField {
    CreatedAt,
    LastMessageAt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Conversation as reported by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationView {
    pub id: String,
    /// Hex-encoded group id
    pub group_id: String,
    pub creator_did: String,
    pub members: Vec<Member>,
    pub epoch: u64,
    pub cipher_suite: String,
    pub created_at: i64,
    #[serde(default)]
    pub last_message_at: Option<i64>,
    /// Highest sequence number assigned so far, if any message was sent
    #[serde(default)]
    pub last_sequence_number: Option<i64>,
    #[serde(default)]
    pub metadata: ConversationMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConversationPage {
    pub conversations: Vec<ConversationView>,
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationRequest {
    /// Client-chosen conversation id
    pub conversation_id: String,
    pub group_id: String,
    pub cipher_suite: String,
    pub creator_did: String,
    #[serde(default)]
    pub initial_members: Option<Vec<String>>,
    #[serde(default)]
    pub metadata: Option<ConversationMetadata>,
    #[serde(default)]
    pub commit: Option<Vec<u8>>,
    #[serde(default)]
    pub welcome: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WelcomeDelivery {
    pub recipient_did: String,
    pub welcome: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedConversation {
    pub conversation: ConversationView,
    pub welcome_messages: Vec<WelcomeDelivery>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddMembersResponse {
    pub success: bool,
    pub new_epoch: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveResponse {
    pub commit: Option<Vec<u8>>,
    pub epoch: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub conversation_id: String,
    pub sender_did: String,
    pub ciphertext: Vec<u8>,
    pub epoch: u64,
    pub content_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentMessage {
    pub message_id: String,
    pub received_at: i64,
    /// Server-assigned position in the conversation
    pub sequence_number: i64,
}

/// Filters for [`ApiClient::get_messages`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageQuery {
    pub limit: Option<u32>,
    pub cursor: Option<String>,
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub epoch: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<InboundMessage>,
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPackageView {
    pub did: String,
    pub key_package: Vec<u8>,
    pub cipher_suite: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KeyPackagesResponse {
    pub key_packages: Vec<KeyPackageView>,
    /// DIDs with no usable package
    pub missing: Vec<String>,
}

/// Commit stored by the server, tagged with the epoch it produces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitEnvelope {
    pub epoch: u64,
    pub commit: Vec<u8>,
}

/// Delivery service endpoints used by the engine
///
/// Implementations map transport failures to [`ApiError`]; the engine wraps
/// them into `MlsError::ServerError`.
#[async_trait]
pub trait ApiClient: Send + Sync {
    async fn get_conversations(
        &self,
        limit: u32,
        cursor: Option<String>,
        sort_by: SortField,
        sort_order: SortOrder,
    ) -> MlsResult<ConversationPage>;

    async fn create_conversation(
        &self,
        request: CreateConversationRequest,
    ) -> MlsResult<CreatedConversation>;

    async fn add_members(
        &self,
        conversation_id: &str,
        member_dids: &[String],
        commit: Option<Vec<u8>>,
        welcome: Option<Vec<u8>>,
    ) -> MlsResult<AddMembersResponse>;

    async fn leave_conversation(&self, conversation_id: &str) -> MlsResult<LeaveResponse>;

    async fn send_message(&self, request: SendMessageRequest) -> MlsResult<SentMessage>;

    async fn get_messages(&self, conversation_id: &str, query: MessageQuery)
        -> MlsResult<MessagePage>;

    async fn get_key_packages(
        &self,
        dids: &[String],
        cipher_suite: Option<&str>,
    ) -> MlsResult<KeyPackagesResponse>;

    /// Upload a key package and return its server reference
    async fn publish_key_package(
        &self,
        owner_did: &str,
        key_package: Vec<u8>,
        cipher_suite: &str,
        expires_at: Option<i64>,
    ) -> MlsResult<String>;

    /// Current epoch of a group (hex id)
    async fn get_epoch(&self, group_id: &str) -> MlsResult<u64>;

    /// Commits producing epochs `from_epoch..=to_epoch`
    async fn get_commits(
        &self,
        group_id: &str,
        from_epoch: u64,
        to_epoch: u64,
    ) -> MlsResult<Vec<CommitEnvelope>>;

    /// Ask the group to re-add this device
    async fn request_rejoin(&self, conversation_id: &str, reason: &str) -> MlsResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_classification() {
        assert!(ApiError::http(503, "unavailable").is_retryable());
        assert!(ApiError::Network("reset".into()).is_retryable());
        assert!(!ApiError::http(400, "bad").is_retryable());
        assert!(!ApiError::Decode("eof".into()).is_retryable());

        assert!(ApiError::http(409, "epoch").is_epoch_conflict());
        assert!(!ApiError::http(500, "boom").is_epoch_conflict());
        assert_eq!(ApiError::http(404, "nope").status(), Some(404));
    }

    #[test]
    fn test_conversation_view_wire_names() {
        let json = r#"{
            "id": "c1",
            "groupId": "abcd",
            "creatorDid": "did:alice",
            "members": [],
            "epoch": 2,
            "cipherSuite": "suite",
            "createdAt": 10
        }"#;
        let view: ConversationView = serde_json::from_str(json).unwrap();
        assert_eq!(view.group_id, "abcd");
        assert_eq!(view.last_message_at, None);
        assert_eq!(view.metadata, ConversationMetadata::default());
    }
}
