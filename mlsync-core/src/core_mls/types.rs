//! Type definitions for conversations, messages and ordering state

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::errors::{MlsError, MlsResult};

/// `lastProcessedSeq` value before any message was processed
pub const NO_SEQUENCE: i64 = -1;

/// Body shown in place of a message that could not be decrypted or validated
pub const PLACEHOLDER_TEXT: &str = "⚠️ Message unavailable";

/// Lifecycle of a conversation
///
/// `Uninitialized → Initializing → Active`, `Initializing → Failed` when
/// the initial sync fails, and `Active → Removed` on leave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    Uninitialized,
    Initializing,
    Active,
    Failed,
    Removed,
}

impl ConversationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationState::Uninitialized => "uninitialized",
            ConversationState::Initializing => "initializing",
            ConversationState::Active => "active",
            ConversationState::Failed => "failed",
            ConversationState::Removed => "removed",
        }
    }

    /// Whether the transition `self → next` is part of the lifecycle
    pub fn can_transition_to(&self, next: ConversationState) -> bool {
        use ConversationState::*;
        matches!(
            (self, next),
            (Uninitialized, Initializing)
                | (Initializing, Active)
                | (Initializing, Failed)
                | (Failed, Initializing)
                | (Active, Removed)
        )
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversationState {
    type Err = MlsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uninitialized" => Ok(ConversationState::Uninitialized),
            "initializing" => Ok(ConversationState::Initializing),
            "active" => Ok(ConversationState::Active),
            "failed" => Ok(ConversationState::Failed),
            "removed" => Ok(ConversationState::Removed),
            other => Err(MlsError::Storage(format!("unknown conversation state '{}'", other))),
        }
    }
}

/// Group member as seen by this client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub did: String,
    pub joined_at: i64,
    /// Position in the group's ratchet tree
    pub leaf_index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<Vec<u8>>,
}

/// User-visible conversation metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A conversation record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub conversation_id: String,
    /// Hex-encoded cryptographic group id
    pub group_id: String,
    pub creator_did: String,
    pub members: Vec<Member>,
    pub epoch: u64,
    pub cipher_suite: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_message_at: Option<i64>,
    pub metadata: ConversationMetadata,
    pub state: ConversationState,
    pub consecutive_failures: u32,
    pub last_recovery_attempt: Option<i64>,
}

impl Conversation {
    pub fn group_id_bytes(&self) -> MlsResult<Vec<u8>> {
        hex::decode(&self.group_id).map_err(|e| MlsError::InvalidGroupId(e.to_string()))
    }

    pub fn is_active(&self) -> bool {
        self.state == ConversationState::Active
    }

    pub fn member_dids(&self) -> Vec<String> {
        self.members.iter().map(|m| m.did.clone()).collect()
    }
}

/// Rich content attached to a message
///
/// Serialized with a `kind` discriminator so new variants from the server
/// decode into a known shape or fail loudly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Attachment {
    Image {
        blob_ref: String,
        mime_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alt_text: Option<String>,
    },
    File {
        blob_ref: String,
        file_name: String,
        size_bytes: u64,
    },
    Link {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    Quote {
        message_id: String,
    },
}

/// A stored message, decrypted or placeholder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_did: String,
    pub ciphertext: Option<Vec<u8>>,
    pub plaintext: Option<String>,
    pub epoch: u64,
    pub sequence_number: i64,
    pub created_at: i64,
    pub content_type: String,
    pub attachments: Vec<Attachment>,
    pub is_placeholder: bool,
    pub error_message: Option<String>,
}

impl Message {
    /// Stand-in for a message that failed validation or decryption
    pub fn placeholder(
        id: impl Into<String>,
        conversation_id: impl Into<String>,
        sender_did: impl Into<String>,
        epoch: u64,
        sequence_number: i64,
        created_at: i64,
        error: &MlsError,
    ) -> Self {
        Self {
            id: id.into(),
            conversation_id: conversation_id.into(),
            sender_did: sender_did.into(),
            ciphertext: None,
            plaintext: Some(PLACEHOLDER_TEXT.to_string()),
            epoch,
            sequence_number,
            created_at,
            content_type: "text/plain".to_string(),
            attachments: Vec::new(),
            is_placeholder: true,
            error_message: Some(error.to_string()),
        }
    }
}

/// Message as delivered by the network, before decryption
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_did: String,
    pub ciphertext: Vec<u8>,
    pub epoch: u64,
    pub sequence_number: i64,
    pub created_at: i64,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

fn default_content_type() -> String {
    "text/plain".to_string()
}

/// Where an inbound message came from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageSource {
    Sse,
    Push,
    Sync,
    Other(String),
}

impl MessageSource {
    pub fn as_str(&self) -> &str {
        match self {
            MessageSource::Sse => "sse",
            MessageSource::Push => "push",
            MessageSource::Sync => "sync",
            MessageSource::Other(tag) => tag,
        }
    }

    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "sse" => MessageSource::Sse,
            "push" => MessageSource::Push,
            "sync" => MessageSource::Sync,
            other => MessageSource::Other(other.to_string()),
        }
    }
}

impl fmt::Display for MessageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordering state for one (conversation, user) pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceState {
    pub conversation_id: String,
    pub current_user_did: String,
    pub last_processed_seq: i64,
    pub updated_at: i64,
}

/// A buffered inbound message waiting for its predecessors
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub message_id: String,
    pub current_user_did: String,
    pub conversation_id: String,
    pub sequence_number: i64,
    pub epoch: u64,
    /// Serialized [`InboundMessage`]
    pub payload: Vec<u8>,
    pub received_at: i64,
    pub process_attempts: u32,
    pub source: MessageSource,
}

impl PendingMessage {
    pub fn from_inbound(
        message: &InboundMessage,
        current_user_did: &str,
        source: MessageSource,
        received_at: i64,
    ) -> MlsResult<Self> {
        Ok(Self {
            message_id: message.id.clone(),
            current_user_did: current_user_did.to_string(),
            conversation_id: message.conversation_id.clone(),
            sequence_number: message.sequence_number,
            epoch: message.epoch,
            payload: serde_json::to_vec(message)?,
            received_at,
            process_attempts: 0,
            source,
        })
    }

    pub fn decode(&self) -> MlsResult<InboundMessage> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| MlsError::DecodingFailed(format!("buffered payload: {}", e)))
    }
}

/// Group parameters handed to the crypto engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Past epochs whose secrets stay usable for late messages
    pub max_past_epochs: u64,
    pub out_of_order_tolerance: u32,
    pub maximum_forward_distance: u64,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            max_past_epochs: 5,
            out_of_order_tolerance: 10,
            maximum_forward_distance: 2000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        use ConversationState::*;
        assert!(Uninitialized.can_transition_to(Initializing));
        assert!(Initializing.can_transition_to(Active));
        assert!(Initializing.can_transition_to(Failed));
        assert!(Active.can_transition_to(Removed));
        assert!(!Active.can_transition_to(Initializing));
        assert!(!Removed.can_transition_to(Active));
    }

    #[test]
    fn test_state_string_roundtrip() {
        for state in [
            ConversationState::Uninitialized,
            ConversationState::Initializing,
            ConversationState::Active,
            ConversationState::Failed,
            ConversationState::Removed,
        ] {
            assert_eq!(state.as_str().parse::<ConversationState>().unwrap(), state);
        }
        assert!("gone".parse::<ConversationState>().is_err());
    }

    #[test]
    fn test_attachment_kind_discriminator() {
        let link = Attachment::Link {
            url: "https://example.org".into(),
            title: None,
        };
        let json = serde_json::to_value(&link).unwrap();
        assert_eq!(json["kind"], "link");

        let quote: Attachment =
            serde_json::from_str(r#"{"kind":"quote","message_id":"m1"}"#).unwrap();
        assert_eq!(
            quote,
            Attachment::Quote {
                message_id: "m1".into()
            }
        );

        assert!(serde_json::from_str::<Attachment>(r#"{"kind":"poll"}"#).is_err());
    }

    #[test]
    fn test_placeholder_carries_error_text() {
        let err = MlsError::InvalidCiphertext("auth tag mismatch".into());
        let msg = Message::placeholder("m1", "c1", "did:bob", 3, 7, 0, &err);
        assert!(msg.is_placeholder);
        assert_eq!(msg.plaintext.as_deref(), Some(PLACEHOLDER_TEXT));
        assert_eq!(
            msg.error_message.as_deref(),
            Some("Invalid ciphertext: auth tag mismatch")
        );
        assert_eq!(msg.sequence_number, 7);
    }

    #[test]
    fn test_message_source_tags() {
        assert_eq!(MessageSource::from_tag("sse"), MessageSource::Sse);
        assert_eq!(MessageSource::from_tag("push").as_str(), "push");
        assert_eq!(
            MessageSource::from_tag("backfill"),
            MessageSource::Other("backfill".into())
        );
    }

    #[test]
    fn test_pending_payload_decodes() {
        let inbound = InboundMessage {
            id: "m1".into(),
            conversation_id: "c1".into(),
            sender_did: "did:bob".into(),
            ciphertext: vec![1, 2, 3],
            epoch: 2,
            sequence_number: 4,
            created_at: 10,
            content_type: "text/plain".into(),
            attachments: vec![],
        };
        let pending = PendingMessage::from_inbound(&inbound, "did:alice", MessageSource::Push, 11)
            .unwrap();
        assert_eq!(pending.decode().unwrap(), inbound);

        let broken = PendingMessage {
            payload: b"not json".to_vec(),
            ..pending
        };
        assert!(matches!(broken.decode(), Err(MlsError::DecodingFailed(_))));
    }
}
