//! Engine events
//!
//! Events emitted by the group state manager for UI and sync layers.

use serde::{Deserialize, Serialize};

pub mod observers;

pub use observers::{ObserverRegistry, ObserverToken, Subscription};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupEvent {
    ConversationCreated {
        conversation_id: String,
        epoch: u64,
    },

    /// Joined through a welcome message
    ConversationJoined {
        conversation_id: String,
        epoch: u64,
    },

    MembersAdded {
        conversation_id: String,
        member_dids: Vec<String>,
        epoch: u64,
    },

    ConversationLeft {
        conversation_id: String,
    },

    EpochUpdated {
        conversation_id: String,
        old_epoch: u64,
        new_epoch: u64,
    },

    MessageReceived {
        conversation_id: String,
        message_id: String,
        sequence_number: i64,
    },

    MessageSent {
        conversation_id: String,
        message_id: String,
    },

    /// An inbound message was replaced by a placeholder
    PlaceholderStored {
        conversation_id: String,
        message_id: String,
        error: String,
    },

    RecoveryTriggered {
        conversation_id: String,
        reason: String,
    },

    SyncCompleted {
        count: usize,
    },

    SyncFailed {
        error: String,
    },

    KeyPackagePublished {
        key_package_ref: String,
        expires_at: i64,
    },
}

impl GroupEvent {
    /// Conversation this event concerns, if any
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            GroupEvent::ConversationCreated { conversation_id, .. }
            | GroupEvent::ConversationJoined { conversation_id, .. }
            | GroupEvent::MembersAdded { conversation_id, .. }
            | GroupEvent::ConversationLeft { conversation_id }
            | GroupEvent::EpochUpdated { conversation_id, .. }
            | GroupEvent::MessageReceived { conversation_id, .. }
            | GroupEvent::MessageSent { conversation_id, .. }
            | GroupEvent::PlaceholderStored { conversation_id, .. }
            | GroupEvent::RecoveryTriggered { conversation_id, .. } => Some(conversation_id),
            GroupEvent::SyncCompleted { .. }
            | GroupEvent::SyncFailed { .. }
            | GroupEvent::KeyPackagePublished { .. } => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            GroupEvent::SyncFailed { .. } | GroupEvent::PlaceholderStored { .. }
        )
    }
}
