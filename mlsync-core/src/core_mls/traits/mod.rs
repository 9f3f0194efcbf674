//! Trait seams
//!
//! The engine never talks to a concrete MLS library or HTTP client. Both are
//! injected behind these traits so tests can substitute deterministic
//! implementations from [`crate::core_mls::providers`].

pub mod api;
pub mod crypto;

pub use api::{
    AddMembersResponse, ApiClient, ApiError, CommitEnvelope, ConversationPage, ConversationView,
    CreateConversationRequest, CreatedConversation, KeyPackageView, KeyPackagesResponse,
    LeaveResponse, MessagePage, MessageQuery, SendMessageRequest, SentMessage, SortField,
    SortOrder, WelcomeDelivery,
};
pub use crypto::{CryptoEngine, DecryptedMessage, KeyPackageBundle, StagedCommit};
