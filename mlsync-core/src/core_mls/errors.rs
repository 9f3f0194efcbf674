//! Error types for conversation engine operations

use thiserror::Error;

use super::traits::ApiError;
use super::types::ConversationState;

/// Result type for engine operations
pub type MlsResult<T> = Result<T, MlsError>;

/// Coarse grouping of [`MlsError`] used for reporting and retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Authentication,
    NotFound,
    MalformedInput,
    Consistency,
    Server,
    State,
    Internal,
}

/// Errors that can occur in engine operations
#[derive(Debug, Error)]
pub enum MlsError {
    /// No signed-in identity is available
    #[error("No authenticated user")]
    NoAuthentication,

    /// The crypto engine was used before initialisation
    #[error("Crypto context not initialized")]
    ContextNotInitialized,

    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("Group state not found: {0}")]
    GroupStateNotFound(String),

    #[error("Invalid group id: {0}")]
    InvalidGroupId(String),

    #[error("Invalid welcome message: {0}")]
    InvalidWelcomeMessage(String),

    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Invalid ciphertext: {0}")]
    InvalidCiphertext(String),

    #[error("Decoding failed: {0}")]
    DecodingFailed(String),

    /// Key packages could not be fetched for these DIDs
    #[error("Missing key packages for: {}", .0.join(", "))]
    MissingKeyPackages(Vec<String>),

    #[error("Epoch {epoch} out of range (oldest accepted: {min_epoch})")]
    EpochOutOfRange { epoch: u64, min_epoch: u64 },

    #[error("Sequence number {sequence} out of bounds (limit: {upper_limit})")]
    SequenceOutOfBounds { sequence: i64, upper_limit: i64 },

    #[error("Server error: {0}")]
    ServerError(#[from] ApiError),

    #[error("Sync failed: {0}")]
    SyncFailed(String),

    #[error("Conversation {conversation_id} not ready (state: {state})")]
    ConversationNotReady {
        conversation_id: String,
        state: ConversationState,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Operation stopped at a cancellation checkpoint
    #[error("Operation cancelled")]
    Cancelled,
}

impl MlsError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            MlsError::NoAuthentication | MlsError::ContextNotInitialized => {
                ErrorCategory::Authentication
            }
            MlsError::ConversationNotFound(_)
            | MlsError::GroupStateNotFound(_)
            | MlsError::InvalidGroupId(_) => ErrorCategory::NotFound,
            MlsError::InvalidWelcomeMessage(_)
            | MlsError::InvalidIdentity(_)
            | MlsError::InvalidMessage(_)
            | MlsError::InvalidCiphertext(_)
            | MlsError::DecodingFailed(_) => ErrorCategory::MalformedInput,
            MlsError::MissingKeyPackages(_)
            | MlsError::EpochOutOfRange { .. }
            | MlsError::SequenceOutOfBounds { .. } => ErrorCategory::Consistency,
            MlsError::ServerError(_) | MlsError::SyncFailed(_) => ErrorCategory::Server,
            MlsError::ConversationNotReady { .. } => ErrorCategory::State,
            MlsError::Storage(_)
            | MlsError::Serialization(_)
            | MlsError::Crypto(_)
            | MlsError::Cancelled => ErrorCategory::Internal,
        }
    }

    /// Whether the caller may retry the failed operation unchanged.
    ///
    /// Only server-side 5xx, 409 epoch conflicts and connectivity failures
    /// qualify; scheduling the retry is left to the caller.
    pub fn is_retryable(&self) -> bool {
        match self {
            MlsError::ServerError(api) => api.is_retryable() || api.is_epoch_conflict(),
            MlsError::SyncFailed(_) => true,
            _ => false,
        }
    }

    /// Short machine-readable name used in diagnostic records
    pub fn kind(&self) -> &'static str {
        match self {
            MlsError::NoAuthentication => "noAuthentication",
            MlsError::ContextNotInitialized => "contextNotInitialized",
            MlsError::ConversationNotFound(_) => "conversationNotFound",
            MlsError::GroupStateNotFound(_) => "groupStateNotFound",
            MlsError::InvalidGroupId(_) => "invalidGroupId",
            MlsError::InvalidWelcomeMessage(_) => "invalidWelcomeMessage",
            MlsError::InvalidIdentity(_) => "invalidIdentity",
            MlsError::InvalidMessage(_) => "invalidMessage",
            MlsError::InvalidCiphertext(_) => "invalidCiphertext",
            MlsError::DecodingFailed(_) => "decodingFailed",
            MlsError::MissingKeyPackages(_) => "missingKeyPackages",
            MlsError::EpochOutOfRange { .. } => "epochOutOfRange",
            MlsError::SequenceOutOfBounds { .. } => "sequenceOutOfBounds",
            MlsError::ServerError(_) => "serverError",
            MlsError::SyncFailed(_) => "syncFailed",
            MlsError::ConversationNotReady { .. } => "conversationNotReady",
            MlsError::Storage(_) => "storage",
            MlsError::Serialization(_) => "serialization",
            MlsError::Crypto(_) => "crypto",
            MlsError::Cancelled => "cancelled",
        }
    }
}

impl From<serde_json::Error> for MlsError {
    fn from(e: serde_json::Error) -> Self {
        MlsError::Serialization(e.to_string())
    }
}

impl From<rusqlite::Error> for MlsError {
    fn from(e: rusqlite::Error) -> Self {
        MlsError::Storage(e.to_string())
    }
}

impl From<r2d2::Error> for MlsError {
    fn from(e: r2d2::Error) -> Self {
        MlsError::Storage(format!("Failed to get connection: {}", e))
    }
}

impl From<tokio::task::JoinError> for MlsError {
    fn from(e: tokio::task::JoinError) -> Self {
        MlsError::Storage(format!("Task join error: {}", e))
    }
}
