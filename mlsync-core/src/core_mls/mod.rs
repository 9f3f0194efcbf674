//! Conversation state engine
//!
//! Four cooperating subsystems keep a client's view of its encrypted
//! conversations consistent:
//!
//! - [`SequenceCoordinator`]: per-conversation ordering gate. Decides whether
//!   an inbound message is processed now, buffered, or dropped as a duplicate,
//!   and drains buffered runs once gaps fill.
//! - [`GroupStateManager`]: conversation lifecycle, membership and epoch
//!   changes, message send/receive, and server synchronisation.
//! - [`RecoveryCoordinator`]: validates inbound messages, stores placeholders
//!   for failures and requests debounced rejoins.
//! - [`KeyVault`]: namespaced secret storage driven by epoch transitions.
//!
//! ## Concurrency
//!
//! A foreground app and a background notification handler may open the same
//! database file at the same time. No in-memory copy of sequence or epoch
//! state is authoritative: every transition is a conditional write checked
//! against the value currently stored (compare-and-set).
//!
//! ```text
//! inbound ─▶ SequenceCoordinator ─▶ RecoveryCoordinator ─▶ CryptoEngine
//!                 (order gate)          (validation)         (decrypt)
//!                                            │
//!                      failure ◀─────────────┘────────▶ success
//!                 placeholder + rejoin               persist + notify
//! ```

pub mod clock;
pub mod errors;
pub mod events;
pub mod group_manager;
pub mod key_vault;
pub mod providers;
pub mod recovery;
pub mod sequencer;
pub mod storage;
pub mod traits;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use errors::{ErrorCategory, MlsError, MlsResult};
pub use events::{GroupEvent, ObserverRegistry, ObserverToken, Subscription};
pub use group_manager::{
    GroupStateManager, InboundOutcome, ManagerDeps, PublishedKeyPackage, SyncOutcome,
};
pub use key_vault::{ArchivedKey, KeyVault, MemoryVaultBackend, SqlVaultBackend, VaultBackend};
pub use recovery::{FailedMessage, FailureClass, FailureReport, RecoveryCoordinator};
pub use sequencer::{SequenceCoordinator, SequenceDecision};
pub use storage::{DiagnosticRecord, SqlStateStore};
pub use traits::{ApiClient, ApiError, CryptoEngine};
pub use types::{
    Attachment, Conversation, ConversationMetadata, ConversationState, GroupConfig,
    InboundMessage, Member, Message, MessageSource, PendingMessage, SequenceState,
};
