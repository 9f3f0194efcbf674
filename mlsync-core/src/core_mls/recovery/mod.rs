//! Failure handling for inbound messages
//!
//! When a message cannot be validated or decrypted the conversation must
//! keep moving: the message is replaced by a placeholder, the failure is
//! logged to the diagnostics table and counted. Enough consecutive failures
//! trigger a rejoin request, at most once per debounce interval across all
//! processes sharing the store.

pub mod validation;

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::RecoveryConfig;
use crate::core_mls::clock::{duration_millis, Clock};
use crate::core_mls::errors::{ErrorCategory, MlsError, MlsResult};
use crate::core_mls::storage::{DiagnosticRecord, SqlStateStore};
use crate::core_mls::traits::ApiClient;
use crate::core_mls::types::Message;
use crate::metrics::{record_counter, MESSAGES_PLACEHOLDERS, RECOVERY_TRIGGERED};

pub use validation::{should_trigger_recovery, validate_message_epoch, validate_message_sequence};

/// Identity of the message that failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedMessage {
    pub message_id: String,
    pub conversation_id: String,
    pub sender_did: String,
    pub epoch: u64,
    pub sequence_number: i64,
    pub created_at: i64,
}

/// What [`RecoveryCoordinator::handle_failure`] did
#[derive(Debug, Clone)]
pub struct FailureReport {
    pub placeholder: Message,
    pub consecutive_failures: u32,
    /// A rejoin request was sent successfully
    pub recovery_triggered: bool,
}

/// How a commit-flow failure should be treated by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Retryable,
    Permanent,
}

pub struct RecoveryCoordinator {
    store: Arc<SqlStateStore>,
    api: Arc<dyn ApiClient>,
    clock: Arc<dyn Clock>,
    config: RecoveryConfig,
    user_did: String,
}

impl RecoveryCoordinator {
    pub fn new(
        store: Arc<SqlStateStore>,
        api: Arc<dyn ApiClient>,
        clock: Arc<dyn Clock>,
        config: RecoveryConfig,
        user_did: impl Into<String>,
    ) -> Self {
        Self {
            store,
            api,
            clock,
            config,
            user_did: user_did.into(),
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    pub fn validate_message_epoch(&self, message_epoch: u64, current_epoch: u64) -> MlsResult<()> {
        validate_message_epoch(message_epoch, current_epoch, self.config.max_past_epochs)
    }

    pub fn validate_message_sequence(
        &self,
        sequence_number: i64,
        upper_limit: i64,
    ) -> MlsResult<()> {
        validate_message_sequence(sequence_number, upper_limit)
    }

    pub fn classify(error: &MlsError) -> FailureClass {
        if error.is_retryable() {
            FailureClass::Retryable
        } else {
            FailureClass::Permanent
        }
    }

    /// Errors caused by one message's content rather than by local state
    pub fn is_message_failure(error: &MlsError) -> bool {
        matches!(
            error.category(),
            ErrorCategory::MalformedInput | ErrorCategory::Consistency
        ) || matches!(error, MlsError::Crypto(_) | MlsError::GroupStateNotFound(_))
    }

    /// Persist a placeholder in place of the failed message
    ///
    /// If a real message with the same id already exists it is kept.
    pub async fn save_placeholder(
        &self,
        failed: &FailedMessage,
        error: &MlsError,
    ) -> MlsResult<Message> {
        let placeholder = Message::placeholder(
            failed.message_id.clone(),
            failed.conversation_id.clone(),
            failed.sender_did.clone(),
            failed.epoch,
            failed.sequence_number,
            failed.created_at,
            error,
        );

        if self.store.insert_message(&self.user_did, &placeholder).await? {
            record_counter(MESSAGES_PLACEHOLDERS, 1);
        }
        Ok(placeholder)
    }

    pub async fn log_error(&self, failed: &FailedMessage, error: &MlsError) -> MlsResult<()> {
        let record = DiagnosticRecord {
            id: None,
            conversation_id: failed.conversation_id.clone(),
            message_id: Some(failed.message_id.clone()),
            error_type: error.kind().to_string(),
            message: error.to_string(),
            epoch: Some(failed.epoch),
            sequence_number: Some(failed.sequence_number),
            created_at: self.clock.now_millis(),
        };
        self.store.insert_diagnostic(&record).await?;
        Ok(())
    }

    pub async fn record_failure(&self, conversation_id: &str) -> MlsResult<u32> {
        self.store.increment_failures(conversation_id, &self.user_did).await
    }

    /// Reset the failure counter after a successful decrypt or rejoin
    pub async fn record_recovery_success(&self, conversation_id: &str) -> MlsResult<()> {
        self.store.reset_failures(conversation_id, &self.user_did).await
    }

    pub fn should_trigger_recovery(&self, last_attempt: Option<i64>) -> bool {
        should_trigger_recovery(
            last_attempt,
            self.clock.now_millis(),
            duration_millis(self.config.debounce_interval),
        )
    }

    /// Request a rejoin unless one was requested within the debounce window
    ///
    /// Returns `Ok(false)` when debounced. The attempt timestamp is claimed
    /// before the request is sent, so a failed request still counts against
    /// the window.
    pub async fn trigger_recovery(&self, conversation_id: &str, reason: &str) -> MlsResult<bool> {
        let conversation = self
            .store
            .get_conversation(conversation_id, &self.user_did)
            .await?
            .ok_or_else(|| MlsError::ConversationNotFound(conversation_id.to_string()))?;

        if !self.should_trigger_recovery(conversation.last_recovery_attempt) {
            info!(conversation_id = %conversation_id, "Rejoin debounced");
            return Ok(false);
        }

        let claimed = self
            .store
            .claim_recovery_attempt(
                conversation_id,
                &self.user_did,
                conversation.last_recovery_attempt,
                self.clock.now_millis(),
            )
            .await?;
        if !claimed {
            info!(conversation_id = %conversation_id, "Rejoin already claimed by another process");
            return Ok(false);
        }

        warn!(conversation_id = %conversation_id, reason = %reason, "Requesting rejoin");
        self.api.request_rejoin(conversation_id, reason).await?;
        record_counter(RECOVERY_TRIGGERED, 1);
        Ok(true)
    }

    /// Placeholder, diagnostics entry, failure count, and a rejoin once the
    /// threshold is reached
    ///
    /// A failing rejoin request is logged and recorded but does not fail the
    /// call; the placeholder is already stored at that point.
    pub async fn handle_failure(
        &self,
        failed: &FailedMessage,
        error: &MlsError,
    ) -> MlsResult<FailureReport> {
        warn!(
            conversation_id = %failed.conversation_id,
            message_id = %failed.message_id,
            sequence_number = failed.sequence_number,
            error = %error,
            "Inbound message failed, storing placeholder"
        );

        let placeholder = self.save_placeholder(failed, error).await?;
        self.log_error(failed, error).await?;
        let consecutive_failures = self.record_failure(&failed.conversation_id).await?;

        let mut recovery_triggered = false;
        if consecutive_failures >= self.config.failure_threshold {
            let reason = format!("{} consecutive failures: {}", consecutive_failures, error.kind());
            match self.trigger_recovery(&failed.conversation_id, &reason).await {
                Ok(sent) => recovery_triggered = sent,
                Err(e) => {
                    warn!(
                        conversation_id = %failed.conversation_id,
                        error = %e,
                        "Rejoin request failed"
                    );
                    let record = DiagnosticRecord {
                        id: None,
                        conversation_id: failed.conversation_id.clone(),
                        message_id: None,
                        error_type: e.kind().to_string(),
                        message: format!("rejoin request failed: {}", e),
                        epoch: Some(failed.epoch),
                        sequence_number: None,
                        created_at: self.clock.now_millis(),
                    };
                    self.store.insert_diagnostic(&record).await?;
                }
            }
        }

        Ok(FailureReport {
            placeholder,
            consecutive_failures,
            recovery_triggered,
        })
    }

    pub async fn diagnostics(&self, conversation_id: &str) -> MlsResult<Vec<DiagnosticRecord>> {
        self.store.diagnostics_for(conversation_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::core_mls::clock::ManualClock;
    use crate::core_mls::providers::InMemoryDeliveryService;
    use crate::core_mls::traits::{ApiError, CreateConversationRequest};
    use crate::core_mls::types::{
        Conversation, ConversationMetadata, ConversationState, PLACEHOLDER_TEXT,
    };
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        store: Arc<SqlStateStore>,
        api: InMemoryDeliveryService,
        clock: Arc<ManualClock>,
        recovery: RecoveryCoordinator,
    }

    async fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let store = Arc::new(
            SqlStateStore::open(dir.path().join("recovery.db"), &StoreConfig::default()).unwrap(),
        );
        let api = InMemoryDeliveryService::new();
        let client = Arc::new(api.client("did:alice"));
        client
            .create_conversation(CreateConversationRequest {
                conversation_id: "c1".into(),
                group_id: "00".into(),
                cipher_suite: "suite".into(),
                creator_did: "did:bob".into(),
                initial_members: Some(vec!["did:alice".into()]),
                metadata: None,
                commit: None,
                welcome: None,
            })
            .await
            .unwrap();
        let clock = Arc::new(ManualClock::new(10_000_000));
        let recovery = RecoveryCoordinator::new(
            store.clone(),
            client,
            clock.clone(),
            RecoveryConfig::default(),
            "did:alice",
        );

        store
            .insert_conversation(
                "did:alice",
                &Conversation {
                    conversation_id: "c1".into(),
                    group_id: "00".into(),
                    creator_did: "did:bob".into(),
                    members: vec![],
                    epoch: 3,
                    cipher_suite: "suite".into(),
                    created_at: 0,
                    updated_at: 0,
                    last_message_at: None,
                    metadata: ConversationMetadata::default(),
                    state: ConversationState::Active,
                    consecutive_failures: 0,
                    last_recovery_attempt: None,
                },
            )
            .await
            .unwrap();

        Fixture {
            _dir: dir,
            store,
            api,
            clock,
            recovery,
        }
    }

    fn failed(seq: i64) -> FailedMessage {
        FailedMessage {
            message_id: format!("m{}", seq),
            conversation_id: "c1".into(),
            sender_did: "did:bob".into(),
            epoch: 3,
            sequence_number: seq,
            created_at: seq,
        }
    }

    #[tokio::test]
    async fn test_placeholder_is_stored_with_error() {
        let f = fixture().await;
        let err = MlsError::InvalidCiphertext("tag mismatch".into());

        let report = f.recovery.handle_failure(&failed(0), &err).await.unwrap();
        assert!(report.placeholder.is_placeholder);
        assert_eq!(report.consecutive_failures, 1);
        assert!(!report.recovery_triggered);

        let messages = f.store.list_messages("c1", "did:alice").await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].plaintext.as_deref(), Some(PLACEHOLDER_TEXT));

        let diagnostics = f.recovery.diagnostics("c1").await.unwrap();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].error_type, "invalidCiphertext");
        assert_eq!(diagnostics[0].sequence_number, Some(0));
    }

    #[tokio::test]
    async fn test_threshold_triggers_single_debounced_rejoin() {
        let f = fixture().await;
        let err = MlsError::DecodingFailed("garbage".into());

        for seq in 0..2 {
            let report = f.recovery.handle_failure(&failed(seq), &err).await.unwrap();
            assert!(!report.recovery_triggered);
        }
        let report = f.recovery.handle_failure(&failed(2), &err).await.unwrap();
        assert!(report.recovery_triggered);
        assert_eq!(f.api.rejoin_requests().len(), 1);

        // Inside the debounce window nothing more is sent
        f.clock.advance(Duration::from_secs(30));
        let report = f.recovery.handle_failure(&failed(3), &err).await.unwrap();
        assert!(!report.recovery_triggered);
        assert_eq!(f.api.rejoin_requests().len(), 1);

        f.clock.advance(Duration::from_secs(31));
        let report = f.recovery.handle_failure(&failed(4), &err).await.unwrap();
        assert!(report.recovery_triggered);
        assert_eq!(f.api.rejoin_requests().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_rejoin_keeps_placeholder() {
        let f = fixture().await;
        f.api
            .fail_next("request_rejoin", ApiError::http(503, "unavailable"));

        let err = MlsError::InvalidMessage("bad".into());
        for seq in 0..3 {
            f.recovery.handle_failure(&failed(seq), &err).await.unwrap();
        }

        let messages = f.store.list_messages("c1", "did:alice").await.unwrap();
        assert_eq!(messages.len(), 3);
        assert!(messages.iter().all(|m| m.is_placeholder));
        assert!(f.api.rejoin_requests().is_empty());

        let diagnostics = f.recovery.diagnostics("c1").await.unwrap();
        assert_eq!(diagnostics.len(), 4);
        assert!(diagnostics[3].message.starts_with("rejoin request failed"));

        // The failed attempt still counts against the window
        let convo = f.store.get_conversation("c1", "did:alice").await.unwrap().unwrap();
        assert!(convo.last_recovery_attempt.is_some());
        assert!(!f.recovery.trigger_recovery("c1", "manual").await.unwrap());
    }

    #[tokio::test]
    async fn test_success_resets_counter() {
        let f = fixture().await;
        let err = MlsError::InvalidCiphertext("x".into());
        f.recovery.handle_failure(&failed(0), &err).await.unwrap();
        f.recovery.handle_failure(&failed(1), &err).await.unwrap();

        f.recovery.record_recovery_success("c1").await.unwrap();
        let report = f.recovery.handle_failure(&failed(2), &err).await.unwrap();
        assert_eq!(report.consecutive_failures, 1);
    }

    #[test]
    fn test_classification() {
        assert_eq!(
            RecoveryCoordinator::classify(&MlsError::ServerError(ApiError::http(409, "epoch"))),
            FailureClass::Retryable
        );
        assert_eq!(
            RecoveryCoordinator::classify(&MlsError::ServerError(ApiError::http(403, "no"))),
            FailureClass::Permanent
        );
        assert!(RecoveryCoordinator::is_message_failure(&MlsError::InvalidCiphertext("x".into())));
        assert!(RecoveryCoordinator::is_message_failure(&MlsError::EpochOutOfRange {
            epoch: 1,
            min_epoch: 2
        }));
        assert!(!RecoveryCoordinator::is_message_failure(&MlsError::Storage("disk".into())));
    }
}
