//! Per-conversation message ordering
//!
//! The server assigns every message in a conversation a sequence number.
//! [`SequenceCoordinator`] makes sure a client applies them strictly in that
//! order even when they arrive through different channels (SSE, push, sync)
//! and different processes. Out-of-order arrivals are buffered in
//! `pending_messages` and released as a contiguous run once the gap fills.
//!
//! `lastProcessedSeq` only ever moves from `n` to `n + 1`, and only through a
//! compare-and-set against the stored value. A process that loses the race
//! re-reads and retries; it never overwrites a sibling's progress.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::SequencingConfig;
use crate::core_mls::clock::{duration_millis, Clock};
use crate::core_mls::errors::MlsResult;
use crate::core_mls::storage::SqlStateStore;
use crate::core_mls::types::{InboundMessage, MessageSource, PendingMessage, NO_SEQUENCE};
use crate::metrics::{record_counter, MESSAGES_BUFFERED};

/// Attempts before giving up on a contended sequence write
const MAX_CAS_ATTEMPTS: usize = 8;

/// What to do with an inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceDecision {
    /// Next in line; decrypt and apply it now
    ProcessNow,
    /// A predecessor is missing; park it
    Buffer,
    /// Already applied or already buffered
    AlreadyProcessed,
}

/// Ordering gate backed by the shared store
pub struct SequenceCoordinator {
    store: Arc<SqlStateStore>,
    clock: Arc<dyn Clock>,
    stale_timeout: Duration,
}

impl SequenceCoordinator {
    pub fn new(
        store: Arc<SqlStateStore>,
        clock: Arc<dyn Clock>,
        config: &SequencingConfig,
    ) -> Self {
        Self {
            store,
            clock,
            stale_timeout: config.stale_timeout,
        }
    }

    pub async fn last_processed_seq(
        &self,
        conversation_id: &str,
        user_did: &str,
    ) -> MlsResult<i64> {
        self.store.last_processed_seq(conversation_id, user_did).await
    }

    /// Classify an inbound message against the stored sequence state
    pub async fn should_process_message(
        &self,
        message_id: &str,
        conversation_id: &str,
        sequence_number: i64,
        user_did: &str,
    ) -> MlsResult<SequenceDecision> {
        let last = self.store.last_processed_seq(conversation_id, user_did).await?;

        if sequence_number <= last {
            debug!(
                conversation_id = %conversation_id,
                message_id = %message_id,
                sequence_number,
                last_processed = last,
                "Dropping already processed message"
            );
            return Ok(SequenceDecision::AlreadyProcessed);
        }

        if self.store.pending_exists(message_id, user_did).await? {
            return Ok(SequenceDecision::AlreadyProcessed);
        }

        if sequence_number == last + 1 {
            Ok(SequenceDecision::ProcessNow)
        } else {
            Ok(SequenceDecision::Buffer)
        }
    }

    /// Park a message until its predecessors arrive
    ///
    /// Idempotent per message id; returns false when the message was already
    /// buffered.
    pub async fn buffer_message(
        &self,
        message: &InboundMessage,
        user_did: &str,
        source: MessageSource,
    ) -> MlsResult<bool> {
        let pending =
            PendingMessage::from_inbound(message, user_did, source, self.clock.now_millis())?;
        let inserted = self.store.insert_pending(&pending).await?;

        if inserted {
            record_counter(MESSAGES_BUFFERED, 1);
            debug!(
                conversation_id = %message.conversation_id,
                message_id = %message.id,
                sequence_number = message.sequence_number,
                source = %pending.source,
                "Buffered out-of-order message"
            );
        }

        Ok(inserted)
    }

    /// Advance `lastProcessedSeq` to `sequence_number` and return the
    /// buffered run that is now ready, in ascending order
    ///
    /// The write is accepted only when `sequence_number` is exactly one past
    /// the stored value; anything else is logged and leaves the state as is.
    /// Buffered rows at or below the resulting sequence are purged.
    pub async fn record_message_processed(
        &self,
        message_id: &str,
        conversation_id: &str,
        sequence_number: i64,
        user_did: &str,
    ) -> MlsResult<Vec<PendingMessage>> {
        let mut attempts = 0;
        let last = loop {
            let current = self.store.last_processed_seq(conversation_id, user_did).await?;

            if sequence_number != current + 1 {
                if sequence_number > current + 1 {
                    warn!(
                        conversation_id = %conversation_id,
                        message_id = %message_id,
                        sequence_number,
                        last_processed = current,
                        "Refusing to skip ahead of unprocessed messages"
                    );
                }
                break current;
            }

            let applied = self
                .store
                .compare_and_set_sequence(
                    conversation_id,
                    user_did,
                    current,
                    sequence_number,
                    self.clock.now_millis(),
                )
                .await?;
            if applied {
                break sequence_number;
            }

            attempts += 1;
            if attempts >= MAX_CAS_ATTEMPTS {
                warn!(
                    conversation_id = %conversation_id,
                    sequence_number,
                    "Sequence write still contended, leaving state unchanged"
                );
                break self.store.last_processed_seq(conversation_id, user_did).await?;
            }
        };

        let purged = self
            .store
            .delete_pending_through(conversation_id, user_did, last)
            .await?;
        if purged > 0 {
            debug!(conversation_id = %conversation_id, purged, "Purged obsolete buffered messages");
        }

        let buffered = self
            .store
            .pending_after(conversation_id, user_did, last)
            .await?;

        Ok(contiguous_run(buffered, last))
    }

    /// Start a fresh sequence state just after `sequence_number`
    ///
    /// Used when joining a conversation that already carries traffic: the
    /// earlier messages belong to epochs this member never had. Only a state
    /// that has never advanced is moved; returns whether the write happened.
    pub async fn start_after(
        &self,
        conversation_id: &str,
        user_did: &str,
        sequence_number: i64,
    ) -> MlsResult<bool> {
        if sequence_number <= NO_SEQUENCE {
            return Ok(false);
        }

        let started = self
            .store
            .compare_and_set_sequence(
                conversation_id,
                user_did,
                NO_SEQUENCE,
                sequence_number,
                self.clock.now_millis(),
            )
            .await?;
        if started {
            self.store
                .delete_pending_through(conversation_id, user_did, sequence_number)
                .await?;
            debug!(
                conversation_id = %conversation_id,
                last_processed = sequence_number,
                "Sequence state starts after existing traffic"
            );
        }
        Ok(started)
    }

    /// Buffered run that can be applied right now, without advancing anything
    pub async fn ready_messages(
        &self,
        conversation_id: &str,
        user_did: &str,
    ) -> MlsResult<Vec<PendingMessage>> {
        let last = self.store.last_processed_seq(conversation_id, user_did).await?;
        let buffered = self
            .store
            .pending_after(conversation_id, user_did, last)
            .await?;
        Ok(contiguous_run(buffered, last))
    }

    /// Every buffered message of a conversation, ascending
    pub async fn flush_buffered_messages(
        &self,
        conversation_id: &str,
        user_did: &str,
    ) -> MlsResult<Vec<PendingMessage>> {
        self.store
            .pending_after(conversation_id, user_did, i64::MIN)
            .await
    }

    /// Drop buffered messages older than the configured stale timeout
    pub async fn cleanup_stale_messages(&self, user_did: &str) -> MlsResult<usize> {
        self.cleanup_stale_messages_older_than(user_did, self.stale_timeout)
            .await
    }

    pub async fn cleanup_stale_messages_older_than(
        &self,
        user_did: &str,
        timeout: Duration,
    ) -> MlsResult<usize> {
        let cutoff = self.clock.now_millis() - duration_millis(timeout);
        let removed = self
            .store
            .delete_pending_received_before(user_did, cutoff)
            .await?;

        if removed > 0 {
            warn!(user_did = %user_did, removed, "Dropped stale buffered messages");
        }
        Ok(removed)
    }

    /// Count one more processing attempt on a buffered message
    pub async fn mark_attempt(&self, message_id: &str, user_did: &str) -> MlsResult<()> {
        self.store.increment_pending_attempts(message_id, user_did).await
    }

    pub async fn remove_buffered(&self, message_id: &str, user_did: &str) -> MlsResult<bool> {
        self.store.delete_pending(message_id, user_did).await
    }
}

/// Longest prefix of `buffered` (ascending) that continues right after `last`
fn contiguous_run(buffered: Vec<PendingMessage>, last: i64) -> Vec<PendingMessage> {
    let mut expected = last + 1;
    let mut run = Vec::new();
    for pending in buffered {
        if pending.sequence_number != expected {
            break;
        }
        expected += 1;
        run.push(pending);
    }
    run
}
