//! Application messages: send, decrypt and the inbound pipeline
//!
//! Inbound flow: the sequencer decides whether a message is next in line,
//! early or a duplicate. Early messages are buffered after a bounds check.
//! The next-in-line message is decrypted (catching up on commits first if it
//! is from a newer epoch), persisted, and then every buffered successor that
//! became contiguous is applied in order. Messages that cannot be validated
//! or decrypted are replaced by placeholders and still advance the sequence.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::GroupStateManager;
use crate::core_mls::errors::{MlsError, MlsResult};
use crate::core_mls::events::GroupEvent;
use crate::core_mls::recovery::{FailedMessage, FailureReport, RecoveryCoordinator};
use crate::core_mls::sequencer::SequenceDecision;
use crate::core_mls::traits::SendMessageRequest;
use crate::core_mls::types::{
    Attachment, InboundMessage, Message, MessageSource, PendingMessage,
};
use crate::metrics::{record_counter, MESSAGES_ENCRYPTED, MESSAGES_PROCESSED};

/// Source tag for this user's own messages parked behind a gap
const OWN_MESSAGE_SOURCE: &str = "self";

/// Plaintext carried inside the ciphertext
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct MessageBody {
    text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    attachments: Vec<Attachment>,
}

/// Result of [`GroupStateManager::process_incoming`]
#[derive(Debug, Clone)]
pub enum InboundOutcome {
    /// The message and any buffered successors were applied
    Applied { processed: usize, placeholders: usize },
    /// Parked until the gap before it fills
    Buffered,
    Duplicate,
    /// Too far ahead to buffer; a placeholder was stored
    Rejected(FailureReport),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    Stored,
    Placeholder,
    /// Already persisted, e.g. the echo of an own message
    Skipped,
}

#[derive(Default)]
struct Tally {
    processed: usize,
    placeholders: usize,
}

impl Tally {
    fn add(&mut self, applied: Applied) {
        match applied {
            Applied::Stored => self.processed += 1,
            Applied::Placeholder => self.placeholders += 1,
            Applied::Skipped => {}
        }
    }
}

impl GroupStateManager {
    /// Encrypt and send a message at the current epoch
    pub async fn send_message(
        &self,
        conversation_id: &str,
        text: &str,
        content_type: &str,
        attachments: Vec<Attachment>,
    ) -> MlsResult<Message> {
        let _guard = self.lock_conversation(conversation_id).await;

        let conversation = self.require_conversation(conversation_id).await?;
        if !conversation.is_active() {
            return Err(MlsError::ConversationNotReady {
                conversation_id: conversation_id.to_string(),
                state: conversation.state,
            });
        }

        let group_id = self.ensure_group_loaded(&conversation).await?;
        let epoch = self.engine.epoch(&group_id).await?;
        let body = serde_json::to_vec(&MessageBody {
            text: text.to_string(),
            attachments: attachments.clone(),
        })?;
        let ciphertext = self.engine.encrypt_message(&group_id, &body).await?;
        record_counter(MESSAGES_ENCRYPTED, 1);

        let sent = self
            .api
            .send_message(SendMessageRequest {
                conversation_id: conversation_id.to_string(),
                sender_did: self.user_did.clone(),
                ciphertext: ciphertext.clone(),
                epoch,
                content_type: content_type.to_string(),
            })
            .await?;

        let message = Message {
            id: sent.message_id.clone(),
            conversation_id: conversation_id.to_string(),
            sender_did: self.user_did.clone(),
            ciphertext: Some(ciphertext.clone()),
            plaintext: Some(text.to_string()),
            epoch,
            sequence_number: sent.sequence_number,
            created_at: sent.received_at,
            content_type: content_type.to_string(),
            attachments: attachments.clone(),
            is_placeholder: false,
            error_message: None,
        };
        self.store.insert_message(&self.user_did, &message).await?;
        self.store
            .touch_last_message(conversation_id, &self.user_did, sent.received_at)
            .await?;

        // The server sequences our own messages with everyone else's
        let decision = self
            .sequencer
            .should_process_message(
                &message.id,
                conversation_id,
                message.sequence_number,
                &self.user_did,
            )
            .await?;
        match decision {
            SequenceDecision::ProcessNow => {
                let ready = self
                    .sequencer
                    .record_message_processed(
                        &message.id,
                        conversation_id,
                        message.sequence_number,
                        &self.user_did,
                    )
                    .await?;
                let mut tally = Tally::default();
                self.drain_ready(conversation_id, ready, &mut tally).await?;
            }
            SequenceDecision::Buffer => {
                let echo = InboundMessage {
                    id: message.id.clone(),
                    conversation_id: conversation_id.to_string(),
                    sender_did: self.user_did.clone(),
                    ciphertext,
                    epoch,
                    sequence_number: message.sequence_number,
                    created_at: sent.received_at,
                    content_type: content_type.to_string(),
                    attachments,
                };
                self.sequencer
                    .buffer_message(
                        &echo,
                        &self.user_did,
                        MessageSource::Other(OWN_MESSAGE_SOURCE.to_string()),
                    )
                    .await?;
            }
            SequenceDecision::AlreadyProcessed => {}
        }

        self.emit(GroupEvent::MessageSent {
            conversation_id: conversation_id.to_string(),
            message_id: message.id.clone(),
        });
        debug!(
            conversation_id = %conversation_id,
            message_id = %message.id,
            epoch,
            sequence_number = message.sequence_number,
            "Message sent"
        );
        Ok(message)
    }

    /// Decrypt a stored message's ciphertext and return its text
    pub async fn decrypt_message(&self, message: &Message) -> MlsResult<String> {
        let ciphertext = match message.ciphertext.as_deref() {
            Some(c) if !c.is_empty() => c,
            _ => {
                return Err(MlsError::InvalidCiphertext(
                    "message carries no ciphertext".to_string(),
                ))
            }
        };

        let conversation = self.require_conversation(&message.conversation_id).await?;
        if !conversation.is_active() {
            return Err(MlsError::ConversationNotReady {
                conversation_id: conversation.conversation_id,
                state: conversation.state,
            });
        }

        let group_id = self.ensure_group_loaded(&conversation).await?;
        let decrypted = self.engine.decrypt_message(&group_id, ciphertext).await?;
        Ok(decode_body(&decrypted.plaintext)?.text)
    }

    /// Messages of a conversation in sequence order, placeholders included
    pub async fn messages(&self, conversation_id: &str) -> MlsResult<Vec<Message>> {
        self.store
            .list_messages(conversation_id, &self.user_did)
            .await
    }

    /// Run one inbound message through ordering, validation and decryption
    pub async fn process_incoming(
        &self,
        message: InboundMessage,
        source: MessageSource,
    ) -> MlsResult<InboundOutcome> {
        let conversation_id = message.conversation_id.clone();
        let _guard = self.lock_conversation(&conversation_id).await;

        let conversation = self.require_conversation(&conversation_id).await?;
        if !conversation.is_active() {
            return Err(MlsError::ConversationNotReady {
                conversation_id,
                state: conversation.state,
            });
        }

        let decision = self
            .sequencer
            .should_process_message(
                &message.id,
                &conversation_id,
                message.sequence_number,
                &self.user_did,
            )
            .await?;

        match decision {
            SequenceDecision::AlreadyProcessed => {
                debug!(
                    conversation_id = %conversation_id,
                    message_id = %message.id,
                    source = %source,
                    "Duplicate delivery"
                );
                Ok(InboundOutcome::Duplicate)
            }
            SequenceDecision::Buffer => {
                let last = self
                    .sequencer
                    .last_processed_seq(&conversation_id, &self.user_did)
                    .await?;
                let forward = i64::try_from(self.config.sequencing.max_forward_distance)
                    .unwrap_or(i64::MAX);
                let upper_limit = last.saturating_add(forward);

                if let Err(e) = self
                    .recovery
                    .validate_message_sequence(message.sequence_number, upper_limit)
                {
                    let report = self
                        .recovery
                        .handle_failure(&failed_message(&message), &e)
                        .await?;
                    self.emit_failure(&message.conversation_id, &message.id, &e, &report);
                    return Ok(InboundOutcome::Rejected(report));
                }

                self.sequencer
                    .buffer_message(&message, &self.user_did, source)
                    .await?;
                Ok(InboundOutcome::Buffered)
            }
            SequenceDecision::ProcessNow => {
                let mut tally = Tally::default();
                tally.add(self.apply_inbound(&conversation_id, &message).await?);

                let ready = self
                    .sequencer
                    .record_message_processed(
                        &message.id,
                        &conversation_id,
                        message.sequence_number,
                        &self.user_did,
                    )
                    .await?;
                self.drain_ready(&conversation_id, ready, &mut tally).await?;

                Ok(InboundOutcome::Applied {
                    processed: tally.processed,
                    placeholders: tally.placeholders,
                })
            }
        }
    }

    /// Apply buffered messages that are already contiguous, e.g. after a
    /// restart or once another process advanced the sequence
    pub async fn resume_buffered(&self, conversation_id: &str) -> MlsResult<usize> {
        let _guard = self.lock_conversation(conversation_id).await;

        let ready = self
            .sequencer
            .ready_messages(conversation_id, &self.user_did)
            .await?;
        let mut tally = Tally::default();
        self.drain_ready(conversation_id, ready, &mut tally).await?;
        Ok(tally.processed + tally.placeholders)
    }

    /// Apply a ready run in order, following it as it grows
    async fn drain_ready(
        &self,
        conversation_id: &str,
        ready: Vec<PendingMessage>,
        tally: &mut Tally,
    ) -> MlsResult<()> {
        let mut queue: VecDeque<PendingMessage> = ready.into();

        while let Some(pending) = queue.pop_front() {
            self.check_cancelled()?;

            let last = self
                .sequencer
                .last_processed_seq(conversation_id, &self.user_did)
                .await?;
            if pending.sequence_number <= last {
                continue;
            }
            if pending.sequence_number != last + 1 {
                break;
            }

            self.sequencer
                .mark_attempt(&pending.message_id, &self.user_did)
                .await?;

            let applied = match pending.decode() {
                Ok(message) => self.apply_inbound(conversation_id, &message).await?,
                Err(e) => {
                    let failed = FailedMessage {
                        message_id: pending.message_id.clone(),
                        conversation_id: conversation_id.to_string(),
                        sender_did: String::new(),
                        epoch: pending.epoch,
                        sequence_number: pending.sequence_number,
                        created_at: pending.received_at,
                    };
                    let report = self.recovery.handle_failure(&failed, &e).await?;
                    self.emit_failure(conversation_id, &pending.message_id, &e, &report);
                    Applied::Placeholder
                }
            };
            tally.add(applied);

            let next = self
                .sequencer
                .record_message_processed(
                    &pending.message_id,
                    conversation_id,
                    pending.sequence_number,
                    &self.user_did,
                )
                .await?;
            queue = next.into();
        }

        Ok(())
    }

    /// Decrypt and persist one next-in-line message
    ///
    /// Message-level failures become placeholders. Anything else (storage,
    /// network during catch-up) is returned and the sequence stays put so
    /// the message can be retried.
    async fn apply_inbound(
        &self,
        conversation_id: &str,
        message: &InboundMessage,
    ) -> MlsResult<Applied> {
        if self.store.message_exists(&message.id, &self.user_did).await? {
            return Ok(Applied::Skipped);
        }

        match self.decrypt_inbound(conversation_id, message).await {
            Ok(body) => {
                let attachments = if body.attachments.is_empty() {
                    message.attachments.clone()
                } else {
                    body.attachments
                };
                let stored = Message {
                    id: message.id.clone(),
                    conversation_id: conversation_id.to_string(),
                    sender_did: message.sender_did.clone(),
                    ciphertext: Some(message.ciphertext.clone()),
                    plaintext: Some(body.text),
                    epoch: message.epoch,
                    sequence_number: message.sequence_number,
                    created_at: message.created_at,
                    content_type: message.content_type.clone(),
                    attachments,
                    is_placeholder: false,
                    error_message: None,
                };
                self.store.insert_message(&self.user_did, &stored).await?;
                self.store
                    .touch_last_message(conversation_id, &self.user_did, message.created_at)
                    .await?;
                self.recovery.record_recovery_success(conversation_id).await?;

                record_counter(MESSAGES_PROCESSED, 1);
                self.emit(GroupEvent::MessageReceived {
                    conversation_id: conversation_id.to_string(),
                    message_id: message.id.clone(),
                    sequence_number: message.sequence_number,
                });
                Ok(Applied::Stored)
            }
            Err(e) if RecoveryCoordinator::is_message_failure(&e) => {
                let report = self
                    .recovery
                    .handle_failure(&failed_message(message), &e)
                    .await?;
                self.emit_failure(conversation_id, &message.id, &e, &report);
                Ok(Applied::Placeholder)
            }
            Err(e) => {
                warn!(
                    conversation_id = %conversation_id,
                    message_id = %message.id,
                    error = %e,
                    "Inbound message deferred"
                );
                Err(e)
            }
        }
    }

    async fn decrypt_inbound(
        &self,
        conversation_id: &str,
        message: &InboundMessage,
    ) -> MlsResult<MessageBody> {
        let conversation = self.require_conversation(conversation_id).await?;
        let group_id = self.ensure_group_loaded(&conversation).await?;

        let mut current = self.engine.epoch(&group_id).await?;
        if message.epoch > current {
            info!(
                conversation_id = %conversation_id,
                message_epoch = message.epoch,
                local_epoch = current,
                "Message from a newer epoch, catching up"
            );
            current = self.catch_up_locked(conversation_id, &group_id).await?;
        }
        self.recovery.validate_message_epoch(message.epoch, current)?;

        if message.ciphertext.is_empty() {
            return Err(MlsError::InvalidCiphertext("empty ciphertext".to_string()));
        }
        let decrypted = self
            .engine
            .decrypt_message(&group_id, &message.ciphertext)
            .await?;
        if decrypted.epoch != message.epoch {
            warn!(
                conversation_id = %conversation_id,
                message_id = %message.id,
                claimed = message.epoch,
                actual = decrypted.epoch,
                "Message epoch header disagrees with ciphertext"
            );
        }
        decode_body(&decrypted.plaintext)
    }

    fn emit_failure(
        &self,
        conversation_id: &str,
        message_id: &str,
        error: &MlsError,
        report: &FailureReport,
    ) {
        self.emit(GroupEvent::PlaceholderStored {
            conversation_id: conversation_id.to_string(),
            message_id: message_id.to_string(),
            error: error.to_string(),
        });
        if report.recovery_triggered {
            self.emit(GroupEvent::RecoveryTriggered {
                conversation_id: conversation_id.to_string(),
                reason: format!(
                    "{} consecutive failures: {}",
                    report.consecutive_failures,
                    error.kind()
                ),
            });
        }
    }
}

fn failed_message(message: &InboundMessage) -> FailedMessage {
    FailedMessage {
        message_id: message.id.clone(),
        conversation_id: message.conversation_id.clone(),
        sender_did: message.sender_did.clone(),
        epoch: message.epoch,
        sequence_number: message.sequence_number,
        created_at: message.created_at,
    }
}

/// Structured body, or plain UTF-8 from senders that do not wrap text
fn decode_body(plaintext: &[u8]) -> MlsResult<MessageBody> {
    if let Ok(body) = serde_json::from_slice::<MessageBody>(plaintext) {
        return Ok(body);
    }
    let text = std::str::from_utf8(plaintext)
        .map_err(|e| MlsError::DecodingFailed(format!("message body: {}", e)))?;
    Ok(MessageBody {
        text: text.to_string(),
        attachments: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_structured_body() {
        let body = MessageBody {
            text: "hi".into(),
            attachments: vec![Attachment::Quote {
                message_id: "m0".into(),
            }],
        };
        let bytes = serde_json::to_vec(&body).unwrap();
        assert_eq!(decode_body(&bytes).unwrap(), body);
    }

    #[test]
    fn test_decode_plain_text_body() {
        let body = decode_body(b"plain hello").unwrap();
        assert_eq!(body.text, "plain hello");
        assert!(body.attachments.is_empty());
    }

    #[test]
    fn test_decode_rejects_invalid_utf8() {
        assert!(matches!(
            decode_body(&[0xff, 0xfe, 0x00]),
            Err(MlsError::DecodingFailed(_))
        ));
    }
}
