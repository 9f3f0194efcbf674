//! SQLite-backed state store
//!
//! Synchronous rusqlite calls run on the blocking pool via
//! `tokio::task::spawn_blocking`. Connections come from an r2d2 pool, each
//! opened in WAL mode with a busy timeout so concurrent processes wait for
//! the writer instead of failing.
//!
//! Ordering and epoch columns are only ever changed through conditional
//! statements (`... WHERE last_processed_seq = ?`, `... WHERE epoch = ?`).
//! The returned `bool` says whether this caller's write won.

use crate::config::StoreConfig;
use crate::core_mls::errors::{MlsError, MlsResult};
use crate::core_mls::storage::migrations;
use crate::core_mls::types::{
    Conversation, ConversationMetadata, ConversationState, Member, Message, MessageSource,
    PendingMessage, NO_SEQUENCE,
};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Row of the diagnostics log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticRecord {
    pub id: Option<i64>,
    pub conversation_id: String,
    pub message_id: Option<String>,
    pub error_type: String,
    pub message: String,
    pub epoch: Option<u64>,
    pub sequence_number: Option<i64>,
    pub created_at: i64,
}

/// Shared persistent store
pub struct SqlStateStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl SqlStateStore {
    /// Open (or create) the database at `path` and run pending migrations
    pub fn open(path: impl AsRef<Path>, config: &StoreConfig) -> MlsResult<Self> {
        let busy_timeout = config.busy_timeout;
        let manager = SqliteConnectionManager::file(path.as_ref())
            .with_init(move |conn| configure_connection(conn, busy_timeout));

        Self::from_manager(manager, config.pool_size)
    }

    /// Open the database described by `config.database_path()`
    pub fn open_with_config(config: &StoreConfig) -> MlsResult<Self> {
        std::fs::create_dir_all(&config.data_dir).map_err(|e| {
            MlsError::Storage(format!(
                "Failed to create data dir {}: {}",
                config.data_dir.display(),
                e
            ))
        })?;
        Self::open(config.database_path(), config)
    }

    /// Single-connection in-memory database
    pub fn open_in_memory() -> MlsResult<Self> {
        let manager = SqliteConnectionManager::memory();
        Self::from_manager(manager, 1)
    }

    fn from_manager(manager: SqliteConnectionManager, pool_size: u32) -> MlsResult<Self> {
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .build(manager)
            .map_err(|e| MlsError::Storage(format!("Failed to create pool: {}", e)))?;

        {
            let mut conn = pool.get()?;
            migrations::migrate(&mut conn)?;
        }

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Run `f` with a pooled connection on the blocking thread pool
    pub(crate) async fn with_conn<F, T>(&self, f: F) -> MlsResult<T>
    where
        F: FnOnce(&mut Connection) -> MlsResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await?
    }

    // ---------------------------------------------------------------------
    // Conversations
    // ---------------------------------------------------------------------

    /// Insert a conversation; returns false if the row already exists
    pub async fn insert_conversation(
        &self,
        user_did: &str,
        conversation: &Conversation,
    ) -> MlsResult<bool> {
        let user = user_did.to_string();
        let convo = conversation.clone();
        let members = serde_json::to_string(&convo.members)?;
        let metadata = serde_json::to_string(&convo.metadata)?;

        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT INTO conversations (
                    conversation_id, current_user_did, group_id, creator_did, members,
                    epoch, cipher_suite, created_at, updated_at, last_message_at,
                    metadata, state, consecutive_failures, last_recovery_attempt
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                 ON CONFLICT(conversation_id, current_user_did) DO NOTHING",
                params![
                    convo.conversation_id,
                    user,
                    convo.group_id,
                    convo.creator_did,
                    members,
                    convo.epoch as i64,
                    convo.cipher_suite,
                    convo.created_at,
                    convo.updated_at,
                    convo.last_message_at,
                    metadata,
                    convo.state.as_str(),
                    convo.consecutive_failures,
                    convo.last_recovery_attempt,
                ],
            )?;
            Ok(inserted == 1)
        })
        .await
    }

    pub async fn get_conversation(
        &self,
        conversation_id: &str,
        user_did: &str,
    ) -> MlsResult<Option<Conversation>> {
        let convo_id = conversation_id.to_string();
        let user = user_did.to_string();

        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM conversations
                         WHERE conversation_id = ?1 AND current_user_did = ?2",
                        CONVERSATION_COLUMNS
                    ),
                    params![convo_id, user],
                    ConversationRow::from_row,
                )
                .optional()?;
            row.map(ConversationRow::into_conversation).transpose()
        })
        .await
    }

    pub async fn find_conversation_by_group(
        &self,
        group_id_hex: &str,
        user_did: &str,
    ) -> MlsResult<Option<Conversation>> {
        let group_id = group_id_hex.to_string();
        let user = user_did.to_string();

        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    &format!(
                        "SELECT {} FROM conversations
                         WHERE group_id = ?1 AND current_user_did = ?2",
                        CONVERSATION_COLUMNS
                    ),
                    params![group_id, user],
                    ConversationRow::from_row,
                )
                .optional()?;
            row.map(ConversationRow::into_conversation).transpose()
        })
        .await
    }

    /// All conversations of a user, most recently active first
    pub async fn list_conversations(&self, user_did: &str) -> MlsResult<Vec<Conversation>> {
        let user = user_did.to_string();

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM conversations
                 WHERE current_user_did = ?1
                 ORDER BY COALESCE(last_message_at, created_at) DESC, conversation_id ASC",
                CONVERSATION_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![user], ConversationRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(ConversationRow::into_conversation)
                .collect()
        })
        .await
    }

    /// Conditional lifecycle transition
    pub async fn compare_and_set_state(
        &self,
        conversation_id: &str,
        user_did: &str,
        expected: ConversationState,
        next: ConversationState,
        now: i64,
    ) -> MlsResult<bool> {
        let convo_id = conversation_id.to_string();
        let user = user_did.to_string();

        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE conversations SET state = ?1, updated_at = ?2
                 WHERE conversation_id = ?3 AND current_user_did = ?4 AND state = ?5",
                params![next.as_str(), now, convo_id, user, expected.as_str()],
            )?;
            Ok(updated == 1)
        })
        .await
    }

    /// Set the epoch only if it still holds `expected`
    pub async fn compare_and_set_epoch(
        &self,
        conversation_id: &str,
        user_did: &str,
        expected: u64,
        new_epoch: u64,
        now: i64,
    ) -> MlsResult<bool> {
        let convo_id = conversation_id.to_string();
        let user = user_did.to_string();

        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE conversations SET epoch = ?1, updated_at = ?2
                 WHERE conversation_id = ?3 AND current_user_did = ?4 AND epoch = ?5",
                params![new_epoch as i64, now, convo_id, user, expected as i64],
            )?;
            Ok(updated == 1)
        })
        .await
    }

    /// Raise the epoch to `new_epoch`; never lowers it
    pub async fn advance_epoch(
        &self,
        conversation_id: &str,
        user_did: &str,
        new_epoch: u64,
        now: i64,
    ) -> MlsResult<bool> {
        let convo_id = conversation_id.to_string();
        let user = user_did.to_string();

        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE conversations SET epoch = ?1, updated_at = ?2
                 WHERE conversation_id = ?3 AND current_user_did = ?4 AND epoch < ?1",
                params![new_epoch as i64, now, convo_id, user],
            )?;
            Ok(updated == 1)
        })
        .await
    }

    /// Replace member list and metadata from an authoritative source
    pub async fn update_membership(
        &self,
        conversation_id: &str,
        user_did: &str,
        members: &[Member],
        metadata: &ConversationMetadata,
        now: i64,
    ) -> MlsResult<()> {
        let convo_id = conversation_id.to_string();
        let user = user_did.to_string();
        let members = serde_json::to_string(members)?;
        let metadata = serde_json::to_string(metadata)?;

        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE conversations SET members = ?1, metadata = ?2, updated_at = ?3
                 WHERE conversation_id = ?4 AND current_user_did = ?5",
                params![members, metadata, now, convo_id, user],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn touch_last_message(
        &self,
        conversation_id: &str,
        user_did: &str,
        at: i64,
    ) -> MlsResult<()> {
        let convo_id = conversation_id.to_string();
        let user = user_did.to_string();

        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE conversations
                 SET last_message_at = MAX(COALESCE(last_message_at, 0), ?1)
                 WHERE conversation_id = ?2 AND current_user_did = ?3",
                params![at, convo_id, user],
            )?;
            Ok(())
        })
        .await
    }

    /// Atomically bump the failure counter and return the new value
    pub async fn increment_failures(
        &self,
        conversation_id: &str,
        user_did: &str,
    ) -> MlsResult<u32> {
        let convo_id = conversation_id.to_string();
        let user = user_did.to_string();

        self.with_conn(move |conn| {
            let count = conn
                .query_row(
                    "UPDATE conversations SET consecutive_failures = consecutive_failures + 1
                     WHERE conversation_id = ?1 AND current_user_did = ?2
                     RETURNING consecutive_failures",
                    params![convo_id, user],
                    |row| row.get::<_, u32>(0),
                )
                .optional()?;
            count.ok_or(MlsError::ConversationNotFound(convo_id))
        })
        .await
    }

    pub async fn reset_failures(&self, conversation_id: &str, user_did: &str) -> MlsResult<()> {
        let convo_id = conversation_id.to_string();
        let user = user_did.to_string();

        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE conversations SET consecutive_failures = 0
                 WHERE conversation_id = ?1 AND current_user_did = ?2",
                params![convo_id, user],
            )?;
            Ok(())
        })
        .await
    }

    /// Stamp a recovery attempt if nobody else stamped one since `expected`
    pub async fn claim_recovery_attempt(
        &self,
        conversation_id: &str,
        user_did: &str,
        expected: Option<i64>,
        now: i64,
    ) -> MlsResult<bool> {
        let convo_id = conversation_id.to_string();
        let user = user_did.to_string();

        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE conversations SET last_recovery_attempt = ?1
                 WHERE conversation_id = ?2 AND current_user_did = ?3
                   AND last_recovery_attempt IS ?4",
                params![now, convo_id, user, expected],
            )?;
            Ok(updated == 1)
        })
        .await
    }

    /// Remove a conversation with its messages and ordering state
    pub async fn delete_conversation(
        &self,
        conversation_id: &str,
        user_did: &str,
    ) -> MlsResult<bool> {
        let convo_id = conversation_id.to_string();
        let user = user_did.to_string();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            for table in ["messages", "sequence_state", "pending_messages"] {
                tx.execute(
                    &format!(
                        "DELETE FROM {} WHERE conversation_id = ?1 AND current_user_did = ?2",
                        table
                    ),
                    params![convo_id, user],
                )?;
            }
            let deleted = tx.execute(
                "DELETE FROM conversations WHERE conversation_id = ?1 AND current_user_did = ?2",
                params![convo_id, user],
            )?;
            tx.commit()?;
            Ok(deleted == 1)
        })
        .await
    }

    // ---------------------------------------------------------------------
    // Messages
    // ---------------------------------------------------------------------

    /// Store a message; the first writer for an id wins
    pub async fn insert_message(&self, user_did: &str, message: &Message) -> MlsResult<bool> {
        let user = user_did.to_string();
        let msg = message.clone();
        let attachments = serde_json::to_string(&msg.attachments)?;

        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT INTO messages (
                    message_id, current_user_did, conversation_id, sender_did, ciphertext,
                    plaintext, epoch, sequence_number, created_at, content_type,
                    attachments, is_placeholder, error_message
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT(message_id, current_user_did) DO NOTHING",
                params![
                    msg.id,
                    user,
                    msg.conversation_id,
                    msg.sender_did,
                    msg.ciphertext,
                    msg.plaintext,
                    msg.epoch as i64,
                    msg.sequence_number,
                    msg.created_at,
                    msg.content_type,
                    attachments,
                    msg.is_placeholder,
                    msg.error_message,
                ],
            )?;
            Ok(inserted == 1)
        })
        .await
    }

    pub async fn message_exists(&self, message_id: &str, user_did: &str) -> MlsResult<bool> {
        let id = message_id.to_string();
        let user = user_did.to_string();

        self.with_conn(move |conn| {
            let exists = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM messages WHERE message_id = ?1 AND current_user_did = ?2)",
                params![id, user],
                |row| row.get::<_, bool>(0),
            )?;
            Ok(exists)
        })
        .await
    }

    /// Messages of a conversation in delivery order
    pub async fn list_messages(
        &self,
        conversation_id: &str,
        user_did: &str,
    ) -> MlsResult<Vec<Message>> {
        let convo_id = conversation_id.to_string();
        let user = user_did.to_string();

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT message_id, conversation_id, sender_did, ciphertext, plaintext, epoch,
                        sequence_number, created_at, content_type, attachments,
                        is_placeholder, error_message
                 FROM messages
                 WHERE conversation_id = ?1 AND current_user_did = ?2
                 ORDER BY sequence_number ASC, created_at ASC",
            )?;
            let rows = stmt
                .query_map(params![convo_id, user], |row| {
                    Ok((
                        Message {
                            id: row.get(0)?,
                            conversation_id: row.get(1)?,
                            sender_did: row.get(2)?,
                            ciphertext: row.get(3)?,
                            plaintext: row.get(4)?,
                            epoch: row.get::<_, i64>(5)? as u64,
                            sequence_number: row.get(6)?,
                            created_at: row.get(7)?,
                            content_type: row.get(8)?,
                            attachments: Vec::new(),
                            is_placeholder: row.get(10)?,
                            error_message: row.get(11)?,
                        },
                        row.get::<_, String>(9)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(mut message, attachments)| {
                    message.attachments = serde_json::from_str(&attachments)?;
                    Ok(message)
                })
                .collect()
        })
        .await
    }

    // ---------------------------------------------------------------------
    // Sequence state
    // ---------------------------------------------------------------------

    /// Last processed sequence number, [`NO_SEQUENCE`] when nothing was processed
    pub async fn last_processed_seq(
        &self,
        conversation_id: &str,
        user_did: &str,
    ) -> MlsResult<i64> {
        let convo_id = conversation_id.to_string();
        let user = user_did.to_string();

        self.with_conn(move |conn| {
            let seq = conn
                .query_row(
                    "SELECT last_processed_seq FROM sequence_state
                     WHERE conversation_id = ?1 AND current_user_did = ?2",
                    params![convo_id, user],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?;
            Ok(seq.unwrap_or(NO_SEQUENCE))
        })
        .await
    }

    /// Move `lastProcessedSeq` from `expected` to `new_seq` if nobody moved it first
    pub async fn compare_and_set_sequence(
        &self,
        conversation_id: &str,
        user_did: &str,
        expected: i64,
        new_seq: i64,
        now: i64,
    ) -> MlsResult<bool> {
        let convo_id = conversation_id.to_string();
        let user = user_did.to_string();

        self.with_conn(move |conn| {
            let changed = if expected == NO_SEQUENCE {
                conn.execute(
                    "INSERT INTO sequence_state
                        (conversation_id, current_user_did, last_processed_seq, updated_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(conversation_id, current_user_did) DO UPDATE
                        SET last_processed_seq = excluded.last_processed_seq,
                            updated_at = excluded.updated_at
                        WHERE sequence_state.last_processed_seq = ?5",
                    params![convo_id, user, new_seq, now, NO_SEQUENCE],
                )?
            } else {
                conn.execute(
                    "UPDATE sequence_state SET last_processed_seq = ?1, updated_at = ?2
                     WHERE conversation_id = ?3 AND current_user_did = ?4
                       AND last_processed_seq = ?5",
                    params![new_seq, now, convo_id, user, expected],
                )?
            };
            Ok(changed == 1)
        })
        .await
    }

    // ---------------------------------------------------------------------
    // Pending messages
    // ---------------------------------------------------------------------

    /// Buffer a message; returns false if it was already buffered
    pub async fn insert_pending(&self, pending: &PendingMessage) -> MlsResult<bool> {
        let p = pending.clone();

        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT INTO pending_messages (
                    message_id, current_user_did, conversation_id, sequence_number, epoch,
                    payload, received_at, process_attempts, source
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(message_id, current_user_did) DO NOTHING",
                params![
                    p.message_id,
                    p.current_user_did,
                    p.conversation_id,
                    p.sequence_number,
                    p.epoch as i64,
                    p.payload,
                    p.received_at,
                    p.process_attempts,
                    p.source.as_str(),
                ],
            )?;
            Ok(inserted == 1)
        })
        .await
    }

    pub async fn pending_exists(&self, message_id: &str, user_did: &str) -> MlsResult<bool> {
        let id = message_id.to_string();
        let user = user_did.to_string();

        self.with_conn(move |conn| {
            let exists = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM pending_messages
                               WHERE message_id = ?1 AND current_user_did = ?2)",
                params![id, user],
                |row| row.get::<_, bool>(0),
            )?;
            Ok(exists)
        })
        .await
    }

    /// Buffered messages with `sequence_number > after_seq`, ascending
    pub async fn pending_after(
        &self,
        conversation_id: &str,
        user_did: &str,
        after_seq: i64,
    ) -> MlsResult<Vec<PendingMessage>> {
        let convo_id = conversation_id.to_string();
        let user = user_did.to_string();

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT message_id, current_user_did, conversation_id, sequence_number, epoch,
                        payload, received_at, process_attempts, source
                 FROM pending_messages
                 WHERE conversation_id = ?1 AND current_user_did = ?2 AND sequence_number > ?3
                 ORDER BY sequence_number ASC, received_at ASC",
            )?;
            let rows = stmt
                .query_map(params![convo_id, user, after_seq], pending_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    pub async fn delete_pending(&self, message_id: &str, user_did: &str) -> MlsResult<bool> {
        let id = message_id.to_string();
        let user = user_did.to_string();

        self.with_conn(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM pending_messages WHERE message_id = ?1 AND current_user_did = ?2",
                params![id, user],
            )?;
            Ok(deleted == 1)
        })
        .await
    }

    /// Drop buffered rows that the sequence has already moved past
    pub async fn delete_pending_through(
        &self,
        conversation_id: &str,
        user_did: &str,
        through_seq: i64,
    ) -> MlsResult<usize> {
        let convo_id = conversation_id.to_string();
        let user = user_did.to_string();

        self.with_conn(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM pending_messages
                 WHERE conversation_id = ?1 AND current_user_did = ?2 AND sequence_number <= ?3",
                params![convo_id, user, through_seq],
            )?;
            Ok(deleted)
        })
        .await
    }

    pub async fn increment_pending_attempts(
        &self,
        message_id: &str,
        user_did: &str,
    ) -> MlsResult<()> {
        let id = message_id.to_string();
        let user = user_did.to_string();

        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE pending_messages SET process_attempts = process_attempts + 1
                 WHERE message_id = ?1 AND current_user_did = ?2",
                params![id, user],
            )?;
            Ok(())
        })
        .await
    }

    /// Delete a user's buffered rows received before `cutoff`
    pub async fn delete_pending_received_before(
        &self,
        user_did: &str,
        cutoff: i64,
    ) -> MlsResult<usize> {
        let user = user_did.to_string();

        self.with_conn(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM pending_messages WHERE current_user_did = ?1 AND received_at < ?2",
                params![user, cutoff],
            )?;
            Ok(deleted)
        })
        .await
    }

    // ---------------------------------------------------------------------
    // Diagnostics
    // ---------------------------------------------------------------------

    pub async fn insert_diagnostic(&self, record: &DiagnosticRecord) -> MlsResult<i64> {
        let r = record.clone();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO diagnostics
                    (conversation_id, message_id, error_type, message, epoch, sequence_number, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    r.conversation_id,
                    r.message_id,
                    r.error_type,
                    r.message,
                    r.epoch.map(|e| e as i64),
                    r.sequence_number,
                    r.created_at,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn diagnostics_for(&self, conversation_id: &str) -> MlsResult<Vec<DiagnosticRecord>> {
        let convo_id = conversation_id.to_string();

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, message_id, error_type, message, epoch,
                        sequence_number, created_at
                 FROM diagnostics WHERE conversation_id = ?1
                 ORDER BY id ASC",
            )?;
            let rows = stmt
                .query_map(params![convo_id], |row| {
                    Ok(DiagnosticRecord {
                        id: row.get(0)?,
                        conversation_id: row.get(1)?,
                        message_id: row.get(2)?,
                        error_type: row.get(3)?,
                        message: row.get(4)?,
                        epoch: row.get::<_, Option<i64>>(5)?.map(|e| e as u64),
                        sequence_number: row.get(6)?,
                        created_at: row.get(7)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    // ---------------------------------------------------------------------
    // Key packages
    // ---------------------------------------------------------------------

    pub async fn insert_key_package(
        &self,
        key_package_ref: &str,
        user_did: &str,
        cipher_suite: &str,
        created_at: i64,
        expires_at: i64,
    ) -> MlsResult<()> {
        let kp_ref = key_package_ref.to_string();
        let user = user_did.to_string();
        let suite = cipher_suite.to_string();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO key_packages
                    (key_package_ref, current_user_did, cipher_suite, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(key_package_ref, current_user_did) DO UPDATE
                    SET expires_at = excluded.expires_at",
                params![kp_ref, user, suite, created_at, expires_at],
            )?;
            Ok(())
        })
        .await
    }

    /// Expiry of the freshest published key package
    pub async fn latest_key_package_expiry(&self, user_did: &str) -> MlsResult<Option<i64>> {
        let user = user_did.to_string();

        self.with_conn(move |conn| {
            let expiry = conn.query_row(
                "SELECT MAX(expires_at) FROM key_packages WHERE current_user_did = ?1",
                params![user],
                |row| row.get::<_, Option<i64>>(0),
            )?;
            Ok(expiry)
        })
        .await
    }
}

fn configure_connection(conn: &mut Connection, busy_timeout: Duration) -> rusqlite::Result<()> {
    conn.busy_timeout(busy_timeout)?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(())
}

const CONVERSATION_COLUMNS: &str = "conversation_id, group_id, creator_did, members, epoch,
    cipher_suite, created_at, updated_at, last_message_at, metadata, state,
    consecutive_failures, last_recovery_attempt";

/// Raw conversation columns; JSON and enum decoding happens outside rusqlite
struct ConversationRow {
    conversation_id: String,
    group_id: String,
    creator_did: String,
    members: String,
    epoch: i64,
    cipher_suite: String,
    created_at: i64,
    updated_at: i64,
    last_message_at: Option<i64>,
    metadata: String,
    state: String,
    consecutive_failures: u32,
    last_recovery_attempt: Option<i64>,
}

impl ConversationRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            conversation_id: row.get(0)?,
            group_id: row.get(1)?,
            creator_did: row.get(2)?,
            members: row.get(3)?,
            epoch: row.get(4)?,
            cipher_suite: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
            last_message_at: row.get(8)?,
            metadata: row.get(9)?,
            state: row.get(10)?,
            consecutive_failures: row.get(11)?,
            last_recovery_attempt: row.get(12)?,
        })
    }

    fn into_conversation(self) -> MlsResult<Conversation> {
        Ok(Conversation {
            conversation_id: self.conversation_id,
            group_id: self.group_id,
            creator_did: self.creator_did,
            members: serde_json::from_str(&self.members)?,
            epoch: self.epoch as u64,
            cipher_suite: self.cipher_suite,
            created_at: self.created_at,
            updated_at: self.updated_at,
            last_message_at: self.last_message_at,
            metadata: serde_json::from_str(&self.metadata)?,
            state: self.state.parse()?,
            consecutive_failures: self.consecutive_failures,
            last_recovery_attempt: self.last_recovery_attempt,
        })
    }
}

fn pending_from_row(row: &Row<'_>) -> rusqlite::Result<PendingMessage> {
    Ok(PendingMessage {
        message_id: row.get(0)?,
        current_user_did: row.get(1)?,
        conversation_id: row.get(2)?,
        sequence_number: row.get(3)?,
        epoch: row.get::<_, i64>(4)? as u64,
        payload: row.get(5)?,
        received_at: row.get(6)?,
        process_attempts: row.get(7)?,
        source: MessageSource::from_tag(&row.get::<_, String>(8)?),
    })
}
