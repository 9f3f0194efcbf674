//! Database Schema Migration System
//!
//! Versioned migrations for the shared store. Pending migrations are applied
//! inside one `BEGIN IMMEDIATE` transaction so two processes opening the same
//! file at once cannot both apply the same version.

use crate::core_mls::errors::{MlsError, MlsResult};
use crate::core_mls::clock::{Clock, SystemClock};
use rusqlite::{params, Connection, TransactionBehavior};

/// Current schema version
pub const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Migration descriptor
pub struct Migration {
    pub version: i32,
    pub description: &'static str,
    pub up_sql: &'static str,
    pub down_sql: Option<&'static str>,
}

/// All available migrations in order
pub fn get_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Conversations, messages, sequence state and pending messages",
            up_sql: r#"
                CREATE TABLE IF NOT EXISTS conversations (
                    conversation_id TEXT NOT NULL,
                    current_user_did TEXT NOT NULL,
                    group_id TEXT NOT NULL,
                    creator_did TEXT NOT NULL,
                    members TEXT NOT NULL,
                    epoch INTEGER NOT NULL DEFAULT 0,
                    cipher_suite TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    last_message_at INTEGER,
                    metadata TEXT NOT NULL,
                    state TEXT NOT NULL,
                    consecutive_failures INTEGER NOT NULL DEFAULT 0,
                    last_recovery_attempt INTEGER,
                    PRIMARY KEY (conversation_id, current_user_did)
                );

                CREATE INDEX IF NOT EXISTS idx_conversations_group
                    ON conversations(group_id, current_user_did);

                CREATE TABLE IF NOT EXISTS messages (
                    message_id TEXT NOT NULL,
                    current_user_did TEXT NOT NULL,
                    conversation_id TEXT NOT NULL,
                    sender_did TEXT NOT NULL,
                    ciphertext BLOB,
                    plaintext TEXT,
                    epoch INTEGER NOT NULL,
                    sequence_number INTEGER NOT NULL,
                    created_at INTEGER NOT NULL,
                    content_type TEXT NOT NULL,
                    attachments TEXT NOT NULL,
                    is_placeholder INTEGER NOT NULL DEFAULT 0,
                    error_message TEXT,
                    PRIMARY KEY (message_id, current_user_did)
                );

                CREATE INDEX IF NOT EXISTS idx_messages_conversation_seq
                    ON messages(conversation_id, current_user_did, sequence_number ASC);

                CREATE TABLE IF NOT EXISTS sequence_state (
                    conversation_id TEXT NOT NULL,
                    current_user_did TEXT NOT NULL,
                    last_processed_seq INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    PRIMARY KEY (conversation_id, current_user_did)
                );

                CREATE TABLE IF NOT EXISTS pending_messages (
                    message_id TEXT NOT NULL,
                    current_user_did TEXT NOT NULL,
                    conversation_id TEXT NOT NULL,
                    sequence_number INTEGER NOT NULL,
                    epoch INTEGER NOT NULL,
                    payload BLOB NOT NULL,
                    received_at INTEGER NOT NULL,
                    process_attempts INTEGER NOT NULL DEFAULT 0,
                    source TEXT NOT NULL,
                    PRIMARY KEY (message_id, current_user_did)
                );

                CREATE INDEX IF NOT EXISTS idx_pending_conversation_seq
                    ON pending_messages(conversation_id, current_user_did, sequence_number ASC);

                CREATE INDEX IF NOT EXISTS idx_pending_received
                    ON pending_messages(current_user_did, received_at);
            "#,
            down_sql: Some(
                r#"
                DROP INDEX IF EXISTS idx_pending_received;
                DROP INDEX IF EXISTS idx_pending_conversation_seq;
                DROP TABLE IF EXISTS pending_messages;
                DROP TABLE IF EXISTS sequence_state;
                DROP INDEX IF EXISTS idx_messages_conversation_seq;
                DROP TABLE IF EXISTS messages;
                DROP INDEX IF EXISTS idx_conversations_group;
                DROP TABLE IF EXISTS conversations;
            "#,
            ),
        },
        Migration {
            version: 2,
            description: "Diagnostics log and published key packages",
            up_sql: r#"
                CREATE TABLE IF NOT EXISTS diagnostics (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    conversation_id TEXT NOT NULL,
                    message_id TEXT,
                    error_type TEXT NOT NULL,
                    message TEXT NOT NULL,
                    epoch INTEGER,
                    sequence_number INTEGER,
                    created_at INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_diagnostics_conversation
                    ON diagnostics(conversation_id, created_at);

                CREATE TABLE IF NOT EXISTS key_packages (
                    key_package_ref TEXT NOT NULL,
                    current_user_did TEXT NOT NULL,
                    cipher_suite TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    expires_at INTEGER NOT NULL,
                    PRIMARY KEY (key_package_ref, current_user_did)
                );

                CREATE INDEX IF NOT EXISTS idx_key_packages_expires
                    ON key_packages(current_user_did, expires_at);
            "#,
            down_sql: Some(
                r#"
                DROP INDEX IF EXISTS idx_key_packages_expires;
                DROP TABLE IF EXISTS key_packages;
                DROP INDEX IF EXISTS idx_diagnostics_conversation;
                DROP TABLE IF EXISTS diagnostics;
            "#,
            ),
        },
        Migration {
            version: 3,
            description: "Encrypted key vault items",
            up_sql: r#"
                CREATE TABLE IF NOT EXISTS vault_items (
                    namespace TEXT NOT NULL,
                    item TEXT NOT NULL,
                    value BLOB NOT NULL,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    PRIMARY KEY (namespace, item)
                );
            "#,
            down_sql: Some(
                r#"
                DROP TABLE IF EXISTS vault_items;
            "#,
            ),
        },
    ]
}

fn ensure_version_table(conn: &Connection) -> MlsResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        );
        "#,
    )
    .map_err(|e| MlsError::Storage(format!("Failed to create schema_version: {}", e)))
}

/// Get current schema version from database
pub fn get_current_version(conn: &Connection) -> MlsResult<i32> {
    ensure_version_table(conn)?;
    let version = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get::<_, Option<i32>>(0)
        })
        .map_err(|e| MlsError::Storage(format!("Failed to read schema version: {}", e)))?
        .unwrap_or(0);
    Ok(version)
}

/// Run all pending migrations
pub fn migrate(conn: &mut Connection) -> MlsResult<()> {
    ensure_version_table(conn)?;

    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| MlsError::Storage(format!("Failed to begin transaction: {}", e)))?;

    // Re-read under the write lock; a sibling may have migrated meanwhile.
    let current_version = get_current_version(&tx)?;
    let now = SystemClock.now_millis();

    for migration in get_migrations().into_iter().filter(|m| m.version > current_version) {
        tracing::info!(
            version = migration.version,
            description = migration.description,
            "Applying migration"
        );
        tx.execute_batch(migration.up_sql).map_err(|e| {
            MlsError::Storage(format!("Migration {} failed: {}", migration.version, e))
        })?;
        tx.execute(
            "INSERT INTO schema_version (version, applied_at) VALUES (?, ?)",
            params![migration.version, now],
        )
        .map_err(|e| MlsError::Storage(format!("Failed to record migration: {}", e)))?;
    }

    tx.commit()
        .map_err(|e| MlsError::Storage(format!("Failed to commit migrations: {}", e)))?;

    Ok(())
}

/// Rollback a migration (if down_sql is available)
pub fn rollback_migration(conn: &mut Connection, version: i32) -> MlsResult<()> {
    let migration = get_migrations()
        .into_iter()
        .find(|m| m.version == version)
        .ok_or_else(|| MlsError::Storage(format!("Migration version {} not found", version)))?;

    let down_sql = migration.down_sql.ok_or_else(|| {
        MlsError::Storage(format!("No rollback available for version {}", version))
    })?;

    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| MlsError::Storage(format!("Failed to begin transaction: {}", e)))?;

    tx.execute_batch(down_sql)
        .map_err(|e| MlsError::Storage(format!("Rollback {} failed: {}", version, e)))?;

    tx.execute("DELETE FROM schema_version WHERE version = ?", params![version])
        .map_err(|e| MlsError::Storage(format!("Failed to remove migration record: {}", e)))?;

    tx.commit()
        .map_err(|e| MlsError::Storage(format!("Failed to commit rollback: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table'")
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
    }

    #[test]
    fn test_initial_migration() {
        let dir = tempdir().unwrap();
        let mut conn = Connection::open(dir.path().join("migration_test.db")).unwrap();

        assert_eq!(get_current_version(&conn).unwrap(), 0);
        migrate(&mut conn).unwrap();
        assert_eq!(get_current_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);

        let tables = table_names(&conn);
        for expected in [
            "schema_version",
            "conversations",
            "messages",
            "sequence_state",
            "pending_messages",
            "diagnostics",
            "key_packages",
            "vault_items",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing {}", expected);
        }
    }

    #[test]
    fn test_idempotent_migrations() {
        let dir = tempdir().unwrap();
        let mut conn = Connection::open(dir.path().join("idempotent_test.db")).unwrap();

        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();

        assert_eq!(get_current_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_migration_rollback_and_reapply() {
        let dir = tempdir().unwrap();
        let mut conn = Connection::open(dir.path().join("rollback_test.db")).unwrap();

        migrate(&mut conn).unwrap();
        rollback_migration(&mut conn, 3).unwrap();
        assert_eq!(get_current_version(&conn).unwrap(), 2);
        assert!(!table_names(&conn).contains(&"vault_items".to_string()));

        migrate(&mut conn).unwrap();
        assert_eq!(get_current_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_unknown_rollback_version() {
        let dir = tempdir().unwrap();
        let mut conn = Connection::open(dir.path().join("unknown.db")).unwrap();
        migrate(&mut conn).unwrap();
        assert!(rollback_migration(&mut conn, 42).is_err());
    }
}
