//! Shared setup for integration tests

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use mlsync_core::config::{Config, StoreConfig};
use mlsync_core::core_mls::providers::{InMemoryDeliveryService, MockCryptoEngine};
use mlsync_core::core_mls::{
    GroupStateManager, InboundMessage, KeyVault, ManagerDeps, ManualClock, SqlStateStore,
    SqlVaultBackend,
};

pub const START_MILLIS: i64 = 1_700_000_000_000;
pub const VAULT_KEY: [u8; 32] = [42u8; 32];

/// A manager as one process would run it
pub struct Process {
    pub manager: GroupStateManager,
    pub store: Arc<SqlStateStore>,
    pub engine: Arc<MockCryptoEngine>,
    pub clock: Arc<ManualClock>,
}

/// Open a fresh connection pool on `db` and wire a manager for `did`
pub fn spawn_process(did: &str, db: &Path, server: &InMemoryDeliveryService) -> Process {
    let store = Arc::new(open_store(db));
    let clock = Arc::new(ManualClock::new(START_MILLIS));
    let engine = Arc::new(MockCryptoEngine::new());
    let backend = SqlVaultBackend::new(store.clone(), VAULT_KEY).with_clock(clock.clone());
    let vault = Arc::new(KeyVault::new(Arc::new(backend)));

    let manager = GroupStateManager::new(
        did,
        Config::default(),
        ManagerDeps {
            store: store.clone(),
            vault,
            engine: engine.clone(),
            api: Arc::new(server.client(did)),
            clock: clock.clone(),
        },
    );

    Process {
        manager,
        store,
        engine,
        clock,
    }
}

pub fn open_store(db: &Path) -> SqlStateStore {
    SqlStateStore::open(db, &StoreConfig::default()).expect("open store")
}

pub fn message(conversation_id: &str, sequence_number: i64) -> InboundMessage {
    InboundMessage {
        id: format!("{}-m{}", conversation_id, sequence_number),
        conversation_id: conversation_id.to_string(),
        sender_did: "did:example:sender".to_string(),
        ciphertext: vec![1, 2, 3],
        epoch: 0,
        sequence_number,
        created_at: START_MILLIS + sequence_number,
        content_type: "text/plain".to_string(),
        attachments: Vec::new(),
    }
}
