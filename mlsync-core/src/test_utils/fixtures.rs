//! Fixtures for wiring test clients

use std::sync::Arc;

use crate::config::Config;
use crate::core_mls::clock::ManualClock;
use crate::core_mls::group_manager::{GroupStateManager, ManagerDeps};
use crate::core_mls::key_vault::{KeyVault, SqlVaultBackend};
use crate::core_mls::providers::{InMemoryApiClient, InMemoryDeliveryService, MockCryptoEngine};
use crate::core_mls::storage::SqlStateStore;
use crate::core_mls::types::InboundMessage;

/// 2023-11-14T22:13:20Z
pub const TEST_EPOCH_MILLIS: i64 = 1_700_000_000_000;

pub const TEST_VAULT_KEY: [u8; 32] = [7u8; 32];

/// One user's manager together with the doubles behind it
pub struct TestClient {
    pub did: String,
    pub manager: Arc<GroupStateManager>,
    pub store: Arc<SqlStateStore>,
    pub engine: Arc<MockCryptoEngine>,
    pub api: Arc<InMemoryApiClient>,
    pub clock: Arc<ManualClock>,
}

/// Builder for [`TestClient`]
pub struct TestClientBuilder {
    did: String,
    server: InMemoryDeliveryService,
    config: Config,
    store: Option<Arc<SqlStateStore>>,
    clock: Option<Arc<ManualClock>>,
}

impl TestClientBuilder {
    pub fn new(did: impl Into<String>, server: &InMemoryDeliveryService) -> Self {
        Self {
            did: did.into(),
            server: server.clone(),
            config: Config::default(),
            store: None,
            clock: None,
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Share a store with another client, as a second process would
    pub fn with_store(mut self, store: Arc<SqlStateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_clock(mut self, clock: Arc<ManualClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> TestClient {
        let store = self.store.unwrap_or_else(|| {
            Arc::new(SqlStateStore::open_in_memory().expect("in-memory store"))
        });
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(ManualClock::new(TEST_EPOCH_MILLIS)));
        let engine = Arc::new(MockCryptoEngine::new());
        let api = Arc::new(self.server.client(self.did.clone()));
        let backend =
            SqlVaultBackend::new(store.clone(), TEST_VAULT_KEY).with_clock(clock.clone());
        let vault = Arc::new(KeyVault::new(Arc::new(backend)));

        let manager = Arc::new(GroupStateManager::new(
            self.did.clone(),
            self.config,
            ManagerDeps {
                store: store.clone(),
                vault,
                engine: engine.clone(),
                api: api.clone(),
                clock: clock.clone(),
            },
        ));

        TestClient {
            did: self.did,
            manager,
            store,
            engine,
            api,
            clock,
        }
    }
}

/// Client with default config and its own store
pub fn test_client(did: &str, server: &InMemoryDeliveryService) -> TestClient {
    TestClientBuilder::new(did, server).build()
}

/// Inbound message with an arbitrary ciphertext, for ordering tests
pub fn inbound(
    conversation_id: &str,
    id: &str,
    sequence_number: i64,
    epoch: u64,
) -> InboundMessage {
    InboundMessage {
        id: id.to_string(),
        conversation_id: conversation_id.to_string(),
        sender_did: "did:test:sender".to_string(),
        ciphertext: vec![0xAB; 48],
        epoch,
        sequence_number,
        created_at: TEST_EPOCH_MILLIS,
        content_type: "text/plain".to_string(),
        attachments: Vec::new(),
    }
}
