//! Two processes sharing one database file
//!
//! Each "process" opens its own connection pool on the same file, like a
//! foreground app and a notification handler would. Neither keeps an
//! authoritative in-memory copy of sequence or epoch state.

mod common;

use std::sync::Arc;

use futures::future::join_all;
use common::{message, open_store, spawn_process, START_MILLIS};
use mlsync_core::config::SequencingConfig;
use mlsync_core::core_mls::providers::InMemoryDeliveryService;
use mlsync_core::core_mls::{
    InboundOutcome, ManualClock, MessageSource, SequenceCoordinator, SequenceDecision,
};
use tempfile::tempdir;

const USER: &str = "did:alice";

fn coordinator(db: &std::path::Path) -> Arc<SequenceCoordinator> {
    Arc::new(SequenceCoordinator::new(
        Arc::new(open_store(db)),
        Arc::new(ManualClock::new(START_MILLIS)),
        &SequencingConfig::default(),
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_racing_coordinators_keep_sequence_monotonic() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("shared.db");
    let first = coordinator(&db);
    let second = coordinator(&db);

    let race = |sequencer: Arc<SequenceCoordinator>| {
        tokio::spawn(async move {
            let mut observed = Vec::new();
            for seq in 0..25 {
                sequencer
                    .record_message_processed(&format!("m{}", seq), "c1", seq, USER)
                    .await
                    .unwrap();
                observed.push(sequencer.last_processed_seq("c1", USER).await.unwrap());
            }
            observed
        })
    };

    let runs = join_all([race(first.clone()), race(second.clone())]).await;
    for observed in runs {
        let observed = observed.unwrap();
        assert!(observed.windows(2).all(|w| w[0] <= w[1]), "{:?}", observed);
    }

    assert_eq!(first.last_processed_seq("c1", USER).await.unwrap(), 24);
    assert_eq!(second.last_processed_seq("c1", USER).await.unwrap(), 24);
}

#[tokio::test]
async fn test_buffer_in_one_process_drains_in_the_other() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("shared.db");
    let foreground = coordinator(&db);
    let background = coordinator(&db);

    background
        .buffer_message(&message("c1", 1), USER, MessageSource::Push)
        .await
        .unwrap();
    assert_eq!(
        foreground
            .should_process_message("c1-m1", "c1", 1, USER)
            .await
            .unwrap(),
        SequenceDecision::AlreadyProcessed
    );

    let ready = foreground
        .record_message_processed("c1-m0", "c1", 0, USER)
        .await
        .unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].message_id, "c1-m1");

    let ready = background
        .record_message_processed("c1-m1", "c1", 1, USER)
        .await
        .unwrap();
    assert!(ready.is_empty());
    assert!(foreground
        .flush_buffered_messages("c1", USER)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_second_process_sends_from_vault_snapshot() {
    let dir = tempdir().unwrap();
    let server = InMemoryDeliveryService::new();
    let alice_db = dir.path().join("alice.db");
    let app = spawn_process(USER, &alice_db, &server);
    let extension = spawn_process(USER, &alice_db, &server);
    let bob = spawn_process("did:bob", &dir.path().join("bob.db"), &server);
    let carol = spawn_process("did:carol", &dir.path().join("carol.db"), &server);

    bob.manager.publish_key_package(None).await.unwrap();
    let convo = app
        .manager
        .create_group(&["did:bob".to_string()], None)
        .await
        .unwrap();
    let convo_id = convo.conversation_id;
    let welcome = server.take_welcomes("did:bob").pop().unwrap();
    bob.manager.join_group(&welcome).await.unwrap();

    // The extension never saw the group; it loads the snapshot from the vault
    let sent = extension
        .manager
        .send_message(&convo_id, "from the extension", "text/plain", vec![])
        .await
        .unwrap();
    assert_eq!(sent.sequence_number, 0);

    // The app sees the sequence the extension recorded
    app.manager
        .send_message(&convo_id, "from the app", "text/plain", vec![])
        .await
        .unwrap();
    assert_eq!(
        app.manager
            .sequencer()
            .last_processed_seq(&convo_id, USER)
            .await
            .unwrap(),
        1
    );

    // An epoch change made by the app reaches the extension through the store
    carol.manager.publish_key_package(None).await.unwrap();
    let epoch = app
        .manager
        .add_members(&convo_id, &["did:carol".to_string()])
        .await
        .unwrap();
    assert_eq!(epoch, 2);
    assert_eq!(extension.manager.get_epoch(&convo_id).await.unwrap(), 2);

    let after_commit = extension
        .manager
        .send_message(&convo_id, "after the commit", "text/plain", vec![])
        .await
        .unwrap();
    assert_eq!(after_commit.epoch, 2);

    for inbound in server.messages(&convo_id) {
        let outcome = bob
            .manager
            .process_incoming(inbound, MessageSource::Sse)
            .await
            .unwrap();
        assert!(matches!(outcome, InboundOutcome::Applied { processed: 1, .. }));
    }

    let texts: Vec<String> = bob
        .manager
        .messages(&convo_id)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| m.plaintext)
        .collect();
    assert_eq!(
        texts,
        vec!["from the extension", "from the app", "after the commit"]
    );
    assert_eq!(bob.manager.get_epoch(&convo_id).await.unwrap(), 2);
}
