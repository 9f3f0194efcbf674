//! Ordering properties of the sequence coordinator under arbitrary delivery

mod common;

use std::sync::Arc;

use anyhow::Result;
use common::{message, open_store, START_MILLIS};
use mlsync_core::config::SequencingConfig;
use mlsync_core::core_mls::{ManualClock, MessageSource, SequenceCoordinator, SequenceDecision};
use proptest::prelude::*;
use tempfile::{tempdir, TempDir};

const USER: &str = "did:alice";
const CONVO: &str = "c1";

/// Deliver `order` the way the inbound pipeline does and return the
/// sequence numbers in the order they were applied
async fn deliver(order: &[i64]) -> Result<(Vec<i64>, SequenceCoordinator, TempDir)> {
    let dir = tempdir()?;
    let sequencer = SequenceCoordinator::new(
        Arc::new(open_store(&dir.path().join("seq.db"))),
        Arc::new(ManualClock::new(START_MILLIS)),
        &SequencingConfig::default(),
    );

    let mut applied = Vec::new();
    for &seq in order {
        let inbound = message(CONVO, seq);
        match sequencer
            .should_process_message(&inbound.id, CONVO, seq, USER)
            .await?
        {
            SequenceDecision::AlreadyProcessed => {}
            SequenceDecision::Buffer => {
                sequencer
                    .buffer_message(&inbound, USER, MessageSource::Sse)
                    .await?;
            }
            SequenceDecision::ProcessNow => {
                applied.push(seq);
                let mut ready = sequencer
                    .record_message_processed(&inbound.id, CONVO, seq, USER)
                    .await?;
                while let Some(next) = ready.first().cloned() {
                    applied.push(next.sequence_number);
                    ready = sequencer
                        .record_message_processed(
                            &next.message_id,
                            CONVO,
                            next.sequence_number,
                            USER,
                        )
                        .await?;
                }
            }
        }
    }

    Ok((applied, sequencer, dir))
}

fn run<T>(future: impl std::future::Future<Output = T>) -> T {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
        .block_on(future)
}

/// A permutation of `0..n` with some entries delivered twice
fn delivery_order() -> impl Strategy<Value = (usize, Vec<i64>)> {
    (1usize..24)
        .prop_flat_map(|n| (Just(n), prop::collection::vec(0..n as i64, 0..6)))
        .prop_flat_map(|(n, dups)| {
            let mut order: Vec<i64> = (0..n as i64).collect();
            order.extend(dups);
            (Just(n), Just(order).prop_shuffle())
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_every_message_applied_once_in_order((n, order) in delivery_order()) {
        let (applied, _, _dir) = run(deliver(&order)).unwrap();
        prop_assert_eq!(applied, (0..n as i64).collect::<Vec<_>>());
    }

    #[test]
    fn prop_redelivery_is_already_processed((n, order) in delivery_order()) {
        let (decisions, leftover) = run(async {
            let (_, sequencer, _dir) = deliver(&order).await?;
            let mut decisions = Vec::new();
            for seq in 0..n as i64 {
                let id = format!("{}-m{}", CONVO, seq);
                decisions.push(sequencer.should_process_message(&id, CONVO, seq, USER).await?);
            }
            let leftover = sequencer.flush_buffered_messages(CONVO, USER).await?;
            Ok::<_, anyhow::Error>((decisions, leftover.len()))
        })
        .unwrap();

        prop_assert!(decisions.iter().all(|d| *d == SequenceDecision::AlreadyProcessed));
        prop_assert_eq!(leftover, 0);
    }
}
