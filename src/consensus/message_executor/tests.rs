#![allow(unused_qualifications)] // This is to suppress warnings originating in the test macros.

use std::sync::Arc;

use num_rational::Ratio;
use parking_lot::RwLock;

use super::*;
use crate::{
    consensus::{
        dag::{
            message::{Bond, Message},
            state::{tests::*, DagState},
            weight::Weight,
        },
        finality::FinalityDetector,
    },
    storage::InMemStorage,
    testing::{TestClock, TestEngine, TestPayloadOps},
    types::Timestamp,
};

type TestExecutor =
    MessageExecutor<TestContext, TestEngine, InMemStorage<TestContext>, InMemStorage<TestContext>>;

struct Fixture {
    executor: TestExecutor,
    dag: SharedDag<TestContext>,
    events: mpsc::UnboundedReceiver<ConsensusEvent<TestContext>>,
    cancel: crate::utils::CancellationToken,
}

fn fixture_with_bonds(bonds: Vec<Bond<u32>>, our_id: Option<u32>) -> Fixture {
    let dag: SharedDag<TestContext> = Arc::new(RwLock::new(DagState::new(Message::genesis(
        0xDEAD,
        bonds.clone(),
        Timestamp::zero(),
    ))));
    let storage = Arc::new(InMemStorage::<TestContext>::new());
    let finality = FinalityDetector::new(&dag.read(), Ratio::new(1, 10), false);
    let cancel = crate::utils::CancellationToken::new();
    let (executor, events) = MessageExecutor::new(
        Arc::clone(&dag),
        Arc::new(TestEngine::new(bonds)),
        Arc::clone(&storage),
        storage,
        Arc::new(TestPayloadOps),
        finality,
        Arc::new(TestClock::at(1_000_000)),
        our_id,
        TimeDiff::from(100),
        TimeDiff::from(0),
        cancel.clone(),
        None,
    );
    Fixture {
        executor,
        dag,
        events,
        cancel,
    }
}

fn fixture(our_id: Option<u32>) -> Fixture {
    fixture_with_bonds(test_bonds(), our_id)
}

#[tokio::test]
async fn valid_block_is_stored_and_announced() {
    let mut fx = fixture(None);
    let g = *fx.dag.read().genesis();

    let swm = {
        let dag = fx.dag.read();
        wire_msg(&dag, ALICE, Some(7), vec![g], vec![], None, None)
    };
    let hash = swm.hash();

    let status = fx.executor.add_message(swm.clone()).await.unwrap();
    assert_eq!(BlockStatus::Valid, status);
    assert!(fx.dag.read().contains(&hash));

    // Re-submitting reports the earlier processing.
    let status = fx.executor.add_message(swm).await.unwrap();
    assert_eq!(BlockStatus::Processed, status);

    let event = fx.events.try_recv().unwrap();
    assert_eq!(ConsensusEvent::BlockAdded { hash }, event);
}

#[tokio::test]
async fn missing_dependency_is_reported() {
    let fx = fixture(None);
    let g = *fx.dag.read().genesis();

    let mut swm = {
        let dag = fx.dag.read();
        wire_msg(&dag, ALICE, Some(7), vec![g], vec![], None, None)
    };
    swm.wire_message.parents = vec![0xBAD_C0DE];
    let swm = SignedWireMessage::new(swm.wire_message, &TestSecret(ALICE));

    let status = fx.executor.add_message(swm).await.unwrap();
    assert_eq!(BlockStatus::MissingBlocks, status);
}

#[tokio::test]
async fn wrong_post_state_is_a_transaction_error() {
    let fx = fixture(None);
    let g = *fx.dag.read().genesis();

    let mut swm = {
        let dag = fx.dag.read();
        wire_msg(&dag, ALICE, Some(7), vec![g], vec![], None, None)
    };
    swm.wire_message.post_state_hash = 0xBAD;
    let swm = SignedWireMessage::new(swm.wire_message, &TestSecret(ALICE));
    let hash = swm.hash();

    let status = fx.executor.add_message(swm.clone()).await.unwrap();
    assert_eq!(
        BlockStatus::InvalidBlock(InvalidBlockKind::Transaction),
        status
    );
    // Invalid blocks are not added to the DAG, and re-offering one is answered from the record
    // of earlier rejections.
    assert!(!fx.dag.read().contains(&hash));
    let status = fx.executor.add_message(swm).await.unwrap();
    assert_eq!(
        BlockStatus::InvalidBlock(InvalidBlockKind::Transaction),
        status
    );
}

#[tokio::test]
async fn unbonded_creator_is_rejected() {
    let fx = fixture_with_bonds(vec![Bond::new(ALICE, Weight(10))], None);
    let g = *fx.dag.read().genesis();

    // Bob is not bonded in genesis.
    let swm = {
        let dag = fx.dag.read();
        wire_msg(&dag, BOB, Some(7), vec![g], vec![], None, None)
    };
    let status = fx.executor.add_message(swm).await.unwrap();
    assert_eq!(BlockStatus::InvalidBlock(InvalidBlockKind::Creator), status);
}

#[tokio::test]
async fn foreign_equivocation_is_stored_and_flagged() {
    let mut fx = fixture(None);
    let g = *fx.dag.read().genesis();

    let (fork0, fork1) = {
        let dag = fx.dag.read();
        (
            wire_msg(&dag, CAROL, Some(1), vec![g], vec![], None, None),
            wire_msg(&dag, CAROL, Some(2), vec![g], vec![], None, None),
        )
    };

    assert_eq!(
        BlockStatus::Valid,
        fx.executor.add_message(fork0).await.unwrap()
    );
    let fork1_hash = fork1.hash();
    assert_eq!(
        BlockStatus::EquivocatedBlock,
        fx.executor.add_message(fork1).await.unwrap()
    );
    // The fork is stored as evidence and Carol is a known equivocator.
    assert!(fx.dag.read().contains(&fork1_hash));
    assert!(fx.dag.read().is_equivocator(&CAROL));

    let mut saw_equivocation_event = false;
    while let Ok(event) = fx.events.try_recv() {
        if let ConsensusEvent::EquivocationDetected { validator } = event {
            assert_eq!(CAROL, validator);
            saw_equivocation_event = true;
        }
    }
    assert!(saw_equivocation_event);
}

/// Self-equivocation is fatal: when the local key has signed two messages at the same swimlane
/// position, the second one must be classified `SelfEquivocatedBlock` and must not be stored.
#[tokio::test]
async fn self_equivocation_is_fatal() {
    let fx = fixture(Some(ALICE));
    let g = *fx.dag.read().genesis();

    let (block, ballot) = {
        let dag = fx.dag.read();
        (
            wire_msg(&dag, ALICE, Some(1), vec![g], vec![], None, None),
            wire_msg(&dag, ALICE, None, vec![g], vec![], None, None),
        )
    };

    assert_eq!(
        BlockStatus::Valid,
        fx.executor.add_message(block).await.unwrap()
    );
    let ballot_hash = ballot.hash();
    assert_eq!(
        BlockStatus::SelfEquivocatedBlock,
        fx.executor.add_message(ballot).await.unwrap()
    );
    // Our own equivocation is never stored or gossiped.
    assert!(!fx.dag.read().contains(&ballot_hash));
    assert!(!fx.dag.read().is_equivocator(&ALICE));
}

#[tokio::test]
async fn cancelled_executor_adds_nothing() {
    let fx = fixture(None);
    let g = *fx.dag.read().genesis();
    let swm = {
        let dag = fx.dag.read();
        wire_msg(&dag, ALICE, Some(7), vec![g], vec![], None, None)
    };
    fx.cancel.cancel();
    let result = fx.executor.add_message(swm).await;
    assert!(matches!(result, Err(ConsensusError::Cancelled)));
}

/// The executor drives the finality detector: a two-validator chain reaches finality and the
/// event stream reports the new LFB.
#[tokio::test]
async fn finalization_is_announced() {
    let mut fx = fixture_with_bonds(
        vec![Bond::new(ALICE, Weight(10)), Bond::new(BOB, Weight(10))],
        None,
    );
    let g = *fx.dag.read().genesis();

    let mut prev = g;
    for i in 0..4u32 {
        let creator = if i % 2 == 0 { ALICE } else { BOB };
        let swm = {
            let dag = fx.dag.read();
            wire_msg(&dag, creator, Some(i), vec![prev], vec![], None, None)
        };
        prev = swm.hash();
        assert_eq!(
            BlockStatus::Valid,
            fx.executor.add_message(swm).await.unwrap()
        );
    }

    let mut finalized = Vec::new();
    while let Ok(event) = fx.events.try_recv() {
        if let ConsensusEvent::NewLastFinalizedBlock { hash, .. } = event {
            finalized.push(hash);
        }
    }
    assert!(!finalized.is_empty(), "the chain should have finalized");
    let lfb = *fx.dag.read().last_finalized();
    assert_eq!(*finalized.last().unwrap(), lfb);
}
