#![allow(unused_qualifications)] // This is to suppress warnings originating in the test macros.

use std::collections::{hash_map::DefaultHasher, BTreeMap};
use std::hash::Hasher;

use super::*;
use crate::{
    consensus::{
        dag::{
            message::{Bond, WireMessage},
            weight::Weight,
        },
        traits::ValidatorSecret,
    },
    types::Timestamp,
};

pub(crate) const WEIGHTS: &[Weight] = &[Weight(3), Weight(4), Weight(5)];

pub(crate) const ALICE: u32 = 0;
pub(crate) const BOB: u32 = 1;
pub(crate) const CAROL: u32 = 2;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct TestContext;

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct TestSecret(pub(crate) u32);

impl ValidatorSecret for TestSecret {
    type Hash = u64;
    type Signature = u64;

    fn sign(&self, data: &Self::Hash) -> Self::Signature {
        data.wrapping_add(u64::from(self.0))
    }
}

impl Context for TestContext {
    type ConsensusValue = u32;
    type ValidatorId = u32;
    type ValidatorSecret = TestSecret;
    type Signature = u64;
    type Hash = u64;
    type InstanceId = u64;

    fn hash(data: &[u8]) -> Self::Hash {
        let mut hasher = DefaultHasher::new();
        hasher.write(data);
        hasher.finish()
    }

    fn instance_id(key_block: &Self::Hash) -> Self::InstanceId {
        *key_block
    }

    fn verify_signature(
        hash: &Self::Hash,
        public_key: &Self::ValidatorId,
        signature: &Self::Signature,
    ) -> bool {
        let computed_signature = hash.wrapping_add(u64::from(*public_key));
        computed_signature == *signature
    }
}

/// Returns the default test bonds: Alice 3, Bob 4, Carol 5.
pub(crate) fn test_bonds() -> Vec<Bond<u32>> {
    WEIGHTS
        .iter()
        .enumerate()
        .map(|(validator, weight)| Bond::new(validator as u32, *weight))
        .collect()
}

/// Returns a DAG containing only a genesis block with the given bonds.
pub(crate) fn new_dag_with_bonds(bonds: Vec<Bond<u32>>) -> DagState<TestContext> {
    DagState::new(Message::genesis(0xDEAD, bonds, Timestamp::zero()))
}

/// Returns a DAG containing only a genesis block with the default test bonds.
pub(crate) fn new_dag() -> DagState<TestContext> {
    new_dag_with_bonds(test_bonds())
}

/// Builds a signed wire message the way a live validator would: citing the given parents (the
/// first is the main parent) plus `extra_cites`, with justifications derived as the latest
/// message per validator among everything cited, including the creator's own previous message.
pub(crate) fn wire_msg(
    state: &DagState<TestContext>,
    creator: u32,
    value: Option<u32>,
    parents: Vec<u64>,
    extra_cites: Vec<u64>,
    era_id: Option<u64>,
    round_id: Option<Timestamp>,
) -> SignedWireMessage<TestContext> {
    let mut cited: Vec<u64> = parents.clone();
    cited.extend(extra_cites);
    cited.extend(state.latest_in_era(era_id.as_ref(), &creator));

    let mut justifications: BTreeMap<u32, u64> = BTreeMap::new();
    let mut candidates: Vec<(u32, u64)> = Vec::new();
    for hash in &cited {
        let message = state.message(hash);
        if message.era_id != era_id {
            continue;
        }
        if let Some(validator) = message.creator {
            candidates.push((validator, *hash));
        }
        for (validator, justified) in &message.justifications {
            candidates.push((*validator, *justified));
        }
    }
    for (validator, hash) in candidates {
        let entry = justifications.entry(validator).or_insert(hash);
        if state.message(&hash).seq_number > state.message(entry).seq_number {
            *entry = hash;
        }
    }

    let prev = justifications.get(&creator).cloned();
    let seq_number = prev.map_or(1, |hash| state.message(&hash).seq_number + 1);
    let j_rank = 1 + parents
        .iter()
        .chain(justifications.values())
        .map(|hash| state.message(hash).j_rank)
        .max()
        .unwrap_or(0);
    let main_parent = state.message(&parents[0]);
    let main_rank = main_parent.main_rank + 1;
    let timestamp = Timestamp::from(
        1 + parents
            .iter()
            .chain(justifications.values())
            .map(|hash| state.message(hash).timestamp.millis())
            .max()
            .unwrap_or(0),
    );
    let post_state_hash = match value {
        Some(value) => 0xF00D_0000 + u64::from(value),
        None => main_parent.post_state_hash,
    };
    let bonds = main_parent.bonds.clone();

    let wire_message = WireMessage {
        creator,
        seq_number,
        prev,
        parents,
        justifications,
        j_rank,
        main_rank,
        era_id,
        round_id,
        timestamp,
        value,
        post_state_hash,
        bonds,
    };
    SignedWireMessage::new(wire_message, &TestSecret(creator))
}

#[test]
fn add_message() -> Result<(), MessageError> {
    let mut state = new_dag();
    let g = *state.genesis();

    // Create messages as follows; a0, b0 are blocks:
    //
    // Alice: a0 ————— a1
    //                /
    // Bob:   b0 —— b1
    //          \  /
    // Carol:    c0
    let a0 = add_msg!(state, ALICE, Some(0xA); g)?.hash;
    let b0 = add_msg!(state, BOB, Some(0xB); g)?.hash;
    let c0 = add_msg!(state, CAROL, None; b0)?.hash;
    let b1 = add_msg!(state, BOB, None; b0; cites c0)?.hash;
    let a1 = add_msg!(state, ALICE, Some(0xA1); a0; cites b1)?.hash;

    // Ranks agree with the citation structure.
    assert_eq!(0, state.message(&g).j_rank);
    assert_eq!(1, state.message(&a0).j_rank);
    assert_eq!(2, state.message(&c0).j_rank);
    assert_eq!(3, state.message(&b1).j_rank);
    assert_eq!(4, state.message(&a1).j_rank);
    assert_eq!(1, state.message(&a0).main_rank);
    assert_eq!(2, state.message(&a1).main_rank);

    // The children index inverts the parent links.
    let genesis_children: std::collections::BTreeSet<u64> =
        state.children(&g).copied().collect();
    assert_eq!(
        vec![a0, b0].into_iter().collect::<std::collections::BTreeSet<u64>>(),
        genesis_children
    );
    assert_eq!(vec![&a1], state.children(&a0).collect::<Vec<_>>());

    // A message with a wrong sequence number is rejected.
    let mut swm = wire_msg(&state, BOB, None, vec![b0], vec![], None, None);
    swm.wire_message.seq_number = 5;
    swm = SignedWireMessage::new(swm.wire_message, &TestSecret(BOB));
    assert_eq!(Err(MessageError::SequenceNumber), state.add_message(swm));

    // A message citing an unknown dependency is rejected.
    let mut swm = wire_msg(&state, CAROL, None, vec![b1], vec![], None, None);
    swm.wire_message.parents = vec![0xBAD_C0DE];
    swm = SignedWireMessage::new(swm.wire_message, &TestSecret(CAROL));
    assert!(matches!(
        state.add_message(swm),
        Err(MessageError::MissingDependency(_))
    ));

    // A ballot cannot be used as a parent.
    let mut swm = wire_msg(&state, CAROL, None, vec![b0], vec![], None, None);
    swm.wire_message.parents = vec![c0];
    swm = SignedWireMessage::new(swm.wire_message, &TestSecret(CAROL));
    assert_eq!(
        Err(MessageError::BallotParent(format!("{:?}", c0))),
        state.add_message(swm)
    );

    // A wrong claimed rank is rejected.
    let mut swm = wire_msg(&state, CAROL, None, vec![b0], vec![], None, None);
    swm.wire_message.j_rank += 1;
    swm = SignedWireMessage::new(swm.wire_message, &TestSecret(CAROL));
    assert!(matches!(state.add_message(swm), Err(MessageError::JRank { .. })));

    // A bad signature is rejected.
    let mut swm = wire_msg(&state, CAROL, None, vec![b0], vec![], None, None);
    swm.signature = swm.signature.wrapping_add(1);
    assert_eq!(Err(MessageError::Signature), state.add_message(swm));

    Ok(())
}

#[test]
fn find_in_swimlane() -> Result<(), MessageError> {
    let mut state = new_dag();
    let g = *state.genesis();
    let a0 = add_msg!(state, ALICE, Some(0xA); g)?.hash;
    let mut a = vec![a0];
    for i in 1..10 {
        let ai = add_msg!(state, ALICE, Some(0xA0 + i as u32); a[i - 1])?.hash;
        a.push(ai);
    }

    // The predecessor with sequence number i + 1 should always equal a[i].
    for j in (a.len() - 2)..a.len() {
        for i in 0..j {
            assert_eq!(
                Some(&a[i]),
                state.find_in_swimlane(&a[j], i as u64 + 1)
            );
        }
    }

    // The skip index of a message at swimlane position n points at positions n - 2^i.
    // a[8] has sequence number 9, so it skips to 8, 7, 5 and 1.
    assert_eq!(
        vec![a[7], a[6], a[4], a[0]],
        state.message(&a[8]).swimlane_skip
    );
    // a[9] has sequence number 10, which is even, so it only skips to 9.
    assert_eq!(vec![a[8]], state.message(&a[9]).swimlane_skip);
    Ok(())
}

#[test]
fn find_main_ancestor() -> Result<(), MessageError> {
    let mut state = new_dag();
    let g = *state.genesis();
    let mut chain = vec![g];
    for i in 0..9 {
        let block = add_msg!(state, ALICE, Some(i as u32); chain[i])?.hash;
        chain.push(block);
    }

    for high in 0..chain.len() {
        for low in 0..=high {
            assert_eq!(
                Some(&chain[low]),
                state.find_main_ancestor(&chain[high], low as u64)
            );
        }
    }
    assert_eq!(None, state.find_main_ancestor(&chain[3], 7));
    assert!(state.is_main_ancestor(&chain[2], &chain[8]));
    assert!(!state.is_main_ancestor(&chain[8], &chain[2]));

    // The main-chain skip index of the block at rank 8 points at ranks 7, 6, 4 and 0.
    let at_rank_8 = &chain[8];
    assert_eq!(
        vec![chain[7], chain[6], chain[4], chain[0]],
        state.message(at_rank_8).main_skip
    );
    Ok(())
}

#[test]
fn equivocation_on_insert() -> Result<(), MessageError> {
    let mut state = new_dag();
    let g = *state.genesis();

    // Alice signs two children of genesis with the same sequence number.
    let fork0 = wire_msg(&state, ALICE, Some(0xA1), vec![g], vec![], None, None);
    let fork1 = wire_msg(&state, ALICE, Some(0xA2), vec![g], vec![], None, None);
    assert_eq!(fork0.wire_message.seq_number, fork1.wire_message.seq_number);

    let outcome0 = state.add_message(fork0)?;
    assert_eq!(None, outcome0.equivocation);
    assert!(state.equivocators().is_empty());

    // The second fork is stored, but flags Alice as an equivocator.
    let outcome1 = state.add_message(fork1)?;
    assert_eq!(Some(ALICE), outcome1.equivocation);
    assert!(state.equivocators().contains(&ALICE));
    assert!(state.equivocators_in_era(None).contains(&ALICE));
    assert!(state.is_equivocator(&ALICE));
    assert_eq!(Some(1), state.equivocation_base_rank(&ALICE));

    // Both forks are tips: neither dominates the other.
    assert_eq!(2, state.latest_message(&ALICE).len());

    // A later message extending one fork keeps the other fork as a tip.
    let fork1_hash = outcome1.hash;
    let a1 = add_msg!(state, ALICE, Some(0xA3); fork1_hash)?.hash;
    let tips = state.latest_message(&ALICE);
    assert_eq!(2, tips.len());
    assert!(tips.contains(&a1));
    assert!(tips.contains(&outcome0.hash));
    Ok(())
}

#[test]
fn topo_sort_streams_in_rank_order() -> Result<(), MessageError> {
    let mut state = new_dag();
    let g = *state.genesis();
    let a0 = add_msg!(state, ALICE, Some(0xA); g)?.hash;
    let b0 = add_msg!(state, BOB, Some(0xB); g)?.hash;
    let a1 = add_msg!(state, ALICE, Some(0xA1); a0; cites b0)?.hash;

    let ranks: Vec<u64> = state.topo_sort(0, 10).map(|msg| msg.j_rank).collect();
    assert!(ranks.windows(2).all(|pair| pair[0] <= pair[1]));
    let hashes: Vec<u64> = state.topo_sort(2, 10).map(|msg| msg.hash).collect();
    assert_eq!(vec![a1], hashes);
    let first: Vec<u64> = state.topo_sort(0, 1).map(|msg| msg.hash).collect();
    assert_eq!(vec![g], first);
    Ok(())
}

#[test]
fn wire_message_roundtrip() {
    let mut state = new_dag();
    let g = *state.genesis();
    let swm = wire_msg(&state, ALICE, Some(0xA), vec![g], vec![], None, None);
    let serialized = bincode::serialize(&swm).expect("serialize");
    let deserialized: SignedWireMessage<TestContext> =
        bincode::deserialize(&serialized).expect("deserialize");
    assert_eq!(swm, deserialized);
    assert_eq!(swm.hash(), deserialized.hash());
    state.add_message(deserialized).expect("valid message");
}

#[test]
fn finality_status_transitions_once() -> Result<(), MessageError> {
    let mut state = new_dag();
    let g = *state.genesis();
    let b0 = add_msg!(state, BOB, Some(0xB); g)?.hash;

    assert_eq!(
        Some(FinalityStatus::FinalizedDirectly),
        state.finality_status(&g)
    );
    assert_eq!(Some(FinalityStatus::Undecided), state.finality_status(&b0));
    assert_eq!(None, state.finality_status(&0xBAD_C0DE));

    state.set_finality(&b0, FinalityStatus::FinalizedDirectly);
    assert_eq!(&b0, state.last_finalized());
    Ok(())
}
