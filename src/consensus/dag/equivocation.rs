//! The second half of the equivocation detector: deciding which equivocations are *visible* from
//! a given set of justifications.
//!
//! The first half, the pre-store tip check, lives in
//! [`DagState::add_message`](super::state::DagState::add_message), since it runs as part of every
//! insert.

use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};

use crate::consensus::traits::Context;

use super::state::DagState;

/// An entry in the descending-rank traversal queue. Ordered by rank so that a max-heap pops the
/// deepest unexplored message first.
#[derive(Eq, PartialEq)]
struct QueueEntry<C: Context> {
    j_rank: u64,
    hash: C::Hash,
}

impl<C: Context> Ord for QueueEntry<C> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.j_rank
            .cmp(&other.j_rank)
            .then_with(|| self.hash.cmp(&other.hash))
    }
}

impl<C: Context> PartialOrd for QueueEntry<C> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Returns the validators that appear equivocating in the justification-past-cone of the given
/// messages.
///
/// The typical input is a block's direct justifications: the result is the set of equivocators
/// the block's creator could have seen.
///
/// The traversal walks back from the given messages in descending justification-rank order and
/// flags a validator once two distinct messages with the same swimlane position have been
/// encountered. It stops early when every equivocator recorded in the DAG has been found, or when
/// it descends past the lowest recorded fork base, below which no evidence can exist.
pub fn visible_equivocators<'a, C: Context>(
    dag: &DagState<C>,
    justifications: impl IntoIterator<Item = &'a C::Hash>,
) -> BTreeSet<C::ValidatorId>
where
    C::Hash: 'a,
{
    let known = dag.equivocators();
    if known.is_empty() {
        return BTreeSet::new();
    }
    // No fork starts below this rank, so no traversal needs to either.
    let min_base_rank = known
        .iter()
        .filter_map(|validator| dag.equivocation_base_rank(validator))
        .min()
        .map(|base| base.saturating_sub(1))
        .unwrap_or(0);

    let mut queue: BinaryHeap<QueueEntry<C>> = BinaryHeap::new();
    let mut enqueued: HashSet<C::Hash> = HashSet::new();
    for hash in justifications {
        if enqueued.insert(hash.clone()) {
            queue.push(QueueEntry {
                j_rank: dag.message(hash).j_rank,
                hash: hash.clone(),
            });
        }
    }

    let mut positions_seen: HashMap<(C::ValidatorId, u64), C::Hash> = HashMap::new();
    let mut detected = BTreeSet::new();

    while let Some(QueueEntry { j_rank, hash }) = queue.pop() {
        if j_rank < min_base_rank || detected.len() == known.len() {
            break;
        }
        let message = dag.message(&hash);
        if let Some(creator) = message.creator.clone() {
            let position = (creator.clone(), message.seq_number);
            match positions_seen.get(&position) {
                None => {
                    positions_seen.insert(position, hash.clone());
                }
                Some(other) if *other != hash => {
                    detected.insert(creator);
                }
                Some(_) => {}
            }
        }
        for dependency in message
            .parents
            .iter()
            .chain(message.justifications.values())
        {
            if enqueued.insert(dependency.clone()) {
                queue.push(QueueEntry {
                    j_rank: dag.message(dependency).j_rank,
                    hash: dependency.clone(),
                });
            }
        }
    }

    detected
}

#[allow(unused_qualifications)] // This is to suppress warnings originating in the test macros.
#[cfg(test)]
mod tests {
    use super::super::state::{tests::*, MessageError};
    use super::*;

    #[test]
    fn equivocation_invisible_without_citation() -> Result<(), MessageError> {
        let mut state = new_dag();
        let g = *state.genesis();

        // Alice forks at sequence number 1; Bob never cites either fork.
        let fork0 = wire_msg(&state, ALICE, Some(0xA1), vec![g], vec![], None, None);
        let fork1 = wire_msg(&state, ALICE, Some(0xA2), vec![g], vec![], None, None);
        state.add_message(fork0)?;
        state.add_message(fork1)?;
        let b0 = add_msg!(state, BOB, Some(0xB); g)?.hash;

        // The DAG knows Alice equivocated, but Bob's past cone shows no evidence.
        assert!(state.is_equivocator(&ALICE));
        let visible = visible_equivocators(&state, state.message(&b0).justifications.values());
        assert!(visible.is_empty());
        Ok(())
    }

    #[test]
    fn equivocation_visible_when_both_forks_cited() -> Result<(), MessageError> {
        let mut state = new_dag();
        let g = *state.genesis();

        let fork0 = wire_msg(&state, ALICE, Some(0xA1), vec![g], vec![], None, None);
        let fork1 = wire_msg(&state, ALICE, Some(0xA2), vec![g], vec![], None, None);
        let fork0_hash = state.add_message(fork0)?.hash;
        let fork1_hash = state.add_message(fork1)?.hash;

        // Bob cites one fork, Carol the other; a block citing both Bob and Carol sees the fork.
        let b0 = add_msg!(state, BOB, Some(0xB); fork0_hash)?.hash;
        let c0 = add_msg!(state, CAROL, Some(0xC); fork1_hash)?.hash;
        let b1 = add_msg!(state, BOB, Some(0xB1); b0; cites c0)?.hash;

        let visible = visible_equivocators(&state, state.message(&b1).justifications.values());
        assert_eq!(vec![ALICE], visible.into_iter().collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn traversal_consults_only_the_cone() -> Result<(), MessageError> {
        let mut state = new_dag();
        let g = *state.genesis();

        // An honest chain by Bob.
        let b0 = add_msg!(state, BOB, Some(0xB0); g)?.hash;
        let b1 = add_msg!(state, BOB, Some(0xB1); b0)?.hash;

        // Carol forks afterwards, at a higher rank than Bob's chain.
        let c_fork0 = wire_msg(&state, CAROL, Some(0xC1), vec![b1], vec![], None, None);
        let c_fork1 = wire_msg(&state, CAROL, Some(0xC2), vec![b1], vec![], None, None);
        state.add_message(c_fork0)?;
        state.add_message(c_fork1)?;

        // From Bob's old chain, Carol's later fork is invisible.
        let visible = visible_equivocators(&state, std::iter::once(&b1));
        assert!(visible.is_empty());
        Ok(())
    }
}
