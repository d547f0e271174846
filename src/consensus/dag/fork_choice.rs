//! The fork choice rule: greatest-honest-weight subtree.
//!
//! The honest validators' latest messages count as votes for the block they point to, as well as
//! all of its ancestors, down to the `stop_hash` (the era's key block in highway mode, genesis
//! otherwise). At each level the block with the highest score is selected from the children of
//! the previously selected block, until a block is reached that has no children with any votes.

use std::{
    collections::BTreeMap,
    iter::{self, Extend, FromIterator},
};

use itertools::Itertools;

use crate::consensus::traits::Context;

use super::{
    state::DagState,
    validators::Validators,
    weight::Weight,
};

/// A tally of votes at a specific main rank. This is never empty: It contains at least one vote.
///
/// It must always contain at most one vote from each validator. In particular, the sum of the
/// weights must be at most the total of all validators' weights.
#[derive(Clone)]
struct Tally<'a, C: Context> {
    /// The block with the highest weight, and the highest hash if there's a tie.
    max: (Weight, &'a C::Hash),
    /// The total vote weight for each block.
    votes: BTreeMap<&'a C::Hash, Weight>,
}

impl<'a, C: Context> Extend<(&'a C::Hash, Weight)> for Tally<'a, C> {
    fn extend<T: IntoIterator<Item = (&'a C::Hash, Weight)>>(&mut self, iter: T) {
        for (bhash, w) in iter {
            self.add(bhash, w);
        }
    }
}

impl<'a, C: Context> Tally<'a, C> {
    /// Returns a new tally with a single entry.
    fn new(bhash: &'a C::Hash, w: Weight) -> Self {
        Tally {
            max: (w, bhash),
            votes: iter::once((bhash, w)).collect(),
        }
    }

    /// Creates a tally from a list of votes. Returns `None` if the iterator is empty.
    fn try_from_iter<T: IntoIterator<Item = (&'a C::Hash, Weight)>>(iter: T) -> Option<Self> {
        let mut iter = iter.into_iter();
        let (bhash, w) = iter.next()?;
        let mut tally = Tally::new(bhash, w);
        tally.extend(iter);
        Some(tally)
    }

    /// Returns a new tally with the same votes, but one level lower: a vote for a block counts as
    /// a vote for that block's parent. Panics if called on the root level.
    fn parents(&self, dag: &'a DagState<C>) -> Self {
        let to_parent = |(hash, w): (&&'a C::Hash, &Weight)| {
            let parent = dag
                .message(*hash)
                .main_parent()
                .expect("only genesis has no parent");
            (parent, *w)
        };
        // Safe as a tally is never empty.
        Self::try_from_iter(self.votes.iter().map(to_parent)).unwrap()
    }

    /// Adds a vote for a block to the tally, possibly updating the current maximum.
    fn add(&mut self, bhash: &'a C::Hash, weight: Weight) {
        let w = self.votes.entry(bhash).or_default();
        *w += weight;
        self.max = (*w, bhash).max(self.max);
    }

    /// Returns the maximum voting weight a single block received.
    fn max_w(&self) -> Weight {
        self.max.0
    }

    /// Returns the block hash that received the most votes; the highest hash in case of a tie.
    fn max_bhash(&self) -> &'a C::Hash {
        self.max.1
    }

    /// Returns a tally containing only the votes for descendants of `bhash`.
    fn filter_descendants(
        self,
        main_rank: u64,
        bhash: &'a C::Hash,
        dag: &'a DagState<C>,
    ) -> Option<Self> {
        let iter = self.votes.into_iter();
        Self::try_from_iter(
            iter.filter(|&(b, _)| dag.find_main_ancestor(b, main_rank) == Some(bhash)),
        )
    }
}

/// A list of tallies by main rank. The tally at each rank contains only the votes that point
/// directly to a block at that rank, not at a descendant.
struct Tallies<'a, C: Context>(BTreeMap<u64, Tally<'a, C>>);

impl<'a, C: Context> Default for Tallies<'a, C> {
    fn default() -> Self {
        Tallies(BTreeMap::new())
    }
}

impl<'a, C: Context> FromIterator<(u64, &'a C::Hash, Weight)> for Tallies<'a, C> {
    fn from_iter<T: IntoIterator<Item = (u64, &'a C::Hash, Weight)>>(iter: T) -> Self {
        let mut tallies = Self::default();
        for (main_rank, bhash, weight) in iter {
            tallies.add(main_rank, bhash, weight);
        }
        tallies
    }
}

impl<'a, C: Context> Tallies<'a, C> {
    /// Returns the rank and hash of a block that is an ancestor of the fork choice, and _not_ an
    /// ancestor of all entries in `self`. Returns `None` if `self` is empty.
    fn find_decided(&self, dag: &'a DagState<C>, stop_rank: u64) -> Option<(u64, &'a C::Hash)> {
        let max_rank = *self.0.keys().next_back()?;
        let total_weight: Weight = self
            .0
            .values()
            .flat_map(|tally| tally.votes.values())
            .cloned()
            .sum();
        // In the loop, this will be the tally of all votes from higher than the current rank.
        let mut prev_tally = self.0[&max_rank].clone();
        // Start from `max_rank - 1` and find the greatest rank where a decision can be made.
        for main_rank in (stop_rank..max_rank).rev() {
            // The tally at `main_rank` is the sum of the parents of `main_rank + 1` and the votes
            // that point directly to blocks at `main_rank`.
            let mut rank_tally = prev_tally.parents(dag);
            if let Some(tally) = self.0.get(&main_rank) {
                rank_tally.extend(tally.votes.iter().map(|(b, w)| (*b, *w)));
            }
            // If any block received more than 50%, a decision can be made: Either that block is
            // the fork choice, or we can pick its highest scoring child from `prev_tally`.
            if rank_tally.max_w() * 2 > total_weight {
                return Some(
                    match prev_tally.filter_descendants(main_rank, rank_tally.max_bhash(), dag) {
                        Some(filtered) => (main_rank + 1, filtered.max_bhash()),
                        None => (main_rank, rank_tally.max_bhash()),
                    },
                );
            }
            prev_tally = rank_tally;
        }
        // Even at the stop rank no block received a majority. Pick the highest weight.
        Some((stop_rank, prev_tally.max_bhash()))
    }

    /// Removes all votes for blocks that are not descendants of `bhash`.
    fn filter_descendants(
        self,
        main_rank: u64,
        bhash: &'a C::Hash,
        dag: &'a DagState<C>,
    ) -> Self {
        let map_compatible = |(rank, tally): (u64, Tally<'a, C>)| {
            tally
                .filter_descendants(main_rank, bhash, dag)
                .map(|tally| (rank, tally))
        };
        // All tallies at `main_rank` and lower can be removed, too.
        let relevant_ranks = self.0.into_iter().rev().take_while(|(rank, _)| *rank > main_rank);
        Tallies(relevant_ranks.filter_map(map_compatible).collect())
    }

    /// Adds an entry to the tally at the specified `main_rank`.
    fn add(&mut self, main_rank: u64, bhash: &'a C::Hash, weight: Weight) {
        self.0
            .entry(main_rank)
            .and_modify(|tally| tally.add(bhash, weight))
            .or_insert_with(|| Tally::new(bhash, weight));
    }

    /// Returns `true` if there are no tallies in this map.
    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Returns the fork choice: the main parent for a new message, picked by greatest honest weight
/// over the subtree rooted in `stop_hash`.
///
/// The fork choice is a pure function of the honest validators' latest messages, so calling it
/// twice on the same DAG returns the same block.
pub fn fork_choice<'a, C: Context>(
    dag: &'a DagState<C>,
    stop_hash: &'a C::Hash,
    validators: &Validators<C::ValidatorId>,
    era_id: Option<&C::InstanceId>,
) -> C::Hash {
    let stop_rank = dag.message(stop_hash).main_rank;
    let tips = dag.honest_tips(era_id);
    let to_entry = |(validator, tip): &(C::ValidatorId, C::Hash)| {
        let weight = validators
            .get_index(validator)
            .map(|idx| validators.get_by_index(idx).weight())?;
        let vote = dag.message(tip).vote_block();
        // Votes outside the subtree rooted in `stop_hash` are ignored.
        if dag.find_main_ancestor(&vote, stop_rank) != Some(stop_hash) {
            return None;
        }
        let entry = dag
            .lookup(&vote)
            .map(|block| (block.main_rank, block.hash.clone(), weight))?;
        Some(entry)
    };
    let entries: Vec<(u64, C::Hash, Weight)> = tips.iter().filter_map(to_entry).collect();
    let mut tallies: Tallies<C> = entries
        .iter()
        .map(|(rank, bhash, weight)| (*rank, bhash, *weight))
        .collect();
    loop {
        // Find the highest block that we know is an ancestor of the fork choice.
        let (main_rank, bhash) = match tallies.find_decided(dag, stop_rank) {
            None => return stop_hash.clone(),
            Some(decided) => decided,
        };
        // Drop all votes that are not descendants of `bhash`.
        tallies = tallies.filter_descendants(main_rank, bhash, dag);
        // If there are no blocks left, `bhash` itself is the fork choice. Otherwise repeat.
        if tallies.is_empty() {
            return bhash.clone();
        }
    }
}

/// Returns the candidate secondary parents for a new block with the given main parent: the
/// honest tips' blocks in the subtree of `stop_hash` that are not on the main parent's chain,
/// sorted by hash for determinism.
///
/// The caller is responsible for dropping candidates whose effects conflict with the main
/// parent's at the merge layer.
pub fn parent_candidates<C: Context>(
    dag: &DagState<C>,
    stop_hash: &C::Hash,
    validators: &Validators<C::ValidatorId>,
    era_id: Option<&C::InstanceId>,
    main_parent: &C::Hash,
) -> Vec<C::Hash> {
    let stop_rank = dag.message(stop_hash).main_rank;
    dag.honest_tips(era_id)
        .into_iter()
        .filter(|(validator, _)| validators.contains(validator))
        .map(|(_, tip)| dag.message(&tip).vote_block())
        .filter(|vote| dag.find_main_ancestor(vote, stop_rank) == Some(stop_hash))
        .filter(|vote| vote != main_parent && !dag.is_main_ancestor(vote, main_parent))
        .unique()
        .sorted()
        .collect()
}

#[allow(unused_qualifications)] // This is to suppress warnings originating in the test macros.
#[cfg(test)]
mod tests {
    use super::super::state::{tests::*, MessageError};
    use super::*;

    fn test_validators() -> Validators<u32> {
        WEIGHTS
            .iter()
            .enumerate()
            .map(|(validator, weight)| (validator as u32, *weight))
            .collect()
    }

    #[test]
    fn fork_choice_prefers_heaviest_subtree() -> Result<(), MessageError> {
        let mut state = new_dag();
        let g = *state.genesis();
        let validators = test_validators();

        // Create blocks with scores as follows:
        //
        //          a0: 7 — a1: 3
        //        /       \
        // g: 12            b2: 4
        //        \
        //          c0: 5 — c1: 5
        let c0 = add_msg!(state, CAROL, Some(0xC0); g)?.hash;
        let c1 = add_msg!(state, CAROL, Some(0xC1); c0)?.hash;
        let a0 = add_msg!(state, ALICE, Some(0xA0); g)?.hash;
        let b0 = add_msg!(state, BOB, None; a0)?.hash; // Just a ballot; not shown above.
        let a1 = add_msg!(state, ALICE, Some(0xA1); a0; cites b0, c1)?.hash;
        let b2 = add_msg!(state, BOB, Some(0xB2); a0; cites b0)?.hash;

        // At rank 1, `a0` (Alice 3 + Bob 4) wins against `c0` (Carol 5).
        // At rank 2, `b2` (Bob 4) wins against `a1` (Alice 3). `c1` is not a child of `a0`.
        assert_eq!(b2, fork_choice(&state, &g, &validators, None));

        // Secondary parent candidates: Alice's and Carol's tips are off the chosen main chain.
        let candidates = parent_candidates(&state, &g, &validators, None, &b2);
        let mut expected = vec![a1, c1];
        expected.sort();
        assert_eq!(expected, candidates);
        Ok(())
    }

    #[test]
    fn fork_choice_is_idempotent() -> Result<(), MessageError> {
        let mut state = new_dag();
        let g = *state.genesis();
        let validators = test_validators();

        let b0 = add_msg!(state, BOB, Some(0xB0); g)?.hash;
        let _c0 = add_msg!(state, CAROL, Some(0xC0); g)?.hash;
        let _a0 = add_msg!(state, ALICE, Some(0xA0); b0)?.hash;

        let first = fork_choice(&state, &g, &validators, None);
        let second = fork_choice(&state, &g, &validators, None);
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn fork_choice_without_votes_returns_stop_hash() {
        let state = new_dag();
        let g = *state.genesis();
        let validators = test_validators();
        assert_eq!(g, fork_choice(&state, &g, &validators, None));
    }

    #[test]
    fn equivocators_have_no_vote() -> Result<(), MessageError> {
        let mut state = new_dag();
        let g = *state.genesis();
        let validators = test_validators();

        let b0 = add_msg!(state, BOB, Some(0xB0); g)?.hash;
        // Carol forks; her weight of 5 would otherwise beat Bob's 4.
        let fork0 = wire_msg(&state, CAROL, Some(0xC1), vec![g], vec![], None, None);
        let fork1 = wire_msg(&state, CAROL, Some(0xC2), vec![g], vec![], None, None);
        state.add_message(fork0)?;
        state.add_message(fork1)?;

        assert_eq!(b0, fork_choice(&state, &g, &validators, None));
        Ok(())
    }
}
