//! The finality detector.
//!
//! Finality is decided relative to the current last finalized block (LFB) over the validator set
//! bonded in it. For every fork-choice candidate that is a direct child of the LFB, a
//! [`VotingMatrix`](voting_matrix::VotingMatrix) instance accumulates which validators vote for
//! that candidate and who has seen whom doing so. A candidate becomes the new LFB once a
//! committee forms whose members all see each other voting for it and whose stake reaches the
//! quorum derived from the relative fault tolerance threshold.

pub(crate) mod voting_matrix;

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    iter,
};

use num_rational::Ratio;
use tracing::{info, trace};

use crate::consensus::{
    dag::{
        equivocation::visible_equivocators,
        state::{DagState, FinalityStatus},
        validators::Validators,
        weight::Weight,
    },
    traits::Context,
};

use voting_matrix::VotingMatrix;

/// A block that was finalized directly by a committee, with everything decided alongside it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FinalizedBlock<C: Context> {
    /// The newly finalized block; the new LFB.
    pub block: C::Hash,
    /// The committee members whose mutual visibility committed the block.
    pub committee: Vec<C::ValidatorId>,
    /// The committee's total stake.
    pub quorum: Weight,
    /// Ancestors of the new LFB that became finalized along with it, via any parent edge.
    pub indirectly_finalized: Vec<C::Hash>,
    /// Blocks in the new LFB's past cone that can no longer be finalized.
    pub orphaned: Vec<C::Hash>,
    /// Equivocators visible from the new LFB that were not reported before.
    pub new_equivocators: Vec<C::ValidatorId>,
}

/// The result of running the finality detector on the DAG.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FinalityOutcome<C: Context> {
    /// No new block has been finalized yet.
    None,
    /// One or more blocks were finalized, oldest first.
    Finalized(Vec<FinalizedBlock<C>>),
    /// The fault tolerance threshold has been exceeded: The total stake of observed equivocators
    /// invalidates this detector's results.
    FttExceeded,
}

/// An incremental finality detector.
///
/// It reuses information between subsequent calls, so it must always be applied to the same DAG.
#[derive(Debug)]
pub struct FinalityDetector<C: Context> {
    /// The relative fault tolerance threshold, in `[0, 0.5)`.
    rel_ftt: Ratio<u64>,
    /// The validator set bonded in the current LFB.
    validators: Validators<C::ValidatorId>,
    /// One matrix per direct child of the LFB that has received votes.
    matrices: BTreeMap<C::Hash, VotingMatrix<C>>,
    /// Equivocators already reported in an earlier outcome.
    reported_equivocators: BTreeSet<C::ValidatorId>,
    /// Whether the orphan traversal is bounded by the LFB's era.
    highway: bool,
}

impl<C: Context> FinalityDetector<C> {
    /// Creates a detector for the DAG's current LFB.
    pub fn new(dag: &DagState<C>, rel_ftt: Ratio<u64>, highway: bool) -> Self {
        assert!(
            rel_ftt < Ratio::new(1, 2),
            "the relative fault tolerance threshold must be below 1/2"
        );
        let mut detector = FinalityDetector {
            rel_ftt,
            validators: bonded_validators(dag, dag.last_finalized()),
            matrices: BTreeMap::new(),
            reported_equivocators: BTreeSet::new(),
            highway,
        };
        detector.seed_from_latest(dag);
        detector
    }

    /// Feeds a newly added message into the matrices. Call this for every message the executor
    /// stores, before running `run`.
    pub fn on_new_message(&mut self, dag: &DagState<C>, hash: &C::Hash) {
        let message = dag.message(hash);
        let creator = match message.creator.clone() {
            None => return,
            Some(creator) => creator,
        };
        if dag.is_equivocator(&creator) {
            if let Some(idx) = self.validators.get_index(&creator) {
                for matrix in self.matrices.values_mut() {
                    matrix.exclude(idx);
                }
            }
            return;
        }
        let lfb = dag.last_finalized().clone();
        let branch = match voted_branch(dag, &lfb, hash) {
            None => return,
            Some(branch) => branch,
        };
        let validators = self.validators.clone();
        let matrix = self
            .matrices
            .entry(branch.clone())
            .or_insert_with(|| VotingMatrix::new(branch, validators));
        matrix.update(dag, hash, |msg_hash| voted_branch(dag, &lfb, msg_hash));
    }

    /// Returns the next finality decisions, if any votes added since the last call produced one.
    ///
    /// Commits cascade: once a candidate is finalized the detector reseeds itself from the
    /// validators' latest messages and immediately checks the next level.
    pub fn run(&mut self, dag: &mut DagState<C>) -> FinalityOutcome<C> {
        if self.ftt_exceeded(dag) {
            return FinalityOutcome::FttExceeded;
        }
        let mut finalized = Vec::new();
        while let Some((candidate, quorum, committee)) = self.next_committed(dag) {
            info!(block = ?candidate, %quorum, "finalized block");
            let (indirectly_finalized, orphaned) = mark_finalized(dag, &candidate, self.highway);
            let new_equivocators = self.unreported_equivocators(dag, &candidate);
            finalized.push(FinalizedBlock {
                block: candidate.clone(),
                committee,
                quorum,
                indirectly_finalized,
                orphaned,
                new_equivocators,
            });
            self.rebuild(dag);
        }
        if finalized.is_empty() {
            FinalityOutcome::None
        } else {
            FinalityOutcome::Finalized(finalized)
        }
    }

    /// Returns the quorum: the least committee stake that commits a candidate, i.e.
    /// `total * (1 + 2 * rel_ftt) / 2`, as a comparison on integers.
    fn meets_quorum(&self, committee_weight: Weight) -> bool {
        let total = self.validators.total_weight();
        let num = *self.rel_ftt.numer();
        let denom = *self.rel_ftt.denom();
        u128::from(committee_weight) * 2 * u128::from(denom)
            >= u128::from(total) * (u128::from(denom) + 2 * u128::from(num))
    }

    /// Returns the first candidate, in hash order, whose committee reaches the quorum.
    fn next_committed(
        &self,
        dag: &DagState<C>,
    ) -> Option<(C::Hash, Weight, Vec<C::ValidatorId>)> {
        for (candidate, matrix) in &self.matrices {
            if let Some((weight, committee)) = matrix.committee(dag) {
                if self.meets_quorum(weight) {
                    let members = matrix.member_ids(&committee);
                    return Some((candidate.clone(), weight, members));
                }
                trace!(?candidate, %weight, "committee below quorum");
            }
        }
        None
    }

    /// Returns whether the total stake of known equivocators reaches the fault tolerance
    /// threshold, at which point the detector's decisions are no longer trustworthy.
    fn ftt_exceeded(&self, dag: &DagState<C>) -> bool {
        let faulty: Weight = dag
            .equivocators()
            .iter()
            .filter_map(|validator| self.validators.get_index(validator))
            .map(|idx| self.validators.get_by_index(idx).weight())
            .sum();
        if faulty.is_zero() {
            return false;
        }
        let total = self.validators.total_weight();
        let num = *self.rel_ftt.numer();
        let denom = *self.rel_ftt.denom();
        u128::from(faulty) * u128::from(denom) >= u128::from(total) * u128::from(num)
    }

    /// Drops all matrices and reseeds from the validators' latest messages, relative to the new
    /// LFB and its bonds.
    fn rebuild(&mut self, dag: &DagState<C>) {
        self.validators = bonded_validators(dag, dag.last_finalized());
        self.matrices.clear();
        self.seed_from_latest(dag);
    }

    /// Feeds every honest validator's tip into the matrices, twice: the first pass establishes
    /// all level-zero votes, the second fills in the rows against them. A single pass would make
    /// the cells depend on the iteration order, since a row only records columns whose level-zero
    /// vote is already known.
    fn seed_from_latest(&mut self, dag: &DagState<C>) {
        let mut tips: Vec<C::Hash> = dag
            .latest_messages()
            .filter(|(validator, _)| !dag.is_equivocator(validator))
            .flat_map(|(_, tips)| tips.iter().cloned())
            .collect();
        tips.sort();
        for tip in tips.iter().chain(tips.iter()) {
            self.on_new_message(dag, tip);
        }
    }

    fn unreported_equivocators(
        &mut self,
        dag: &DagState<C>,
        new_lfb: &C::Hash,
    ) -> Vec<C::ValidatorId> {
        let visible = visible_equivocators(dag, dag.message(new_lfb).justifications.values());
        let new: Vec<C::ValidatorId> = visible
            .into_iter()
            .filter(|validator| !self.reported_equivocators.contains(validator))
            .collect();
        self.reported_equivocators.extend(new.iter().cloned());
        new
    }
}

/// Returns the direct child of `lfb` on the main chain of the block voted by `hash`, or `None`
/// if that block is not a proper descendant of `lfb`.
fn voted_branch<C: Context>(
    dag: &DagState<C>,
    lfb: &C::Hash,
    hash: &C::Hash,
) -> Option<C::Hash> {
    let vote = dag.message(hash).vote_block();
    let lfb_rank = dag.message(lfb).main_rank;
    if dag.message(&vote).main_rank <= lfb_rank {
        return None;
    }
    if dag.find_main_ancestor(&vote, lfb_rank) != Some(lfb) {
        return None;
    }
    dag.find_main_ancestor(&vote, lfb_rank + 1).cloned()
}

/// Returns the validator set bonded in the given block.
fn bonded_validators<C: Context>(
    dag: &DagState<C>,
    block: &C::Hash,
) -> Validators<C::ValidatorId> {
    dag.message(block)
        .bonds
        .iter()
        .map(|bond| (bond.validator.clone(), bond.stake))
        .collect()
}

/// Marks `new_lfb` as directly finalized and settles everything decided alongside it.
///
/// Every not-yet-finalized ancestor reachable over parent edges becomes `FinalizedIndirectly`;
/// every undecided block in the justification-past cone that is not such an ancestor becomes
/// `Orphaned`. In highway mode the orphan traversal stays within the new LFB's era.
pub(crate) fn mark_finalized<C: Context>(
    dag: &mut DagState<C>,
    new_lfb: &C::Hash,
    highway: bool,
) -> (Vec<C::Hash>, Vec<C::Hash>) {
    dag.set_finality(new_lfb, FinalityStatus::FinalizedDirectly);
    let era_id = dag.message(new_lfb).era_id.clone();

    // Ancestors over parent edges, stopping at blocks already finalized. Parents are always
    // blocks, so everything visited here is a block.
    let mut indirectly_finalized = Vec::new();
    let mut queue: VecDeque<C::Hash> = dag.message(new_lfb).parents.iter().cloned().collect();
    let mut visited: BTreeSet<C::Hash> = queue.iter().cloned().collect();
    while let Some(hash) = queue.pop_front() {
        if dag.finality_status(&hash) != Some(FinalityStatus::Undecided) {
            continue;
        }
        dag.set_finality(&hash, FinalityStatus::FinalizedIndirectly);
        indirectly_finalized.push(hash.clone());
        for parent in &dag.message(&hash).parents.clone() {
            if visited.insert(parent.clone()) {
                queue.push_back(parent.clone());
            }
        }
    }

    // Undecided blocks in the justification-past cone that did not just get finalized can never
    // be finalized anymore. Blocks finalized in *earlier* calls already had their cones settled,
    // so the traversal stops there; blocks finalized just now still need their cones scanned.
    let just_finalized: BTreeSet<C::Hash> = indirectly_finalized
        .iter()
        .chain(iter::once(new_lfb))
        .cloned()
        .collect();
    let mut orphaned = Vec::new();
    let message = dag.message(new_lfb);
    let mut queue: VecDeque<C::Hash> = message
        .parents
        .iter()
        .chain(message.justifications.values())
        .cloned()
        .collect();
    let mut visited: BTreeSet<C::Hash> = queue.iter().cloned().collect();
    while let Some(hash) = queue.pop_front() {
        let message = dag.message(&hash);
        if highway && message.era_id != era_id {
            continue;
        }
        let status = dag.finality_status(&hash);
        if status == Some(FinalityStatus::Undecided) && message.is_block() {
            dag.set_finality(&hash, FinalityStatus::Orphaned);
            orphaned.push(hash.clone());
        } else if status.map_or(false, FinalityStatus::is_finalized)
            && !just_finalized.contains(&hash)
        {
            continue;
        }
        let message = dag.message(&hash);
        for dependency in message
            .parents
            .iter()
            .chain(message.justifications.values())
        {
            if visited.insert(dependency.clone()) {
                queue.push_back(dependency.clone());
            }
        }
    }

    orphaned.sort();
    (indirectly_finalized, orphaned)
}
