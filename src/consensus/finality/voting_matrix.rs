use std::fmt::{self, Debug, Formatter};

use crate::consensus::{
    dag::{
        state::DagState,
        validators::{ValidatorIndex, ValidatorMap, Validators},
        weight::Weight,
    },
    traits::Context,
};

/// The per-candidate voting matrix.
///
/// One instance exists per fork-choice candidate that is a direct child of the last finalized
/// block. The validator set is frozen when the instance is created; the matrix itself is a
/// single flat buffer of length `n * n`.
///
/// `matrix[i][j]` holds the justification rank of the latest message by `v_j` that `v_i` has
/// seen, recorded only when both already vote for this candidate and the seen message is no
/// earlier than `v_j`'s level-zero vote. A zero cell means "does not see `v_j` voting this
/// branch".
pub(crate) struct VotingMatrix<C: Context> {
    /// The direct child of the last finalized block that this matrix tracks votes for.
    candidate: C::Hash,
    /// The bonded validator set, frozen for this instance's lifetime.
    validators: Validators<C::ValidatorId>,
    /// Flat `n * n` row-major buffer.
    matrix: Vec<u64>,
    /// For each validator, the earliest message of their current streak of votes for the
    /// candidate, with its justification rank.
    first_level_zero_votes: ValidatorMap<Option<(C::Hash, u64)>>,
}

impl<C: Context> Debug for VotingMatrix<C> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("VotingMatrix")
            .field("candidate", &self.candidate)
            .field("validators", &self.validators.len())
            .finish()
    }
}

impl<C: Context> VotingMatrix<C> {
    pub(crate) fn new(candidate: C::Hash, validators: Validators<C::ValidatorId>) -> Self {
        let n = validators.len();
        VotingMatrix {
            candidate,
            validators,
            matrix: vec![0; n * n],
            first_level_zero_votes: (0..n).map(|_| None).collect(),
        }
    }

    fn get(&self, row: ValidatorIndex, column: ValidatorIndex) -> u64 {
        self.matrix[row.0 as usize * self.validators.len() + column.0 as usize]
    }

    fn set(&mut self, row: ValidatorIndex, column: ValidatorIndex, value: u64) {
        let n = self.validators.len();
        self.matrix[row.0 as usize * n + column.0 as usize] = value;
    }

    /// Records the perspective of a new latest message by a validator that votes for this
    /// candidate.
    ///
    /// `voted_branch` reports which direct child of the last finalized block a stored message
    /// votes for, so the level-zero walk can tell where the creator's current streak of votes
    /// for this candidate began.
    pub(crate) fn update(
        &mut self,
        dag: &DagState<C>,
        message_hash: &C::Hash,
        voted_branch: impl Fn(&C::Hash) -> Option<C::Hash>,
    ) {
        let message = dag.message(message_hash);
        let creator = match message.creator.clone() {
            None => return,
            Some(creator) => creator,
        };
        let row = match self.validators.get_index(&creator) {
            None => return,
            Some(idx) => idx,
        };
        if dag.is_equivocator(&creator) {
            self.exclude(row);
            return;
        }

        if self.first_level_zero_votes[row].is_none() {
            // The earliest message in the creator's current streak of votes for the candidate.
            let level_zero = dag
                .swimlane(message_hash)
                .take_while(|(hash, _)| voted_branch(hash).as_ref() == Some(&self.candidate))
                .last()
                .map(|(hash, msg)| (hash.clone(), msg.j_rank));
            self.first_level_zero_votes[row] = level_zero;
        }

        // Copy the message's panorama into the creator's row. A column is only set when its
        // validator votes for the same branch, and the seen message is no earlier than that
        // validator's level-zero vote.
        for column in self.validators.iter_indexes() {
            let cell = if column == row {
                message.j_rank
            } else {
                let column_id = self
                    .validators
                    .id(column)
                    .expect("index is within the validator set");
                let seen_rank = message
                    .justifications
                    .get(column_id)
                    .map(|seen| dag.message(seen).j_rank);
                match (seen_rank, &self.first_level_zero_votes[column]) {
                    (Some(seen_rank), Some((_, level_zero_rank)))
                        if seen_rank >= *level_zero_rank && !dag.is_equivocator(column_id) =>
                    {
                        seen_rank
                    }
                    _ => 0,
                }
            };
            self.set(row, column, cell);
        }
    }

    /// Zeroes out a validator's row, column and level-zero vote; used when they are seen
    /// equivocating.
    pub(crate) fn exclude(&mut self, idx: ValidatorIndex) {
        for other in self.validators.iter_indexes() {
            self.set(idx, other, 0);
            self.set(other, idx, 0);
        }
        self.first_level_zero_votes[idx] = None;
    }

    /// Finds the committee that commits this candidate, if one exists.
    ///
    /// Starting from all validators with a level-zero vote, members are pruned until every two
    /// remaining members see each other seeing the candidate. The result is the pruned
    /// committee's total weight and members; the caller checks it against the quorum.
    pub(crate) fn committee(&self, dag: &DagState<C>) -> Option<(Weight, Vec<ValidatorIndex>)> {
        let mut committee: Vec<ValidatorIndex> = self
            .first_level_zero_votes
            .keys_some()
            .filter(|idx| {
                let id = self.validators.id(*idx).expect("index within set");
                !dag.is_equivocator(id)
            })
            .collect();
        loop {
            let mutual = |i: &ValidatorIndex| {
                committee
                    .iter()
                    .all(|j| self.get(*i, *j) > 0 && self.get(*j, *i) > 0)
            };
            let retained: Vec<ValidatorIndex> =
                committee.iter().copied().filter(mutual).collect();
            if retained.len() == committee.len() {
                break;
            }
            committee = retained;
        }
        if committee.is_empty() {
            return None;
        }
        let weight = committee
            .iter()
            .map(|idx| self.validators.get_by_index(*idx).weight())
            .sum();
        Some((weight, committee))
    }

    /// Returns the IDs of the committee members.
    pub(crate) fn member_ids(&self, committee: &[ValidatorIndex]) -> Vec<C::ValidatorId> {
        committee
            .iter()
            .filter_map(|idx| self.validators.id(*idx).cloned())
            .collect()
    }

    /// The invariant behind the committee check: a nonzero cell implies both validators have
    /// consistent level-zero votes for this candidate.
    #[cfg(test)]
    pub(crate) fn check_invariant(&self) -> bool {
        self.validators.iter_indexes().all(|i| {
            self.validators.iter_indexes().all(|j| {
                self.get(i, j) == 0
                    || (self.first_level_zero_votes[i].is_some()
                        && self.first_level_zero_votes[j].is_some())
            })
        })
    }
}
