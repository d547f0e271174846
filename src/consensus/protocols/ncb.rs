//! The classical, non-era mode: no rounds, no leaders.
//!
//! A validator proposes a block whenever deploys are pending, building on the fork choice over
//! the whole DAG, rooted at genesis. Finality advances exactly as in highway mode; only the
//! scheduling differs.

use crate::consensus::{
    dag::{state::DagState, validators::Validators},
    traits::Context,
};

/// The classical mode's proposal policy.
#[derive(Clone, Debug)]
pub struct NcbProtocol<C: Context> {
    our_id: Option<C::ValidatorId>,
}

impl<C: Context> NcbProtocol<C> {
    /// Creates the protocol driver for the given local validator, if any.
    pub fn new(our_id: Option<C::ValidatorId>) -> Self {
        NcbProtocol { our_id }
    }

    /// Returns the fork-choice context for a new proposal: genesis as the stop hash, and the
    /// validator set bonded in the last finalized block.
    pub fn propose_context(&self, dag: &DagState<C>) -> (C::Hash, Validators<C::ValidatorId>) {
        let stop_hash = dag.genesis().clone();
        let validators = dag
            .message(dag.last_finalized())
            .bonds
            .iter()
            .map(|bond| (bond.validator.clone(), bond.stake))
            .collect();
        (stop_hash, validators)
    }

    /// Returns whether this node should propose a block now: it must be bonded in the current
    /// validator set and there must be something to include.
    pub fn should_propose(&self, dag: &DagState<C>, pending_deploys: usize) -> bool {
        let our_id = match &self.our_id {
            None => return false,
            Some(id) => id,
        };
        if pending_deploys == 0 {
            return false;
        }
        dag.message(dag.last_finalized())
            .bonds
            .iter()
            .any(|bond| bond.validator == *our_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::dag::state::tests::*;

    #[test]
    fn propose_context_is_rooted_at_genesis() {
        let state = new_dag();
        let protocol = NcbProtocol::<TestContext>::new(Some(ALICE));
        let (stop_hash, validators) = protocol.propose_context(&state);
        assert_eq!(state.genesis(), &stop_hash);
        assert_eq!(WEIGHTS.len(), validators.len());
    }

    #[test]
    fn proposes_only_when_bonded_and_backlogged() {
        let state = new_dag();
        let bonded = NcbProtocol::<TestContext>::new(Some(ALICE));
        assert!(bonded.should_propose(&state, 3));
        assert!(!bonded.should_propose(&state, 0));

        let observer = NcbProtocol::<TestContext>::new(None);
        assert!(!observer.should_propose(&state, 3));

        let unbonded = NcbProtocol::<TestContext>::new(Some(99));
        assert!(!unbonded.should_propose(&state, 3));
    }
}
