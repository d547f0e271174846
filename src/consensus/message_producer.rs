//! The message producer: the thread-safe builder for this validator's own blocks and ballots.
//!
//! A single permit serializes the fork-choice-then-sign window. Without it, two concurrent
//! invocations could both read the same "previous own message" and sign two messages with the
//! same sequence number, which is a self-equivocation.

use std::{collections::BTreeMap, sync::Arc};

use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    consensus::{
        dag::{
            fork_choice::{fork_choice, parent_candidates},
            message::{Bond, SignedWireMessage, WireMessage},
            state::SharedDag,
            validators::Validators,
        },
        error::ConsensusError,
        traits::{Context, PayloadOps},
    },
    execution::{Effects, ExecutionEngine, PROTOCOL_V1},
    storage::{BlockStorage, DeployStorage, StorageError},
    types::Timestamp,
};

/// The maximum number of deploys pulled into a single proposed block.
const MAX_DEPLOYS_PER_BLOCK: usize = 100;

/// Everything the producer derives from the DAG under the permit, before any I/O.
struct ProposalBasis<C: Context> {
    parents: Vec<C::Hash>,
    justifications: BTreeMap<C::ValidatorId, C::Hash>,
    prev: Option<C::Hash>,
    seq_number: u64,
    j_rank: u64,
    main_rank: u64,
    main_post_state: C::Hash,
}

/// Builds and signs this validator's messages.
pub struct MessageProducer<C, E, BS, DS>
where
    C: Context,
{
    our_id: C::ValidatorId,
    secret: C::ValidatorSecret,
    dag: SharedDag<C>,
    engine: Arc<E>,
    block_storage: Arc<BS>,
    deploy_storage: Arc<DS>,
    payload_ops: Arc<dyn PayloadOps<C>>,
    /// The producer permit; see the module docs.
    permit: Mutex<()>,
    /// The last message we signed, per era. Production is refused until it is stored, so that
    /// two productions in a row cannot reuse a sequence number.
    own_last: SyncMutex<BTreeMap<Option<C::InstanceId>, C::Hash>>,
    enable_secondary_parents: bool,
}

impl<C, E, BS, DS> MessageProducer<C, E, BS, DS>
where
    C: Context,
    E: ExecutionEngine<C>,
    BS: BlockStorage<C>,
    DS: DeployStorage,
{
    /// Creates a new producer for the given validator identity.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        our_id: C::ValidatorId,
        secret: C::ValidatorSecret,
        dag: SharedDag<C>,
        engine: Arc<E>,
        block_storage: Arc<BS>,
        deploy_storage: Arc<DS>,
        payload_ops: Arc<dyn PayloadOps<C>>,
        enable_secondary_parents: bool,
    ) -> Self {
        MessageProducer {
            our_id,
            secret,
            dag,
            engine,
            block_storage,
            deploy_storage,
            payload_ops,
            permit: Mutex::new(()),
            own_last: SyncMutex::new(BTreeMap::new()),
            enable_secondary_parents,
        }
    }

    /// Signs a ballot targeting `target`, copying post-state and bonds from it, without
    /// executing any deploys.
    pub async fn ballot(
        &self,
        era_id: Option<C::InstanceId>,
        round_id: Option<Timestamp>,
        target: C::Hash,
        justifications: Option<BTreeMap<C::ValidatorId, C::Hash>>,
        timestamp: Timestamp,
    ) -> Result<SignedWireMessage<C>, ConsensusError> {
        let _permit = self.permit.lock().await;

        let (basis, post_state_hash, bonds) = {
            let dag = self.dag.read();
            self.check_own_last_stored(&dag, &era_id)?;
            let target_msg = dag
                .lookup(&target)
                .ok_or_else(|| {
                    ConsensusError::InvariantViolation(format!(
                        "ballot target {:?} not in the DAG",
                        target
                    ))
                })?
                .clone();
            let basis = self.proposal_basis(
                &dag,
                era_id.clone(),
                vec![target.clone()],
                justifications,
            );
            (basis, target_msg.post_state_hash, target_msg.bonds)
        };

        let message = self.sign(
            era_id,
            round_id,
            timestamp,
            basis,
            None,
            post_state_hash,
            bonds,
        );
        debug!(hash = ?message.hash(), "produced ballot");
        Ok(message)
    }

    /// Builds a new block: selects parents by fork choice, pulls pending deploys, computes their
    /// effects and signs the result.
    pub async fn block(
        &self,
        era_id: Option<C::InstanceId>,
        round_id: Option<Timestamp>,
        stop_hash: C::Hash,
        validators: Validators<C::ValidatorId>,
        justifications: Option<BTreeMap<C::ValidatorId, C::Hash>>,
        is_booking_block: bool,
        timestamp: Timestamp,
    ) -> Result<SignedWireMessage<C>, ConsensusError> {
        let _permit = self.permit.lock().await;

        let (mut basis, candidates, main_post_state) = {
            let dag = self.dag.read();
            self.check_own_last_stored(&dag, &era_id)?;
            let main_parent = fork_choice(&dag, &stop_hash, &validators, era_id.as_ref());
            let candidates = if self.enable_secondary_parents {
                parent_candidates(&dag, &stop_hash, &validators, era_id.as_ref(), &main_parent)
            } else {
                vec![]
            };
            let basis = self.proposal_basis(
                &dag,
                era_id.clone(),
                vec![main_parent.clone()],
                justifications,
            );
            let main_post_state = basis.main_post_state.clone();
            (basis, candidates, main_post_state)
        };

        // Keep only secondary parents whose effects commute with everything merged so far.
        let mut merged_effects = Effects::new();
        for candidate in candidates {
            let effects = self.stored_effects(&candidate).await?;
            if merged_effects.commutes_with(&effects) {
                merged_effects.merge(effects);
                basis.parents.push(candidate.clone());
                let candidate_rank = self.dag.read().message(&candidate).j_rank;
                basis.j_rank = basis.j_rank.max(candidate_rank + 1);
            } else {
                debug!(?candidate, "skipping conflicting secondary parent");
            }
        }

        // The merged pre-state: the main parent's post-state with the secondary branches'
        // effects committed on top.
        let (pre_state, _) = self
            .engine
            .commit(main_post_state, merged_effects, PROTOCOL_V1)
            .await
            .map_err(|error| ConsensusError::ExecutionEngine(error.to_string()))?;

        let deploys = self
            .deploy_storage
            .pending_deploys(timestamp, MAX_DEPLOYS_PER_BLOCK)
            .await
            .map_err(|error| ConsensusError::Storage(error.to_string()))?;
        let value = self.payload_ops.assemble(&deploys);

        let results = self
            .engine
            .exec(pre_state.clone(), timestamp, value.clone(), PROTOCOL_V1)
            .await
            .map_err(|error| ConsensusError::ExecutionEngine(error.to_string()))?;
        let mut block_effects = Effects::new();
        for result in &results {
            if result.is_error {
                warn!(error = ?result.error_message, "deploy failed; including its effects anyway");
            }
            block_effects.merge(result.effects.clone());
        }
        let (post_state_hash, bonds) = self
            .engine
            .commit(pre_state, block_effects, PROTOCOL_V1)
            .await
            .map_err(|error| ConsensusError::ExecutionEngine(error.to_string()))?;

        let message = self.sign(
            era_id,
            round_id,
            timestamp,
            basis,
            Some(value),
            post_state_hash,
            bonds,
        );
        info!(
            hash = ?message.hash(),
            deploys = results.len(),
            %is_booking_block,
            "produced block"
        );
        Ok(message)
    }

    /// Derives parents' ranks, justifications and our own swimlane position from the DAG.
    ///
    /// Our own previous message comes from the provided justifications if present, falling back
    /// to a DAG lookup under the permit.
    fn proposal_basis(
        &self,
        dag: &crate::consensus::dag::state::DagState<C>,
        era_id: Option<C::InstanceId>,
        parents: Vec<C::Hash>,
        justifications: Option<BTreeMap<C::ValidatorId, C::Hash>>,
    ) -> ProposalBasis<C> {
        let mut justifications = justifications
            .unwrap_or_else(|| default_justifications(dag, era_id.as_ref()));

        // Every cited parent must be dominated by a justification for its creator.
        for parent in &parents {
            let parent_msg = dag.message(parent);
            if let Some(creator) = parent_msg.creator.clone() {
                if parent_msg.era_id == era_id {
                    let dominated = justifications
                        .get(&creator)
                        .map_or(false, |justified| {
                            dag.message(justified).seq_number >= parent_msg.seq_number
                        });
                    if !dominated {
                        justifications.insert(creator, parent.clone());
                    }
                }
            }
        }

        let prev = match justifications.get(&self.our_id) {
            Some(prev) => Some(prev.clone()),
            None => dag
                .latest_in_era(era_id.as_ref(), &self.our_id)
                .into_iter()
                .next_back(),
        };
        if let Some(prev) = prev.clone() {
            justifications.insert(self.our_id.clone(), prev);
        }

        let seq_number = prev
            .as_ref()
            .map_or(1, |hash| dag.message(hash).seq_number + 1);
        let j_rank = 1 + parents
            .iter()
            .chain(justifications.values())
            .map(|hash| dag.message(hash).j_rank)
            .max()
            .unwrap_or(0);
        let main_parent = dag.message(&parents[0]);
        ProposalBasis {
            main_rank: main_parent.main_rank + 1,
            main_post_state: main_parent.post_state_hash.clone(),
            parents,
            justifications,
            prev,
            seq_number,
            j_rank,
        }
    }

    /// Builds and signs the wire message, and records it as our last one in the era.
    #[allow(clippy::too_many_arguments)]
    fn sign(
        &self,
        era_id: Option<C::InstanceId>,
        round_id: Option<Timestamp>,
        timestamp: Timestamp,
        basis: ProposalBasis<C>,
        value: Option<C::ConsensusValue>,
        post_state_hash: C::Hash,
        bonds: Vec<Bond<C::ValidatorId>>,
    ) -> SignedWireMessage<C> {
        let wire_message = WireMessage {
            creator: self.our_id.clone(),
            seq_number: basis.seq_number,
            prev: basis.prev,
            parents: basis.parents,
            justifications: basis.justifications,
            j_rank: basis.j_rank,
            main_rank: basis.main_rank,
            era_id: era_id.clone(),
            round_id,
            timestamp,
            value,
            post_state_hash,
            bonds,
        };
        let message = SignedWireMessage::new(wire_message, &self.secret);
        self.own_last.lock().insert(era_id, message.hash());
        message
    }

    /// Refuses to produce while our previously signed message is not in the DAG yet: signing on
    /// top of a stale view would reuse its sequence number.
    fn check_own_last_stored(
        &self,
        dag: &crate::consensus::dag::state::DagState<C>,
        era_id: &Option<C::InstanceId>,
    ) -> Result<(), ConsensusError> {
        match self.own_last.lock().get(era_id) {
            Some(hash) if !dag.contains(hash) => Err(ConsensusError::OwnMessageNotStored),
            _ => Ok(()),
        }
    }

    async fn stored_effects(&self, hash: &C::Hash) -> Result<Effects, ConsensusError> {
        self.block_storage
            .get_block_effects(hash)
            .await
            .map_err(|error| ConsensusError::Storage(error.to_string()))?
            .ok_or_else(|| {
                ConsensusError::Storage(
                    StorageError::Corruption(format!("no effects stored for {:?}", hash))
                        .to_string(),
                )
            })
    }
}

/// Returns the latest message of each validator in the era, picking the highest fork of an
/// equivocator so the citation is still a valid justification.
pub(crate) fn default_justifications<C: Context>(
    dag: &crate::consensus::dag::state::DagState<C>,
    era_id: Option<&C::InstanceId>,
) -> BTreeMap<C::ValidatorId, C::Hash> {
    dag.latest_messages_in_era(era_id)
        .filter_map(|(validator, tips)| {
            let best = tips
                .iter()
                .max_by_key(|hash| (dag.message(hash).seq_number, (*hash).clone()))?;
            Some((validator.clone(), best.clone()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use parking_lot::RwLock;

    use super::*;
    use crate::{
        consensus::dag::{
            message::{Bond, Message},
            state::{tests::*, DagState},
            weight::Weight,
        },
        storage::InMemStorage,
        testing::{TestEngine, TestPayloadOps},
    };

    type TestProducer = MessageProducer<
        TestContext,
        TestEngine,
        InMemStorage<TestContext>,
        InMemStorage<TestContext>,
    >;

    fn fixture() -> (TestProducer, SharedDag<TestContext>, Validators<u32>) {
        let bonds = vec![Bond::new(ALICE, Weight(10)), Bond::new(BOB, Weight(10))];
        let dag: SharedDag<TestContext> = Arc::new(RwLock::new(DagState::new(Message::genesis(
            0xDEAD,
            bonds.clone(),
            Timestamp::zero(),
        ))));
        let storage = Arc::new(InMemStorage::<TestContext>::new());
        let producer = MessageProducer::new(
            ALICE,
            TestSecret(ALICE),
            Arc::clone(&dag),
            Arc::new(TestEngine::new(bonds.clone())),
            Arc::clone(&storage),
            storage,
            Arc::new(TestPayloadOps),
            true,
        );
        let validators = bonds
            .into_iter()
            .map(|bond| (bond.validator, bond.stake))
            .collect();
        (producer, dag, validators)
    }

    #[tokio::test]
    async fn produced_messages_pass_validation() {
        let (producer, dag, validators) = fixture();
        let genesis = *dag.read().genesis();

        let block = producer
            .block(
                None,
                None,
                genesis,
                validators,
                None,
                false,
                Timestamp::from(10),
            )
            .await
            .expect("producing a block should work");
        assert!(block.wire_message.is_block());
        assert_eq!(1, block.wire_message.seq_number);
        let block_hash = dag
            .write()
            .add_message(block)
            .expect("produced block must validate")
            .hash;

        let ballot = producer
            .ballot(None, None, block_hash, None, Timestamp::from(11))
            .await
            .expect("producing a ballot should work");
        assert!(!ballot.wire_message.is_block());
        assert_eq!(2, ballot.wire_message.seq_number);
        assert_eq!(Some(block_hash), ballot.wire_message.prev);
        dag.write()
            .add_message(ballot)
            .expect("produced ballot must validate");
    }

    #[tokio::test]
    async fn production_waits_for_own_message_to_be_stored() {
        let (producer, dag, _) = fixture();
        let genesis = *dag.read().genesis();

        let _unstored = producer
            .ballot(None, None, genesis, None, Timestamp::from(5))
            .await
            .expect("first production works");

        // The first ballot was never added to the DAG; producing again would reuse its sequence
        // number.
        let result = producer
            .ballot(None, None, genesis, None, Timestamp::from(6))
            .await;
        assert!(matches!(result, Err(ConsensusError::OwnMessageNotStored)));
    }
}
