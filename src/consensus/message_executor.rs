//! The message executor: the single entry point through which messages reach the DAG.
//!
//! Every incoming message passes the state machine
//!
//! ```text
//! Received → PreTimestampCheck → (wait, if ahead) → Validated → Executed → Persisted → Finalized*
//!                                                           ↘ Invalid(kind) → (stored-invalid | dropped)
//! ```
//!
//! under the single message-adding permit: only one message is validated, executed and persisted
//! at a time, and this is the only place that writes to the DAG indexes. Suspensions inside the
//! critical section (storage, execution engine) are allowed; no lock other than the permit
//! itself is held across them.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

use crate::{
    consensus::{
        dag::{
            message::SignedWireMessage,
            state::{FinalityStatus, MessageError, SharedDag},
        },
        error::{BlockStatus, ConsensusError, InvalidBlockKind},
        finality::{FinalityDetector, FinalityOutcome, FinalizedBlock},
        metrics::ConsensusMetrics,
        traits::{Clock, Context, PayloadOps},
    },
    execution::{Effects, ExecutionEngine, PROTOCOL_V1},
    storage::{BlockStorage, DeployStorage},
    types::{DeployHash, TimeDiff},
    utils::{CancellationToken, DisplayIter},
};

/// Events emitted by the executor for the rest of the node (event stream, gossip relay).
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConsensusEvent<C: Context> {
    /// A message was validated and stored.
    BlockAdded {
        /// The stored message's hash.
        hash: C::Hash,
    },
    /// The finality detector advanced the last finalized block.
    NewLastFinalizedBlock {
        /// The new LFB.
        hash: C::Hash,
        /// Ancestors finalized along with it.
        indirectly_finalized: Vec<C::Hash>,
        /// Blocks that can no longer be finalized.
        orphaned: Vec<C::Hash>,
    },
    /// A validator was seen equivocating.
    EquivocationDetected {
        /// The equivocating validator.
        validator: C::ValidatorId,
    },
}

/// Validates, executes, persists and finalizes incoming messages.
pub struct MessageExecutor<C, E, BS, DS>
where
    C: Context,
{
    dag: SharedDag<C>,
    engine: Arc<E>,
    block_storage: Arc<BS>,
    deploy_storage: Arc<DS>,
    payload_ops: Arc<dyn PayloadOps<C>>,
    finality: SyncMutex<FinalityDetector<C>>,
    clock: Arc<dyn Clock>,
    /// The message-adding permit.
    permit: Semaphore,
    /// Hashes currently inside the critical section.
    in_flight: SyncMutex<HashSet<C::Hash>>,
    /// Blocks already rejected as invalid, so that peers re-offering them cost nothing.
    known_invalid: SyncMutex<HashMap<C::Hash, InvalidBlockKind>>,
    /// The local validator's ID, to recognize self-equivocations.
    our_id: Option<C::ValidatorId>,
    max_clock_drift: TimeDiff,
    min_deploy_ttl: TimeDiff,
    /// Checked at the pipeline's suspension points; a cancelled executor adds nothing further.
    cancel: CancellationToken,
    metrics: Option<ConsensusMetrics>,
    events: mpsc::UnboundedSender<ConsensusEvent<C>>,
}

impl<C, E, BS, DS> MessageExecutor<C, E, BS, DS>
where
    C: Context,
    E: ExecutionEngine<C>,
    BS: BlockStorage<C>,
    DS: DeployStorage,
{
    /// Creates a new executor and the receiving end of its event stream.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dag: SharedDag<C>,
        engine: Arc<E>,
        block_storage: Arc<BS>,
        deploy_storage: Arc<DS>,
        payload_ops: Arc<dyn PayloadOps<C>>,
        finality: FinalityDetector<C>,
        clock: Arc<dyn Clock>,
        our_id: Option<C::ValidatorId>,
        max_clock_drift: TimeDiff,
        min_deploy_ttl: TimeDiff,
        cancel: CancellationToken,
        metrics: Option<ConsensusMetrics>,
    ) -> (Self, mpsc::UnboundedReceiver<ConsensusEvent<C>>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let executor = MessageExecutor {
            dag,
            engine,
            block_storage,
            deploy_storage,
            payload_ops,
            finality: SyncMutex::new(finality),
            clock,
            permit: Semaphore::new(1),
            in_flight: SyncMutex::new(HashSet::new()),
            known_invalid: SyncMutex::new(HashMap::new()),
            our_id,
            max_clock_drift,
            min_deploy_ttl,
            cancel,
            metrics,
            events,
        };
        (executor, receiver)
    }

    /// Runs an incoming message through the full pipeline and returns its verdict.
    pub async fn add_message(
        &self,
        swm: SignedWireMessage<C>,
    ) -> Result<BlockStatus, ConsensusError> {
        let hash = swm.hash();
        if self.dag.read().contains(&hash) {
            return Ok(BlockStatus::Processed);
        }
        if let Some(kind) = self.known_invalid.lock().get(&hash) {
            return Ok(BlockStatus::InvalidBlock(kind.clone()));
        }
        if !self.in_flight.lock().insert(hash.clone()) {
            return Ok(BlockStatus::Processing);
        }
        let result = self.add_message_inner(&hash, swm).await;
        self.in_flight.lock().remove(&hash);
        if let Ok(BlockStatus::InvalidBlock(kind)) = &result {
            self.known_invalid.lock().insert(hash, kind.clone());
        }
        result
    }

    async fn add_message_inner(
        &self,
        hash: &C::Hash,
        swm: SignedWireMessage<C>,
    ) -> Result<BlockStatus, ConsensusError> {
        // Pre-timestamp check: a block from the future is not rejected, we wait until its
        // timestamp is no longer ahead of our clock (plus drift) and re-check.
        loop {
            if self.cancel.is_cancelled() {
                return Err(ConsensusError::Cancelled);
            }
            let now = self.clock.now();
            let horizon = now + self.max_clock_drift;
            if swm.wire_message.timestamp <= horizon {
                break;
            }
            let wait = swm.wire_message.timestamp - horizon;
            debug!(%wait, "message is ahead of our clock; waiting");
            tokio::time::delay_for(wait.into()).await;
        }

        let _permit = self
            .permit
            .acquire()
            .await;
        if self.cancel.is_cancelled() {
            return Err(ConsensusError::Cancelled);
        }

        // Full validation against the DAG. Nothing is stored if this fails.
        if let Err(error) = self.dag.read().validate_message(&swm) {
            return Ok(classify(error));
        }

        // Intrinsic payload checks, e.g. deploy TTLs.
        if let Some(value) = &swm.wire_message.value {
            if let Err(kind) =
                self.payload_ops
                    .validate(value, swm.wire_message.timestamp, self.min_deploy_ttl)
            {
                warn!(?hash, ?kind, "invalid block payload");
                return Ok(BlockStatus::InvalidBlock(kind));
            }
        }

        // The creator must be bonded in the validator set defined by the main parent.
        let creator_bonded = {
            let dag = self.dag.read();
            let main_parent = dag.message(&swm.wire_message.parents[0]);
            main_parent
                .bonds
                .iter()
                .any(|bond| bond.validator == swm.wire_message.creator)
        };
        if !creator_bonded {
            return Ok(BlockStatus::InvalidBlock(InvalidBlockKind::Creator));
        }

        // Self-equivocation is checked before anything is persisted: the node must never store,
        // let alone gossip, a second message of its own at the same swimlane position.
        let would_equivocate = self.dag.read().would_equivocate(
            swm.wire_message.era_id.as_ref(),
            &swm.wire_message.creator,
            swm.wire_message.prev.as_ref(),
        );
        if would_equivocate && Some(&swm.wire_message.creator) == self.our_id.as_ref() {
            error!("this node's own key signed an equivocation; aborting");
            return Ok(BlockStatus::SelfEquivocatedBlock);
        }

        // Execute the payload and verify the block's claims.
        let effects = match self.execute(&swm).await? {
            Ok(effects) => effects,
            Err(kind) => return Ok(BlockStatus::InvalidBlock(kind)),
        };

        // Persist first, then make the message visible in the DAG indexes.
        let deploy_hashes = self.contained_deploys(&swm);
        self.block_storage
            .put_block(swm.clone(), effects, deploy_hashes.clone())
            .await
            .map_err(|error| ConsensusError::Storage(error.to_string()))?;
        let outcome = self
            .dag
            .write()
            .add_message(swm)
            .map_err(|error| ConsensusError::InvariantViolation(error.to_string()))?;

        let equivocated = outcome.equivocation.is_some();
        if let Some(validator) = outcome.equivocation {
            warn!(?validator, "stored an equivocating message");
            let _ = self.events.send(ConsensusEvent::EquivocationDetected { validator });
        }

        self.post_add(hash, &deploy_hashes).await?;

        if equivocated {
            Ok(BlockStatus::EquivocatedBlock)
        } else {
            Ok(BlockStatus::Valid)
        }
    }

    /// Recomputes the merged pre-state, executes the deploys and compares the outcome against
    /// the block's claims. Ballots are checked to copy their target's state verbatim.
    async fn execute(
        &self,
        swm: &SignedWireMessage<C>,
    ) -> Result<Result<Effects, InvalidBlockKind>, ConsensusError> {
        let wm = &swm.wire_message;
        let (main_post_state, main_bonds) = {
            let dag = self.dag.read();
            let main_parent = dag.message(&wm.parents[0]);
            (main_parent.post_state_hash.clone(), main_parent.bonds.clone())
        };

        if wm.value.is_none() {
            // A ballot executes nothing; it must copy its target's post-state and bonds.
            if wm.post_state_hash != main_post_state || wm.bonds != main_bonds {
                return Ok(Err(InvalidBlockKind::Transaction));
            }
            return Ok(Ok(Effects::new()));
        }

        // Merge the secondary parents' effects; they must commute.
        let mut merged_effects = Effects::new();
        for parent in wm.parents.iter().skip(1) {
            let effects = self
                .block_storage
                .get_block_effects(parent)
                .await
                .map_err(|error| ConsensusError::Storage(error.to_string()))?
                .ok_or_else(|| {
                    ConsensusError::InvariantViolation(format!(
                        "no effects stored for parent {:?}",
                        parent
                    ))
                })?;
            if !merged_effects.commutes_with(&effects) {
                return Ok(Err(InvalidBlockKind::Parents));
            }
            merged_effects.merge(effects);
        }
        let (pre_state, _) = self
            .engine
            .commit(main_post_state, merged_effects, PROTOCOL_V1)
            .await
            .map_err(|error| ConsensusError::ExecutionEngine(error.to_string()))?;

        // Execute each deploy and accumulate the transforms.
        let value = wm.value.clone().expect("checked above");
        let results = self
            .engine
            .exec(pre_state.clone(), wm.timestamp, value, PROTOCOL_V1)
            .await
            .map_err(|error| ConsensusError::ExecutionEngine(error.to_string()))?;
        let mut block_effects = Effects::new();
        for result in &results {
            block_effects.merge(result.effects.clone());
        }

        // Transaction validation: the recomputed post-state and bonds must match the claims.
        let (post_state, bonds) = self
            .engine
            .commit(pre_state, block_effects.clone(), PROTOCOL_V1)
            .await
            .map_err(|error| ConsensusError::ExecutionEngine(error.to_string()))?;
        if post_state != wm.post_state_hash || bonds != wm.bonds {
            warn!(
                claimed = ?wm.post_state_hash,
                computed = ?post_state,
                "post-state mismatch"
            );
            return Ok(Err(InvalidBlockKind::Transaction));
        }
        Ok(Ok(block_effects))
    }

    /// Post-add effects: deploys are marked processed, events are emitted and the finality
    /// detector runs.
    async fn post_add(
        &self,
        hash: &C::Hash,
        deploy_hashes: &[DeployHash],
    ) -> Result<(), ConsensusError> {
        if !deploy_hashes.is_empty() {
            self.deploy_storage
                .mark_processed(deploy_hashes)
                .await
                .map_err(|error| ConsensusError::Storage(error.to_string()))?;
        }
        let _ = self.events.send(ConsensusEvent::BlockAdded { hash: hash.clone() });

        let outcome = {
            let mut dag = self.dag.write();
            let mut finality = self.finality.lock();
            finality.on_new_message(&dag, hash);
            finality.run(&mut dag)
        };
        match outcome {
            FinalityOutcome::None => {}
            FinalityOutcome::FttExceeded => {
                warn!("equivocation weight exceeds the fault tolerance threshold");
            }
            FinalityOutcome::Finalized(finalized) => {
                for block in finalized {
                    self.settle_finalized(&block).await?;
                }
            }
        }
        Ok(())
    }

    /// Persists one finality decision and its consequences.
    async fn settle_finalized(&self, block: &FinalizedBlock<C>) -> Result<(), ConsensusError> {
        let store = |hash: C::Hash, status: FinalityStatus| async move {
            self.block_storage
                .put_finality_status(&hash, status)
                .await
                .map_err(|error| ConsensusError::Storage(error.to_string()))
        };
        store(block.block.clone(), FinalityStatus::FinalizedDirectly).await?;
        for hash in &block.indirectly_finalized {
            store(hash.clone(), FinalityStatus::FinalizedIndirectly).await?;
        }
        for hash in &block.orphaned {
            store(hash.clone(), FinalityStatus::Orphaned).await?;
        }

        // Deploys in finalized blocks are gone for good; deploys in orphaned blocks go back to
        // the pending set.
        let mut finalized_deploys = self.deploys_of(&block.block);
        for hash in &block.indirectly_finalized {
            finalized_deploys.extend(self.deploys_of(hash));
        }
        if !finalized_deploys.is_empty() {
            self.deploy_storage
                .remove_finalized(&finalized_deploys)
                .await
                .map_err(|error| ConsensusError::Storage(error.to_string()))?;
        }
        let mut orphaned_deploys = Vec::new();
        for hash in &block.orphaned {
            orphaned_deploys.extend(self.deploys_of(hash));
        }
        if !orphaned_deploys.is_empty() {
            self.deploy_storage
                .requeue(&orphaned_deploys)
                .await
                .map_err(|error| ConsensusError::Storage(error.to_string()))?;
        }

        info!(
            block = ?block.block,
            quorum = %block.quorum,
            orphaned = %DisplayIter::new(block.orphaned.iter().map(|hash| format!("{:?}", hash))),
            "new last finalized block"
        );
        if let Some(metrics) = &self.metrics {
            metrics.finalized_block_count.inc();
            let proposed = {
                let dag = self.dag.read();
                dag.message(&block.block).timestamp
            };
            let lag = self.clock.now().saturating_sub(proposed);
            metrics.finalization_time.set(lag.millis() as f64);
        }
        let _ = self.events.send(ConsensusEvent::NewLastFinalizedBlock {
            hash: block.block.clone(),
            indirectly_finalized: block.indirectly_finalized.clone(),
            orphaned: block.orphaned.clone(),
        });
        Ok(())
    }

    fn contained_deploys(&self, swm: &SignedWireMessage<C>) -> Vec<DeployHash> {
        swm.wire_message
            .value
            .as_ref()
            .map(|value| self.payload_ops.deploy_hashes(value))
            .unwrap_or_default()
    }

    fn deploys_of(&self, hash: &C::Hash) -> Vec<DeployHash> {
        let dag = self.dag.read();
        dag.message(hash)
            .value
            .as_ref()
            .map(|value| self.payload_ops.deploy_hashes(value))
            .unwrap_or_default()
    }
}

/// Maps a DAG validation error to the executor's status taxonomy.
fn classify(error: MessageError) -> BlockStatus {
    match error {
        MessageError::Duplicate => BlockStatus::Processed,
        MessageError::MissingDependency(_) => BlockStatus::MissingBlocks,
        MessageError::Signature => BlockStatus::InvalidBlock(InvalidBlockKind::Signature),
        MessageError::Timestamps => BlockStatus::InvalidBlock(InvalidBlockKind::Timestamp),
        other => BlockStatus::InvalidBlock(InvalidBlockKind::Shape(other)),
    }
}

#[cfg(test)]
mod tests;
