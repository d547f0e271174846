#[cfg(test)]
pub(crate) mod tests;

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    iter,
    sync::Arc,
};

use itertools::Itertools;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::trace;

use crate::consensus::traits::Context;

use super::message::{Message, SignedWireMessage};

/// The finality status of a block.
///
/// Every block starts `Undecided` and transitions to exactly one of the terminal states, at most
/// once, and never back.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FinalityStatus {
    /// No decision yet.
    Undecided,
    /// Finalized by a committee of the voting matrix.
    FinalizedDirectly,
    /// An ancestor of a directly finalized block.
    FinalizedIndirectly,
    /// In the past cone of a finalized block, but not an ancestor of it: can never be finalized.
    Orphaned,
}

impl FinalityStatus {
    /// Returns `true` for either of the two finalized states.
    pub fn is_finalized(self) -> bool {
        matches!(
            self,
            FinalityStatus::FinalizedDirectly | FinalityStatus::FinalizedIndirectly
        )
    }
}

/// An error making a message unfit for the DAG. These are attributable to the sender.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum MessageError {
    /// Only the genesis message may have an empty parent list.
    #[error("The message has no parents.")]
    NoParents,
    /// Sequence numbers start at 1; 0 is reserved for genesis.
    #[error("The sequence number must be at least 1.")]
    SequenceNumberZero,
    /// The message skipped or repeated a swimlane position.
    #[error("The message contains the wrong sequence number.")]
    SequenceNumber,
    /// `prev` and the creator's self-justification must agree.
    #[error("The previous-message hash is inconsistent with the justifications.")]
    PrevMessage,
    /// A cited parent or justification is not stored yet.
    #[error("The dependency {0} is missing from the DAG.")]
    MissingDependency(String),
    /// Parents must be blocks.
    #[error("The parent {0} is a ballot.")]
    BallotParent(String),
    /// The claimed justification rank disagrees with the cited messages.
    #[error("The justification rank {claimed} does not match the computed rank {computed}.")]
    JRank {
        /// Rank stated in the wire message.
        claimed: u64,
        /// Rank derived from parents and justifications.
        computed: u64,
    },
    /// The claimed main rank disagrees with the main parent.
    #[error("The main rank {claimed} does not match the computed rank {computed}.")]
    MainRank {
        /// Rank stated in the wire message.
        claimed: u64,
        /// Rank derived from the main parent.
        computed: u64,
    },
    /// A justification must dominate every parent by the same creator.
    #[error("A justification does not name the latest cited message of its validator.")]
    Justifications,
    /// The message's timestamp is older than a justification's.
    #[error("The message's timestamp is older than a justification's.")]
    Timestamps,
    /// The signature does not verify against the creator's public key.
    #[error("The signature is invalid.")]
    Signature,
    /// The message was already added.
    #[error("The message is already present in the DAG.")]
    Duplicate,
}

/// The result of adding a valid message to the DAG.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AddOutcome<C: Context> {
    /// The hash of the added message.
    pub hash: C::Hash,
    /// Set if this message made its creator an equivocator (or extended an existing fork).
    pub equivocation: Option<C::ValidatorId>,
}

/// A shared, concurrently readable DAG.
///
/// Writers go through the message-adding permit in the executor, so there is at most one writer;
/// readers take the lock briefly and never hold it across suspension points.
pub type SharedDag<C> = Arc<RwLock<DagState<C>>>;

/// The scope of a swimlane: an era in highway mode, or the whole DAG in NCB mode.
type Scope<C> = Option<<C as Context>::InstanceId>;

#[derive(Clone, Debug, Default)]
struct Swimlane<C: Context> {
    /// All hashes recorded per sequence number. More than one entry is an equivocation.
    by_seq: BTreeMap<u64, Vec<C::Hash>>,
    /// The creator's current tips: messages no later own message links back to.
    tips: BTreeSet<C::Hash>,
}

impl<C: Context> Swimlane<C> {
    fn new() -> Self {
        Swimlane {
            by_seq: BTreeMap::new(),
            tips: BTreeSet::new(),
        }
    }
}

/// The block-DAG: a content-addressed, append-only store of messages with the reverse and
/// swimlane indexes needed by the finality detector, the fork choice and the equivocation
/// detector.
///
/// Every message referenced by a stored message is itself stored; this is checked on insert and
/// relied upon everywhere else.
#[derive(Clone, Debug)]
pub struct DagState<C: Context> {
    /// The genesis message's hash.
    genesis: C::Hash,
    /// All messages, by hash.
    messages: HashMap<C::Hash, Message<C>>,
    /// Reverse index: parent hash to the messages citing it as a parent.
    children: HashMap<C::Hash, BTreeSet<C::Hash>>,
    /// Swimlanes by scope and creator.
    swimlanes: HashMap<(Scope<C>, C::ValidatorId), Swimlane<C>>,
    /// Each validator's most recent scope and the tips within it.
    latest: HashMap<C::ValidatorId, (Scope<C>, BTreeSet<C::Hash>)>,
    /// All validators ever seen equivocating.
    equivocators: BTreeSet<C::ValidatorId>,
    /// Validators seen equivocating, by scope.
    equivocators_by_scope: HashMap<Scope<C>, BTreeSet<C::ValidatorId>>,
    /// For each equivocator, the lowest justification rank of a conflicting message observed at
    /// detection time. Traversals looking for visible equivocations need not descend below this.
    equivocation_bases: HashMap<C::ValidatorId, u64>,
    /// Messages in insertion order per justification rank, for topological streaming.
    topo: BTreeMap<u64, Vec<C::Hash>>,
    /// Finality status per block.
    finality: HashMap<C::Hash, FinalityStatus>,
    /// The hash of the last finalized block.
    last_finalized: C::Hash,
}

impl<C: Context> DagState<C> {
    /// Creates a new DAG containing only the given genesis message, already finalized.
    pub fn new(genesis: Message<C>) -> Self {
        assert!(genesis.is_genesis(), "DAG must be rooted in genesis");
        let genesis_hash = genesis.hash.clone();
        let mut messages = HashMap::new();
        messages.insert(genesis_hash.clone(), genesis);
        let mut topo = BTreeMap::new();
        topo.insert(0, vec![genesis_hash.clone()]);
        let mut finality = HashMap::new();
        finality.insert(genesis_hash.clone(), FinalityStatus::FinalizedDirectly);
        DagState {
            genesis: genesis_hash.clone(),
            messages,
            children: HashMap::new(),
            swimlanes: HashMap::new(),
            latest: HashMap::new(),
            equivocators: BTreeSet::new(),
            equivocators_by_scope: HashMap::new(),
            equivocation_bases: HashMap::new(),
            topo,
            finality,
            last_finalized: genesis_hash,
        }
    }

    /// Returns the genesis hash.
    pub fn genesis(&self) -> &C::Hash {
        &self.genesis
    }

    /// Returns the hash of the last finalized block.
    pub fn last_finalized(&self) -> &C::Hash {
        &self.last_finalized
    }

    /// Returns the message with the given hash, if present.
    pub fn lookup(&self, hash: &C::Hash) -> Option<&Message<C>> {
        self.messages.get(hash)
    }

    /// Returns whether the message with the given hash is known.
    pub fn contains(&self, hash: &C::Hash) -> bool {
        self.messages.contains_key(hash)
    }

    /// Returns the message with the given hash. Panics if not found.
    pub fn message(&self, hash: &C::Hash) -> &Message<C> {
        self.lookup(hash).expect("message hash must exist")
    }

    /// Returns the hashes of all messages citing `hash` as a parent.
    pub fn children(&self, hash: &C::Hash) -> impl Iterator<Item = &C::Hash> {
        self.children.get(hash).into_iter().flatten()
    }

    /// Returns the set of latest messages of the validator, across all eras.
    ///
    /// The set has one element normally, and two or more if the validator has equivocated and
    /// none of its forks dominate the others.
    pub fn latest_message(&self, validator: &C::ValidatorId) -> BTreeSet<C::Hash> {
        self.latest
            .get(validator)
            .map(|(_, tips)| tips.clone())
            .unwrap_or_default()
    }

    /// Returns the set of latest messages of the validator within the given era.
    pub fn latest_in_era(
        &self,
        era_id: Option<&C::InstanceId>,
        validator: &C::ValidatorId,
    ) -> BTreeSet<C::Hash> {
        self.swimlanes
            .get(&(era_id.cloned(), validator.clone()))
            .map(|lane| lane.tips.clone())
            .unwrap_or_default()
    }

    /// Returns an iterator over all validators with any messages, with the tips of their newest
    /// era.
    pub fn latest_messages(
        &self,
    ) -> impl Iterator<Item = (&C::ValidatorId, &BTreeSet<C::Hash>)> {
        self.latest
            .iter()
            .map(|(validator, (_, tips))| (validator, tips))
    }

    /// Returns an iterator over all validators with messages in the given era, with their tips.
    pub fn latest_messages_in_era(
        &self,
        era_id: Option<&C::InstanceId>,
    ) -> impl Iterator<Item = (&C::ValidatorId, &BTreeSet<C::Hash>)> {
        let era_id = era_id.cloned();
        self.swimlanes
            .iter()
            .filter(move |((scope, _), _)| *scope == era_id)
            .map(|((_, validator), lane)| (validator, &lane.tips))
    }

    /// Returns all validators ever seen equivocating.
    pub fn equivocators(&self) -> &BTreeSet<C::ValidatorId> {
        &self.equivocators
    }

    /// Returns the validators seen equivocating within the given era.
    pub fn equivocators_in_era(&self, era_id: Option<&C::InstanceId>) -> BTreeSet<C::ValidatorId> {
        self.equivocators_by_scope
            .get(&era_id.cloned())
            .cloned()
            .unwrap_or_default()
    }

    /// Returns whether the validator is known to have equivocated anywhere.
    pub fn is_equivocator(&self, validator: &C::ValidatorId) -> bool {
        self.equivocators.contains(validator)
    }

    /// Returns the lowest justification rank at which the validator's recorded fork begins, if
    /// the validator is an equivocator with stored evidence.
    pub fn equivocation_base_rank(&self, validator: &C::ValidatorId) -> Option<u64> {
        self.equivocation_bases.get(validator).copied()
    }

    /// Marks a validator as an equivocator based on evidence from outside this DAG, e.g. another
    /// era.
    pub fn mark_equivocator(&mut self, validator: C::ValidatorId, era_id: Option<C::InstanceId>) {
        self.equivocators_by_scope
            .entry(era_id)
            .or_default()
            .insert(validator.clone());
        self.equivocators.insert(validator);
    }

    /// Streams all messages with `start_rank <= j_rank < end_rank`, in ascending rank order, in
    /// insertion order within a rank.
    pub fn topo_sort(
        &self,
        start_rank: u64,
        end_rank: u64,
    ) -> impl Iterator<Item = &Message<C>> + '_ {
        self.topo
            .range(start_rank..end_rank)
            .flat_map(move |(_, hashes)| hashes.iter())
            .map(move |hash| self.message(hash))
    }

    /// Returns the finality status of the block, or `None` if the hash is unknown.
    pub fn finality_status(&self, hash: &C::Hash) -> Option<FinalityStatus> {
        if !self.contains(hash) {
            return None;
        }
        Some(
            self.finality
                .get(hash)
                .copied()
                .unwrap_or(FinalityStatus::Undecided),
        )
    }

    /// Records a finality decision. Panics if it would overwrite an earlier decision: finality is
    /// monotonic and decided exactly once.
    pub(crate) fn set_finality(&mut self, hash: &C::Hash, status: FinalityStatus) {
        assert!(
            status != FinalityStatus::Undecided,
            "cannot reset finality to undecided"
        );
        let previous = self
            .finality
            .insert(hash.clone(), status)
            .unwrap_or(FinalityStatus::Undecided);
        assert!(
            previous == FinalityStatus::Undecided || previous == status,
            "finality status changed from {:?} to {:?}",
            previous,
            status,
        );
        if status == FinalityStatus::FinalizedDirectly {
            self.last_finalized = hash.clone();
        }
    }

    /// Validates a wire message against the DAG and adds it.
    ///
    /// An equivocation is not an error here: the message is stored either way, so that the fork
    /// is visible as evidence, and the creator is reported in the outcome. The executor decides
    /// how to treat the sender.
    pub fn add_message(&mut self, swm: SignedWireMessage<C>) -> Result<AddOutcome<C>, MessageError> {
        self.validate_message(&swm)?;
        Ok(self.add_valid_message(swm))
    }

    /// Returns an error if the message violates any DAG invariant. All dependencies must already
    /// be present.
    pub fn validate_message(&self, swm: &SignedWireMessage<C>) -> Result<(), MessageError> {
        let wm = &swm.wire_message;
        let hash = wm.hash();
        if self.contains(&hash) {
            return Err(MessageError::Duplicate);
        }
        if !C::verify_signature(&hash, &wm.creator, &swm.signature) {
            return Err(MessageError::Signature);
        }
        if wm.parents.is_empty() {
            return Err(MessageError::NoParents);
        }
        if wm.seq_number == 0 {
            return Err(MessageError::SequenceNumberZero);
        }

        // Invariant 1: every cited message must already be stored.
        for dependency in wm.parents.iter().chain(wm.justifications.values()) {
            if !self.contains(dependency) {
                return Err(MessageError::MissingDependency(format!("{:?}", dependency)));
            }
        }

        for parent_hash in &wm.parents {
            let parent = self.message(parent_hash);
            if !parent.is_block() {
                return Err(MessageError::BallotParent(format!("{:?}", parent_hash)));
            }
            // A justification must dominate every cited parent by the same creator. Parents from
            // the previous era are exempt: their creators need not be bonded in this one.
            if let Some(parent_creator) = parent.creator.clone() {
                if parent.era_id == wm.era_id {
                    let dominates = wm
                        .justifications
                        .get(&parent_creator)
                        .map(|justified| self.message(justified).seq_number >= parent.seq_number);
                    if dominates != Some(true) {
                        return Err(MessageError::Justifications);
                    }
                }
            }
        }

        // Invariant 3: ranks must agree with parents and justifications.
        let computed_j_rank = 1 + wm
            .parents
            .iter()
            .chain(wm.justifications.values())
            .map(|dependency| self.message(dependency).j_rank)
            .max()
            .unwrap_or(0);
        if wm.j_rank != computed_j_rank {
            return Err(MessageError::JRank {
                claimed: wm.j_rank,
                computed: computed_j_rank,
            });
        }
        let computed_main_rank = 1 + self.message(&wm.parents[0]).main_rank;
        if wm.main_rank != computed_main_rank {
            return Err(MessageError::MainRank {
                claimed: wm.main_rank,
                computed: computed_main_rank,
            });
        }

        // Invariant 2: swimlane continuity. The self-justification is the previous message.
        if wm.prev.as_ref() != wm.justifications.get(&wm.creator) {
            return Err(MessageError::PrevMessage);
        }
        match &wm.prev {
            None => {
                if wm.seq_number != 1 {
                    return Err(MessageError::SequenceNumber);
                }
            }
            Some(prev_hash) => {
                let prev = self.message(prev_hash);
                if prev.creator.as_ref() != Some(&wm.creator)
                    || prev.era_id != wm.era_id
                    || prev.seq_number + 1 != wm.seq_number
                {
                    return Err(MessageError::SequenceNumber);
                }
            }
        }

        if wm
            .justifications
            .values()
            .any(|justified| self.message(justified).timestamp > wm.timestamp)
        {
            return Err(MessageError::Timestamps);
        }

        Ok(())
    }

    /// Adds a message that has passed `validate_message`, updating all indexes.
    fn add_valid_message(&mut self, swm: SignedWireMessage<C>) -> AddOutcome<C> {
        let messages = &self.messages;
        let message = Message::from_wire(
            swm,
            |hash, i| messages[hash].swimlane_skip[i].clone(),
            |hash, i| messages[hash].main_skip[i].clone(),
        );
        let hash = message.hash.clone();
        let creator = message.creator.clone().expect("wire messages have creators");
        let scope = message.era_id.clone();

        let equivocation = self.detect_equivocation(&message, &creator);

        for parent in &message.parents {
            self.children
                .entry(parent.clone())
                .or_default()
                .insert(hash.clone());
        }
        self.topo
            .entry(message.j_rank)
            .or_default()
            .push(hash.clone());

        let lane = self
            .swimlanes
            .entry((scope.clone(), creator.clone()))
            .or_insert_with(Swimlane::new);
        lane.by_seq
            .entry(message.seq_number)
            .or_default()
            .push(hash.clone());
        if let Some(prev) = &message.prev {
            lane.tips.remove(prev);
        }
        lane.tips.insert(hash.clone());

        // The validator's newest era supersedes older ones in the global latest index.
        let entry = self
            .latest
            .entry(creator.clone())
            .or_insert_with(|| (scope.clone(), BTreeSet::new()));
        if entry.0 != scope {
            *entry = (scope.clone(), BTreeSet::new());
        }
        if let Some(prev) = &message.prev {
            entry.1.remove(prev);
        }
        entry.1.insert(hash.clone());

        if let Some(equivocator) = &equivocation {
            trace!(?equivocator, "storing equivocating message");
            // The fork base: the lowest rank of a message sharing a swimlane position with the
            // new one. Scans for visible equivocations never need to descend below it.
            let conflicting_rank = self.swimlanes[&(scope.clone(), creator.clone())]
                .by_seq
                .get(&message.seq_number)
                .into_iter()
                .flatten()
                .filter(|other| **other != hash)
                .map(|other| self.messages[other].j_rank)
                .min();
            let base = conflicting_rank.unwrap_or(message.j_rank).min(message.j_rank);
            let entry = self
                .equivocation_bases
                .entry(equivocator.clone())
                .or_insert(base);
            *entry = (*entry).min(base);
            self.equivocators.insert(equivocator.clone());
            self.equivocators_by_scope
                .entry(scope)
                .or_default()
                .insert(equivocator.clone());
        }

        self.messages.insert(hash.clone(), message);
        AddOutcome { hash, equivocation }
    }

    /// The pre-store equivocation check: a message equivocates unless it extends the creator's
    /// single current tip in its era, or is the creator's first message there.
    pub fn would_equivocate(
        &self,
        era_id: Option<&C::InstanceId>,
        creator: &C::ValidatorId,
        prev: Option<&C::Hash>,
    ) -> bool {
        let lane = self.swimlanes.get(&(era_id.cloned(), creator.clone()));
        let tips = match lane {
            None => return false,
            Some(lane) if lane.tips.is_empty() => return false,
            Some(lane) => &lane.tips,
        };
        !(tips.len() == 1 && prev == tips.iter().next())
    }

    fn detect_equivocation(
        &self,
        message: &Message<C>,
        creator: &C::ValidatorId,
    ) -> Option<C::ValidatorId> {
        if self.would_equivocate(message.era_id.as_ref(), creator, message.prev.as_ref()) {
            Some(creator.clone())
        } else {
            None
        }
    }

    /// Returns the hash of the message with the given sequence number in the swimlane of the
    /// creator of `hash`, or `None` if the sequence number is higher than that of the message
    /// with `hash`.
    pub fn find_in_swimlane<'a>(&'a self, hash: &'a C::Hash, seq_number: u64) -> Option<&'a C::Hash> {
        let message = self.message(hash);
        match message.seq_number.cmp(&seq_number) {
            std::cmp::Ordering::Equal => Some(hash),
            std::cmp::Ordering::Less => None,
            std::cmp::Ordering::Greater => {
                let diff = message.seq_number - seq_number;
                // We want to make the greatest step 2^i such that 2^i <= diff.
                let i = message.swimlane_step(diff);
                self.find_in_swimlane(&message.swimlane_skip[i], seq_number)
            }
        }
    }

    /// Returns the ancestor of the message with the given `hash` on the main-parent chain, at the
    /// specified `main_rank`, or `None` if the message's rank is lower than that.
    pub fn find_main_ancestor<'a>(
        &'a self,
        hash: &'a C::Hash,
        main_rank: u64,
    ) -> Option<&'a C::Hash> {
        let message = self.message(hash);
        match message.main_rank.cmp(&main_rank) {
            std::cmp::Ordering::Equal => Some(hash),
            std::cmp::Ordering::Less => None,
            std::cmp::Ordering::Greater => {
                let diff = message.main_rank - main_rank;
                let i = message.main_step(diff);
                self.find_main_ancestor(&message.main_skip[i], main_rank)
            }
        }
    }

    /// Returns whether `ancestor` lies on the main-parent chain of `descendant` (or equals it).
    pub fn is_main_ancestor(&self, ancestor: &C::Hash, descendant: &C::Hash) -> bool {
        let ancestor_rank = self.message(ancestor).main_rank;
        self.find_main_ancestor(descendant, ancestor_rank) == Some(ancestor)
    }

    /// Returns an iterator over the creator's messages, in reverse order, starting with `hash`.
    pub fn swimlane<'a>(
        &'a self,
        hash: &'a C::Hash,
    ) -> impl Iterator<Item = (&'a C::Hash, &'a Message<C>)> {
        let mut next = Some(hash);
        iter::from_fn(move || {
            let current = next?;
            let message = self.message(current);
            next = message.prev.as_ref();
            Some((current, message))
        })
    }

    /// Returns an iterator over the hashes of all main-chain ancestors of `hash`, excluding
    /// `hash` itself.
    pub fn main_chain<'a>(&'a self, hash: &'a C::Hash) -> impl Iterator<Item = &'a C::Hash> {
        let mut next = self.message(hash).main_parent();
        iter::from_fn(move || {
            let current = next?;
            next = self.message(current).main_parent();
            Some(current)
        })
    }

    /// Returns the tips of all validators in the era that are not known equivocators, sorted for
    /// determinism. Equivocators have no vote in the fork choice.
    pub fn honest_tips(&self, era_id: Option<&C::InstanceId>) -> Vec<(C::ValidatorId, C::Hash)> {
        self.latest_messages_in_era(era_id)
            .filter(|(validator, _)| !self.equivocators.contains(*validator))
            .filter_map(|(validator, tips)| {
                // A non-equivocator has exactly one tip.
                tips.iter()
                    .exactly_one()
                    .ok()
                    .map(|tip| (validator.clone(), tip.clone()))
            })
            .sorted()
            .collect()
    }
}
