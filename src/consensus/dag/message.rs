use std::{
    collections::BTreeMap,
    fmt::{self, Debug},
};

use serde::{Deserialize, Serialize};

use crate::{
    consensus::traits::{Context, ValidatorSecret},
    types::Timestamp,
    utils::log2,
};

use super::weight::Weight;

/// A validator's stake, as recorded in a block's post-state.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(bound(serialize = "VID: Serialize", deserialize = "VID: Deserialize<'de>"))]
pub struct Bond<VID> {
    /// The bonded validator.
    pub validator: VID,
    /// The bonded stake.
    pub stake: Weight,
}

impl<VID> Bond<VID> {
    /// Creates a new bond entry.
    pub fn new(validator: VID, stake: Weight) -> Self {
        Bond { validator, stake }
    }
}

/// A message as it is sent over the wire, before validation.
///
/// The message hash is the hash of this struct's serialized bytes; the signature covers that
/// hash. A message with a consensus value is a block, one without is a ballot. Ballots copy the
/// post-state hash and bonds from their target, so every message carries them.
#[derive(Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(bound(serialize = "", deserialize = ""))]
pub struct WireMessage<C: Context> {
    /// The message's creator.
    pub creator: C::ValidatorId,
    /// The number of earlier messages by the same creator in this era, plus one.
    pub seq_number: u64,
    /// The creator's previous message in this era, or `None` if this is the first.
    pub prev: Option<C::Hash>,
    /// Parent messages; the first one is the main parent. Never empty.
    pub parents: Vec<C::Hash>,
    /// The latest message of each validator the creator had seen when creating this one.
    pub justifications: BTreeMap<C::ValidatorId, C::Hash>,
    /// Depth in the justification-induced partial order.
    pub j_rank: u64,
    /// Depth in the main-parent chain.
    pub main_rank: u64,
    /// The key block hash of the era this message belongs to; `None` outside highway mode.
    pub era_id: Option<C::InstanceId>,
    /// The tick of the round that produced this message; highway only.
    pub round_id: Option<Timestamp>,
    /// When the message was created.
    pub timestamp: Timestamp,
    /// The block's deploys; `None` for ballots.
    pub value: Option<C::ConsensusValue>,
    /// The post-state root after executing this block's deploys (copied from the target for
    /// ballots).
    pub post_state_hash: C::Hash,
    /// The bonds snapshot at the post-state.
    pub bonds: Vec<Bond<C::ValidatorId>>,
}

impl<C: Context> WireMessage<C> {
    /// Returns the message's hash, which is used as its identifier.
    pub fn hash(&self) -> C::Hash {
        <C as Context>::hash(&bincode::serialize(self).expect("serialize WireMessage"))
    }

    /// Returns `true` if this message carries a consensus value, i.e. it is a block.
    pub fn is_block(&self) -> bool {
        self.value.is_some()
    }

    /// Returns the main parent, or `None` if the parent list is empty.
    pub fn main_parent(&self) -> Option<&C::Hash> {
        self.parents.first()
    }
}

impl<C: Context> Debug for WireMessage<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        /// A type whose debug implementation prints ".." (without the quotes).
        struct Ellipsis;

        impl Debug for Ellipsis {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "..")
            }
        }

        f.debug_struct("WireMessage")
            .field("hash()", &self.hash())
            .field("creator", &self.creator)
            .field("seq_number", &self.seq_number)
            .field("value", &self.value.as_ref().map(|_| Ellipsis))
            .field("j_rank", &self.j_rank)
            .field("main_rank", &self.main_rank)
            .field("timestamp", &self.timestamp.millis())
            .field("round_id", &self.round_id)
            .finish()
    }
}

/// A wire message together with its creator's signature over the message hash.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(bound(serialize = "", deserialize = ""))]
pub struct SignedWireMessage<C: Context> {
    /// The unsigned message.
    pub wire_message: WireMessage<C>,
    /// The creator's signature over the message hash.
    pub signature: C::Signature,
}

impl<C: Context> SignedWireMessage<C> {
    /// Signs the wire message and wraps it.
    pub fn new(wire_message: WireMessage<C>, secret_key: &C::ValidatorSecret) -> Self {
        let signature = secret_key.sign(&wire_message.hash());
        SignedWireMessage {
            wire_message,
            signature,
        }
    }

    /// Returns the message's hash.
    pub fn hash(&self) -> C::Hash {
        self.wire_message.hash()
    }
}

/// A validated message stored in the DAG.
///
/// In addition to the wire fields it holds two skip-list indexes: over the creator's own earlier
/// messages (the swimlane) and over the main-parent chain, so both can be traversed in
/// logarithmic time.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Message<C: Context> {
    /// The message's content-addressed hash.
    pub hash: C::Hash,
    /// The creator, or `None` for the genesis message.
    pub creator: Option<C::ValidatorId>,
    /// The creator's signature; meaningless for genesis.
    pub signature: Option<C::Signature>,
    /// Position in the creator's swimlane; `0` for genesis only.
    pub seq_number: u64,
    /// The creator's previous message, or `None` if this is the first in the era.
    pub prev: Option<C::Hash>,
    /// Parent messages; the first one is the main parent. Empty only for genesis.
    pub parents: Vec<C::Hash>,
    /// The latest message of each validator visible from this one.
    pub justifications: BTreeMap<C::ValidatorId, C::Hash>,
    /// Depth in the justification-induced partial order.
    pub j_rank: u64,
    /// Depth in the main-parent chain.
    pub main_rank: u64,
    /// The key block hash of this message's era; `None` outside highway mode.
    pub era_id: Option<C::InstanceId>,
    /// The tick of the round that produced this message; highway only.
    pub round_id: Option<Timestamp>,
    /// When the message was created.
    pub timestamp: Timestamp,
    /// The block's deploys; `None` for ballots.
    pub value: Option<C::ConsensusValue>,
    /// The post-state root.
    pub post_state_hash: C::Hash,
    /// The bonds snapshot at the post-state.
    pub bonds: Vec<Bond<C::ValidatorId>>,
    /// Skip-list index over the creator's earlier messages.
    pub(crate) swimlane_skip: Vec<C::Hash>,
    /// Skip-list index over main-parent chain ancestors.
    pub(crate) main_skip: Vec<C::Hash>,
}

impl<C: Context> Message<C> {
    /// Creates the genesis message: no creator, no parents, rank zero.
    pub fn genesis(
        post_state_hash: C::Hash,
        bonds: Vec<Bond<C::ValidatorId>>,
        timestamp: Timestamp,
    ) -> Self {
        let payload = (b"genesis".to_vec(), &post_state_hash, &bonds);
        let hash = <C as Context>::hash(&bincode::serialize(&payload).expect("serialize genesis"));
        Message {
            hash,
            creator: None,
            signature: None,
            seq_number: 0,
            prev: None,
            parents: vec![],
            justifications: BTreeMap::new(),
            j_rank: 0,
            main_rank: 0,
            era_id: None,
            round_id: None,
            timestamp,
            value: None,
            post_state_hash,
            bonds,
            swimlane_skip: vec![],
            main_skip: vec![],
        }
    }

    /// Creates a stored message from a validated signed wire message.
    ///
    /// `swimlane_skip_source` and `main_skip_source` look up the skip index of an already stored
    /// message; the caller guarantees the previous message and all parents are stored.
    pub(crate) fn from_wire(
        swm: SignedWireMessage<C>,
        swimlane_skip_of: impl Fn(&C::Hash, usize) -> C::Hash,
        main_skip_of: impl Fn(&C::Hash, usize) -> C::Hash,
    ) -> Self {
        let hash = swm.hash();
        let SignedWireMessage {
            wire_message: wm,
            signature,
        } = swm;

        let mut swimlane_skip = Vec::new();
        if let Some(prev) = wm.prev.clone() {
            swimlane_skip.push(prev);
            for i in 0..(wm.seq_number - 1).trailing_zeros() as usize {
                let ancestor = swimlane_skip_of(&swimlane_skip[i], i);
                swimlane_skip.push(ancestor);
            }
        }

        let mut main_skip = Vec::new();
        if let Some(main_parent) = wm.parents.first().cloned() {
            // Ranks are 0-based with genesis at rank 0, while sequence numbers are 1-based, hence
            // the different loop bounds.
            main_skip.push(main_parent);
            for i in 0..wm.main_rank.trailing_zeros() as usize {
                let ancestor = main_skip_of(&main_skip[i], i);
                main_skip.push(ancestor);
            }
        }

        Message {
            hash,
            creator: Some(wm.creator),
            signature: Some(signature),
            seq_number: wm.seq_number,
            prev: wm.prev,
            parents: wm.parents,
            justifications: wm.justifications,
            j_rank: wm.j_rank,
            main_rank: wm.main_rank,
            era_id: wm.era_id,
            round_id: wm.round_id,
            timestamp: wm.timestamp,
            value: wm.value,
            post_state_hash: wm.post_state_hash,
            bonds: wm.bonds,
            swimlane_skip,
            main_skip,
        }
    }

    /// Returns `true` if this message carries a consensus value, i.e. it is a block.
    pub fn is_block(&self) -> bool {
        self.value.is_some() || self.is_genesis()
    }

    /// Returns `true` if this is the genesis message.
    pub fn is_genesis(&self) -> bool {
        self.creator.is_none()
    }

    /// Returns the main parent, or `None` for genesis.
    pub fn main_parent(&self) -> Option<&C::Hash> {
        self.parents.first()
    }

    /// Returns the hash of the block this message votes for: the message itself if it is a
    /// block, otherwise its main parent (the ballot's target).
    pub fn vote_block(&self) -> C::Hash {
        if self.is_block() {
            self.hash.clone()
        } else {
            self.parents
                .first()
                .cloned()
                .expect("a ballot always has a target")
        }
    }

    /// Returns the greatest skip-list step `2^i <= diff` usable from this message's swimlane
    /// index.
    pub(crate) fn swimlane_step(&self, diff: u64) -> usize {
        let max_i = log2(diff) as usize;
        max_i.min(self.swimlane_skip.len() - 1)
    }

    /// Returns the greatest skip-list step `2^i <= diff` usable from this message's main-chain
    /// index.
    pub(crate) fn main_step(&self, diff: u64) -> usize {
        let max_i = log2(diff) as usize;
        max_i.min(self.main_skip.len() - 1)
    }
}
