//! # Meridian blockchain node
//!
//! This crate contains the consensus core of the Meridian proof-of-stake
//! validator node. Instead of a single chain, the consensus layer produces
//! and validates a block-DAG: signed messages (blocks and ballots) linked by
//! parents and justifications.
//!
//! The main pieces, leaves first:
//!
//! * [`consensus::dag`](consensus/dag/index.html): the DAG state with its
//!   swimlane, child and topological indexes, the equivocation detector and
//!   the fork choice.
//! * [`consensus::finality`](consensus/finality/index.html): the
//!   voting-matrix finality detector that advances the last finalized block.
//! * [`consensus::message_executor`](consensus/message_executor/index.html):
//!   validates, executes and persists incoming blocks under the single
//!   message-adding permit.
//! * [`consensus::message_producer`](consensus/message_producer/index.html):
//!   builds and signs new blocks and ballots under the per-validator
//!   producer permit.
//! * [`consensus::era_supervisor`](consensus/era_supervisor/index.html): the
//!   highway mode driver with its era tree, round scheduling, and lambda and
//!   omega messages.
//!
//! The execution engine, persistent storage and gossip layers are external
//! collaborators reached through the traits in [`execution`](execution/index.html),
//! [`storage`](storage/index.html) and [`gossip`](gossip/index.html).

#![warn(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_qualifications
)]

pub mod consensus;
pub mod crypto;
pub mod execution;
pub mod gossip;
pub mod logging;
pub mod storage;
#[cfg(test)]
pub(crate) mod testing;
pub mod types;
pub mod utils;

use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

/// The RNG used throughout the node, for all cryptographic and non-cryptographic purposes.
pub type NodeRng = ChaCha20Rng;

/// Constructs a new `NodeRng`, seeded from the operating system's entropy source.
#[cfg(not(test))]
pub fn new_rng() -> NodeRng {
    NodeRng::from_entropy()
}

/// Constructs a new `NodeRng` with a fixed seed, for reproducible tests.
#[cfg(test)]
pub fn new_rng() -> NodeRng {
    NodeRng::seed_from_u64(0x4d45_5249_4449_414e)
}
