//! Eras: time intervals of the highway protocol, keyed by their key block.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::{
    consensus::{
        dag::{
            validators::{ValidatorIndex, ValidatorMap, Validators},
            weight::Weight,
        },
        traits::Context,
    },
    types::{TimeDiff, Timestamp},
};

/// Returns the round length, given the round exponent.
pub fn round_len(round_exp: u8) -> TimeDiff {
    TimeDiff::from(1 << round_exp)
}

/// An era of the highway protocol.
///
/// Rounds within the era are `1 << round_exponent` ticks long, anchored at `start_tick`. Blocks
/// are only produced while the era is active; during the voting period that follows only ballots
/// are cast.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(bound(serialize = "", deserialize = ""))]
pub struct Era<C: Context> {
    /// The era's identifier: the hash of its key block.
    pub key_block_hash: C::InstanceId,
    /// The key block itself, the root of this era's subtree in the DAG.
    pub key_block: C::Hash,
    /// The parent era's key block hash; `None` for the genesis era.
    pub parent_key_block_hash: Option<C::InstanceId>,
    /// The block whose post-state defined this era's bonds, once known.
    pub booking_block_hash: Option<C::Hash>,
    /// The first tick of the era.
    pub start_tick: Timestamp,
    /// The first tick no longer part of the era's active phase.
    pub end_tick: Timestamp,
    /// The tick at which the era enters its booking phase.
    pub booking_tick: Timestamp,
    /// The first tick past the era's voting period.
    pub voting_end_tick: Timestamp,
    /// The validators bonded in this era.
    pub bonds: Validators<C::ValidatorId>,
    /// The seed for the leader sequence, derived from the booking block's entropy.
    pub leader_seed: u64,
    /// Rounds are `1 << round_exponent` ticks long.
    pub round_exponent: u8,
    /// Cumulative validator weights: entry `i` contains the sum of the weights of validators `0`
    /// through `i`.
    cumulative_weights: ValidatorMap<Weight>,
}

impl<C: Context> Era<C> {
    /// Creates a new era.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key_block: C::Hash,
        parent_key_block_hash: Option<C::InstanceId>,
        start_tick: Timestamp,
        era_duration: TimeDiff,
        booking_duration: TimeDiff,
        voting_duration: TimeDiff,
        bonds: Validators<C::ValidatorId>,
        leader_seed: u64,
        round_exponent: u8,
    ) -> Self {
        assert!(!bonds.is_empty(), "cannot start an era with no validators");
        let cumulative_weights = bonds.cumulative_weights();
        Era {
            key_block_hash: C::instance_id(&key_block),
            key_block,
            parent_key_block_hash,
            booking_block_hash: None,
            start_tick,
            end_tick: start_tick + era_duration,
            booking_tick: start_tick + booking_duration,
            voting_end_tick: start_tick + era_duration + voting_duration,
            bonds,
            leader_seed,
            round_exponent,
            cumulative_weights,
        }
    }

    /// Returns the round length.
    pub fn round_len(&self) -> TimeDiff {
        round_len(self.round_exponent)
    }

    /// Returns the tick at which the round containing `timestamp` began. Rounds are anchored at
    /// the era's start tick.
    pub fn round_id(&self, timestamp: Timestamp) -> Timestamp {
        let into_era = timestamp.saturating_sub(self.start_tick);
        let round_index = into_era.millis() / self.round_len().millis();
        self.start_tick + self.round_len() * round_index
    }

    /// Returns whether new blocks may be proposed at this tick.
    pub fn is_active(&self, timestamp: Timestamp) -> bool {
        self.start_tick <= timestamp && timestamp < self.end_tick
    }

    /// Returns whether this tick falls into the post-era voting period, in which only ballots
    /// are cast.
    pub fn in_voting_period(&self, timestamp: Timestamp) -> bool {
        self.end_tick <= timestamp && timestamp < self.voting_end_tick
    }

    /// Returns whether a block proposed at this tick is a booking block for a child era.
    pub fn is_booking_tick(&self, timestamp: Timestamp) -> bool {
        timestamp >= self.booking_tick && timestamp < self.end_tick
    }

    /// Returns the leader of the round starting at `round_id`, by weighted round-robin over the
    /// era's bonds and leader seed.
    pub fn leader(&self, round_id: Timestamp) -> ValidatorIndex {
        let seed = self.leader_seed.wrapping_add(round_id.millis());
        // We select a random one out of the total weight units, starting numbering at 1.
        let total_weight = u64::from(self.bonds.total_weight());
        let r = Weight(leader_prng(total_weight, seed));
        // The weight units are subdivided into intervals that belong to some validator.
        // `cumulative_weights[i]` denotes the last weight unit that belongs to validator `i`.
        // `binary_search` returns the first `i` with `cumulative_weights[i] >= r`, i.e. the
        // validator who owns the randomly selected weight unit.
        self.cumulative_weights.binary_search(&r)
    }

    /// Returns the ID of the round leader, if the index is in range.
    pub fn leader_id(&self, round_id: Timestamp) -> Option<&C::ValidatorId> {
        self.bonds.id(self.leader(round_id))
    }
}

/// Returns a pseudorandom `u64` between `1` and `upper` (inclusive).
fn leader_prng(upper: u64, seed: u64) -> u64 {
    ChaCha8Rng::seed_from_u64(seed).gen_range(0, upper) + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::dag::state::tests::TestContext;

    fn era() -> Era<TestContext> {
        let bonds: Validators<u32> = vec![(0u32, 3u64), (1, 4), (2, 5)].into_iter().collect();
        Era::new(
            0xE0,
            None,
            Timestamp::from(1_000),
            TimeDiff::from(1_024),
            TimeDiff::from(768),
            TimeDiff::from(512),
            bonds,
            42,
            4,
        )
    }

    #[test]
    fn round_ids_are_anchored_at_era_start() {
        let era = era();
        assert_eq!(TimeDiff::from(16), era.round_len());
        assert_eq!(Timestamp::from(1_000), era.round_id(Timestamp::from(1_000)));
        assert_eq!(Timestamp::from(1_000), era.round_id(Timestamp::from(1_015)));
        assert_eq!(Timestamp::from(1_016), era.round_id(Timestamp::from(1_016)));
        assert_eq!(Timestamp::from(1_992), era.round_id(Timestamp::from(2_000)));
    }

    #[test]
    fn phases() {
        let era = era();
        assert!(era.is_active(Timestamp::from(1_000)));
        assert!(era.is_active(Timestamp::from(2_023)));
        assert!(!era.is_active(Timestamp::from(2_024)));
        assert!(era.in_voting_period(Timestamp::from(2_024)));
        assert!(!era.in_voting_period(Timestamp::from(2_536)));
        assert!(!era.is_booking_tick(Timestamp::from(1_767)));
        assert!(era.is_booking_tick(Timestamp::from(1_768)));
    }

    #[test]
    fn leader_is_deterministic_and_weighted() {
        let era = era();
        let round_id = Timestamp::from(1_016);
        assert_eq!(era.leader(round_id), era.leader(round_id));
        // Every round has exactly one leader within the validator set.
        for round in 0..64u64 {
            let round_id = Timestamp::from(1_000 + round * 16);
            let leader = era.leader(round_id);
            assert!((leader.0 as usize) < era.bonds.len());
        }
    }

    #[test]
    fn test_leader_prng() {
        // Pin concrete values, to detect if the ChaCha8Rng implementation changes.
        assert_eq!(12578764544318200737, leader_prng(u64::MAX, 42));
        assert_eq!(12358540700710939054, leader_prng(u64::MAX, 1337));
        assert_eq!(4134160578770126600, leader_prng(u64::MAX, 0x1020304050607));
    }

    #[test]
    fn era_round_trip() {
        let era = era();
        let serialized = bincode::serialize(&era).expect("serialize era");
        let deserialized: Era<TestContext> = bincode::deserialize(&serialized).expect("deserialize");
        assert_eq!(era, deserialized);
    }
}
