//! The highway era supervisor.
//!
//! The timeline is partitioned into eras delimited by key blocks. Rounds within an era fire at
//! `2^round_exponent`-tick boundaries; each round has one designated leader who proposes a block
//! (the lambda message), everyone else answers with a lambda-response ballot, and every active
//! validator casts a tie-breaking omega ballot at a random tick inside the configured window.
//!
//! The supervisor is a state machine: it consumes timer ticks and added messages and emits
//! [`ProtocolOutcome`]s. The driver owns the actual timers and the message producer; this keeps
//! the scheduling logic deterministic and testable.

use std::collections::{HashMap, VecDeque};

use rand::Rng;
use tracing::{info, trace, warn};

use crate::{
    consensus::{
        config::{ChainSpec, HighwayConfig},
        dag::{
            message::{Bond, Message},
            state::DagState,
            validators::Validators,
            weight::Weight,
        },
        era::Era,
        traits::Context,
    },
    types::{TimeDiff, Timestamp},
    NodeRng,
};

/// The unbonding period, in eras. Past eras up to this depth still accept messages (e.g. late
/// evidence); older ones are evicted.
const BONDED_ERAS: usize = 3;

/// An instruction from the supervisor to its driver.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProtocolOutcome<C: Context> {
    /// `handle_timer` needs to be called at the specified time.
    ScheduleTimer(Timestamp),
    /// We are the round leader: propose a block on top of the fork choice.
    ProposeLambda {
        /// The era to propose in.
        era_id: C::InstanceId,
        /// The era's key block, the fork-choice stop hash.
        key_block: C::Hash,
        /// The round being proposed in.
        round_id: Timestamp,
        /// Whether the proposed block falls into the era's booking phase.
        is_booking_block: bool,
    },
    /// The round leader's proposal arrived: answer with a lambda-response ballot.
    LambdaResponse {
        /// The era to vote in.
        era_id: C::InstanceId,
        /// The round being voted in.
        round_id: Timestamp,
        /// The leader's block.
        target: C::Hash,
    },
    /// Cast the round's tie-breaking omega ballot on the current fork choice.
    ProposeOmega {
        /// The era to vote in.
        era_id: C::InstanceId,
        /// The era's key block, the fork-choice stop hash.
        key_block: C::Hash,
        /// The round being voted in.
        round_id: Timestamp,
    },
    /// A switch block was finalized and opened a new era.
    EraCreated {
        /// The new era's key block.
        key_block: C::Hash,
    },
}

/// Tracks the tree of active eras and drives the round schedule.
pub struct EraSupervisor<C: Context> {
    chainspec: ChainSpec,
    highway_config: HighwayConfig,
    active_eras: HashMap<C::InstanceId, Era<C>>,
    /// Era creation order, for eviction.
    era_order: VecDeque<C::InstanceId>,
    current_era: C::InstanceId,
    our_id: Option<C::ValidatorId>,
    /// The omega tick scheduled for the current round, if any.
    pending_omega: Option<(C::InstanceId, Timestamp, Timestamp)>,
    /// The last round we sent a lambda response in.
    responded_round: Option<Timestamp>,
}

impl<C: Context> EraSupervisor<C> {
    /// Creates the supervisor with the genesis era, keyed by the genesis block.
    pub fn new(
        genesis: &Message<C>,
        chainspec: ChainSpec,
        highway_config: HighwayConfig,
        our_id: Option<C::ValidatorId>,
    ) -> (Self, Vec<ProtocolOutcome<C>>) {
        let bonds = scaled_validators::<C>(&genesis.bonds);
        let era = Era::<C>::new(
            genesis.hash.clone(),
            None,
            chainspec.genesis_timestamp,
            chainspec.era_duration_millis,
            chainspec.booking_duration_millis,
            chainspec.voting_period_duration_millis,
            bonds,
            0,
            highway_config.init_round_exponent,
        );
        let era_id = era.key_block_hash.clone();
        let start_tick = era.start_tick;
        info!(%start_tick, "starting genesis era");
        let mut active_eras = HashMap::new();
        active_eras.insert(era_id.clone(), era);
        let mut era_order = VecDeque::new();
        era_order.push_back(era_id.clone());
        let supervisor = EraSupervisor {
            chainspec,
            highway_config,
            active_eras,
            era_order,
            current_era: era_id,
            our_id,
            pending_omega: None,
            responded_round: None,
        };
        (supervisor, vec![ProtocolOutcome::ScheduleTimer(start_tick)])
    }

    /// Returns the era with the given ID. Panics if it does not exist.
    pub fn era(&self, era_id: &C::InstanceId) -> &Era<C> {
        &self.active_eras[era_id]
    }

    /// Returns the current era.
    pub fn current_era(&self) -> &Era<C> {
        &self.active_eras[&self.current_era]
    }

    /// Handles a timer firing at `timestamp` and returns what to do next.
    pub fn handle_timer(
        &mut self,
        timestamp: Timestamp,
        rng: &mut NodeRng,
    ) -> Vec<ProtocolOutcome<C>> {
        let mut outcomes = Vec::new();

        // An omega tick scheduled earlier in the round fires independently of the boundary
        // handling below.
        if let Some((era_id, round_id, tick)) = self.pending_omega.clone() {
            if timestamp >= tick {
                self.pending_omega = None;
                let key_block = self.era(&era_id).key_block.clone();
                outcomes.push(ProtocolOutcome::ProposeOmega {
                    era_id,
                    key_block,
                    round_id,
                });
            }
        }

        let era = self.current_era().clone();
        if timestamp < era.start_tick {
            outcomes.push(ProtocolOutcome::ScheduleTimer(era.start_tick));
            return outcomes;
        }
        if timestamp >= era.voting_end_tick {
            // The era is over; nothing fires until the switch block opens the next one.
            warn!(%timestamp, "timer fired past the era's voting period");
            return outcomes;
        }

        let round_id = era.round_id(timestamp);
        if timestamp != round_id {
            trace!(%timestamp, %round_id, "timer did not hit a round boundary");
            return outcomes;
        }

        // Round boundary: the leader proposes, if block production is open.
        let is_leader = self
            .our_id
            .as_ref()
            .map_or(false, |id| era.leader_id(round_id) == Some(id));
        if era.is_active(timestamp) && is_leader {
            outcomes.push(ProtocolOutcome::ProposeLambda {
                era_id: era.key_block_hash.clone(),
                key_block: era.key_block.clone(),
                round_id,
                is_booking_block: era.is_booking_tick(round_id),
            });
        }

        // Every bonded validator schedules its omega ballot at a random tick inside the
        // configured window of this round.
        let bonded = self
            .our_id
            .as_ref()
            .map_or(false, |id| era.bonds.contains(id));
        if bonded {
            let omega_tick = self.omega_tick(round_id, era.round_len(), rng);
            self.pending_omega = Some((era.key_block_hash.clone(), round_id, omega_tick));
            outcomes.push(ProtocolOutcome::ScheduleTimer(omega_tick));
        }

        // And the next round boundary.
        let next_round = round_id + era.round_len();
        if next_round < era.voting_end_tick {
            outcomes.push(ProtocolOutcome::ScheduleTimer(next_round));
        }
        outcomes
    }

    /// Picks the omega tick: uniform in `[round + start * len, round + end * len)`.
    fn omega_tick(&self, round_id: Timestamp, round_len: TimeDiff, rng: &mut NodeRng) -> Timestamp {
        let len = round_len.millis();
        let start = len * *self.highway_config.omega_message_time_start.numer()
            / *self.highway_config.omega_message_time_start.denom();
        let end = len * *self.highway_config.omega_message_time_end.numer()
            / *self.highway_config.omega_message_time_end.denom();
        let offset = if end > start {
            start + rng.gen_range(0, end - start)
        } else {
            start
        };
        round_id + TimeDiff::from(offset)
    }

    /// Reacts to a message that was added to the DAG: if it is the current round leader's
    /// proposal and we are a bonded non-leader, answer with a lambda-response ballot.
    pub fn on_message_added(
        &mut self,
        dag: &DagState<C>,
        hash: &C::Hash,
    ) -> Vec<ProtocolOutcome<C>> {
        let message = dag.message(hash);
        if !message.is_block() || message.era_id.as_ref() != Some(&self.current_era) {
            return vec![];
        }
        let era = self.current_era().clone();
        let round_id = match message.round_id {
            None => return vec![],
            Some(round_id) => round_id,
        };
        let our_id = match &self.our_id {
            None => return vec![],
            Some(id) => id.clone(),
        };
        let leader = era.leader_id(round_id);
        if leader != message.creator.as_ref()
            || !era.bonds.contains(&our_id)
            || leader == Some(&our_id)
            || self.responded_round == Some(round_id)
        {
            return vec![];
        }
        self.responded_round = Some(round_id);
        vec![ProtocolOutcome::LambdaResponse {
            era_id: era.key_block_hash.clone(),
            round_id,
            target: hash.clone(),
        }]
    }

    /// Reacts to a finalized block: a finalized switch block becomes the key block of a new era.
    pub fn on_block_finalized(
        &mut self,
        dag: &DagState<C>,
        hash: &C::Hash,
    ) -> Vec<ProtocolOutcome<C>> {
        let message = dag.message(hash).clone();
        let era_id = match &message.era_id {
            None => return vec![],
            Some(era_id) => era_id.clone(),
        };
        let era = match self.active_eras.get(&era_id) {
            None => return vec![],
            Some(era) => era,
        };
        if !is_switch_block(era, &message) {
            return vec![];
        }
        if self
            .active_eras
            .values()
            .any(|existing| existing.parent_key_block_hash.as_ref() == Some(&era_id))
        {
            return vec![]; // The child era already exists.
        }

        // The booking block is the earliest main-chain block inside the booking phase; its hash
        // seeds the child era's leader sequence.
        let booking_block = booking_block(dag, era, hash);
        let leader_seed = seed_from_hash::<C>(&booking_block);

        let child = Era::<C>::new(
            hash.clone(),
            Some(era_id),
            era.end_tick,
            self.chainspec.era_duration_millis,
            self.chainspec.booking_duration_millis,
            self.chainspec.voting_period_duration_millis,
            scaled_validators::<C>(&message.bonds),
            leader_seed,
            self.highway_config.init_round_exponent,
        );
        let child_id = child.key_block_hash.clone();
        let start_tick = child.start_tick;
        info!(key_block = ?hash, %start_tick, "era created");

        let mut child_era = child;
        child_era.booking_block_hash = Some(booking_block);
        self.active_eras.insert(child_id.clone(), child_era);
        self.era_order.push_back(child_id.clone());
        self.current_era = child_id;
        self.pending_omega = None;
        self.responded_round = None;

        // Remove the eras that have become obsolete now.
        while self.era_order.len() > 2 * BONDED_ERAS + 1 {
            if let Some(obsolete) = self.era_order.pop_front() {
                self.active_eras.remove(&obsolete);
            }
        }

        vec![
            ProtocolOutcome::EraCreated {
                key_block: hash.clone(),
            },
            ProtocolOutcome::ScheduleTimer(start_tick),
        ]
    }
}

/// Returns whether the block closes its era's active phase, i.e. it was proposed in the last
/// round in which block production is open.
fn is_switch_block<C: Context>(era: &Era<C>, message: &Message<C>) -> bool {
    if !message.is_block() || !era.is_active(message.timestamp) {
        return false;
    }
    let round_id = message
        .round_id
        .unwrap_or_else(|| era.round_id(message.timestamp));
    round_id + era.round_len() >= era.end_tick
}

/// Returns the earliest main-chain ancestor of `hash` inside the era's booking phase, or `hash`
/// itself if there is none.
fn booking_block<C: Context>(dag: &DagState<C>, era: &Era<C>, hash: &C::Hash) -> C::Hash {
    let mut booking = hash.clone();
    let mut current = hash.clone();
    loop {
        let message = dag.message(&current);
        if message.era_id.as_ref() != Some(&era.key_block_hash)
            || !era.is_booking_tick(era.round_id(message.timestamp))
        {
            break;
        }
        booking = current.clone();
        match message.main_parent() {
            None => break,
            Some(parent) => current = parent.clone(),
        }
    }
    booking
}

/// Derives a `u64` seed from a hash's serialized bytes.
fn seed_from_hash<C: Context>(hash: &C::Hash) -> u64 {
    let bytes = bincode::serialize(hash).expect("serialize hash");
    bytes
        .iter()
        .fold(0u64, |seed, byte| seed.wrapping_mul(31).wrapping_add(u64::from(*byte)))
}

/// Converts a bonds snapshot into a validator set, scaling stakes down if their sum would
/// overflow the consensus weight type.
fn scaled_validators<C: Context>(bonds: &[Bond<C::ValidatorId>]) -> Validators<C::ValidatorId> {
    let sum: u128 = bonds.iter().map(|bond| u128::from(bond.stake)).sum();
    // If we round up the divisor, the resulting sum is guaranteed to be <= u64::MAX.
    let divisor = ((sum + u128::from(u64::MAX) - 1) / u128::from(u64::MAX)).max(1);
    bonds
        .iter()
        .map(|bond| {
            let scaled = u128::from(bond.stake) / divisor;
            (bond.validator.clone(), Weight(scaled as u64))
        })
        .collect()
}
