use std::path::PathBuf;

use datasize::DataSize;
use num_rational::Ratio;
use serde::{Deserialize, Serialize};

use crate::types::{TimeDiff, Timestamp};

/// Consensus configuration.
#[derive(Clone, DataSize, Debug, Deserialize, Serialize)]
// Disallow unknown fields to ensure config files and command-line overrides contain valid keys.
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The target relative fault tolerance threshold used by the finality detector, in [0, 0.5).
    #[data_size(skip)]
    pub fault_tolerance_threshold: Ratio<u64>,
    /// The number of approvals needed to accept the genesis block.
    pub required_sigs: u32,
    /// Deploys with a shorter time-to-live are rejected at intake.
    pub min_deploy_ttl: TimeDiff,
    /// The maximum serialized size of a proposed block.
    pub max_block_size_bytes: u32,
    /// How far ahead of our clock a block's timestamp may lie before it is rejected outright.
    pub max_clock_drift: TimeDiff,
    /// Whether new blocks may merge additional tips as secondary parents.
    pub enable_secondary_parents: bool,
    /// Retry count for a single block download.
    pub download_max_retries: u32,
    /// Initial backoff between download retries.
    pub download_retry_initial_backoff: TimeDiff,
    /// Multiplier applied to the backoff after each failed download.
    pub download_retry_backoff_factor: u32,
    /// How many peers each received block is relayed to.
    pub relay_factor: u32,
    /// Stop relaying after this fraction (in percent) of peers confirmed having the block.
    pub relay_saturation: u32,
    /// Maximum number of nodes to contact during initial synchronization.
    pub init_sync_max_nodes: u32,
    /// Minimum number of successful initial-sync rounds before the node goes live.
    pub init_sync_min_successful: u32,
    /// Increment of contacted nodes per initial-sync round.
    pub init_sync_step: u32,
    /// Pause between initial-sync rounds.
    pub init_sync_round_period: TimeDiff,
    /// Pause between periodic sync rounds once live.
    pub periodic_sync_round_period: TimeDiff,
    /// Upper bound on the DAG depth accepted from a single peer during sync.
    pub sync_max_possible_depth: u64,
    /// Upper bound on the rate of bonding changes accepted during sync.
    pub sync_max_bonding_rate: u32,
    /// Minimum number of blocks before the sync width check kicks in.
    pub sync_min_block_count_to_check_width: u32,
    /// Upper bound on the depth of an ancestors request.
    pub sync_max_depth_ancestors_request: u64,
    /// Highway-specific settings.
    pub highway: HighwayConfig,
    /// The local validator's keys.
    pub validator: ValidatorConfig,
    /// Path to the chain specification.
    pub chainspec_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            fault_tolerance_threshold: Ratio::new(1, 10),
            required_sigs: 0,
            min_deploy_ttl: TimeDiff::from_seconds(60),
            max_block_size_bytes: 10 * 1024 * 1024,
            max_clock_drift: TimeDiff::from_seconds(10),
            enable_secondary_parents: true,
            download_max_retries: 3,
            download_retry_initial_backoff: TimeDiff::from(1_000),
            download_retry_backoff_factor: 2,
            relay_factor: 2,
            relay_saturation: 90,
            init_sync_max_nodes: 5,
            init_sync_min_successful: 1,
            init_sync_step: 1,
            init_sync_round_period: TimeDiff::from_seconds(10),
            periodic_sync_round_period: TimeDiff::from_seconds(60),
            sync_max_possible_depth: 1_000,
            sync_max_bonding_rate: 10,
            sync_min_block_count_to_check_width: 100,
            sync_max_depth_ancestors_request: 50,
            highway: HighwayConfig::default(),
            validator: ValidatorConfig::default(),
            chainspec_path: PathBuf::from("chainspec.toml"),
        }
    }
}

/// Highway consensus protocol configuration.
#[derive(Clone, DataSize, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HighwayConfig {
    /// The initial round exponent: rounds are `1 << init_round_exponent` ticks long.
    pub init_round_exponent: u8,
    /// The omega message is sent at a random tick no earlier than this fraction of the round.
    #[data_size(skip)]
    pub omega_message_time_start: Ratio<u64>,
    /// The omega message is sent at a random tick strictly before this fraction of the round.
    #[data_size(skip)]
    pub omega_message_time_end: Ratio<u64>,
}

impl Default for HighwayConfig {
    fn default() -> Self {
        HighwayConfig {
            init_round_exponent: 14,
            omega_message_time_start: Ratio::new(1, 2),
            omega_message_time_end: Ratio::new(3, 4),
        }
    }
}

/// The local validator's signing identity.
#[derive(Clone, DataSize, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ValidatorConfig {
    /// Path to the public key file.
    pub public_key_path: Option<PathBuf>,
    /// Path to the secret key file.
    pub private_key_path: Option<PathBuf>,
    /// Signature algorithm name; only "ed25519" is supported.
    pub signature_algorithm: String,
}

/// Era timing parameters. These come from the chain specification, not from the node's own
/// configuration, so that all validators agree on era boundaries.
#[derive(Clone, DataSize, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ChainSpec {
    /// The network name, mixed into instance identifiers.
    pub name: String,
    /// The genesis timestamp: tick zero of era zero.
    pub genesis_timestamp: Timestamp,
    /// How long an era accepts new blocks.
    pub era_duration_millis: TimeDiff,
    /// How far into an era its booking block is chosen.
    pub booking_duration_millis: TimeDiff,
    /// How long after the booking block the era's entropy is accumulated.
    pub entropy_duration_millis: TimeDiff,
    /// How long the post-era voting period lasts, if not ended by summit level.
    pub voting_period_duration_millis: TimeDiff,
    /// The summit level that ends the voting period early.
    pub voting_period_summit_level: u8,
}

impl Default for ChainSpec {
    fn default() -> Self {
        ChainSpec {
            name: "meridian-testnet".to_string(),
            genesis_timestamp: Timestamp::zero(),
            era_duration_millis: TimeDiff::from_seconds(7 * 24 * 60 * 60),
            booking_duration_millis: TimeDiff::from_seconds(6 * 24 * 60 * 60),
            entropy_duration_millis: TimeDiff::from_seconds(3 * 60 * 60),
            voting_period_duration_millis: TimeDiff::from_seconds(2 * 24 * 60 * 60),
            voting_period_summit_level: 1,
        }
    }
}
