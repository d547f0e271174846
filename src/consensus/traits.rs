use std::{fmt::Debug, hash::Hash};

use serde::{de::DeserializeOwned, Serialize};

use crate::types::Timestamp;

/// An identifier for a peer node.
pub trait NodeIdT: Clone + Debug + Send + 'static {}
impl<I> NodeIdT for I where I: Clone + Debug + Send + 'static {}

/// A validator identifier.
pub trait ValidatorIdT:
    Eq + Ord + Clone + Debug + Hash + Serialize + DeserializeOwned + Send + Sync + 'static
{
}
impl<VID> ValidatorIdT for VID where
    VID: Eq + Ord + Clone + Debug + Hash + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// The consensus value type, e.g. a list of deploy hashes.
pub trait ConsensusValueT:
    Eq + Clone + Debug + Hash + Serialize + DeserializeOwned + Send + Sync + 'static
{
}
impl<CV> ConsensusValueT for CV where
    CV: Eq + Clone + Debug + Hash + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// A hash, as an identifier for a block or ballot.
pub trait HashT:
    Eq + Ord + Clone + Debug + Hash + Serialize + DeserializeOwned + Send + Sync + 'static
{
}
impl<H> HashT for H where
    H: Eq + Ord + Clone + Debug + Hash + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// A validator's secret signing key.
pub trait ValidatorSecret {
    /// The hash type the secret key signs.
    type Hash;

    /// The signature type produced by this secret key.
    type Signature: Eq
        + PartialEq
        + Clone
        + Debug
        + Hash
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static;

    /// Signs the given hash.
    fn sign(&self, data: &Self::Hash) -> Self::Signature;
}

/// The collection of types the user can choose for cryptography, IDs, deploys, etc.
// These trait bounds make `#[derive(...)]` work for types with a `C: Context` type parameter.
pub trait Context: Clone + Debug + Eq + Ord + Hash {
    /// The consensus value type, e.g. a list of deploy hashes.
    type ConsensusValue: ConsensusValueT;
    /// Unique identifiers for validators.
    type ValidatorId: ValidatorIdT;
    /// A validator's secret signing key.
    type ValidatorSecret: ValidatorSecret<Hash = Self::Hash, Signature = Self::Signature>;
    /// A signature over a message hash.
    type Signature: Eq
        + PartialEq
        + Clone
        + Debug
        + Hash
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static;
    /// Unique identifiers for messages.
    type Hash: HashT;
    /// The ID of a consensus protocol instance; in highway mode, the era's key block hash.
    type InstanceId: HashT;

    /// Hashes the given serialized data.
    fn hash(data: &[u8]) -> Self::Hash;

    /// Derives the protocol instance ID of the era keyed by the given key block.
    fn instance_id(key_block: &Self::Hash) -> Self::InstanceId;

    /// Verifies the signature of the given hash against the given public key.
    fn verify_signature(
        hash: &Self::Hash,
        public_key: &Self::ValidatorId,
        signature: &Self::Signature,
    ) -> bool;
}

/// The context-specific glue the executor and the producer need to look inside a block payload.
///
/// Consensus treats `Context::ConsensusValue` as opaque; this trait is the one place that knows
/// how to enumerate, validate and assemble the deploys inside it.
pub trait PayloadOps<C: Context>: Send + Sync {
    /// Returns the hashes of the deploys contained in the payload.
    fn deploy_hashes(&self, value: &C::ConsensusValue) -> Vec<crate::types::DeployHash>;

    /// Checks the payload's intrinsic validity for a block with the given timestamp, e.g. that
    /// no contained deploy is expired or below the minimum time-to-live.
    fn validate(
        &self,
        value: &C::ConsensusValue,
        block_timestamp: Timestamp,
        min_ttl: crate::types::TimeDiff,
    ) -> Result<(), super::error::InvalidBlockKind>;

    /// Builds a payload from the given deploys.
    fn assemble(&self, deploys: &[crate::types::Deploy]) -> C::ConsensusValue;
}

/// A source of the current time.
///
/// Threaded through constructors instead of calling `Timestamp::now` directly, so that tests can
/// drive the executor and the era supervisor with a manual clock.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> Timestamp;
}

/// The wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct WallClock;

impl Clock for WallClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}
