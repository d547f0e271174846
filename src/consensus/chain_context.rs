use std::sync::Arc;

use datasize::DataSize;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    consensus::{
        error::InvalidBlockKind,
        traits::{Context, PayloadOps, ValidatorSecret},
    },
    crypto::{
        self,
        hash::{self, Digest},
        PublicKey, SecretKey, Signature,
    },
    types::{Deploy, DeployHash, TimeDiff, Timestamp},
};

/// The local validator's key pair.
#[derive(DataSize)]
pub struct Keypair {
    #[data_size(skip)]
    secret_key: Arc<SecretKey>,
    #[data_size(skip)]
    public_key: PublicKey,
}

impl Keypair {
    /// Creates a key pair from an existing secret key.
    pub fn new(secret_key: Arc<SecretKey>, public_key: PublicKey) -> Self {
        Self {
            secret_key,
            public_key,
        }
    }

    /// Returns the public half.
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }
}

impl From<Arc<SecretKey>> for Keypair {
    fn from(secret_key: Arc<SecretKey>) -> Self {
        let public_key: PublicKey = secret_key.as_ref().into();
        Self::new(secret_key, public_key)
    }
}

impl ValidatorSecret for Keypair {
    type Hash = Digest;
    type Signature = Signature;

    fn sign(&self, hash: &Digest) -> Signature {
        crypto::sign(hash, self.secret_key.as_ref(), &self.public_key)
    }
}

/// The deploys carried by a block.
///
/// Deploys travel in full inside the block so that their time-to-live and approval signatures
/// can be checked without a round-trip to storage.
#[derive(Clone, DataSize, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct BlockPayload {
    /// The contained deploys, in execution order.
    pub deploys: Vec<Deploy>,
}

/// The collection of types used for cryptography, IDs and blocks in the Meridian node.
#[derive(Clone, DataSize, Debug, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ChainContext;

impl Context for ChainContext {
    type ConsensusValue = Arc<BlockPayload>;
    type ValidatorId = PublicKey;
    type ValidatorSecret = Keypair;
    type Signature = Signature;
    type Hash = Digest;
    type InstanceId = Digest;

    fn hash(data: &[u8]) -> Digest {
        hash::hash(data)
    }

    fn instance_id(key_block: &Digest) -> Digest {
        *key_block
    }

    fn verify_signature(hash: &Digest, public_key: &PublicKey, signature: &Signature) -> bool {
        if let Err(error) = crypto::verify(hash, signature, public_key) {
            info!(%error, %signature, %public_key, %hash, "failed to validate signature");
            return false;
        }
        true
    }
}

/// Payload glue for [`ChainContext`].
#[derive(Clone, Debug, Default)]
pub struct ChainPayloadOps;

impl PayloadOps<ChainContext> for ChainPayloadOps {
    fn deploy_hashes(&self, value: &Arc<BlockPayload>) -> Vec<DeployHash> {
        value.deploys.iter().map(|deploy| *deploy.id()).collect()
    }

    fn validate(
        &self,
        value: &Arc<BlockPayload>,
        block_timestamp: Timestamp,
        min_ttl: TimeDiff,
    ) -> Result<(), InvalidBlockKind> {
        for deploy in &value.deploys {
            if deploy.header().ttl < min_ttl {
                return Err(InvalidBlockKind::Deploy);
            }
            if deploy.has_expired(block_timestamp) {
                return Err(InvalidBlockKind::Deploy);
            }
            if deploy.verify().is_err() {
                return Err(InvalidBlockKind::Deploy);
            }
        }
        Ok(())
    }

    fn assemble(&self, deploys: &[Deploy]) -> Arc<BlockPayload> {
        Arc::new(BlockPayload {
            deploys: deploys.to_vec(),
        })
    }
}
