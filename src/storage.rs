//! The storage façade: the interfaces the consensus core uses to persist blocks, eras and
//! deploys, plus an in-memory implementation used in tests.
//!
//! Real storage is an external collaborator; these traits are its contract. All writes on the
//! block path happen under the message-adding permit, so implementations need to be transactional
//! at the block level but not beyond.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

use crate::{
    consensus::{
        dag::{message::SignedWireMessage, state::FinalityStatus},
        era::Era,
        traits::Context,
    },
    execution::Effects,
    types::{Deploy, DeployHash, Timestamp},
};

/// A storage failure. Transient; callers retry under backoff.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The storage backend is unavailable.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    /// The stored data is corrupt.
    #[error("storage corruption: {0}")]
    Corruption(String),
}

/// Block storage: signed messages with their execution effects and finality status.
#[async_trait]
pub trait BlockStorage<C: Context>: Send + Sync {
    /// Atomically stores a block together with its effects. `deploy_hashes` are the deploys in
    /// the block's payload, supplied by the caller since the payload is opaque to storage; they
    /// feed the deploy-to-block index.
    async fn put_block(
        &self,
        message: SignedWireMessage<C>,
        effects: Effects,
        deploy_hashes: Vec<DeployHash>,
    ) -> Result<(), StorageError>;

    /// Returns the block with the given hash, if stored.
    async fn get_block(&self, hash: &C::Hash) -> Result<Option<SignedWireMessage<C>>, StorageError>;

    /// Returns the stored effects of the given block.
    async fn get_block_effects(&self, hash: &C::Hash) -> Result<Option<Effects>, StorageError>;

    /// Returns the hashes of all stored blocks whose serialized hash starts with `prefix`.
    async fn get_blocks_by_prefix(&self, prefix: &[u8]) -> Result<Vec<C::Hash>, StorageError>;

    /// Returns the hashes of all stored blocks containing the given deploy.
    async fn get_blocks_by_deploy(
        &self,
        deploy_hash: &DeployHash,
    ) -> Result<Vec<C::Hash>, StorageError>;

    /// Records a block's finality decision.
    async fn put_finality_status(
        &self,
        hash: &C::Hash,
        status: FinalityStatus,
    ) -> Result<(), StorageError>;

    /// Returns a block's recorded finality decision.
    async fn get_finality_status(
        &self,
        hash: &C::Hash,
    ) -> Result<Option<FinalityStatus>, StorageError>;
}

/// Era storage, highway mode only.
#[async_trait]
pub trait EraStorage<C: Context>: Send + Sync {
    /// Stores an era.
    async fn add_era(&self, era: Era<C>) -> Result<(), StorageError>;

    /// Returns the era keyed by the given key block hash.
    async fn get_era(&self, key_block_hash: &C::InstanceId) -> Result<Option<Era<C>>, StorageError>;

    /// Returns the key block hashes of the eras whose parent is the given era.
    async fn era_children(
        &self,
        parent_key_block_hash: &C::InstanceId,
    ) -> Result<Vec<C::InstanceId>, StorageError>;
}

/// The consensus-facing view of the deploy mempool.
#[async_trait]
pub trait DeployStorage: Send + Sync {
    /// Adds a deploy to the pending set.
    async fn add_deploy(&self, deploy: Deploy) -> Result<(), StorageError>;

    /// Returns pending deploys valid for inclusion in a block at `block_timestamp`.
    async fn pending_deploys(
        &self,
        block_timestamp: Timestamp,
        max: usize,
    ) -> Result<Vec<Deploy>, StorageError>;

    /// Marks deploys as included in a stored block; they stop being offered for inclusion.
    async fn mark_processed(&self, hashes: &[DeployHash]) -> Result<(), StorageError>;

    /// Returns deploys from orphaned blocks to the pending set.
    async fn requeue(&self, hashes: &[DeployHash]) -> Result<(), StorageError>;

    /// Drops deploys contained in finalized blocks for good.
    async fn remove_finalized(&self, hashes: &[DeployHash]) -> Result<(), StorageError>;
}

/// An in-memory implementation of the storage façade, used in tests and local runs.
#[derive(Debug)]
pub struct InMemStorage<C: Context> {
    blocks: Mutex<HashMap<C::Hash, (SignedWireMessage<C>, Effects)>>,
    deploy_index: Mutex<HashMap<DeployHash, Vec<C::Hash>>>,
    finality: Mutex<HashMap<C::Hash, FinalityStatus>>,
    eras: Mutex<HashMap<C::InstanceId, Era<C>>>,
    pending: Mutex<HashMap<DeployHash, Deploy>>,
    processed: Mutex<BTreeSet<DeployHash>>,
}

impl<C: Context> Default for InMemStorage<C> {
    fn default() -> Self {
        InMemStorage {
            blocks: Mutex::new(HashMap::new()),
            deploy_index: Mutex::new(HashMap::new()),
            finality: Mutex::new(HashMap::new()),
            eras: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            processed: Mutex::new(BTreeSet::new()),
        }
    }
}

impl<C: Context> InMemStorage<C> {
    /// Creates an empty in-memory storage.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl<C: Context> BlockStorage<C> for InMemStorage<C> {
    async fn put_block(
        &self,
        message: SignedWireMessage<C>,
        effects: Effects,
        deploy_hashes: Vec<DeployHash>,
    ) -> Result<(), StorageError> {
        let hash = message.hash();
        let mut index = self.deploy_index.lock();
        for deploy_hash in deploy_hashes {
            index.entry(deploy_hash).or_default().push(hash.clone());
        }
        drop(index);
        self.blocks.lock().insert(hash, (message, effects));
        Ok(())
    }

    async fn get_block(&self, hash: &C::Hash) -> Result<Option<SignedWireMessage<C>>, StorageError> {
        Ok(self.blocks.lock().get(hash).map(|(message, _)| message.clone()))
    }

    async fn get_block_effects(&self, hash: &C::Hash) -> Result<Option<Effects>, StorageError> {
        Ok(self.blocks.lock().get(hash).map(|(_, effects)| effects.clone()))
    }

    async fn get_blocks_by_prefix(&self, prefix: &[u8]) -> Result<Vec<C::Hash>, StorageError> {
        let blocks = self.blocks.lock();
        let mut matches = Vec::new();
        for hash in blocks.keys() {
            let serialized = bincode::serialize(hash)
                .map_err(|error| StorageError::Corruption(error.to_string()))?;
            if serialized.starts_with(prefix) {
                matches.push(hash.clone());
            }
        }
        Ok(matches)
    }

    async fn get_blocks_by_deploy(
        &self,
        deploy_hash: &DeployHash,
    ) -> Result<Vec<C::Hash>, StorageError> {
        Ok(self
            .deploy_index
            .lock()
            .get(deploy_hash)
            .cloned()
            .unwrap_or_default())
    }

    async fn put_finality_status(
        &self,
        hash: &C::Hash,
        status: FinalityStatus,
    ) -> Result<(), StorageError> {
        self.finality.lock().insert(hash.clone(), status);
        Ok(())
    }

    async fn get_finality_status(
        &self,
        hash: &C::Hash,
    ) -> Result<Option<FinalityStatus>, StorageError> {
        Ok(self.finality.lock().get(hash).copied())
    }
}

#[async_trait]
impl<C: Context> EraStorage<C> for InMemStorage<C> {
    async fn add_era(&self, era: Era<C>) -> Result<(), StorageError> {
        self.eras.lock().insert(era.key_block_hash.clone(), era);
        Ok(())
    }

    async fn get_era(&self, key_block_hash: &C::InstanceId) -> Result<Option<Era<C>>, StorageError> {
        Ok(self.eras.lock().get(key_block_hash).cloned())
    }

    async fn era_children(
        &self,
        parent_key_block_hash: &C::InstanceId,
    ) -> Result<Vec<C::InstanceId>, StorageError> {
        Ok(self
            .eras
            .lock()
            .values()
            .filter(|era| era.parent_key_block_hash.as_ref() == Some(parent_key_block_hash))
            .map(|era| era.key_block_hash.clone())
            .collect())
    }
}

#[async_trait]
impl<C: Context> DeployStorage for InMemStorage<C> {
    async fn add_deploy(&self, deploy: Deploy) -> Result<(), StorageError> {
        self.pending.lock().insert(*deploy.id(), deploy);
        Ok(())
    }

    async fn pending_deploys(
        &self,
        block_timestamp: Timestamp,
        max: usize,
    ) -> Result<Vec<Deploy>, StorageError> {
        let processed = self.processed.lock();
        Ok(self
            .pending
            .lock()
            .values()
            .filter(|deploy| !deploy.has_expired(block_timestamp))
            .filter(|deploy| !processed.contains(deploy.id()))
            .take(max)
            .cloned()
            .collect())
    }

    async fn mark_processed(&self, hashes: &[DeployHash]) -> Result<(), StorageError> {
        self.processed.lock().extend(hashes.iter().copied());
        Ok(())
    }

    async fn requeue(&self, hashes: &[DeployHash]) -> Result<(), StorageError> {
        let mut processed = self.processed.lock();
        for hash in hashes {
            processed.remove(hash);
        }
        Ok(())
    }

    async fn remove_finalized(&self, hashes: &[DeployHash]) -> Result<(), StorageError> {
        let mut pending = self.pending.lock();
        for hash in hashes {
            pending.remove(hash);
        }
        Ok(())
    }
}
