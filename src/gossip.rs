//! The gossip service contract.
//!
//! Gossip, peer discovery and rate limiting live outside the consensus core; this trait is what
//! the core relies on. The downloader behind it guarantees topological delivery: a block's
//! parents and justifications arrive before the block itself.

use std::collections::BTreeSet;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::{
    consensus::{dag::message::SignedWireMessage, traits::Context},
    types::{Deploy, DeployHash},
};

/// A peer or network failure; retried under the configured backoff.
#[derive(Debug, Error)]
#[error("gossip error: {0}")]
pub struct GossipError(pub String);

/// A block header without its body, as exchanged during synchronization.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockSummary<C: Context> {
    /// The block's hash.
    pub hash: C::Hash,
    /// The creator, or `None` for genesis.
    pub creator: Option<C::ValidatorId>,
    /// Depth in the justification-induced partial order.
    pub j_rank: u64,
    /// The era the block belongs to, if any.
    pub era_id: Option<C::InstanceId>,
}

/// The gossip service interface.
#[async_trait]
pub trait GossipService<C: Context>: Send + Sync {
    /// Returns whether the peer has the block.
    async fn has_block(&self, hash: &C::Hash) -> Result<bool, GossipError>;

    /// Returns the block's summary.
    async fn get_block_summary(&self, hash: &C::Hash)
        -> Result<Option<BlockSummary<C>>, GossipError>;

    /// Returns the full block; with `exclude_bodies` only the header data is populated.
    async fn get_block(
        &self,
        hash: &C::Hash,
        exclude_bodies: bool,
    ) -> Result<Option<SignedWireMessage<C>>, GossipError>;

    /// Streams the requested deploys.
    async fn get_deploys(
        &self,
        hashes: Vec<DeployHash>,
    ) -> Result<BoxStream<'static, Result<Deploy, GossipError>>, GossipError>;

    /// Returns the peer's latest message per validator.
    async fn latest_messages(
        &self,
    ) -> Result<BTreeSet<(C::ValidatorId, C::Hash)>, GossipError>;

    /// Streams the peer's block summaries with `start_rank <= j_rank < end_rank`, in rank order.
    async fn dag_topo_sort(
        &self,
        start_rank: u64,
        end_rank: u64,
    ) -> Result<BoxStream<'static, Result<BlockSummary<C>, GossipError>>, GossipError>;
}
