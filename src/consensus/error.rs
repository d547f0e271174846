use thiserror::Error;

use super::dag::state::MessageError;

/// What exactly made an incoming block invalid. Attributable to the sender.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InvalidBlockKind {
    /// Structurally malformed: empty parents, zero sequence number, ballot parents, bad ranks.
    Shape(MessageError),
    /// The creator's signature does not verify.
    Signature,
    /// The block's timestamp lies too far in the future even after waiting out the drift.
    Timestamp,
    /// The parents cannot be merged: their effects conflict.
    Parents,
    /// The claimed post-state hash or bonds do not match the result of executing the deploys.
    Transaction,
    /// A deploy is expired or otherwise unfit for inclusion.
    Deploy,
    /// The creator is not bonded in the block's era.
    Creator,
}

/// The executor's verdict on an incoming block.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BlockStatus {
    /// Fully validated, executed and stored.
    Valid,
    /// Stored, but its creator equivocated; the sender may be penalized.
    EquivocatedBlock,
    /// The local validator key signed two conflicting messages. Fatal: the caller must terminate
    /// the process rather than publish further messages.
    SelfEquivocatedBlock,
    /// Rejected and stored as invalid, so peers cannot waste our work by re-offering it.
    InvalidBlock(InvalidBlockKind),
    /// A dependency was missing. The downloader delivers blocks in topological order, so this
    /// indicates a bug or a malicious peer.
    MissingBlocks,
    /// The same block is currently being processed by another caller.
    Processing,
    /// The block has been processed before.
    Processed,
}

impl BlockStatus {
    /// Returns `true` if the block ended up stored in the DAG.
    pub fn is_stored(&self) -> bool {
        matches!(self, BlockStatus::Valid | BlockStatus::EquivocatedBlock)
    }
}

/// Errors that travel up to the supervisor, rather than being settled at the executor.
#[derive(Debug, Error)]
pub enum ConsensusError {
    /// A transient storage failure; retriable.
    #[error("storage unavailable: {0}")]
    Storage(String),
    /// A transient execution engine failure; retriable.
    #[error("execution engine unavailable: {0}")]
    ExecutionEngine(String),
    /// The operation was cancelled cooperatively.
    #[error("operation cancelled")]
    Cancelled,
    /// The producer's previous own message is not stored yet; producing now could equivocate.
    #[error("own previous message is not stored yet")]
    OwnMessageNotStored,
    /// The local validator signed two conflicting messages. The process must terminate.
    #[error("this node's validator key equivocated; refusing to continue")]
    SelfEquivocation,
    /// A DAG invariant was violated; indicates data corruption. The process must terminate.
    #[error("DAG invariant violated: {0}")]
    InvariantViolation(String),
}

impl ConsensusError {
    /// Returns `true` if the supervisor must abort the process rather than retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConsensusError::SelfEquivocation | ConsensusError::InvariantViolation(_)
        )
    }
}
