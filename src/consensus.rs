//! The consensus component: the block-DAG, the finality detector, and the state machines that
//! produce and validate messages.
//!
//! The component is generic over a [`Context`](traits::Context), which bundles the hash,
//! signature and payload types; [`ChainContext`](chain_context::ChainContext) is the production
//! instantiation over Blake2b-256 digests and Ed25519 keys. Tests use a lightweight context with
//! arithmetic signatures instead.

#[macro_use]
pub mod dag;

pub mod chain_context;
pub mod config;
pub mod era;
pub mod era_supervisor;
pub mod error;
pub mod finality;
pub mod message_executor;
pub mod message_producer;
pub mod metrics;
pub mod protocols;
pub mod traits;

pub use chain_context::{BlockPayload, ChainContext, ChainPayloadOps, Keypair};
pub use config::{ChainSpec, Config, HighwayConfig};
pub use error::{BlockStatus, ConsensusError, InvalidBlockKind};
pub use era_supervisor::{EraSupervisor, ProtocolOutcome};
pub use finality::{FinalityDetector, FinalityOutcome, FinalizedBlock};
pub use message_executor::{ConsensusEvent, MessageExecutor};
pub use message_producer::MessageProducer;
