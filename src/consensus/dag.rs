//! The block-DAG and the indexes the consensus core maintains over it.
//!
//! Messages (blocks and ballots) are content-addressed and append-only. On top of the raw store
//! this module keeps the reverse child index, the per-validator swimlanes used by the
//! equivocation detector, and the topological index used to stream messages in justification
//! order.

#[cfg(test)]
#[macro_use]
pub(crate) mod test_macros;

pub mod equivocation;
pub mod fork_choice;
pub mod message;
pub mod state;
pub mod validators;
pub mod weight;

pub use message::{Bond, Message, SignedWireMessage, WireMessage};
pub use state::{AddOutcome, DagState, FinalityStatus, MessageError, SharedDag};
pub use validators::{Validator, ValidatorIndex, ValidatorMap, Validators};
pub use weight::Weight;
