//! The execution engine contract.
//!
//! The engine is an external collaborator: consensus never interprets global state itself, it
//! only ships deploys to the engine and compares the returned post-state root and bonds against
//! a block's claims. The [`Effects`] type is shared with storage so that merges can check
//! whether two branches commute without re-executing them.

use std::collections::BTreeMap;

use async_trait::async_trait;
use datasize::DataSize;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    consensus::{dag::message::Bond, traits::Context},
    types::Timestamp,
};

/// The protocol version under which a deploy is executed.
#[derive(
    Copy, Clone, DataSize, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize,
)]
pub struct ProtocolVersion(pub u32);

/// The initial protocol version.
pub const PROTOCOL_V1: ProtocolVersion = ProtocolVersion(1);

/// A single change to a global-state key.
#[derive(Clone, DataSize, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Transform {
    /// No change; reading the key is still a dependency.
    Identity,
    /// Overwrites the value under the key.
    Write(Vec<u8>),
    /// Adds to a numeric value under the key.
    AddInt(i64),
}

impl Transform {
    /// Returns whether applying `self` and `other` in either order yields the same state.
    fn commutes_with(&self, other: &Transform) -> bool {
        match (self, other) {
            (Transform::Identity, _) | (_, Transform::Identity) => true,
            (Transform::AddInt(_), Transform::AddInt(_)) => true,
            _ => false,
        }
    }
}

/// The accumulated effects of executing deploys: a transform per touched global-state key.
#[derive(Clone, DataSize, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Effects {
    /// Transforms by global-state key.
    pub transforms: BTreeMap<String, Transform>,
}

impl Effects {
    /// Returns empty effects.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether the two effect sets commute: every key touched by both must carry
    /// commuting transforms.
    pub fn commutes_with(&self, other: &Effects) -> bool {
        self.transforms.iter().all(|(key, transform)| {
            other
                .transforms
                .get(key)
                .map_or(true, |theirs| transform.commutes_with(theirs))
        })
    }

    /// Merges `other` into `self`. The caller must have checked `commutes_with` first; on a
    /// conflict the later write wins.
    pub fn merge(&mut self, other: Effects) {
        for (key, transform) in other.transforms {
            match (self.transforms.get_mut(&key), transform) {
                (Some(Transform::AddInt(mine)), Transform::AddInt(theirs)) => *mine += theirs,
                (Some(Transform::Identity), theirs) => {
                    self.transforms.insert(key, theirs);
                }
                (Some(_), Transform::Identity) => {}
                (_, theirs) => {
                    self.transforms.insert(key, theirs);
                }
            }
        }
    }
}

/// The outcome of executing a single deploy.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeployResult {
    /// Gas spent.
    pub cost: u64,
    /// Set if the deploy's execution failed; a failed deploy still pays and still produces
    /// (error-path) effects.
    pub is_error: bool,
    /// Human-readable error, if any.
    pub error_message: Option<String>,
    /// The transforms staged by this deploy.
    pub effects: Effects,
}

/// A value read from global state; opaque to consensus.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct StoredValue(pub Vec<u8>);

/// Errors surfaced by the execution engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The given pre-state root is unknown.
    #[error("pre-state root not found: {0}")]
    RootNotFound(String),
    /// The engine is temporarily unreachable; retriable.
    #[error("execution engine unavailable: {0}")]
    Unavailable(String),
    /// An internal engine failure.
    #[error("execution engine error: {0}")]
    Internal(String),
}

/// The execution engine interface.
///
/// `deploys` is the block payload; the engine resolves and runs the deploys named in it.
#[async_trait]
pub trait ExecutionEngine<C: Context>: Send + Sync {
    /// Reads a value under `key` at the given state root.
    async fn query(
        &self,
        state_hash: C::Hash,
        key: String,
        path: Vec<String>,
        protocol_version: ProtocolVersion,
    ) -> Result<StoredValue, EngineError>;

    /// Applies `effects` on top of `pre_state` and returns the new state root and the bonds
    /// recorded in it.
    async fn commit(
        &self,
        pre_state: C::Hash,
        effects: Effects,
        protocol_version: ProtocolVersion,
    ) -> Result<(C::Hash, Vec<Bond<C::ValidatorId>>), EngineError>;

    /// Executes the payload's deploys against `pre_state` and returns one result per deploy.
    async fn exec(
        &self,
        pre_state: C::Hash,
        block_time: Timestamp,
        deploys: C::ConsensusValue,
        protocol_version: ProtocolVersion,
    ) -> Result<Vec<DeployResult>, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disjoint_writes_commute() {
        let mut left = Effects::new();
        left.transforms
            .insert("a".to_string(), Transform::Write(vec![1]));
        let mut right = Effects::new();
        right
            .transforms
            .insert("b".to_string(), Transform::Write(vec![2]));
        assert!(left.commutes_with(&right));

        left.merge(right.clone());
        assert_eq!(2, left.transforms.len());
    }

    #[test]
    fn conflicting_writes_do_not_commute() {
        let mut left = Effects::new();
        left.transforms
            .insert("a".to_string(), Transform::Write(vec![1]));
        let mut right = Effects::new();
        right
            .transforms
            .insert("a".to_string(), Transform::Write(vec![2]));
        assert!(!left.commutes_with(&right));
    }

    #[test]
    fn additions_commute_and_accumulate() {
        let mut left = Effects::new();
        left.transforms
            .insert("n".to_string(), Transform::AddInt(2));
        let mut right = Effects::new();
        right
            .transforms
            .insert("n".to_string(), Transform::AddInt(3));
        assert!(left.commutes_with(&right));
        left.merge(right);
        assert_eq!(Some(&Transform::AddInt(5)), left.transforms.get("n"));
    }
}
