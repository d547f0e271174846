//! Test doubles shared between the consensus tests: a manual clock, a deterministic execution
//! engine and payload glue for the test context.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::{
    consensus::{
        dag::{message::Bond, state::tests::TestContext},
        error::InvalidBlockKind,
        traits::{Clock, PayloadOps},
    },
    execution::{
        DeployResult, Effects, EngineError, ExecutionEngine, ProtocolVersion, StoredValue,
        Transform,
    },
    types::{Deploy, DeployHash, TimeDiff, Timestamp},
};

/// A clock whose time is set by hand.
#[derive(Debug, Default)]
pub(crate) struct TestClock {
    now: AtomicU64,
}

impl TestClock {
    pub(crate) fn at(millis: u64) -> Self {
        TestClock {
            now: AtomicU64::new(millis),
        }
    }

    #[allow(dead_code)]
    pub(crate) fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now(&self) -> Timestamp {
        Timestamp::from(self.now.load(Ordering::SeqCst))
    }
}

/// A deterministic execution engine for `TestContext`.
///
/// Executing the payload `v` writes `v` under the key `"value"`; committing such effects yields
/// the post-state `0xF00D_0000 + v`, matching what the test message builder claims. Committing
/// empty effects leaves the state root unchanged. The bonds snapshot is fixed at construction.
#[derive(Debug)]
pub(crate) struct TestEngine {
    bonds: Vec<Bond<u32>>,
}

impl TestEngine {
    pub(crate) fn new(bonds: Vec<Bond<u32>>) -> Self {
        TestEngine { bonds }
    }
}

#[async_trait]
impl ExecutionEngine<TestContext> for TestEngine {
    async fn query(
        &self,
        _state_hash: u64,
        key: String,
        _path: Vec<String>,
        _protocol_version: ProtocolVersion,
    ) -> Result<StoredValue, EngineError> {
        Err(EngineError::Internal(format!("no value under {}", key)))
    }

    async fn commit(
        &self,
        pre_state: u64,
        effects: Effects,
        _protocol_version: ProtocolVersion,
    ) -> Result<(u64, Vec<Bond<u32>>), EngineError> {
        let post_state = match effects.transforms.get("value") {
            Some(Transform::Write(bytes)) => {
                let mut value = [0u8; 4];
                value.copy_from_slice(&bytes[..4]);
                0xF00D_0000 + u64::from(u32::from_le_bytes(value))
            }
            _ => pre_state,
        };
        Ok((post_state, self.bonds.clone()))
    }

    async fn exec(
        &self,
        _pre_state: u64,
        _block_time: Timestamp,
        deploys: u32,
        _protocol_version: ProtocolVersion,
    ) -> Result<Vec<DeployResult>, EngineError> {
        let mut effects = Effects::new();
        effects.transforms.insert(
            "value".to_string(),
            Transform::Write(deploys.to_le_bytes().to_vec()),
        );
        Ok(vec![DeployResult {
            cost: 1,
            is_error: false,
            error_message: None,
            effects,
        }])
    }
}

/// Payload glue for `TestContext`: the payload is a bare `u32` with no deploys inside.
#[derive(Debug, Default)]
pub(crate) struct TestPayloadOps;

impl PayloadOps<TestContext> for TestPayloadOps {
    fn deploy_hashes(&self, _value: &u32) -> Vec<DeployHash> {
        vec![]
    }

    fn validate(
        &self,
        _value: &u32,
        _block_timestamp: Timestamp,
        _min_ttl: TimeDiff,
    ) -> Result<(), InvalidBlockKind> {
        Ok(())
    }

    fn assemble(&self, deploys: &[Deploy]) -> u32 {
        deploys.len() as u32
    }
}
