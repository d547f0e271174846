use std::fmt::{self, Debug, Display, Formatter};

use datasize::DataSize;
use hex_fmt::HexFmt;
use serde::{Deserialize, Serialize};

use crate::{
    crypto::{
        self,
        hash::{self, Digest},
        PublicKey, SecretKey, Signature,
    },
    types::{TimeDiff, Timestamp},
};

/// The cryptographic hash of a deploy.
#[derive(
    Copy, Clone, DataSize, Default, Ord, PartialOrd, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
pub struct DeployHash(Digest);

impl DeployHash {
    /// Constructs a new `DeployHash`.
    pub fn new(hash: Digest) -> Self {
        DeployHash(hash)
    }

    /// Returns the wrapped inner hash.
    pub fn inner(&self) -> &Digest {
        &self.0
    }
}

impl Debug for DeployHash {
    fn fmt(&self, formatter: &mut Formatter) -> fmt::Result {
        write!(formatter, "{:?}", self.0)
    }
}

impl Display for DeployHash {
    fn fmt(&self, formatter: &mut Formatter) -> fmt::Result {
        write!(formatter, "deploy-hash({:10})", HexFmt(self.0.as_ref()))
    }
}

/// The header portion of a deploy.
#[derive(Clone, DataSize, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct DeployHeader {
    /// The account that submitted the deploy.
    pub account: PublicKey,
    /// When the deploy was created.
    pub timestamp: Timestamp,
    /// How long the deploy stays valid, counted from `timestamp`.
    pub ttl: TimeDiff,
    /// Price per gas unit the account is willing to pay.
    pub gas_price: u64,
    /// Hashes of deploys that must be processed before this one.
    pub dependencies: Vec<DeployHash>,
}

impl DeployHeader {
    /// Returns the timestamp after which the deploy is no longer valid for inclusion.
    pub fn expires(&self) -> Timestamp {
        self.timestamp + self.ttl
    }
}

/// A deploy: a signed item of work for the execution engine, submitted by a client.
#[derive(Clone, DataSize, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Deploy {
    hash: DeployHash,
    header: DeployHeader,
    /// Serialized session code and arguments, opaque to consensus.
    body: Vec<u8>,
    approval: Signature,
}

impl Deploy {
    /// Constructs a new signed `Deploy`.
    pub fn new(
        header: DeployHeader,
        body: Vec<u8>,
        secret_key: &SecretKey,
        public_key: &PublicKey,
    ) -> Self {
        let serialized_header = bincode::serialize(&header).expect("serialize deploy header");
        let mut preimage = serialized_header;
        preimage.extend_from_slice(&body);
        let hash = DeployHash::new(hash::hash(&preimage));
        let approval = crypto::sign(hash.inner(), secret_key, public_key);
        Deploy {
            hash,
            header,
            body,
            approval,
        }
    }

    /// Returns the hash identifying this deploy.
    pub fn id(&self) -> &DeployHash {
        &self.hash
    }

    /// Returns the deploy header.
    pub fn header(&self) -> &DeployHeader {
        &self.header
    }

    /// Returns the opaque deploy body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Returns `true` if the deploy has expired at `block_timestamp`, i.e. it can no longer be
    /// included in a block with that timestamp.
    pub fn has_expired(&self, block_timestamp: Timestamp) -> bool {
        self.header.expires() < block_timestamp
    }

    /// Verifies the approval signature against the deploy hash.
    pub fn verify(&self) -> crypto::Result<()> {
        crypto::verify(self.hash.inner(), &self.approval, &self.header.account)
    }
}

impl Display for Deploy {
    fn fmt(&self, formatter: &mut Formatter) -> fmt::Result {
        write!(formatter, "deploy({})", self.hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed_deploy(rng: &mut crate::NodeRng) -> Deploy {
        let secret_key = SecretKey::random(rng);
        let public_key = PublicKey::from(&secret_key);
        let header = DeployHeader {
            account: public_key,
            timestamp: Timestamp::from(1_000),
            ttl: TimeDiff::from(3_600_000),
            gas_price: 1,
            dependencies: vec![],
        };
        Deploy::new(header, b"session".to_vec(), &secret_key, &public_key)
    }

    #[test]
    fn deploy_signature_verifies() {
        let mut rng = crate::new_rng();
        let deploy = signed_deploy(&mut rng);
        assert!(deploy.verify().is_ok());
    }

    #[test]
    fn deploy_expiry() {
        let mut rng = crate::new_rng();
        let deploy = signed_deploy(&mut rng);
        assert!(!deploy.has_expired(Timestamp::from(3_601_000)));
        assert!(deploy.has_expired(Timestamp::from(3_601_001)));
    }
}
