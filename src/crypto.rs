//! Cryptographic types and functions.

pub(crate) mod asymmetric_key;
mod error;
pub mod hash;

pub use asymmetric_key::{generate_ed25519_keypair, sign, verify, PublicKey, SecretKey, Signature};
pub use error::Error;
pub(crate) use error::Result;
