use std::io;

use thiserror::Error;

/// Cryptographic errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Error resulting from creating or using asymmetric key types.
    #[error("asymmetric key error: {0}")]
    AsymmetricKey(String),

    /// Error trying to decode a hex-encoded value.
    #[error("parsing from hex: {0}")]
    FromHex(#[from] hex::FromHexError),

    /// Error trying to read a secret key.
    #[error("secret key load failed: {0}")]
    SecretKeyLoad(io::Error),

    /// Error trying to read a public key.
    #[error("public key load failed: {0}")]
    PublicKeyLoad(io::Error),

    /// Signature verification failure.
    #[error("signature error: {0}")]
    SignatureError(#[from] ed25519_dalek::SignatureError),
}

/// A specialized `std::result::Result` type for cryptographic errors.
pub(crate) type Result<T> = std::result::Result<T, Error>;
