//! Errors raised while constructing or verifying Keel data types.

use thiserror::Error;

/// Errors that can occur while building or checking core types.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypesError {
    /// A public key could not be decoded.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// A secret key could not be decoded.
    #[error("invalid secret key")]
    InvalidSecretKey,

    /// A signature did not verify.
    #[error("invalid signature")]
    InvalidSignature,

    /// The validator set violates one of its construction rules.
    #[error("invalid validator set: {0}")]
    InvalidValidatorSet(String),

    /// A commit does not justify its block.
    #[error("invalid commit: {0}")]
    InvalidCommit(String),

    /// Evidence does not prove misbehaviour.
    #[error("invalid evidence: {0}")]
    InvalidEvidence(String),
}

/// A specialized Result type for type-level operations.
pub type Result<T> = std::result::Result<T, TypesError>;
