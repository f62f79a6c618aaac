//! Consensus error types.

use crate::wal::WalError;
use keel_types::{Address, Height, Round, RoundStep, TypesError, VoteType};
use thiserror::Error;

/// Errors that stop the consensus engine or prevent it from starting.
#[derive(Debug, Error)]
pub enum ConsensusError {
    /// The write-ahead log failed.
    #[error("wal error: {0}")]
    Wal(#[from] WalError),

    /// A data-model invariant was violated.
    #[error(transparent)]
    Types(#[from] TypesError),

    /// The application failed to execute a decided block.
    #[error("application error: {0}")]
    Application(String),

    /// The gossip layer refused a message.
    #[error("gossip error: {0}")]
    Gossip(String),

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    Config(String),

    /// Invalid genesis document.
    #[error("invalid genesis: {0}")]
    Genesis(String),

    /// Replaying the log did not reproduce the recorded round steps.
    #[error("replay mismatch: log says {logged}, state machine is at {actual}")]
    ReplayMismatch {
        /// Step recorded in the log.
        logged: RoundStep,
        /// Step reconstructed by replay.
        actual: String,
    },

    /// The log holds entries for a height the engine cannot be at.
    #[error("log entry for height {found} while starting at height {expected}")]
    ReplayHeight {
        /// Height the engine starts at.
        expected: Height,
        /// Height found in the log.
        found: Height,
    },

    /// I/O failure outside the log.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The engine's input channel closed.
    #[error("engine stopped")]
    Stopped,
}

/// A specialized Result type for consensus operations.
pub type Result<T> = std::result::Result<T, ConsensusError>;

/// Reasons a vote is rejected by a vote set.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VoteError {
    /// The vote is for another height.
    #[error("wrong height: expected {expected}, got {got}")]
    WrongHeight {
        /// Height of the vote set.
        expected: Height,
        /// Height of the vote.
        got: Height,
    },

    /// The vote is for another round.
    #[error("wrong round: expected {expected}, got {got}")]
    WrongRound {
        /// Round of the vote set.
        expected: Round,
        /// Round of the vote.
        got: Round,
    },

    /// The vote is for another step.
    #[error("wrong vote type: expected {expected}, got {got}")]
    WrongType {
        /// Type of the vote set.
        expected: VoteType,
        /// Type of the vote.
        got: VoteType,
    },

    /// The round is too far ahead of the current one.
    #[error("round {round} beyond limit {limit}")]
    RoundTooFar {
        /// Round of the vote.
        round: Round,
        /// Highest round accepted.
        limit: Round,
    },

    /// The signer is not in the validator set.
    #[error("unknown validator {0}")]
    UnknownValidator(Address),

    /// The vote's index does not match the signer's position.
    #[error("validator {address} is at index {actual}, vote claims {claimed}")]
    IndexMismatch {
        /// Signer address.
        address: Address,
        /// Index claimed by the vote.
        claimed: u32,
        /// Index in the validator set.
        actual: usize,
    },

    /// The signature does not verify.
    #[error("invalid signature")]
    InvalidSignature,
}
