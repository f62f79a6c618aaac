//! Interfaces to the engine's collaborators.
//!
//! The engine never talks to a transport, an executor or a store directly. A node plugs in
//! implementations of these traits; [`crate::local`] and [`crate::application`] provide
//! in-process ones for devnets and tests.

use crate::error::Result;
use crate::message::ConsensusMessage;
use async_trait::async_trait;
use keel_types::{Address, Block, ChainState, Commit, DuplicateVoteEvidence, Height};
use parking_lot::Mutex;
use std::sync::Arc;

/// Peer-to-peer message dissemination.
#[async_trait]
pub trait Gossip: Send + Sync {
    /// Sends `message` to every peer.
    async fn broadcast(&self, message: ConsensusMessage) -> Result<()>;

    /// Sends `message` to one peer.
    async fn send_to(&self, peer: Address, message: ConsensusMessage) -> Result<()>;
}

/// The replicated application.
#[async_trait]
pub trait Application: Send + Sync {
    /// Builds a block to propose on top of `state`, or `None` when there is nothing to propose.
    async fn create_candidate_block(&self, state: &ChainState, proposer: Address)
        -> Option<Block>;

    /// Whether `block` may be voted for on top of `state`.
    async fn validate_block(&self, state: &ChainState, block: &Block) -> bool;

    /// Executes a decided block and returns the state for the next height.
    ///
    /// After a crash the same commit can be delivered again. Implementations must then return
    /// the state they produced the first time instead of executing twice.
    async fn apply_block(&self, state: &ChainState, commit: &Commit) -> Result<ChainState>;

    /// Highest height executed so far.
    fn last_height(&self) -> Height;
}

/// Receives proof that a validator signed conflicting votes.
pub trait EvidenceSink: Send + Sync {
    /// Records `evidence`.
    fn report(&self, evidence: DuplicateVoteEvidence);
}

/// Keeps reported evidence in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryEvidence {
    reported: Arc<Mutex<Vec<DuplicateVoteEvidence>>>,
}

impl MemoryEvidence {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything reported so far.
    pub fn reported(&self) -> Vec<DuplicateVoteEvidence> {
        self.reported.lock().clone()
    }
}

impl EvidenceSink for MemoryEvidence {
    fn report(&self, evidence: DuplicateVoteEvidence) {
        tracing::warn!(
            height = evidence.height(),
            round = evidence.round(),
            validator = %evidence.vote_a.vote.validator_address,
            "validator equivocated"
        );
        let mut reported = self.reported.lock();
        if !reported.contains(&evidence) {
            reported.push(evidence);
        }
    }
}
