//! Consensus messages exchanged between validators.
//!
//! Messages travel on three logical channels so a transport can prioritise votes over
//! block data:
//! - [`Channel::Data`]: proposals (carrying the full block) and decided blocks
//! - [`Channel::Vote`]: prevotes and precommits
//! - [`Channel::VoteSetBits`]: summaries of which votes a node holds

use bitvec::prelude::{BitVec, Lsb0};
use bytes::Bytes;
use keel_types::{Commit, Height, Round, SignedProposal, SignedVote, VoteType};
use serde::{Deserialize, Serialize};

/// Channel ID for proposals.
pub const DATA_CHANNEL: u8 = 0x21;

/// Channel ID for votes.
pub const VOTE_CHANNEL: u8 = 0x22;

/// Channel ID for vote set bits.
pub const VOTE_SET_BITS_CHANNEL: u8 = 0x23;

/// Logical channel a message travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Proposals.
    Data,
    /// Votes.
    Vote,
    /// Vote set bits.
    VoteSetBits,
}

impl Channel {
    /// Returns the wire identifier.
    pub fn id(&self) -> u8 {
        match self {
            Channel::Data => DATA_CHANNEL,
            Channel::Vote => VOTE_CHANNEL,
            Channel::VoteSetBits => VOTE_SET_BITS_CHANNEL,
        }
    }
}

/// Consensus message types exchanged between validators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusMessage {
    /// A signed block proposal.
    Proposal(SignedProposal),

    /// A signed prevote or precommit.
    Vote(SignedVote),

    /// Which votes the sender holds for one (height, round, type).
    VoteSetBits(VoteSetBits),

    /// A decided block with its precommits, for a peer still deciding that height.
    Commit(Commit),
}

impl ConsensusMessage {
    /// Encodes the message to bytes.
    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    /// Decodes a message from bytes.
    pub fn decode(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// Returns the message type as a string for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ConsensusMessage::Proposal(_) => "proposal",
            ConsensusMessage::Vote(v) => v.vote.vote_type.as_str(),
            ConsensusMessage::VoteSetBits(_) => "vote_set_bits",
            ConsensusMessage::Commit(_) => "commit",
        }
    }

    /// Returns the channel this message travels on.
    pub fn channel(&self) -> Channel {
        match self {
            ConsensusMessage::Proposal(_) | ConsensusMessage::Commit(_) => Channel::Data,
            ConsensusMessage::Vote(_) => Channel::Vote,
            ConsensusMessage::VoteSetBits(_) => Channel::VoteSetBits,
        }
    }

    /// Returns the height the message refers to.
    pub fn height(&self) -> Height {
        match self {
            ConsensusMessage::Proposal(p) => p.proposal.height,
            ConsensusMessage::Vote(v) => v.vote.height,
            ConsensusMessage::VoteSetBits(b) => b.height,
            ConsensusMessage::Commit(c) => c.height,
        }
    }
}

/// A bit per validator stating whether the sender holds that validator's vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteSetBits {
    /// Height.
    pub height: Height,
    /// Round.
    pub round: Round,
    /// Prevotes or precommits.
    pub vote_type: VoteType,
    /// One bit per validator, in validator-set order.
    pub votes: BitVec<u8, Lsb0>,
}
