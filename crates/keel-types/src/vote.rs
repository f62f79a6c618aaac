//! Prevotes and precommits.

use crate::block::BlockId;
use crate::crypto::{Address, Keypair, PublicKey, Signature};
use crate::error::Result;
use crate::round::{Height, Round};
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Domain separator for vote sign bytes.
const VOTE_DOMAIN: &[u8] = b"KEEL:VOTE:";

/// The two voting steps of a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum VoteType {
    /// First voting step.
    Prevote,
    /// Second voting step.
    Precommit,
}

impl VoteType {
    /// Returns the vote type name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteType::Prevote => "prevote",
            VoteType::Precommit => "precommit",
        }
    }

    fn tag(&self) -> u8 {
        match self {
            VoteType::Prevote => 1,
            VoteType::Precommit => 2,
        }
    }
}

impl fmt::Display for VoteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a vote is for: a specific block, or nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum VoteValue {
    /// No block.
    Nil,
    /// A specific block.
    Block(BlockId),
}

impl VoteValue {
    /// Returns the block ID, if any.
    pub fn block_id(&self) -> Option<BlockId> {
        match self {
            VoteValue::Nil => None,
            VoteValue::Block(id) => Some(*id),
        }
    }

    /// Returns true for nil.
    pub fn is_nil(&self) -> bool {
        matches!(self, VoteValue::Nil)
    }
}

impl fmt::Display for VoteValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoteValue::Nil => f.write_str("nil"),
            VoteValue::Block(id) => write!(f, "{}", id.short()),
        }
    }
}

/// An unsigned vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Vote {
    /// Prevote or precommit.
    pub vote_type: VoteType,
    /// Height voted at.
    pub height: Height,
    /// Round voted at.
    pub round: Round,
    /// Block or nil.
    pub value: VoteValue,
    /// Address of the voter.
    pub validator_address: Address,
    /// Position of the voter in the validator set.
    pub validator_index: u32,
}

impl Vote {
    /// Returns the bytes signed for this vote under `chain_id`.
    pub fn sign_bytes(&self, chain_id: &str) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(VOTE_DOMAIN.len() + chain_id.len() + 80);
        buf.put_slice(VOTE_DOMAIN);
        buf.put_u16_le(chain_id.len() as u16);
        buf.put_slice(chain_id.as_bytes());
        buf.put_u8(self.vote_type.tag());
        buf.put_u64_le(self.height);
        buf.put_u32_le(self.round);
        match self.value {
            VoteValue::Nil => buf.put_u8(0),
            VoteValue::Block(id) => {
                buf.put_u8(1);
                buf.put_slice(id.as_bytes());
            }
        }
        buf.put_slice(self.validator_address.as_bytes());
        buf.put_u32_le(self.validator_index);
        buf.to_vec()
    }

    /// Signs the vote.
    pub fn sign(self, chain_id: &str, keypair: &Keypair) -> SignedVote {
        let signature = keypair.sign(&self.sign_bytes(chain_id));
        SignedVote {
            vote: self,
            signature,
        }
    }
}

impl fmt::Display for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{} {} by {}",
            self.vote_type,
            self.height,
            self.round,
            self.value,
            self.validator_address.short()
        )
    }
}

/// A vote together with the voter's signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignedVote {
    /// The vote.
    pub vote: Vote,
    /// Signature over `vote.sign_bytes(chain_id)`.
    pub signature: Signature,
}

impl SignedVote {
    /// Verifies the signature against the voter's key.
    pub fn verify(&self, chain_id: &str, pub_key: &PublicKey) -> Result<()> {
        pub_key.verify(&self.vote.sign_bytes(chain_id), &self.signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vote(value: VoteValue) -> Vote {
        let kp = Keypair::from_seed(0);
        Vote {
            vote_type: VoteType::Prevote,
            height: 3,
            round: 1,
            value,
            validator_address: kp.address(),
            validator_index: 0,
        }
    }

    #[test]
    fn test_signed_vote_verifies() {
        let kp = Keypair::from_seed(0);
        let signed = vote(VoteValue::Nil).sign("keel-test", &kp);
        assert!(signed.verify("keel-test", &kp.public_key()).is_ok());
        assert!(signed.verify("other-chain", &kp.public_key()).is_err());
        assert!(signed
            .verify("keel-test", &Keypair::from_seed(1).public_key())
            .is_err());
    }

    #[test]
    fn test_sign_bytes_distinguish_fields() {
        let nil = vote(VoteValue::Nil);
        let block = vote(VoteValue::Block(BlockId::from_bytes([0; 32])));
        assert_ne!(nil.sign_bytes("c"), block.sign_bytes("c"));

        let mut precommit = nil;
        precommit.vote_type = VoteType::Precommit;
        assert_ne!(nil.sign_bytes("c"), precommit.sign_bytes("c"));

        let mut later = nil;
        later.round = 2;
        assert_ne!(nil.sign_bytes("c"), later.sign_bytes("c"));
    }

    #[test]
    fn test_tampered_vote_fails() {
        let kp = Keypair::from_seed(0);
        let mut signed = vote(VoteValue::Nil).sign("keel-test", &kp);
        signed.vote.value = VoteValue::Block(BlockId::from_bytes([7; 32]));
        assert!(signed.verify("keel-test", &kp.public_key()).is_err());
    }
}
