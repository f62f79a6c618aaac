//! Evidence of validator misbehaviour.

use crate::crypto::PublicKey;
use crate::error::{Result, TypesError};
use crate::round::{Height, Round};
use crate::vote::{SignedVote, VoteType};
use serde::{Deserialize, Serialize};

/// Two conflicting signed votes from the same validator for the same (height, round, type).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateVoteEvidence {
    /// The vote that was tallied first.
    pub vote_a: SignedVote,
    /// The conflicting vote.
    pub vote_b: SignedVote,
    /// The offender's voting power.
    pub validator_power: u64,
    /// Total voting power of the set at that height.
    pub total_power: u64,
}

impl DuplicateVoteEvidence {
    /// Height of the offence.
    pub fn height(&self) -> Height {
        self.vote_a.vote.height
    }

    /// Round of the offence.
    pub fn round(&self) -> Round {
        self.vote_a.vote.round
    }

    /// Vote type of the offence.
    pub fn vote_type(&self) -> VoteType {
        self.vote_a.vote.vote_type
    }

    /// Checks that both votes are validly signed by `pub_key` and genuinely conflict.
    pub fn verify(&self, chain_id: &str, pub_key: &PublicKey) -> Result<()> {
        let a = &self.vote_a.vote;
        let b = &self.vote_b.vote;
        if a.validator_address != pub_key.address() || b.validator_address != a.validator_address
        {
            return Err(TypesError::InvalidEvidence("votes from different validators".into()));
        }
        if a.height != b.height || a.round != b.round || a.vote_type != b.vote_type {
            return Err(TypesError::InvalidEvidence(
                "votes are for different positions".into(),
            ));
        }
        if a.value == b.value {
            return Err(TypesError::InvalidEvidence("votes do not conflict".into()));
        }
        self.vote_a.verify(chain_id, pub_key)?;
        self.vote_b.verify(chain_id, pub_key)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockId;
    use crate::crypto::Keypair;
    use crate::vote::{Vote, VoteValue};

    fn vote(kp: &Keypair, value: VoteValue) -> SignedVote {
        Vote {
            vote_type: VoteType::Prevote,
            height: 2,
            round: 0,
            value,
            validator_address: kp.address(),
            validator_index: 1,
        }
        .sign("c", kp)
    }

    #[test]
    fn test_conflicting_votes_are_evidence() {
        let kp = Keypair::from_seed(9);
        let evidence = DuplicateVoteEvidence {
            vote_a: vote(&kp, VoteValue::Nil),
            vote_b: vote(&kp, VoteValue::Block(BlockId::from_bytes([1; 32]))),
            validator_power: 1,
            total_power: 4,
        };
        assert!(evidence.verify("c", &kp.public_key()).is_ok());
        assert_eq!(evidence.height(), 2);
        assert_eq!(evidence.vote_type(), VoteType::Prevote);
    }

    #[test]
    fn test_identical_votes_are_not_evidence() {
        let kp = Keypair::from_seed(9);
        let v = vote(&kp, VoteValue::Nil);
        let evidence = DuplicateVoteEvidence {
            vote_a: v.clone(),
            vote_b: v,
            validator_power: 1,
            total_power: 4,
        };
        assert!(evidence.verify("c", &kp.public_key()).is_err());
    }
}
