//! Commits: a block together with the +2/3 precommits that decided it.

use crate::block::Block;
use crate::error::{Result, TypesError};
use crate::round::{Height, Round};
use crate::validator::ValidatorSet;
use crate::vote::{SignedVote, VoteType, VoteValue};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A decided block and its justification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    /// Height of the decision.
    pub height: Height,
    /// Round in which the precommits were cast.
    pub round: Round,
    /// The decided block.
    pub block: Block,
    /// Precommits for the block, one per signer.
    pub precommits: Vec<SignedVote>,
}

impl Commit {
    /// Checks that the precommits carry strictly more than two thirds of `validators`' power
    /// for this block at this height and round.
    pub fn verify(&self, chain_id: &str, validators: &ValidatorSet) -> Result<()> {
        if self.block.height() != self.height {
            return Err(TypesError::InvalidCommit(format!(
                "block height {} does not match commit height {}",
                self.block.height(),
                self.height
            )));
        }

        let expected = VoteValue::Block(self.block.id());
        let mut seen = HashSet::new();
        let mut power: u64 = 0;

        for signed in &self.precommits {
            let vote = &signed.vote;
            if vote.vote_type != VoteType::Precommit
                || vote.height != self.height
                || vote.round != self.round
                || vote.value != expected
            {
                return Err(TypesError::InvalidCommit(format!("unexpected vote {vote}")));
            }
            let (index, validator) = validators
                .get_by_address(&vote.validator_address)
                .ok_or_else(|| {
                    TypesError::InvalidCommit(format!(
                        "unknown signer {}",
                        vote.validator_address
                    ))
                })?;
            if index as u32 != vote.validator_index {
                return Err(TypesError::InvalidCommit(format!(
                    "signer {} has index {index}, vote says {}",
                    vote.validator_address, vote.validator_index
                )));
            }
            if !seen.insert(vote.validator_address) {
                return Err(TypesError::InvalidCommit(format!(
                    "duplicate signer {}",
                    vote.validator_address
                )));
            }
            signed.verify(chain_id, &validator.pub_key)?;
            power += validator.voting_power;
        }

        if !validators.is_two_thirds(power) {
            return Err(TypesError::InvalidCommit(format!(
                "insufficient power {power} of {}",
                validators.total_power()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockId;
    use crate::crypto::Keypair;
    use crate::validator::Validator;
    use crate::vote::Vote;

    const CHAIN: &str = "keel-test";

    fn setup() -> (Vec<Keypair>, ValidatorSet, Block) {
        let keys: Vec<Keypair> = (0..4).map(Keypair::from_seed).collect();
        let set = ValidatorSet::new(
            keys.iter()
                .map(|k| Validator::new(k.public_key(), 1))
                .collect(),
        )
        .unwrap();
        let block = Block::new(1, BlockId::GENESIS_PARENT, keys[0].address(), 0, vec![], [0; 32]);
        (keys, set, block)
    }

    fn precommit(set: &ValidatorSet, key: &Keypair, block: &Block) -> SignedVote {
        let (index, _) = set.get_by_address(&key.address()).unwrap();
        Vote {
            vote_type: VoteType::Precommit,
            height: 1,
            round: 0,
            value: VoteValue::Block(block.id()),
            validator_address: key.address(),
            validator_index: index as u32,
        }
        .sign(CHAIN, key)
    }

    #[test]
    fn test_commit_with_quorum_verifies() {
        let (keys, set, block) = setup();
        let precommits = keys[..3].iter().map(|k| precommit(&set, k, &block)).collect();
        let commit = Commit {
            height: 1,
            round: 0,
            block,
            precommits,
        };
        assert!(commit.verify(CHAIN, &set).is_ok());
    }

    #[test]
    fn test_commit_without_quorum_fails() {
        let (keys, set, block) = setup();
        let precommits = keys[..2].iter().map(|k| precommit(&set, k, &block)).collect();
        let commit = Commit {
            height: 1,
            round: 0,
            block,
            precommits,
        };
        assert!(matches!(
            commit.verify(CHAIN, &set),
            Err(TypesError::InvalidCommit(msg)) if msg.contains("insufficient")
        ));
    }

    #[test]
    fn test_commit_rejects_duplicate_signers() {
        let (keys, set, block) = setup();
        let vote = precommit(&set, &keys[0], &block);
        let commit = Commit {
            height: 1,
            round: 0,
            block,
            precommits: vec![vote.clone(), vote.clone(), vote],
        };
        assert!(commit.verify(CHAIN, &set).is_err());
    }
}
