//! The validated chain state consensus builds on.

use crate::block::BlockId;
use crate::commit::Commit;
use crate::error::{Result, TypesError};
use crate::round::Height;
use crate::validator::ValidatorSet;
use serde::{Deserialize, Serialize};

/// The last decided block and the validator set for the next height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainState {
    /// Chain identifier, part of every signature.
    pub chain_id: String,
    /// Height of the last decided block (0 before the first block).
    pub last_height: Height,
    /// ID of the last decided block.
    pub last_block_id: BlockId,
    /// Application hash after executing the last decided block.
    pub app_hash: [u8; 32],
    /// Validators for `last_height + 1`.
    pub validators: ValidatorSet,
}

impl ChainState {
    /// State before the first block.
    pub fn genesis(chain_id: impl Into<String>, validators: ValidatorSet) -> Self {
        Self {
            chain_id: chain_id.into(),
            last_height: 0,
            last_block_id: BlockId::GENESIS_PARENT,
            app_hash: [0u8; 32],
            validators,
        }
    }

    /// The height consensus should decide next.
    pub fn next_height(&self) -> Height {
        self.last_height + 1
    }

    /// Produces the state after `commit`. Proposer priorities advance by one increment so the
    /// rotation continues at the next height.
    pub fn advance(&self, commit: &Commit, app_hash: [u8; 32]) -> Result<Self> {
        if commit.height != self.next_height() {
            return Err(TypesError::InvalidCommit(format!(
                "commit for height {} applied to state at height {}",
                commit.height, self.last_height
            )));
        }
        if commit.block.parent() != self.last_block_id {
            return Err(TypesError::InvalidCommit(format!(
                "block parent {} does not extend {}",
                commit.block.parent().short(),
                self.last_block_id.short()
            )));
        }
        Ok(Self {
            chain_id: self.chain_id.clone(),
            last_height: commit.height,
            last_block_id: commit.block.id(),
            app_hash,
            validators: self.validators.copy_increment_proposer_priority(1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Block;
    use crate::crypto::Keypair;
    use crate::validator::Validator;

    fn state() -> ChainState {
        let set = ValidatorSet::new(
            (0..3)
                .map(|i| Validator::new(Keypair::from_seed(i).public_key(), 1))
                .collect(),
        )
        .unwrap();
        ChainState::genesis("keel-test", set)
    }

    #[test]
    fn test_advance_moves_height_and_rotation() {
        let s0 = state();
        let block = Block::new(1, s0.last_block_id, Keypair::from_seed(0).address(), 0, vec![], [0; 32]);
        let commit = Commit {
            height: 1,
            round: 0,
            block: block.clone(),
            precommits: vec![],
        };
        let s1 = s0.advance(&commit, [9; 32]).unwrap();
        assert_eq!(s1.last_height, 1);
        assert_eq!(s1.next_height(), 2);
        assert_eq!(s1.last_block_id, block.id());
        assert_eq!(s1.app_hash, [9; 32]);
        assert_eq!(
            s1.validators.proposer().address,
            s0.validators.proposer_for_round(1).address
        );
    }

    #[test]
    fn test_advance_rejects_wrong_height_or_parent() {
        let s0 = state();
        let addr = Keypair::from_seed(0).address();
        let wrong_height = Commit {
            height: 2,
            round: 0,
            block: Block::new(2, s0.last_block_id, addr, 0, vec![], [0; 32]),
            precommits: vec![],
        };
        assert!(s0.advance(&wrong_height, [0; 32]).is_err());

        let wrong_parent = Commit {
            height: 1,
            round: 0,
            block: Block::new(1, BlockId::from_bytes([3; 32]), addr, 0, vec![], [0; 32]),
            precommits: vec![],
        };
        assert!(s0.advance(&wrong_parent, [0; 32]).is_err());
    }
}
