//! Block proposals.

use crate::block::{Block, BlockId};
use crate::crypto::{Keypair, PublicKey, Signature};
use crate::error::Result;
use crate::round::{Height, Round};
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

const PROPOSAL_DOMAIN: &[u8] = b"KEEL:PROPOSAL:";

/// A proposal for one round. `pol_round` names the round whose +2/3 prevotes justify
/// re-proposing a locked block; `None` means no proof-of-lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    /// Height.
    pub height: Height,
    /// Round.
    pub round: Round,
    /// Proof-of-lock round, if any. Always lower than `round`.
    pub pol_round: Option<Round>,
    /// The proposed block.
    pub block: Block,
}

impl Proposal {
    /// Creates a proposal.
    pub fn new(height: Height, round: Round, pol_round: Option<Round>, block: Block) -> Self {
        Self {
            height,
            round,
            pol_round,
            block,
        }
    }

    /// Returns the proposed block's ID.
    pub fn block_id(&self) -> BlockId {
        self.block.id()
    }

    /// Returns the bytes signed by the proposer. The block is covered through its ID.
    pub fn sign_bytes(&self, chain_id: &str) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(PROPOSAL_DOMAIN.len() + chain_id.len() + 56);
        buf.put_slice(PROPOSAL_DOMAIN);
        buf.put_u16_le(chain_id.len() as u16);
        buf.put_slice(chain_id.as_bytes());
        buf.put_u64_le(self.height);
        buf.put_u32_le(self.round);
        match self.pol_round {
            None => buf.put_u8(0),
            Some(r) => {
                buf.put_u8(1);
                buf.put_u32_le(r);
            }
        }
        buf.put_slice(self.block_id().as_bytes());
        buf.to_vec()
    }

    /// Signs the proposal.
    pub fn sign(self, chain_id: &str, keypair: &Keypair) -> SignedProposal {
        let signature = keypair.sign(&self.sign_bytes(chain_id));
        SignedProposal {
            proposal: self,
            signature,
        }
    }
}

/// A proposal with the proposer's signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedProposal {
    /// The proposal.
    pub proposal: Proposal,
    /// Signature over `proposal.sign_bytes(chain_id)`.
    pub signature: Signature,
}

impl SignedProposal {
    /// Verifies the signature against the expected proposer's key.
    pub fn verify(&self, chain_id: &str, pub_key: &PublicKey) -> Result<()> {
        pub_key.verify(&self.proposal.sign_bytes(chain_id), &self.signature)
    }
}
