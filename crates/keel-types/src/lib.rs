//! # Keel Types
//!
//! The data model shared by every Keel crate: Ed25519 identities, validator sets with
//! weighted round-robin proposer selection, blocks, votes, proposals, commits and evidence.
//!
//! ## Example
//!
//! ```rust
//! use keel_types::{Keypair, Validator, ValidatorSet};
//!
//! let validators = (0..4)
//!     .map(|i| Validator::new(Keypair::from_seed(i).public_key(), 1))
//!     .collect();
//! let set = ValidatorSet::new(validators).unwrap();
//!
//! // Strictly more than two thirds of 4 is 3.
//! assert_eq!(set.quorum_power(), 3);
//! let round_0 = set.proposer_for_round(0);
//! let round_1 = set.proposer_for_round(1);
//! assert_ne!(round_0.address, round_1.address);
//! ```

/// Implements hex-string serde for a fixed-size byte newtype.
macro_rules! hex_serde {
    ($ty:ident, $len:expr) => {
        impl serde::Serialize for $ty {
            fn serialize<S: serde::Serializer>(
                &self,
                serializer: S,
            ) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&hex::encode(self.0))
            }
        }

        impl<'de> serde::Deserialize<'de> for $ty {
            fn deserialize<D: serde::Deserializer<'de>>(
                deserializer: D,
            ) -> std::result::Result<Self, D::Error> {
                let s = <String as serde::Deserialize>::deserialize(deserializer)?;
                let mut bytes = [0u8; $len];
                hex::decode_to_slice(&s, &mut bytes).map_err(serde::de::Error::custom)?;
                Ok(Self(bytes))
            }
        }
    };
}

mod block;
mod commit;
mod crypto;
mod error;
mod evidence;
mod proposal;
mod round;
mod state;
mod validator;
mod vote;

pub use block::{Block, BlockHeader, BlockId};
pub use commit::Commit;
pub use crypto::{Address, Keypair, PublicKey, Signature};
pub use error::{Result, TypesError};
pub use evidence::DuplicateVoteEvidence;
pub use proposal::{Proposal, SignedProposal};
pub use round::{Height, Round, RoundStep, Step};
pub use state::ChainState;
pub use validator::{Validator, ValidatorSet, MAX_TOTAL_VOTING_POWER};
pub use vote::{SignedVote, Vote, VoteType, VoteValue};
