//! Vote tallies for a single (height, round, vote type).

use crate::error::VoteError;
use bitvec::prelude::{BitVec, Lsb0};
use keel_types::{
    DuplicateVoteEvidence, Height, Round, SignedVote, ValidatorSet, VoteType, VoteValue,
};
use std::collections::HashMap;
use std::sync::Arc;

/// One bit per validator, in validator-set order.
pub type VoteBits = BitVec<u8, Lsb0>;

/// Outcome of adding a vote to a [`VoteSet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddVoteResult {
    /// The vote was new and has been tallied.
    Added,
    /// The same vote was already tallied.
    Duplicate,
    /// The validator already voted for a different value. The tally is unchanged.
    Conflicting(Box<DuplicateVoteEvidence>),
    /// The vote was rejected.
    Invalid(VoteError),
}

/// Accumulates signed votes and tracks quorum outcomes.
///
/// At most one vote per validator is tallied. A second, conflicting vote never replaces the
/// first; it produces evidence instead.
#[derive(Debug, Clone)]
pub struct VoteSet {
    chain_id: Arc<str>,
    height: Height,
    round: Round,
    vote_type: VoteType,
    validators: Arc<ValidatorSet>,
    votes: Vec<Option<SignedVote>>,
    bits: VoteBits,
    sum: u64,
    power_by_value: HashMap<VoteValue, u64>,
    majority: Option<VoteValue>,
}

impl VoteSet {
    /// Creates an empty vote set.
    pub fn new(
        chain_id: Arc<str>,
        height: Height,
        round: Round,
        vote_type: VoteType,
        validators: Arc<ValidatorSet>,
    ) -> Self {
        let n = validators.len();
        Self {
            chain_id,
            height,
            round,
            vote_type,
            validators,
            votes: vec![None; n],
            bits: VoteBits::repeat(false, n),
            sum: 0,
            power_by_value: HashMap::new(),
            majority: None,
        }
    }

    /// Height of the set.
    pub fn height(&self) -> Height {
        self.height
    }

    /// Round of the set.
    pub fn round(&self) -> Round {
        self.round
    }

    /// Vote type of the set.
    pub fn vote_type(&self) -> VoteType {
        self.vote_type
    }

    /// Adds a vote, verifying its signature and signer.
    pub fn add_vote(&mut self, signed: SignedVote) -> AddVoteResult {
        let vote = &signed.vote;
        if vote.height != self.height {
            return AddVoteResult::Invalid(VoteError::WrongHeight {
                expected: self.height,
                got: vote.height,
            });
        }
        if vote.round != self.round {
            return AddVoteResult::Invalid(VoteError::WrongRound {
                expected: self.round,
                got: vote.round,
            });
        }
        if vote.vote_type != self.vote_type {
            return AddVoteResult::Invalid(VoteError::WrongType {
                expected: self.vote_type,
                got: vote.vote_type,
            });
        }

        let Some((index, validator)) = self.validators.get_by_address(&vote.validator_address)
        else {
            return AddVoteResult::Invalid(VoteError::UnknownValidator(vote.validator_address));
        };
        if index as u32 != vote.validator_index {
            return AddVoteResult::Invalid(VoteError::IndexMismatch {
                address: vote.validator_address,
                claimed: vote.validator_index,
                actual: index,
            });
        }
        let power = validator.voting_power;

        if let Some(existing) = &self.votes[index] {
            if existing.vote.value == vote.value {
                return AddVoteResult::Duplicate;
            }
            if signed.verify(&self.chain_id, &validator.pub_key).is_err() {
                return AddVoteResult::Invalid(VoteError::InvalidSignature);
            }
            return AddVoteResult::Conflicting(Box::new(DuplicateVoteEvidence {
                vote_a: existing.clone(),
                vote_b: signed,
                validator_power: power,
                total_power: self.validators.total_power(),
            }));
        }

        if signed.verify(&self.chain_id, &validator.pub_key).is_err() {
            return AddVoteResult::Invalid(VoteError::InvalidSignature);
        }

        let value = vote.value;
        self.votes[index] = Some(signed);
        self.bits.set(index, true);
        self.sum += power;
        let for_value = self.power_by_value.entry(value).or_default();
        *for_value += power;
        if self.majority.is_none() && self.validators.is_two_thirds(*for_value) {
            self.majority = Some(value);
        }
        AddVoteResult::Added
    }

    /// The value holding strictly more than two thirds of the power, if any.
    pub fn two_thirds_majority(&self) -> Option<VoteValue> {
        self.majority
    }

    /// Whether votes for any mix of values hold strictly more than two thirds of the power.
    pub fn has_two_thirds_any(&self) -> bool {
        self.validators.is_two_thirds(self.sum)
    }

    /// Whether votes for any mix of values hold strictly more than one third of the power.
    pub fn has_one_third_any(&self) -> bool {
        self.validators.is_one_third(self.sum)
    }

    /// Total power of tallied votes.
    pub fn sum(&self) -> u64 {
        self.sum
    }

    /// Power of tallied votes for `value`.
    pub fn power_for(&self, value: &VoteValue) -> u64 {
        self.power_by_value.get(value).copied().unwrap_or(0)
    }

    /// Which validators have voted.
    pub fn bit_array(&self) -> VoteBits {
        self.bits.clone()
    }

    /// Which validators have voted for `value`.
    pub fn bit_array_for(&self, value: &VoteValue) -> VoteBits {
        self.votes
            .iter()
            .map(|v| v.as_ref().is_some_and(|v| &v.vote.value == value))
            .collect()
    }

    /// The tallied votes for `value`, in validator order.
    pub fn votes_for(&self, value: &VoteValue) -> Vec<SignedVote> {
        self.votes
            .iter()
            .flatten()
            .filter(|v| &v.vote.value == value)
            .cloned()
            .collect()
    }

    /// The vote tallied for the validator at `index`.
    pub fn get(&self, index: usize) -> Option<&SignedVote> {
        self.votes.get(index).and_then(Option::as_ref)
    }

    /// All tallied votes, in validator order.
    pub fn votes(&self) -> impl Iterator<Item = &SignedVote> {
        self.votes.iter().flatten()
    }

    /// Tallied votes whose bit is not set in `peer`.
    pub fn missing_from(&self, peer: &VoteBits) -> Vec<SignedVote> {
        self.votes
            .iter()
            .enumerate()
            .filter(|(i, _)| !peer.get(*i).is_some_and(|b| *b))
            .filter_map(|(_, v)| v.clone())
            .collect()
    }
}
