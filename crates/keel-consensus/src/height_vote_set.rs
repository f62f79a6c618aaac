//! All vote sets for one height.

use crate::error::VoteError;
use crate::vote_set::{AddVoteResult, VoteBits, VoteSet};
use keel_types::{BlockId, Height, Round, SignedVote, ValidatorSet, VoteType, VoteValue};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
struct RoundVotes {
    prevotes: VoteSet,
    precommits: VoteSet,
}

/// Prevote and precommit sets for every round of a height.
///
/// Sets are created lazily. Votes are accepted for rounds up to
/// `current round + max_future_rounds`; anything further is rejected so a faulty peer cannot
/// allocate unbounded rounds.
#[derive(Debug, Clone)]
pub struct HeightVoteSet {
    chain_id: Arc<str>,
    height: Height,
    validators: Arc<ValidatorSet>,
    round: Round,
    max_future_rounds: u32,
    rounds: BTreeMap<Round, RoundVotes>,
}

impl HeightVoteSet {
    /// Creates the vote sets for `height`, starting at round 0.
    pub fn new(
        chain_id: Arc<str>,
        height: Height,
        validators: Arc<ValidatorSet>,
        max_future_rounds: u32,
    ) -> Self {
        let mut hvs = Self {
            chain_id,
            height,
            validators,
            round: 0,
            max_future_rounds,
            rounds: BTreeMap::new(),
        };
        hvs.ensure_round(0);
        hvs
    }

    /// Height of the sets.
    pub fn height(&self) -> Height {
        self.height
    }

    /// Moves the acceptance window to `round`.
    pub fn set_round(&mut self, round: Round) {
        self.round = round;
        self.ensure_round(round);
    }

    fn ensure_round(&mut self, round: Round) -> &mut RoundVotes {
        let (chain_id, height, validators) = (&self.chain_id, self.height, &self.validators);
        self.rounds.entry(round).or_insert_with(|| RoundVotes {
            prevotes: VoteSet::new(
                chain_id.clone(),
                height,
                round,
                VoteType::Prevote,
                validators.clone(),
            ),
            precommits: VoteSet::new(
                chain_id.clone(),
                height,
                round,
                VoteType::Precommit,
                validators.clone(),
            ),
        })
    }

    /// Adds a vote to the set for its round and type.
    pub fn add_vote(&mut self, vote: SignedVote) -> AddVoteResult {
        if vote.vote.height != self.height {
            return AddVoteResult::Invalid(VoteError::WrongHeight {
                expected: self.height,
                got: vote.vote.height,
            });
        }
        let limit = self.round.saturating_add(self.max_future_rounds);
        if vote.vote.round > limit {
            return AddVoteResult::Invalid(VoteError::RoundTooFar {
                round: vote.vote.round,
                limit,
            });
        }
        let round = self.ensure_round(vote.vote.round);
        match vote.vote.vote_type {
            VoteType::Prevote => round.prevotes.add_vote(vote),
            VoteType::Precommit => round.precommits.add_vote(vote),
        }
    }

    /// Prevotes for `round`, if any have been seen.
    pub fn prevotes(&self, round: Round) -> Option<&VoteSet> {
        self.rounds.get(&round).map(|r| &r.prevotes)
    }

    /// Precommits for `round`, if any have been seen.
    pub fn precommits(&self, round: Round) -> Option<&VoteSet> {
        self.rounds.get(&round).map(|r| &r.precommits)
    }

    /// The vote set for `round` and `vote_type`.
    pub fn votes(&self, round: Round, vote_type: VoteType) -> Option<&VoteSet> {
        match vote_type {
            VoteType::Prevote => self.prevotes(round),
            VoteType::Precommit => self.precommits(round),
        }
    }

    /// The +2/3 prevote majority at `round`, if any.
    pub fn prevote_majority(&self, round: Round) -> Option<VoteValue> {
        self.prevotes(round).and_then(VoteSet::two_thirds_majority)
    }

    /// The +2/3 precommit majority at `round`, if any.
    pub fn precommit_majority(&self, round: Round) -> Option<VoteValue> {
        self.precommits(round).and_then(VoteSet::two_thirds_majority)
    }

    /// The highest round with a +2/3 prevote majority, and its value.
    pub fn pol_round(&self) -> Option<(Round, VoteValue)> {
        self.rounds
            .iter()
            .rev()
            .find_map(|(r, votes)| votes.prevotes.two_thirds_majority().map(|v| (*r, v)))
    }

    /// A round with a +2/3 precommit majority for a block.
    pub fn commit_majority(&self) -> Option<(Round, BlockId)> {
        self.rounds.iter().find_map(|(r, votes)| {
            votes
                .precommits
                .two_thirds_majority()
                .and_then(|v| v.block_id())
                .map(|id| (*r, id))
        })
    }

    /// Rounds above `round` where prevotes or precommits hold more than one third of the power.
    pub fn skip_round_above(&self, round: Round) -> Option<Round> {
        self.rounds
            .range(round.saturating_add(1)..)
            .rev()
            .find(|(_, votes)| {
                votes.prevotes.has_one_third_any() || votes.precommits.has_one_third_any()
            })
            .map(|(r, _)| *r)
    }

    /// Which validators' votes are held for `round` and `vote_type`.
    pub fn bit_array(&self, round: Round, vote_type: VoteType) -> VoteBits {
        self.votes(round, vote_type)
            .map(VoteSet::bit_array)
            .unwrap_or_else(|| VoteBits::repeat(false, self.validators.len()))
    }

    /// Votes held for `round` and `vote_type` that a peer's bits say it lacks.
    pub fn missing_votes(
        &self,
        round: Round,
        vote_type: VoteType,
        peer: &VoteBits,
    ) -> Vec<SignedVote> {
        self.votes(round, vote_type)
            .map(|set| set.missing_from(peer))
            .unwrap_or_default()
    }
}
