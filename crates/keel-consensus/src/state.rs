//! The per-height consensus state machine.
//!
//! [`ConsensusState`] is sans-IO and deterministic: it consumes [`Event`]s and returns the
//! [`Action`]s the driver must perform, in order. It never sleeps, signs only through its own
//! key, and never talks to the network, the application or the log. Feeding the same events
//! to a fresh machine reproduces the same actions, which is what log replay relies on.
//!
//! One machine decides one height. The driver builds a new machine for the next height from
//! the [`ChainState`] returned by the application.
//!
//! # Rules
//!
//! - `NewHeight` ends with its timeout and round 0 begins.
//! - On entering `Propose(r)` the proposer re-proposes its locked block, or asks for a
//!   candidate block. Everyone arms the propose timeout.
//! - A valid proposal for the current round makes the node prevote: the block when it holds
//!   no lock, when it is locked on the same block, or when the proposal's proof-of-lock round
//!   is newer than the lock and shows +2/3 prevotes for the block. Otherwise nil.
//! - +2/3 prevotes for a known block lock it and precommit it. +2/3 prevotes for nil or an
//!   unknown block release an older lock and precommit nil. Without a majority (prevote
//!   timeout) the node precommits nil and keeps its lock.
//! - +2/3 precommits for a block at any round decide the height. A peer that already decided
//!   the height may hand over the block with its precommits, which decides it as well.
//! - +2/3 precommits for nil, or the precommit timeout, start the next round.
//! - More than 1/3 of the power voting at a higher round makes the node jump to that round.

use crate::config::ConsensusConfig;
use crate::height_vote_set::HeightVoteSet;
use crate::message::{ConsensusMessage, VoteSetBits};
use crate::timeout::TimeoutInfo;
use crate::vote_set::AddVoteResult;
use keel_types::{
    Address, Block, BlockId, ChainState, Commit, DuplicateVoteEvidence, Height, Keypair,
    Proposal, Round, RoundStep, SignedProposal, SignedVote, Step, ValidatorSet, Vote, VoteType,
    VoteValue,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// A proposal, received or our own.
    Proposal(SignedProposal),
    /// A vote, received or our own.
    Vote(SignedVote),
    /// A step timeout fired.
    Timeout(TimeoutInfo),
    /// The application's answer to [`Action::RequestBlock`].
    CandidateBlock {
        /// Height the block was requested for.
        height: Height,
        /// Round the block was requested for.
        round: Round,
        /// The candidate, or `None` when the application has nothing to propose.
        block: Option<Block>,
    },
    /// A decision for this height, received from a peer that already made it.
    Commit(Commit),
}

impl Event {
    /// Height the event refers to.
    pub fn height(&self) -> Height {
        match self {
            Event::Proposal(p) => p.proposal.height,
            Event::Vote(v) => v.vote.height,
            Event::Timeout(t) => t.height,
            Event::CandidateBlock { height, .. } => *height,
            Event::Commit(c) => c.height,
        }
    }

    /// Event type for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Proposal(_) => "proposal",
            Event::Vote(_) => "vote",
            Event::Timeout(_) => "timeout",
            Event::CandidateBlock { .. } => "candidate_block",
            Event::Commit(_) => "commit",
        }
    }
}

/// Outputs of the state machine, to be executed in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send a message to all peers.
    Broadcast(ConsensusMessage),
    /// Arm a step timeout.
    ScheduleTimeout(TimeoutInfo),
    /// Ask the application for a block to propose.
    RequestBlock {
        /// Height.
        height: Height,
        /// Round.
        round: Round,
    },
    /// The height is decided.
    Commit(Commit),
    /// A validator equivocated.
    Evidence(DuplicateVoteEvidence),
    /// The machine moved to a new step.
    StepChanged {
        /// Height.
        height: Height,
        /// Round.
        round: Round,
        /// Step.
        step: Step,
    },
    /// The machine jumped ahead because peers are voting in a later round.
    RoundSkipped {
        /// Round left.
        from: Round,
        /// Round entered.
        to: Round,
    },
}

/// A read-only snapshot of the machine for observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoundStatus {
    /// Height being decided.
    pub height: Height,
    /// Current round.
    pub round: Round,
    /// Current step.
    pub step: Step,
    /// Lock round and locked block.
    pub locked: Option<(Round, BlockId)>,
    /// Block proposed in the current round.
    pub proposal: Option<BlockId>,
    /// Last decided height and block.
    pub last_commit: Option<(Height, BlockId)>,
}

#[derive(Debug, Clone)]
struct LockedValue {
    round: Round,
    block_id: BlockId,
    block: Block,
}

/// Consensus state for one height.
pub struct ConsensusState {
    config: ConsensusConfig,
    chain: ChainState,
    chain_id: Arc<str>,
    validators: Arc<ValidatorSet>,
    keypair: Option<Keypair>,
    own_index: Option<u32>,

    height: Height,
    round: Round,
    step: Step,

    votes: HeightVoteSet,
    proposals: BTreeMap<Round, SignedProposal>,
    blocks: HashMap<BlockId, Block>,
    locked: Option<LockedValue>,
    awaiting_block: Option<Round>,
    commit_target: Option<(Round, BlockId)>,
    decision: Option<Commit>,
}

impl ConsensusState {
    /// Creates the machine for `chain.next_height()`. Without a keypair, or with a key
    /// outside the validator set, the machine follows the protocol without voting.
    pub fn new(config: ConsensusConfig, chain: ChainState, keypair: Option<Keypair>) -> Self {
        let height = chain.next_height();
        let chain_id: Arc<str> = chain.chain_id.as_str().into();
        let validators = Arc::new(chain.validators.clone());
        let own_index = keypair
            .as_ref()
            .and_then(|kp| validators.get_by_address(&kp.address()))
            .map(|(index, _)| index as u32);
        let votes = HeightVoteSet::new(
            chain_id.clone(),
            height,
            validators.clone(),
            config.max_future_rounds,
        );

        Self {
            config,
            chain,
            chain_id,
            validators,
            keypair,
            own_index,
            height,
            round: 0,
            step: Step::NewHeight,
            votes,
            proposals: BTreeMap::new(),
            blocks: HashMap::new(),
            locked: None,
            awaiting_block: None,
            commit_target: None,
            decision: None,
        }
    }

    /// Height being decided.
    pub fn height(&self) -> Height {
        self.height
    }

    /// Current round.
    pub fn round(&self) -> Round {
        self.round
    }

    /// Current step.
    pub fn step(&self) -> Step {
        self.step
    }

    /// Current (height, round, step).
    pub fn round_step(&self) -> RoundStep {
        RoundStep::new(self.height, self.round, self.step)
    }

    /// The chain state this height builds on.
    pub fn chain(&self) -> &ChainState {
        &self.chain
    }

    /// The validator set for this height.
    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    /// Our address, when we have a key.
    pub fn own_address(&self) -> Option<Address> {
        self.keypair.as_ref().map(Keypair::address)
    }

    /// Whether we vote at this height.
    pub fn is_validator(&self) -> bool {
        self.own_index.is_some()
    }

    /// All votes seen at this height.
    pub fn votes(&self) -> &HeightVoteSet {
        &self.votes
    }

    /// The decision, once made.
    pub fn decision(&self) -> Option<&Commit> {
        self.decision.as_ref()
    }

    /// The proposer for `round` at this height.
    pub fn proposer(&self, round: Round) -> Address {
        self.validators.proposer_for_round(round).address
    }

    /// Snapshot for observers.
    pub fn status(&self) -> RoundStatus {
        RoundStatus {
            height: self.height,
            round: self.round,
            step: self.step,
            locked: self.locked.as_ref().map(|l| (l.round, l.block_id)),
            proposal: self
                .proposals
                .get(&self.round)
                .map(|p| p.proposal.block_id()),
            last_commit: (self.chain.last_height > 0)
                .then_some((self.chain.last_height, self.chain.last_block_id)),
        }
    }

    /// Which votes we hold for `round` and `vote_type`.
    pub fn vote_set_bits(&self, round: Round, vote_type: VoteType) -> VoteSetBits {
        VoteSetBits {
            height: self.height,
            round,
            vote_type,
            votes: self.votes.bit_array(round, vote_type),
        }
    }

    /// Begins the height: enters `NewHeight` and arms its timeout.
    pub fn start(&mut self) -> Vec<Action> {
        let mut out = Vec::new();
        self.step = Step::NewHeight;
        self.step_changed(&mut out);
        self.schedule(Step::NewHeight, 0, &mut out);
        out
    }

    /// Processes one event.
    pub fn handle(&mut self, event: Event) -> Vec<Action> {
        let mut out = Vec::new();
        if self.decision.is_some() {
            tracing::trace!(height = self.height, kind = event.kind(), "height decided, ignoring event");
            return out;
        }
        match event {
            Event::Proposal(proposal) => self.on_proposal(proposal, &mut out),
            Event::Vote(vote) => self.on_vote(vote, &mut out),
            Event::Timeout(timeout) => self.on_timeout(timeout, &mut out),
            Event::CandidateBlock {
                height,
                round,
                block,
            } => self.on_candidate_block(height, round, block, &mut out),
            Event::Commit(commit) => self.on_decided_elsewhere(commit, &mut out),
        }
        out
    }

    fn on_proposal(&mut self, signed: SignedProposal, out: &mut Vec<Action>) {
        let proposal = &signed.proposal;
        if proposal.height != self.height {
            tracing::debug!(
                height = self.height,
                proposal_height = proposal.height,
                "dropping proposal for another height"
            );
            return;
        }
        let replaces = match self.proposals.get(&proposal.round) {
            None => false,
            Some(known) if known.proposal.block_id() == proposal.block_id() => return,
            // A second proposal for the round only matters once its block is being committed.
            Some(_) if self.is_commit_target(&proposal.block_id()) => true,
            Some(_) => {
                tracing::debug!(
                    height = self.height,
                    round = proposal.round,
                    "ignoring second proposal for round"
                );
                return;
            }
        };
        if let Err(reason) = self.check_proposal(&signed) {
            tracing::warn!(
                height = self.height,
                round = proposal.round,
                %reason,
                "dropping invalid proposal"
            );
            return;
        }

        let round = proposal.round;
        let block_id = proposal.block_id();
        tracing::debug!(
            height = self.height,
            round,
            block_id = %block_id.short(),
            pol_round = ?proposal.pol_round,
            "received proposal"
        );
        self.blocks.insert(block_id, proposal.block.clone());
        self.proposals.insert(round, signed);
        if replaces {
            tracing::warn!(
                height = self.height,
                round,
                block_id = %block_id.short(),
                "proposer sent conflicting proposals, keeping the committed one"
            );
        }

        if self.step == Step::Commit {
            self.try_finalize(out);
            return;
        }
        if round == self.round && self.step == Step::Propose {
            self.enter_prevote(round, out);
        }
    }

    fn is_commit_target(&self, block_id: &BlockId) -> bool {
        self.commit_target.is_some_and(|(_, target)| target == *block_id)
    }

    fn check_proposal(&self, signed: &SignedProposal) -> Result<(), String> {
        let proposal = &signed.proposal;
        let limit = self.round.saturating_add(self.config.max_future_rounds);
        if proposal.round > limit {
            return Err(format!("round {} beyond limit {limit}", proposal.round));
        }
        if let Some(pol) = proposal.pol_round {
            if pol >= proposal.round {
                return Err(format!(
                    "pol round {pol} not below round {}",
                    proposal.round
                ));
            }
        }
        let proposer = self.validators.proposer_for_round(proposal.round);
        signed
            .verify(&self.chain_id, &proposer.pub_key)
            .map_err(|_| format!("not signed by proposer {}", proposer.address.short()))?;

        let block = &proposal.block;
        if block.height() != self.height {
            return Err(format!("block height {}", block.height()));
        }
        if block.parent() != self.chain.last_block_id {
            return Err(format!("block parent {}", block.parent().short()));
        }
        if !block.verify_tx_root() {
            return Err("transaction root mismatch".into());
        }
        Ok(())
    }

    fn on_decided_elsewhere(&mut self, commit: Commit, out: &mut Vec<Action>) {
        if commit.height != self.height {
            return;
        }
        let block = &commit.block;
        let checked = commit
            .verify(&self.chain_id, &self.validators)
            .map_err(|e| e.to_string())
            .and_then(|()| {
                if block.parent() != self.chain.last_block_id {
                    Err(format!("block parent {}", block.parent().short()))
                } else if !block.verify_tx_root() {
                    Err("transaction root mismatch".into())
                } else {
                    Ok(())
                }
            });
        if let Err(reason) = checked {
            tracing::warn!(height = self.height, %reason, "dropping invalid commit");
            return;
        }

        let block_id = block.id();
        tracing::info!(
            height = self.height,
            commit_round = commit.round,
            block_id = %block_id.short(),
            "height decided by peers"
        );
        self.blocks.insert(block_id, block.clone());
        if self.step != Step::Commit {
            self.step = Step::Commit;
            self.step_changed(out);
        }
        self.commit_target = Some((commit.round, block_id));
        self.decision = Some(commit.clone());
        out.push(Action::Commit(commit));
    }

    fn on_vote(&mut self, vote: SignedVote, out: &mut Vec<Action>) {
        let round = vote.vote.round;
        let vote_type = vote.vote.vote_type;
        match self.votes.add_vote(vote) {
            AddVoteResult::Added => {}
            AddVoteResult::Duplicate => return,
            AddVoteResult::Conflicting(evidence) => {
                tracing::warn!(
                    height = self.height,
                    round,
                    vote_type = %vote_type,
                    validator = %evidence.vote_a.vote.validator_address.short(),
                    "validator equivocated"
                );
                out.push(Action::Evidence(*evidence));
                return;
            }
            AddVoteResult::Invalid(err) => {
                tracing::debug!(height = self.height, round, error = %err, "dropping invalid vote");
                return;
            }
        }
        match vote_type {
            VoteType::Prevote => self.on_prevote_added(round, out),
            VoteType::Precommit => self.on_precommit_added(round, out),
        }
    }

    fn on_prevote_added(&mut self, round: Round, out: &mut Vec<Action>) {
        if let (Some(majority), Some(lock)) = (self.votes.prevote_majority(round), &self.locked) {
            if lock.round < round
                && round <= self.round
                && majority != VoteValue::Block(lock.block_id)
            {
                tracing::info!(
                    height = self.height,
                    lock_round = lock.round,
                    pol_round = round,
                    "unlocking on newer proof-of-lock"
                );
                self.locked = None;
            }
        }

        if round > self.round {
            self.try_skip_round(out);
        } else if round == self.round {
            self.advance_current_round(out);
        }
    }

    fn on_precommit_added(&mut self, round: Round, out: &mut Vec<Action>) {
        if let Some(VoteValue::Block(block_id)) = self.votes.precommit_majority(round) {
            self.enter_commit(round, block_id, out);
            return;
        }
        if round > self.round {
            self.try_skip_round(out);
        } else if round == self.round {
            self.advance_current_round(out);
        }
    }

    fn on_timeout(&mut self, timeout: TimeoutInfo, out: &mut Vec<Action>) {
        if timeout.position() != self.round_step() {
            tracing::trace!(
                timeout = %timeout.position(),
                current = %self.round_step(),
                "ignoring stale timeout"
            );
            return;
        }
        tracing::debug!(
            height = self.height,
            round = self.round,
            step = %self.step,
            "timeout"
        );
        let round = self.round;
        match timeout.step {
            Step::NewHeight => self.enter_new_round(0, out),
            Step::Propose => self.enter_prevote(round, out),
            Step::Prevote => {
                out.push(Action::Broadcast(ConsensusMessage::VoteSetBits(
                    self.vote_set_bits(round, VoteType::Prevote),
                )));
                self.enter_precommit(round, out);
            }
            Step::Precommit => {
                out.push(Action::Broadcast(ConsensusMessage::VoteSetBits(
                    self.vote_set_bits(round, VoteType::Precommit),
                )));
                self.enter_new_round(round + 1, out);
            }
            Step::Commit => {
                if let Some((commit_round, _)) = self.commit_target {
                    tracing::debug!(
                        height = self.height,
                        commit_round,
                        "committed block still missing, asking peers"
                    );
                    out.push(Action::Broadcast(ConsensusMessage::VoteSetBits(
                        self.vote_set_bits(commit_round, VoteType::Precommit),
                    )));
                }
                self.schedule(Step::Commit, round, out);
            }
        }
    }

    fn on_candidate_block(
        &mut self,
        height: Height,
        round: Round,
        block: Option<Block>,
        out: &mut Vec<Action>,
    ) {
        if height != self.height
            || round != self.round
            || self.step != Step::Propose
            || self.awaiting_block != Some(round)
        {
            tracing::debug!(height, round, "ignoring stale candidate block");
            return;
        }
        self.awaiting_block = None;
        match block {
            Some(block) => {
                let proposal = Proposal::new(height, round, None, block);
                self.publish_proposal(proposal, out);
            }
            None => {
                tracing::info!(height, round, "application has no candidate block, not proposing");
            }
        }
    }

    /// Moves the current round forward when the votes already justify it.
    fn advance_current_round(&mut self, out: &mut Vec<Action>) {
        let round = self.round;
        match self.step {
            Step::Propose => {
                if self.votes.prevote_majority(round).is_some() {
                    self.enter_prevote(round, out);
                }
            }
            Step::Prevote => {
                if self.votes.prevote_majority(round).is_some() {
                    self.enter_precommit(round, out);
                }
            }
            Step::Precommit => {
                if self.votes.precommit_majority(round) == Some(VoteValue::Nil) {
                    self.enter_new_round(round + 1, out);
                }
            }
            Step::NewHeight | Step::Commit => {}
        }
    }

    fn try_skip_round(&mut self, out: &mut Vec<Action>) {
        if self.step == Step::Commit {
            return;
        }
        if let Some(to) = self.votes.skip_round_above(self.round) {
            tracing::info!(
                height = self.height,
                from = self.round,
                to,
                "skipping to round with +1/3 votes"
            );
            out.push(Action::RoundSkipped {
                from: self.round,
                to,
            });
            self.enter_new_round(to, out);
        }
    }

    fn enter_new_round(&mut self, round: Round, out: &mut Vec<Action>) {
        if self.step == Step::Commit
            || round < self.round
            || (round == self.round && self.step != Step::NewHeight)
        {
            return;
        }

        self.round = round;
        self.step = Step::Propose;
        self.awaiting_block = None;
        self.votes.set_round(round);
        let proposer = self.proposer(round);
        tracing::info!(
            height = self.height,
            round,
            proposer = %proposer.short(),
            "entering new round"
        );
        self.step_changed(out);
        self.schedule(Step::Propose, round, out);

        if self.own_address() == Some(proposer) && self.is_validator() {
            self.propose(round, out);
        }
        if self.round != round || self.step != Step::Propose {
            return;
        }
        if self.proposals.contains_key(&round) {
            self.enter_prevote(round, out);
        } else {
            self.advance_current_round(out);
        }
    }

    fn propose(&mut self, round: Round, out: &mut Vec<Action>) {
        match &self.locked {
            Some(lock) => {
                tracing::info!(
                    height = self.height,
                    round,
                    block_id = %lock.block_id.short(),
                    lock_round = lock.round,
                    "re-proposing locked block"
                );
                let proposal =
                    Proposal::new(self.height, round, Some(lock.round), lock.block.clone());
                self.publish_proposal(proposal, out);
            }
            None => {
                self.awaiting_block = Some(round);
                out.push(Action::RequestBlock {
                    height: self.height,
                    round,
                });
            }
        }
    }

    fn publish_proposal(&mut self, proposal: Proposal, out: &mut Vec<Action>) {
        let Some(keypair) = &self.keypair else {
            return;
        };
        let signed = proposal.sign(&self.chain_id, keypair);
        tracing::info!(
            height = self.height,
            round = signed.proposal.round,
            block_id = %signed.proposal.block_id().short(),
            txs = signed.proposal.block.tx_count(),
            "proposing block"
        );
        out.push(Action::Broadcast(ConsensusMessage::Proposal(signed.clone())));
        self.on_proposal(signed, out);
    }

    fn enter_prevote(&mut self, round: Round, out: &mut Vec<Action>) {
        if self.round != round || self.step != Step::Propose {
            return;
        }
        self.step = Step::Prevote;
        self.step_changed(out);

        let value = self.prevote_value(round);
        tracing::debug!(height = self.height, round, %value, "prevoting");
        self.cast_vote(VoteType::Prevote, round, value, out);
        self.schedule(Step::Prevote, round, out);
        self.advance_current_round(out);
    }

    fn prevote_value(&self, round: Round) -> VoteValue {
        let Some(signed) = self.proposals.get(&round) else {
            return VoteValue::Nil;
        };
        let block_id = signed.proposal.block_id();
        match &self.locked {
            None => VoteValue::Block(block_id),
            Some(lock) if lock.block_id == block_id => VoteValue::Block(block_id),
            Some(lock) => match signed.proposal.pol_round {
                Some(pol)
                    if lock.round < pol
                        && self.votes.prevote_majority(pol) == Some(VoteValue::Block(block_id)) =>
                {
                    VoteValue::Block(block_id)
                }
                _ => VoteValue::Nil,
            },
        }
    }

    fn enter_precommit(&mut self, round: Round, out: &mut Vec<Action>) {
        if self.round != round || self.step != Step::Prevote {
            return;
        }
        self.step = Step::Precommit;
        self.step_changed(out);

        let value = match self.votes.prevote_majority(round) {
            Some(VoteValue::Block(block_id)) => match self.blocks.get(&block_id) {
                Some(block) => {
                    tracing::info!(
                        height = self.height,
                        round,
                        block_id = %block_id.short(),
                        "locking block"
                    );
                    self.locked = Some(LockedValue {
                        round,
                        block_id,
                        block: block.clone(),
                    });
                    VoteValue::Block(block_id)
                }
                None => {
                    self.release_lock_before(round);
                    VoteValue::Nil
                }
            },
            Some(VoteValue::Nil) => {
                self.release_lock_before(round);
                VoteValue::Nil
            }
            None => VoteValue::Nil,
        };

        tracing::debug!(height = self.height, round, %value, "precommitting");
        self.cast_vote(VoteType::Precommit, round, value, out);
        self.schedule(Step::Precommit, round, out);
        self.on_precommit_added(round, out);
    }

    fn release_lock_before(&mut self, round: Round) {
        if self.locked.as_ref().is_some_and(|l| l.round < round) {
            tracing::info!(height = self.height, round, "releasing lock");
            self.locked = None;
        }
    }

    fn enter_commit(&mut self, round: Round, block_id: BlockId, out: &mut Vec<Action>) {
        if self.decision.is_some() {
            return;
        }
        if self.step != Step::Commit {
            tracing::info!(
                height = self.height,
                commit_round = round,
                block_id = %block_id.short(),
                "+2/3 precommits for block"
            );
            self.step = Step::Commit;
            self.commit_target = Some((round, block_id));
            self.step_changed(out);
            self.try_finalize(out);
            if self.decision.is_none() {
                self.schedule(Step::Commit, self.round, out);
            }
            return;
        }
        self.try_finalize(out);
    }

    fn try_finalize(&mut self, out: &mut Vec<Action>) {
        let Some((round, block_id)) = self.commit_target else {
            return;
        };
        if self.decision.is_some() {
            return;
        }
        let Some(block) = self.blocks.get(&block_id) else {
            tracing::debug!(
                height = self.height,
                block_id = %block_id.short(),
                "waiting for committed block"
            );
            return;
        };
        let precommits = self
            .votes
            .precommits(round)
            .map(|set| set.votes_for(&VoteValue::Block(block_id)))
            .unwrap_or_default();
        let commit = Commit {
            height: self.height,
            round,
            block: block.clone(),
            precommits,
        };
        tracing::info!(
            height = self.height,
            round,
            block_id = %block_id.short(),
            signatures = commit.precommits.len(),
            "committed block"
        );
        self.decision = Some(commit.clone());
        out.push(Action::Commit(commit));
    }

    fn cast_vote(
        &mut self,
        vote_type: VoteType,
        round: Round,
        value: VoteValue,
        out: &mut Vec<Action>,
    ) {
        let (Some(keypair), Some(index)) = (&self.keypair, self.own_index) else {
            return;
        };
        let vote = Vote {
            vote_type,
            height: self.height,
            round,
            value,
            validator_address: keypair.address(),
            validator_index: index,
        }
        .sign(&self.chain_id, keypair);

        match self.votes.add_vote(vote.clone()) {
            AddVoteResult::Added => out.push(Action::Broadcast(ConsensusMessage::Vote(vote))),
            other => {
                tracing::error!(height = self.height, round, result = ?other, "own vote rejected");
            }
        }
    }

    fn schedule(&self, step: Step, round: Round, out: &mut Vec<Action>) {
        out.push(Action::ScheduleTimeout(TimeoutInfo::new(
            self.height,
            round,
            step,
            self.config.timeout(step, round),
        )));
    }

    fn step_changed(&self, out: &mut Vec<Action>) {
        out.push(Action::StepChanged {
            height: self.height,
            round: self.round,
            step: self.step,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_types::Validator;
    use std::time::Duration;

    const CHAIN: &str = "keel-test";

    struct Net {
        keys: Vec<Keypair>,
        chain: ChainState,
    }

    impl Net {
        fn new(n: u64) -> Self {
            let keys: Vec<Keypair> = (0..n).map(Keypair::from_seed).collect();
            let set = ValidatorSet::new(
                keys.iter()
                    .map(|k| Validator::new(k.public_key(), 1))
                    .collect(),
            )
            .unwrap();
            Self {
                keys,
                chain: ChainState::genesis(CHAIN, set),
            }
        }

        fn key_of(&self, address: Address) -> &Keypair {
            self.keys.iter().find(|k| k.address() == address).unwrap()
        }

        fn proposer(&self, round: Round) -> &Keypair {
            self.key_of(self.chain.validators.proposer_for_round(round).address)
        }

        /// A validator that proposes in none of rounds 0..=2.
        fn bystander(&self) -> &Keypair {
            self.proposer(3)
        }

        fn others(&self, me: &Keypair) -> Vec<&Keypair> {
            self.keys
                .iter()
                .filter(|k| k.address() != me.address())
                .collect()
        }

        fn machine(&self, key: &Keypair) -> ConsensusState {
            ConsensusState::new(
                ConsensusConfig::default(),
                self.chain.clone(),
                Some(key.clone()),
            )
        }

        fn block(&self, tag: u8) -> Block {
            Block::new(
                1,
                self.chain.last_block_id,
                self.keys[0].address(),
                1_000,
                vec![vec![tag]],
                [0; 32],
            )
        }

        fn proposal(&self, round: Round, pol: Option<Round>, block: Block) -> Event {
            Event::Proposal(Proposal::new(1, round, pol, block).sign(CHAIN, self.proposer(round)))
        }

        fn vote(&self, key: &Keypair, vote_type: VoteType, round: Round, value: VoteValue) -> Event {
            let (index, _) = self.chain.validators.get_by_address(&key.address()).unwrap();
            Event::Vote(
                Vote {
                    vote_type,
                    height: 1,
                    round,
                    value,
                    validator_address: key.address(),
                    validator_index: index as u32,
                }
                .sign(CHAIN, key),
            )
        }
    }

    fn timeout(round: Round, step: Step) -> Event {
        Event::Timeout(TimeoutInfo::new(1, round, step, Duration::ZERO))
    }

    fn started(m: &mut ConsensusState) {
        m.start();
        m.handle(timeout(0, Step::NewHeight));
        assert_eq!(m.round_step(), RoundStep::new(1, 0, Step::Propose));
    }

    fn own_votes(actions: &[Action]) -> Vec<Vote> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Broadcast(ConsensusMessage::Vote(v)) => Some(v.vote),
                _ => None,
            })
            .collect()
    }

    fn block_value(block: &Block) -> VoteValue {
        VoteValue::Block(block.id())
    }

    #[test]
    fn test_single_validator_commits() {
        let net = Net::new(1);
        let mut m = net.machine(&net.keys[0]);

        let actions = m.start();
        assert!(matches!(
            actions[..],
            [
                Action::StepChanged { step: Step::NewHeight, .. },
                Action::ScheduleTimeout(TimeoutInfo { step: Step::NewHeight, .. })
            ]
        ));

        let actions = m.handle(timeout(0, Step::NewHeight));
        assert!(actions.contains(&Action::RequestBlock { height: 1, round: 0 }));

        let block = net.block(1);
        let actions = m.handle(Event::CandidateBlock {
            height: 1,
            round: 0,
            block: Some(block.clone()),
        });
        let commit = actions
            .iter()
            .find_map(|a| match a {
                Action::Commit(c) => Some(c.clone()),
                _ => None,
            })
            .expect("single validator should commit");
        assert_eq!(commit.block, block);
        assert!(commit.verify(CHAIN, &net.chain.validators).is_ok());
        assert_eq!(m.step(), Step::Commit);
        assert_eq!(own_votes(&actions).len(), 2);

        // Decided: further events are ignored.
        assert!(m.handle(timeout(0, Step::Precommit)).is_empty());
    }

    #[test]
    fn test_no_candidate_means_no_proposal() {
        let net = Net::new(1);
        let mut m = net.machine(&net.keys[0]);
        started(&mut m);
        let actions = m.handle(Event::CandidateBlock {
            height: 1,
            round: 0,
            block: None,
        });
        assert!(actions.is_empty());

        let actions = m.handle(timeout(0, Step::Propose));
        assert_eq!(own_votes(&actions)[0].value, VoteValue::Nil);
    }

    #[test]
    fn test_propose_timeout_prevotes_nil() {
        let net = Net::new(4);
        let me = net.bystander();
        let mut m = net.machine(me);
        started(&mut m);

        let actions = m.handle(timeout(0, Step::Propose));
        let votes = own_votes(&actions);
        assert_eq!(votes.len(), 1);
        assert_eq!(votes[0].vote_type, VoteType::Prevote);
        assert_eq!(votes[0].value, VoteValue::Nil);
        assert_eq!(m.step(), Step::Prevote);
    }

    #[test]
    fn test_stale_timeout_ignored() {
        let net = Net::new(4);
        let mut m = net.machine(net.bystander());
        started(&mut m);
        m.handle(timeout(0, Step::Propose));
        assert!(m.handle(timeout(0, Step::Propose)).is_empty());
        assert!(m.handle(timeout(0, Step::NewHeight)).is_empty());
        assert_eq!(m.step(), Step::Prevote);
    }

    #[test]
    fn test_early_proposal_processed_on_round_entry() {
        let net = Net::new(4);
        let mut m = net.machine(net.bystander());
        m.start();
        let block = net.block(1);
        assert!(m.handle(net.proposal(0, None, block.clone())).is_empty());

        let actions = m.handle(timeout(0, Step::NewHeight));
        assert_eq!(own_votes(&actions)[0].value, block_value(&block));
    }

    #[test]
    fn test_proposal_from_wrong_proposer_dropped() {
        let net = Net::new(4);
        let mut m = net.machine(net.bystander());
        started(&mut m);
        let forged = Event::Proposal(
            Proposal::new(1, 0, None, net.block(1)).sign(CHAIN, net.proposer(1)),
        );
        assert!(m.handle(forged).is_empty());
        assert_eq!(m.status().proposal, None);
    }

    #[test]
    fn test_full_round_commits_and_locks() {
        let net = Net::new(4);
        let me = net.bystander();
        let mut m = net.machine(me);
        started(&mut m);

        let block = net.block(1);
        let actions = m.handle(net.proposal(0, None, block.clone()));
        assert_eq!(own_votes(&actions)[0].value, block_value(&block));

        let others = net.others(me);
        m.handle(net.vote(others[0], VoteType::Prevote, 0, block_value(&block)));
        let actions = m.handle(net.vote(others[1], VoteType::Prevote, 0, block_value(&block)));
        let precommit = own_votes(&actions);
        assert_eq!(precommit[0].vote_type, VoteType::Precommit);
        assert_eq!(precommit[0].value, block_value(&block));
        assert_eq!(m.status().locked, Some((0, block.id())));

        m.handle(net.vote(others[0], VoteType::Precommit, 0, block_value(&block)));
        let actions = m.handle(net.vote(others[1], VoteType::Precommit, 0, block_value(&block)));
        assert!(actions.iter().any(|a| matches!(a, Action::Commit(c) if c.block == block)));
        assert_eq!(m.decision().unwrap().precommits.len(), 3);
    }

    #[test]
    fn test_commit_waits_for_block() {
        let net = Net::new(4);
        let me = net.bystander();
        let mut m = net.machine(me);
        started(&mut m);

        let block = net.block(9);
        for key in net.others(me) {
            m.handle(net.vote(key, VoteType::Precommit, 0, block_value(&block)));
        }
        assert_eq!(m.step(), Step::Commit);
        assert!(m.decision().is_none());

        let actions = m.handle(net.proposal(0, None, block.clone()));
        assert!(actions.iter().any(|a| matches!(a, Action::Commit(_))));
        assert_eq!(m.decision().unwrap().block, block);
    }

    #[test]
    fn test_committed_block_from_conflicting_proposal() {
        let net = Net::new(4);
        let me = net.bystander();
        let mut m = net.machine(me);
        started(&mut m);

        // The round-0 proposer signs two blocks; this node sees the losing one first.
        let seen = net.block(1);
        let committed = net.block(2);
        let actions = m.handle(net.proposal(0, None, seen.clone()));
        assert_eq!(own_votes(&actions)[0].value, block_value(&seen));

        for key in net.others(me) {
            m.handle(net.vote(key, VoteType::Precommit, 0, block_value(&committed)));
        }
        assert_eq!(m.step(), Step::Commit);
        assert!(m.decision().is_none());

        let actions = m.handle(net.proposal(0, None, committed.clone()));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::Commit(c) if c.block == committed)));
        assert_eq!(m.decision().unwrap().precommits.len(), 3);
        assert_eq!(m.status().proposal, Some(committed.id()));
    }

    #[test]
    fn test_decision_from_peer_decides_height() {
        let net = Net::new(4);
        let me = net.bystander();
        let mut m = net.machine(me);
        started(&mut m);

        let block = net.block(5);
        let precommits: Vec<SignedVote> = net
            .others(me)
            .into_iter()
            .map(|key| match net.vote(key, VoteType::Precommit, 2, block_value(&block)) {
                Event::Vote(v) => v,
                _ => unreachable!(),
            })
            .collect();
        let commit = Commit {
            height: 1,
            round: 2,
            block: block.clone(),
            precommits: precommits.clone(),
        };

        let short = Commit {
            precommits: precommits[..2].to_vec(),
            ..commit.clone()
        };
        assert!(m.handle(Event::Commit(short)).is_empty());
        assert!(m.decision().is_none());

        let actions = m.handle(Event::Commit(commit.clone()));
        assert!(actions.contains(&Action::Commit(commit.clone())));
        assert_eq!(m.step(), Step::Commit);
        assert_eq!(m.decision(), Some(&commit));
    }

    #[test]
    fn test_second_proposal_ignored_outside_commit() {
        let net = Net::new(4);
        let mut m = net.machine(net.bystander());
        started(&mut m);
        m.handle(net.proposal(0, None, net.block(1)));

        assert!(m.handle(net.proposal(0, None, net.block(2))).is_empty());
        assert_eq!(m.status().proposal, Some(net.block(1).id()));
    }

    #[test]
    fn test_missing_committed_block_is_requested_until_received() {
        let net = Net::new(4);
        let me = net.bystander();
        let mut m = net.machine(me);
        started(&mut m);

        let block = net.block(9);
        let mut actions = Vec::new();
        for key in net.others(me) {
            actions.extend(m.handle(net.vote(key, VoteType::Precommit, 0, block_value(&block))));
        }
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::ScheduleTimeout(TimeoutInfo { step: Step::Commit, round: 0, .. })
        )));

        for _ in 0..2 {
            let actions = m.handle(timeout(0, Step::Commit));
            assert!(actions.iter().any(|a| matches!(
                a,
                Action::Broadcast(ConsensusMessage::VoteSetBits(bits))
                    if bits.round == 0 && bits.vote_type == VoteType::Precommit
            )));
            assert!(actions.iter().any(|a| matches!(
                a,
                Action::ScheduleTimeout(TimeoutInfo { step: Step::Commit, .. })
            )));
        }

        m.handle(net.proposal(0, None, block.clone()));
        assert_eq!(m.decision().unwrap().block, block);
        assert!(m.handle(timeout(0, Step::Commit)).is_empty());
    }

    #[test]
    fn test_commit_at_earlier_round() {
        let net = Net::new(4);
        let me = net.bystander();
        let mut m = net.machine(me);
        started(&mut m);
        let block = net.block(3);
        m.handle(net.proposal(0, None, block.clone()));
        m.handle(timeout(0, Step::Prevote));
        m.handle(timeout(0, Step::Precommit));
        assert_eq!(m.round(), 1);

        let others = net.others(me);
        for key in &others {
            m.handle(net.vote(key, VoteType::Precommit, 0, block_value(&block)));
        }
        assert_eq!(m.decision().unwrap().round, 0);
    }

    #[test]
    fn test_unlocking_rule() {
        let net = Net::new(4);
        let me = net.bystander();
        let others = net.others(me);
        let mut m = net.machine(me);
        started(&mut m);

        // Round 0: nil prevotes from two others, we prevote nil on timeout.
        m.handle(net.vote(others[0], VoteType::Prevote, 0, VoteValue::Nil));
        m.handle(net.vote(others[1], VoteType::Prevote, 0, VoteValue::Nil));
        m.handle(timeout(0, Step::Propose));
        assert_eq!(m.step(), Step::Precommit);
        m.handle(timeout(0, Step::Precommit));
        assert_eq!(m.round(), 1);

        // Round 1: block A gets +2/3 prevotes and we lock on it.
        let a = net.block(0xA);
        m.handle(net.proposal(1, None, a.clone()));
        m.handle(net.vote(others[0], VoteType::Prevote, 1, block_value(&a)));
        m.handle(net.vote(others[1], VoteType::Prevote, 1, block_value(&a)));
        assert_eq!(m.status().locked, Some((1, a.id())));

        // A nil majority at a round not newer than the lock keeps the lock.
        m.handle(net.vote(others[2], VoteType::Prevote, 0, VoteValue::Nil));
        assert_eq!(m.status().locked, Some((1, a.id())));

        // Round 2: a nil majority newer than the lock releases it.
        m.handle(timeout(1, Step::Precommit));
        assert_eq!(m.round(), 2);
        m.handle(net.vote(others[0], VoteType::Prevote, 2, VoteValue::Nil));
        m.handle(net.vote(others[1], VoteType::Prevote, 2, VoteValue::Nil));
        assert_eq!(m.status().locked, Some((1, a.id())));
        m.handle(net.vote(others[2], VoteType::Prevote, 2, VoteValue::Nil));
        assert_eq!(m.status().locked, None);
    }

    #[test]
    fn test_locked_node_prevotes_nil_for_other_block() {
        let net = Net::new(4);
        let me = net.bystander();
        let others = net.others(me);
        let mut m = net.machine(me);
        started(&mut m);

        let a = net.block(0xA);
        m.handle(net.proposal(0, None, a.clone()));
        m.handle(net.vote(others[0], VoteType::Prevote, 0, block_value(&a)));
        m.handle(net.vote(others[1], VoteType::Prevote, 0, block_value(&a)));
        assert_eq!(m.status().locked, Some((0, a.id())));
        m.handle(timeout(0, Step::Precommit));

        // A different block without proof-of-lock gets a nil prevote.
        let b = net.block(0xB);
        let actions = m.handle(net.proposal(1, None, b.clone()));
        assert_eq!(own_votes(&actions)[0].value, VoteValue::Nil);
    }

    #[test]
    fn test_newer_pol_lets_locked_node_prevote() {
        let net = Net::new(4);
        let me = net.bystander();
        let others = net.others(me);
        let mut m = net.machine(me);
        started(&mut m);

        // Lock A at round 0.
        let a = net.block(0xA);
        m.handle(net.proposal(0, None, a.clone()));
        m.handle(net.vote(others[0], VoteType::Prevote, 0, block_value(&a)));
        m.handle(net.vote(others[1], VoteType::Prevote, 0, block_value(&a)));
        m.handle(timeout(0, Step::Precommit));
        assert_eq!(m.round(), 1);

        // B gathers +2/3 prevotes at round 1 while we are still waiting for a proposal.
        let b = net.block(0xB);
        for key in &others {
            m.handle(net.vote(key, VoteType::Prevote, 1, block_value(&b)));
        }
        // That majority is newer than our lock, so the lock is gone already.
        assert_eq!(m.status().locked, None);
        m.handle(timeout(1, Step::Precommit));
        assert_eq!(m.round(), 2);

        let actions = m.handle(net.proposal(2, Some(1), b.clone()));
        assert_eq!(own_votes(&actions)[0].value, block_value(&b));
    }

    #[test]
    fn test_pol_rule_requires_majority_at_pol_round() {
        let net = Net::new(4);
        let me = net.bystander();
        let others = net.others(me);
        let mut m = net.machine(me);
        started(&mut m);

        let a = net.block(0xA);
        m.handle(net.proposal(0, None, a.clone()));
        m.handle(net.vote(others[0], VoteType::Prevote, 0, block_value(&a)));
        m.handle(net.vote(others[1], VoteType::Prevote, 0, block_value(&a)));
        m.handle(timeout(0, Step::Precommit));
        m.handle(timeout(1, Step::Propose));
        m.handle(timeout(1, Step::Prevote));
        m.handle(timeout(1, Step::Precommit));
        assert_eq!(m.round(), 2);

        // Claims a proof-of-lock at round 1 that we never saw.
        let b = net.block(0xB);
        let actions = m.handle(net.proposal(2, Some(1), b));
        assert_eq!(own_votes(&actions)[0].value, VoteValue::Nil);
        assert_eq!(m.status().locked, Some((0, a.id())));
    }

    #[test]
    fn test_round_skip_on_one_third_precommits() {
        let net = Net::new(4);
        let me = net.bystander();
        let others = net.others(me);
        let mut m = net.machine(me);
        started(&mut m);

        m.handle(net.vote(others[0], VoteType::Precommit, 2, VoteValue::Nil));
        assert_eq!(m.round(), 0);
        let actions = m.handle(net.vote(others[1], VoteType::Precommit, 2, VoteValue::Nil));
        assert!(actions.contains(&Action::RoundSkipped { from: 0, to: 2 }));
        assert_eq!(m.round_step(), RoundStep::new(1, 2, Step::Propose));
    }

    #[test]
    fn test_equivocation_emits_evidence() {
        let net = Net::new(4);
        let me = net.bystander();
        let others = net.others(me);
        let mut m = net.machine(me);
        started(&mut m);

        let a = net.block(0xA);
        let b = net.block(0xB);
        m.handle(net.vote(others[0], VoteType::Prevote, 0, block_value(&a)));
        let actions = m.handle(net.vote(others[0], VoteType::Prevote, 0, block_value(&b)));
        assert!(matches!(&actions[..], [Action::Evidence(e)] if e.vote_b.vote.value == block_value(&b)));
        assert_eq!(m.votes().prevotes(0).unwrap().power_for(&block_value(&b)), 0);
    }

    #[test]
    fn test_proposer_requests_block_and_relocks() {
        let net = Net::new(4);
        let me = net.proposer(1);
        let others = net.others(me);
        let mut m = net.machine(me);
        started(&mut m);

        // Lock A at round 0.
        let a = net.block(0xA);
        m.handle(net.proposal(0, None, a.clone()));
        m.handle(net.vote(others[0], VoteType::Prevote, 0, block_value(&a)));
        m.handle(net.vote(others[1], VoteType::Prevote, 0, block_value(&a)));
        assert_eq!(m.status().locked, Some((0, a.id())));

        // As proposer of round 1 we re-propose A with its proof-of-lock round.
        let actions = m.handle(timeout(0, Step::Precommit));
        let proposal = actions
            .iter()
            .find_map(|a| match a {
                Action::Broadcast(ConsensusMessage::Proposal(p)) => Some(p.proposal.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(proposal.round, 1);
        assert_eq!(proposal.pol_round, Some(0));
        assert_eq!(proposal.block, a);
        assert!(!actions.iter().any(|a| matches!(a, Action::RequestBlock { .. })));
    }

    #[test]
    fn test_observer_never_votes() {
        let net = Net::new(4);
        let mut m = ConsensusState::new(ConsensusConfig::default(), net.chain.clone(), None);
        assert!(!m.is_validator());
        started(&mut m);
        let actions = m.handle(net.proposal(0, None, net.block(1)));
        assert!(own_votes(&actions).is_empty());
        assert_eq!(m.step(), Step::Prevote);
    }
}
