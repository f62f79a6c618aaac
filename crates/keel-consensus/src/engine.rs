//! The consensus engine: the async driver around [`ConsensusState`].
//!
//! The engine owns the state machine, its single input queue, the timeout scheduler and the
//! write-ahead log. Everything that reaches the machine goes through [`ConsensusEngine::run`]
//! one input at a time:
//!
//! 1. inbound messages and fired timeouts are appended to the log, then fed to the machine;
//! 2. the machine's actions are executed in order: our own proposals and votes are logged
//!    before they are broadcast, step changes are logged as markers, candidate blocks are
//!    requested from the application and fed back, decided blocks are executed before the
//!    next height starts.
//!
//! On startup the log is replayed through a fresh machine. Replay is silent: nothing is
//! broadcast or executed until the machine has caught up with the log, and every logged step
//! marker must be reproduced exactly.

use crate::config::ConsensusConfig;
use crate::error::{ConsensusError, Result};
use crate::message::{ConsensusMessage, VoteSetBits};
use crate::metrics::ConsensusMetrics;
use crate::state::{Action, ConsensusState, Event, RoundStatus};
use crate::timeout::{TimeoutInfo, TimeoutScheduler};
use crate::traits::{Application, EvidenceSink, Gossip};
use crate::wal::{Wal, WalEntry};
use keel_types::{Address, BlockId, ChainState, Commit, Height, Keypair, Round, RoundStep, Step};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, trace, warn};

/// Capacity of the engine's input queue.
pub const INPUT_QUEUE_CAPACITY: usize = 4096;

/// Decided heights kept to help lagging peers.
pub const RETAINED_DECISIONS: usize = 16;

/// Inputs to the engine's queue.
#[derive(Debug, Clone)]
pub enum EngineInput {
    /// A message from a peer.
    Message {
        /// Sender.
        from: Address,
        /// The message.
        message: ConsensusMessage,
    },
    /// A scheduled timeout fired.
    Timeout(TimeoutInfo),
    /// Stop the engine.
    Shutdown,
}

impl From<TimeoutInfo> for EngineInput {
    fn from(info: TimeoutInfo) -> Self {
        EngineInput::Timeout(info)
    }
}

/// Events emitted by the consensus engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusEvent {
    /// The state machine entered a new step.
    StepChanged {
        /// Height.
        height: Height,
        /// Round.
        round: Round,
        /// Step.
        step: Step,
    },
    /// A block was decided and executed.
    BlockCommitted {
        /// Height.
        height: Height,
        /// Round of the decision.
        round: Round,
        /// The block.
        block_id: BlockId,
        /// Transactions in the block.
        tx_count: usize,
    },
    /// The node jumped to a later round.
    RoundSkipped {
        /// Height.
        height: Height,
        /// Round left.
        from: Round,
        /// Round entered.
        to: Round,
    },
    /// A validator signed conflicting votes.
    EvidenceFound {
        /// Height.
        height: Height,
        /// The equivocating validator.
        validator: Address,
    },
}

/// Cheap handle for feeding and observing a running engine.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    sender: mpsc::Sender<EngineInput>,
    status: watch::Receiver<RoundStatus>,
    events: broadcast::Sender<ConsensusEvent>,
}

impl EngineHandle {
    /// Delivers a message from `from`, waiting for queue space.
    pub async fn deliver(&self, from: Address, message: ConsensusMessage) -> Result<()> {
        self.sender
            .send(EngineInput::Message { from, message })
            .await
            .map_err(|_| ConsensusError::Stopped)
    }

    /// Delivers a message without waiting. Returns false when it was dropped.
    pub fn try_deliver(&self, from: Address, message: ConsensusMessage) -> bool {
        match self.sender.try_send(EngineInput::Message { from, message }) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("engine input queue full, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Asks the engine to stop after the input it is processing.
    pub async fn shutdown(&self) {
        // A closed queue means the engine is already gone.
        let _ = self.sender.send(EngineInput::Shutdown).await;
    }

    /// The latest status snapshot.
    pub fn status(&self) -> RoundStatus {
        self.status.borrow().clone()
    }

    /// Watches status snapshots.
    pub fn watch_status(&self) -> watch::Receiver<RoundStatus> {
        self.status.clone()
    }

    /// Subscribes to consensus events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConsensusEvent> {
        self.events.subscribe()
    }

    /// Waits until `height` is decided.
    pub async fn wait_for_height(&self, height: Height) -> Result<BlockId> {
        let mut status = self.status.clone();
        loop {
            if let Some((decided, block_id)) = status.borrow_and_update().last_commit {
                if decided >= height {
                    return Ok(block_id);
                }
            }
            status.changed().await.map_err(|_| ConsensusError::Stopped)?;
        }
    }
}

/// What a replay produced besides the machine's state.
#[derive(Default)]
struct Replayed {
    steps: VecDeque<RoundStep>,
    own: Vec<ConsensusMessage>,
    timeout: Option<TimeoutInfo>,
    request: Option<(Height, Round)>,
    commit: Option<Commit>,
}

/// Drives a [`ConsensusState`] with real collaborators.
pub struct ConsensusEngine<G: ?Sized, A: ?Sized, E: ?Sized, W> {
    config: ConsensusConfig,
    keypair: Option<Keypair>,
    gossip: Arc<G>,
    app: Arc<A>,
    evidence: Arc<E>,
    wal: W,
    metrics: ConsensusMetrics,

    machine: ConsensusState,
    scheduler: TimeoutScheduler<EngineInput>,
    inputs: mpsc::Receiver<EngineInput>,
    handle: EngineHandle,
    status: watch::Sender<RoundStatus>,
    events: broadcast::Sender<ConsensusEvent>,
    decisions: VecDeque<Commit>,
    buffered: Vec<(Address, ConsensusMessage)>,
}

impl<G, A, E, W> ConsensusEngine<G, A, E, W>
where
    G: Gossip + ?Sized,
    A: Application + ?Sized,
    E: EvidenceSink + ?Sized,
    W: Wal,
{
    /// Creates an engine that decides the heights after `chain`.
    ///
    /// Without a keypair, or with a key outside the validator set, the node follows consensus
    /// without voting.
    pub fn new(
        config: ConsensusConfig,
        chain: ChainState,
        keypair: Option<Keypair>,
        gossip: Arc<G>,
        app: Arc<A>,
        evidence: Arc<E>,
        wal: W,
    ) -> Self {
        let (sender, inputs) = mpsc::channel(INPUT_QUEUE_CAPACITY);
        let (events, _) = broadcast::channel(1024);
        let machine = ConsensusState::new(config.clone(), chain, keypair.clone());
        let (status, status_rx) = watch::channel(machine.status());
        let handle = EngineHandle {
            sender: sender.clone(),
            status: status_rx,
            events: events.clone(),
        };

        Self {
            config,
            keypair,
            gossip,
            app,
            evidence,
            wal,
            metrics: ConsensusMetrics::default(),
            machine,
            scheduler: TimeoutScheduler::new(sender),
            inputs,
            handle,
            status,
            events,
            decisions: VecDeque::new(),
            buffered: Vec::new(),
        }
    }

    /// Reports into `metrics` instead of unregistered ones.
    pub fn with_metrics(mut self, metrics: ConsensusMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// A handle for delivering messages and observing progress.
    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// Replays the log, then processes inputs until shut down.
    ///
    /// Returns an error when the log or the application fails; the node cannot continue safely
    /// after either.
    pub async fn run(mut self) -> Result<()> {
        self.config.validate()?;
        self.log_node_mode();
        self.recover().await?;

        while let Some(input) = self.inputs.recv().await {
            match input {
                EngineInput::Message { from, message } => {
                    self.on_message(from, message).await?;
                    self.drain_buffered().await?;
                }
                EngineInput::Timeout(info) => {
                    self.on_timeout(info).await?;
                    self.drain_buffered().await?;
                }
                EngineInput::Shutdown => {
                    info!(height = self.machine.height(), "consensus engine stopping");
                    break;
                }
            }
            self.publish_status();
        }
        Ok(())
    }

    fn log_node_mode(&self) {
        let validators = self.machine.validators();
        match self.machine.own_address() {
            Some(address) if self.machine.is_validator() => {
                info!(
                    %address,
                    validators = validators.len(),
                    total_power = validators.total_power(),
                    "starting consensus as validator"
                );
                if validators.len() == 1 {
                    info!("this node is the only validator, it decides alone");
                }
            }
            Some(address) => {
                info!(%address, "key is not in the validator set, following without voting");
            }
            None => info!("no validator key, following consensus as observer"),
        }
    }

    async fn recover(&mut self) -> Result<()> {
        let records = self.wal.replay()?;
        if !records.is_empty() {
            info!(
                height = self.machine.height(),
                records = records.len(),
                "replaying write-ahead log"
            );
        }

        let mut replayed = Replayed::default();
        let actions = self.machine.start();
        self.absorb(actions, &mut replayed);

        for record in records {
            let height = self.machine.height();
            if record.height < height {
                trace!(record = record.height, height, "skipping log record of an earlier height");
                continue;
            }
            if record.height > height {
                return Err(ConsensusError::ReplayHeight {
                    expected: height,
                    found: record.height,
                });
            }
            match record.entry {
                WalEntry::Event(event) => {
                    if matches!(event, Event::CandidateBlock { .. }) {
                        replayed.request = None;
                    }
                    let actions = self.machine.handle(event);
                    self.absorb(actions, &mut replayed);
                }
                WalEntry::RoundStep(logged) => match replayed.steps.pop_front() {
                    Some(actual) if actual == logged => {}
                    actual => {
                        return Err(ConsensusError::ReplayMismatch {
                            logged,
                            actual: actual.map_or_else(|| "no step".to_string(), |s| s.to_string()),
                        });
                    }
                },
                WalEntry::EndHeight(_) => {}
            }
        }

        // Step changes the machine made after the last logged one.
        for step in std::mem::take(&mut replayed.steps) {
            self.append(step.height, WalEntry::RoundStep(step))?;
        }
        for message in std::mem::take(&mut replayed.own) {
            broadcast_message(&*self.gossip, message).await;
        }
        self.publish_status();

        if let Some(commit) = replayed.commit {
            return self.execute(vec![Action::Commit(commit)]).await;
        }
        if let Some(info) = replayed.timeout {
            self.scheduler.schedule(info);
        }
        if let Some((height, round)) = replayed.request {
            self.execute(vec![Action::RequestBlock { height, round }])
                .await?;
        }
        Ok(())
    }

    /// Collects the effects of replayed events without performing them.
    fn absorb(&mut self, actions: Vec<Action>, replayed: &mut Replayed) {
        for action in actions {
            match action {
                Action::StepChanged {
                    height,
                    round,
                    step,
                } => replayed
                    .steps
                    .push_back(RoundStep::new(height, round, step)),
                Action::Broadcast(
                    message @ (ConsensusMessage::Proposal(_) | ConsensusMessage::Vote(_)),
                ) => replayed.own.push(message),
                Action::Broadcast(
                    ConsensusMessage::VoteSetBits(_) | ConsensusMessage::Commit(_),
                ) => {}
                Action::ScheduleTimeout(info) => replayed.timeout = Some(info),
                Action::RequestBlock { height, round } => {
                    replayed.request = Some((height, round));
                }
                Action::Commit(commit) => replayed.commit = Some(commit),
                Action::Evidence(evidence) => self.report_evidence(evidence),
                Action::RoundSkipped { .. } => {}
            }
        }
    }

    async fn on_message(&mut self, from: Address, message: ConsensusMessage) -> Result<()> {
        let height = self.machine.height();
        if let ConsensusMessage::VoteSetBits(bits) = message {
            return self.answer_vote_set_bits(from, bits).await;
        }

        let message_height = message.height();
        if message_height == height + 1 {
            if self.buffered.len() < self.config.max_buffered_messages {
                self.buffered.push((from, message));
            } else {
                debug!(height, kind = message.kind(), "buffer full, dropping next-height message");
            }
            return Ok(());
        }
        if message_height != height {
            trace!(height, message_height, kind = message.kind(), "dropping message for another height");
            return Ok(());
        }

        let event = match message {
            ConsensusMessage::Proposal(proposal) => {
                let valid = self
                    .app
                    .validate_block(self.machine.chain(), &proposal.proposal.block)
                    .await;
                if !valid {
                    warn!(
                        height,
                        round = proposal.proposal.round,
                        block_id = %proposal.proposal.block_id().short(),
                        peer = %from.short(),
                        "application rejected proposed block"
                    );
                    self.metrics.invalid("proposal");
                    return Ok(());
                }
                Event::Proposal(proposal)
            }
            ConsensusMessage::Vote(vote) => {
                if !self.machine.validators().has_address(&vote.vote.validator_address) {
                    debug!(height, peer = %from.short(), "vote from unknown validator");
                    self.metrics.invalid(vote.vote.vote_type.as_str());
                    return Ok(());
                }
                Event::Vote(vote)
            }
            ConsensusMessage::Commit(commit) => {
                if !self.app.validate_block(self.machine.chain(), &commit.block).await {
                    warn!(
                        height,
                        block_id = %commit.block.id().short(),
                        peer = %from.short(),
                        "application rejected decided block"
                    );
                    self.metrics.invalid("commit");
                    return Ok(());
                }
                Event::Commit(commit)
            }
            ConsensusMessage::VoteSetBits(_) => return Ok(()),
        };

        let actions = self.feed(event)?;
        self.execute(actions).await
    }

    async fn on_timeout(&mut self, info: TimeoutInfo) -> Result<()> {
        if info.position() != self.machine.round_step() {
            trace!(timeout = %info.position(), at = %self.machine.round_step(), "stale timeout");
            return Ok(());
        }
        debug!(
            height = info.height,
            round = info.round,
            step = %info.step,
            "timeout"
        );
        self.metrics.timeout(info.step.as_str());
        let actions = self.feed(Event::Timeout(info))?;
        self.execute(actions).await
    }

    /// Feeds buffered messages once the machine reaches their height.
    async fn drain_buffered(&mut self) -> Result<()> {
        loop {
            let height = self.machine.height();
            if !self.buffered.iter().any(|(_, m)| m.height() == height) {
                return Ok(());
            }
            let (ready, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.buffered)
                .into_iter()
                .partition(|(_, m)| m.height() == height);
            self.buffered = rest.into_iter().filter(|(_, m)| m.height() > height).collect();
            debug!(height, count = ready.len(), "processing buffered messages");
            for (from, message) in ready {
                self.on_message(from, message).await?;
            }
        }
    }

    /// Logs an event, then hands it to the machine.
    fn feed(&mut self, event: Event) -> Result<Vec<Action>> {
        self.append(event.height(), WalEntry::Event(event.clone()))?;
        Ok(self.machine.handle(event))
    }

    async fn execute(&mut self, actions: Vec<Action>) -> Result<()> {
        let mut queue: VecDeque<Action> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                Action::StepChanged {
                    height,
                    round,
                    step,
                } => {
                    self.append(height, WalEntry::RoundStep(RoundStep::new(height, round, step)))?;
                    debug!(height, round, %step, "entered step");
                    self.publish_status();
                    self.emit(ConsensusEvent::StepChanged {
                        height,
                        round,
                        step,
                    });
                }
                Action::Broadcast(message) => {
                    match &message {
                        ConsensusMessage::Proposal(p) => self.append(
                            p.proposal.height,
                            WalEntry::Event(Event::Proposal(p.clone())),
                        )?,
                        ConsensusMessage::Vote(v) => {
                            self.append(v.vote.height, WalEntry::Event(Event::Vote(v.clone())))?
                        }
                        ConsensusMessage::VoteSetBits(_) | ConsensusMessage::Commit(_) => {}
                    }
                    broadcast_message(&*self.gossip, message).await;
                }
                Action::ScheduleTimeout(info) => {
                    self.scheduler.schedule(info);
                }
                Action::RequestBlock { height, round } => {
                    let block = match self.machine.own_address() {
                        Some(proposer) => {
                            self.app
                                .create_candidate_block(self.machine.chain(), proposer)
                                .await
                        }
                        None => None,
                    };
                    if block.is_none() {
                        debug!(height, round, "application has no block to propose");
                    }
                    let actions = self.feed(Event::CandidateBlock {
                        height,
                        round,
                        block,
                    })?;
                    queue.extend(actions);
                }
                Action::Commit(commit) => {
                    let actions = self.finalize(commit).await?;
                    queue.extend(actions);
                }
                Action::Evidence(evidence) => self.report_evidence(evidence),
                Action::RoundSkipped { from, to } => {
                    let height = self.machine.height();
                    info!(height, from, to, "skipping to a later round");
                    self.metrics.rounds_skipped.inc();
                    self.emit(ConsensusEvent::RoundSkipped { height, from, to });
                }
            }
        }
        Ok(())
    }

    /// Executes a decided block and starts the next height.
    async fn finalize(&mut self, commit: Commit) -> Result<Vec<Action>> {
        let height = commit.height;
        let block_id = commit.block.id();
        let next = self.app.apply_block(self.machine.chain(), &commit).await?;
        self.append(height, WalEntry::EndHeight(height))?;

        let tx_count = commit.block.tx_count();
        info!(
            height,
            round = commit.round,
            block_id = %block_id.short(),
            txs = tx_count,
            signatures = commit.precommits.len(),
            "committed block"
        );
        self.metrics.commits.inc();
        self.metrics.block_transactions.observe(tx_count as f64);
        self.emit(ConsensusEvent::BlockCommitted {
            height,
            round: commit.round,
            block_id,
            tx_count,
        });

        if self.decisions.len() == RETAINED_DECISIONS {
            self.decisions.pop_front();
        }
        self.decisions.push_back(commit);

        self.machine = ConsensusState::new(self.config.clone(), next, self.keypair.clone());
        let actions = self.machine.start();
        self.publish_status();
        Ok(actions)
    }

    /// Sends `from` the votes it lacks according to `bits`, or the decision when it is still
    /// deciding a height we finished.
    async fn answer_vote_set_bits(&mut self, from: Address, bits: VoteSetBits) -> Result<()> {
        let mut replies = Vec::new();
        if bits.height == self.machine.height() {
            replies.extend(
                self.machine
                    .votes()
                    .missing_votes(bits.round, bits.vote_type, &bits.votes)
                    .into_iter()
                    .map(ConsensusMessage::Vote),
            );
        } else if let Some(decision) = self.decisions.iter().find(|c| c.height == bits.height) {
            // The peer is still deciding a height we finished: hand it the decision.
            replies.push(ConsensusMessage::Commit(decision.clone()));
        }

        if replies.is_empty() {
            return Ok(());
        }
        debug!(
            peer = %from.short(),
            height = bits.height,
            round = bits.round,
            count = replies.len(),
            "sending missing votes"
        );
        for message in replies {
            if let Err(e) = self.gossip.send_to(from, message).await {
                warn!(peer = %from.short(), error = %e, "failed to send missing vote");
            }
        }
        Ok(())
    }

    fn append(&mut self, height: Height, entry: WalEntry) -> Result<()> {
        self.wal.append(height, entry)?;
        self.metrics.wal_appends.inc();
        Ok(())
    }

    fn report_evidence(&mut self, evidence: keel_types::DuplicateVoteEvidence) {
        self.metrics.equivocations.inc();
        self.emit(ConsensusEvent::EvidenceFound {
            height: evidence.height(),
            validator: evidence.vote_a.vote.validator_address,
        });
        self.evidence.report(evidence);
    }

    fn emit(&self, event: ConsensusEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    fn publish_status(&self) {
        let status = self.machine.status();
        self.metrics.height.set(status.height as i64);
        self.metrics.round.set(i64::from(status.round));
        self.metrics.step.set(status.step as i64);
        self.status.send_replace(status);
    }
}

async fn broadcast_message<G: Gossip + ?Sized>(gossip: &G, message: ConsensusMessage) {
    let kind = message.kind();
    if let Err(e) = gossip.broadcast(message).await {
        warn!(kind, error = %e, "broadcast failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::MemoryApplication;
    use crate::local::LocalNetwork;
    use crate::traits::MemoryEvidence;
    use crate::wal::{MemoryWal, WalRecord};
    use keel_types::{Validator, ValidatorSet};

    type TestEngine =
        ConsensusEngine<crate::local::LocalGossip, MemoryApplication, MemoryEvidence, MemoryWal>;

    fn single_validator() -> (Keypair, ChainState) {
        let kp = Keypair::from_seed(0);
        let set = ValidatorSet::new(vec![Validator::new(kp.public_key(), 1)]).unwrap();
        (kp, ChainState::genesis("keel-test", set))
    }

    fn engine(
        network: &LocalNetwork,
        kp: &Keypair,
        chain: ChainState,
        app: Arc<MemoryApplication>,
        wal: MemoryWal,
    ) -> TestEngine {
        let engine = ConsensusEngine::new(
            ConsensusConfig::fast(),
            chain,
            Some(kp.clone()),
            Arc::new(network.gossip(kp.address())),
            app,
            Arc::new(MemoryEvidence::new()),
            wal,
        );
        network.register(kp.address(), engine.handle());
        engine
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_validator_commits_heights() {
        let (kp, chain) = single_validator();
        let network = LocalNetwork::new();
        let app = Arc::new(MemoryApplication::new());
        app.submit(b"tx".to_vec());
        let engine = engine(&network, &kp, chain, app.clone(), MemoryWal::new());
        let handle = engine.handle();
        let mut events = handle.subscribe();
        let task = tokio::spawn(engine.run());

        handle.wait_for_height(3).await.unwrap();
        handle.shutdown().await;
        task.await.unwrap().unwrap();

        assert!(app.last_height() >= 3);
        assert_eq!(app.block(1).unwrap().tx_count(), 1);
        let mut committed = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ConsensusEvent::BlockCommitted { height, .. } = event {
                committed.push(height);
            }
        }
        assert_eq!(&committed[..3], &[1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_reproduces_unfinished_height() {
        let (kp, chain) = single_validator();
        let network = LocalNetwork::new();
        let app = Arc::new(MemoryApplication::new());
        let wal = MemoryWal::new();
        let first = engine(&network, &kp, chain.clone(), app.clone(), wal.clone());
        let handle = first.handle();
        let task = tokio::spawn(first.run());
        let decided = handle.wait_for_height(1).await.unwrap();
        handle.shutdown().await;
        task.await.unwrap().unwrap();

        // Crash after deciding height 1 but before the end-of-height marker.
        let records: Vec<WalRecord> = wal
            .records()
            .into_iter()
            .take_while(|r| r.entry != WalEntry::EndHeight(1))
            .collect();
        let logged = records.len();

        let network = LocalNetwork::new();
        let fresh_app = Arc::new(MemoryApplication::new());
        let restarted = MemoryWal::from_records(records);
        let second = engine(&network, &kp, chain, fresh_app.clone(), restarted.clone());
        let handle = second.handle();
        let task = tokio::spawn(second.run());
        assert_eq!(handle.wait_for_height(1).await.unwrap(), decided);
        handle.shutdown().await;
        task.await.unwrap().unwrap();

        assert_eq!(fresh_app.block(1), app.block(1));
        // Replay appended no duplicate events, only the end marker and the new height.
        let after = restarted.records();
        assert_eq!(after[logged].entry, WalEntry::EndHeight(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_execution_reuses_executed_block() {
        let (kp, chain) = single_validator();
        let network = LocalNetwork::new();
        let app = Arc::new(MemoryApplication::new());
        let wal = MemoryWal::new();
        let first = engine(&network, &kp, chain.clone(), app.clone(), wal.clone());
        let handle = first.handle();
        let task = tokio::spawn(first.run());
        handle.wait_for_height(1).await.unwrap();
        handle.shutdown().await;
        task.await.unwrap().unwrap();
        let executed = app.block(1).unwrap();

        // The application executed height 1 but the log lost the end marker.
        let records: Vec<WalRecord> = wal
            .records()
            .into_iter()
            .take_while(|r| r.entry != WalEntry::EndHeight(1))
            .collect();
        let network = LocalNetwork::new();
        let second = engine(&network, &kp, chain, app.clone(), MemoryWal::from_records(records));
        let handle = second.handle();
        let task = tokio::spawn(second.run());
        handle.wait_for_height(2).await.unwrap();
        handle.shutdown().await;
        task.await.unwrap().unwrap();

        assert_eq!(app.block(1).unwrap(), executed);
        assert_eq!(app.block(2).unwrap().parent(), executed.id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_mismatch_halts_startup() {
        let (kp, chain) = single_validator();
        let network = LocalNetwork::new();
        let wal = MemoryWal::from_records(vec![WalRecord {
            height: 1,
            seq: 0,
            entry: WalEntry::RoundStep(RoundStep::new(1, 3, Step::Precommit)),
        }]);
        let engine = engine(
            &network,
            &kp,
            chain,
            Arc::new(MemoryApplication::new()),
            wal,
        );
        assert!(matches!(
            engine.run().await,
            Err(ConsensusError::ReplayMismatch { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_log_of_later_height_halts_startup() {
        let (kp, chain) = single_validator();
        let network = LocalNetwork::new();
        let wal = MemoryWal::from_records(vec![WalRecord {
            height: 4,
            seq: 0,
            entry: WalEntry::RoundStep(RoundStep::new(4, 0, Step::NewHeight)),
        }]);
        let engine = engine(
            &network,
            &kp,
            chain,
            Arc::new(MemoryApplication::new()),
            wal,
        );
        assert!(matches!(
            engine.run().await,
            Err(ConsensusError::ReplayHeight {
                expected: 1,
                found: 4
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_own_messages_logged_before_broadcast() {
        let (kp, chain) = single_validator();
        let network = LocalNetwork::new();
        let wal = MemoryWal::new();
        let engine = engine(
            &network,
            &kp,
            chain,
            Arc::new(MemoryApplication::new()),
            wal.clone(),
        );
        let handle = engine.handle();
        let task = tokio::spawn(engine.run());
        handle.wait_for_height(1).await.unwrap();
        handle.shutdown().await;
        task.await.unwrap().unwrap();

        let height_one: Vec<WalEntry> = wal
            .records()
            .into_iter()
            .filter(|r| r.height == 1)
            .map(|r| r.entry)
            .collect();
        assert_eq!(
            height_one[0],
            WalEntry::RoundStep(RoundStep::new(1, 0, Step::NewHeight))
        );
        assert!(height_one
            .iter()
            .any(|e| matches!(e, WalEntry::Event(Event::Proposal(_)))));
        assert_eq!(
            height_one
                .iter()
                .filter(|e| matches!(e, WalEntry::Event(Event::Vote(_))))
                .count(),
            2
        );
        assert_eq!(height_one.last(), Some(&WalEntry::EndHeight(1)));
    }
}
