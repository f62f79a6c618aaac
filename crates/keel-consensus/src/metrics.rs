//! Prometheus metrics for the consensus engine.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Timeout labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StepLabels {
    /// Step the timeout ended.
    pub step: String,
}

/// Invalid message labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct MessageLabels {
    /// Message type.
    pub kind: String,
}

/// Consensus metrics. Clones share the same underlying values.
#[derive(Clone, Debug)]
pub struct ConsensusMetrics {
    /// Height being decided.
    pub height: Gauge,
    /// Current round.
    pub round: Gauge,
    /// Current step, as its position in the round.
    pub step: Gauge,
    /// Decided heights.
    pub commits: Counter,
    /// Rounds left early because peers moved ahead.
    pub rounds_skipped: Counter,
    /// Fired timeouts by step.
    pub timeouts: Family<StepLabels, Counter>,
    /// Equivocations detected.
    pub equivocations: Counter,
    /// Messages dropped as invalid, by type.
    pub invalid_messages: Family<MessageLabels, Counter>,
    /// Records appended to the write-ahead log.
    pub wal_appends: Counter,
    /// Transactions per committed block.
    pub block_transactions: Histogram,
}

impl Default for ConsensusMetrics {
    fn default() -> Self {
        Self {
            height: Gauge::default(),
            round: Gauge::default(),
            step: Gauge::default(),
            commits: Counter::default(),
            rounds_skipped: Counter::default(),
            timeouts: Family::default(),
            equivocations: Counter::default(),
            invalid_messages: Family::default(),
            wal_appends: Counter::default(),
            block_transactions: Histogram::new(exponential_buckets(1.0, 2.0, 12)),
        }
    }
}

impl ConsensusMetrics {
    /// Creates metrics that are not exported anywhere.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates metrics registered into `registry`.
    pub fn register(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "keel_consensus_height",
            "Height being decided",
            metrics.height.clone(),
        );
        registry.register(
            "keel_consensus_round",
            "Current consensus round",
            metrics.round.clone(),
        );
        registry.register(
            "keel_consensus_step",
            "Current step (0 new height, 1 propose, 2 prevote, 3 precommit, 4 commit)",
            metrics.step.clone(),
        );
        registry.register(
            "keel_consensus_commits",
            "Total decided heights",
            metrics.commits.clone(),
        );
        registry.register(
            "keel_consensus_rounds_skipped",
            "Total rounds skipped after seeing +1/3 at a later round",
            metrics.rounds_skipped.clone(),
        );
        registry.register(
            "keel_consensus_timeouts",
            "Total fired timeouts",
            metrics.timeouts.clone(),
        );
        registry.register(
            "keel_consensus_equivocations",
            "Total conflicting votes detected",
            metrics.equivocations.clone(),
        );
        registry.register(
            "keel_consensus_invalid_messages",
            "Total messages dropped as invalid",
            metrics.invalid_messages.clone(),
        );
        registry.register(
            "keel_consensus_wal_appends",
            "Total records appended to the write-ahead log",
            metrics.wal_appends.clone(),
        );
        registry.register(
            "keel_consensus_block_transactions",
            "Transactions per committed block",
            metrics.block_transactions.clone(),
        );
        metrics
    }

    /// Counts a fired timeout.
    pub fn timeout(&self, step: &str) {
        self.timeouts
            .get_or_create(&StepLabels {
                step: step.to_string(),
            })
            .inc();
    }

    /// Counts a dropped message.
    pub fn invalid(&self, kind: &str) {
        self.invalid_messages
            .get_or_create(&MessageLabels {
                kind: kind.to_string(),
            })
            .inc();
    }
}

/// Encodes `registry` in the Prometheus text format.
pub fn encode_text(registry: &Registry) -> String {
    let mut buffer = String::new();
    if let Err(e) = prometheus_client::encoding::text::encode(&mut buffer, registry) {
        tracing::error!(error = %e, "failed to encode metrics");
    }
    buffer
}
