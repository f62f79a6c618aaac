//! Consensus timing and resource configuration.

use crate::error::{ConsensusError, Result};
use keel_types::{Round, Step};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the consensus state machine and engine.
///
/// Step timeouts grow linearly with the round: `base + delta * round`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Propose step timeout at round 0.
    pub timeout_propose_ms: u64,
    /// Propose timeout increase per round.
    pub timeout_propose_delta_ms: u64,
    /// Prevote step timeout at round 0.
    pub timeout_prevote_ms: u64,
    /// Prevote timeout increase per round.
    pub timeout_prevote_delta_ms: u64,
    /// Precommit step timeout at round 0, also paces requests for a missing committed block.
    pub timeout_precommit_ms: u64,
    /// Precommit timeout increase per round.
    pub timeout_precommit_delta_ms: u64,
    /// Wait after a commit before starting the next height.
    pub timeout_commit_ms: u64,
    /// Start the next height immediately after a commit.
    pub skip_timeout_commit: bool,
    /// Rounds beyond the current one for which votes are tallied.
    pub max_future_rounds: u32,
    /// The log is truncated at a height boundary once it exceeds this size.
    pub wal_max_size_bytes: u64,
    /// Messages for the next height buffered until the current height commits.
    pub max_buffered_messages: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            timeout_propose_ms: 3000,
            timeout_propose_delta_ms: 500,
            timeout_prevote_ms: 1000,
            timeout_prevote_delta_ms: 500,
            timeout_precommit_ms: 1000,
            timeout_precommit_delta_ms: 500,
            timeout_commit_ms: 1000,
            skip_timeout_commit: false,
            max_future_rounds: 10,
            wal_max_size_bytes: 64 * 1024 * 1024,
            max_buffered_messages: 1024,
        }
    }
}

impl ConsensusConfig {
    /// Short timeouts for tests and local devnets.
    pub fn fast() -> Self {
        Self {
            timeout_propose_ms: 300,
            timeout_propose_delta_ms: 100,
            timeout_prevote_ms: 100,
            timeout_prevote_delta_ms: 50,
            timeout_precommit_ms: 100,
            timeout_precommit_delta_ms: 50,
            timeout_commit_ms: 50,
            ..Self::default()
        }
    }

    /// Checks the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.timeout_propose_ms == 0 {
            return Err(ConsensusError::Config(
                "timeout_propose_ms must be positive".into(),
            ));
        }
        if self.timeout_prevote_ms == 0 || self.timeout_precommit_ms == 0 {
            return Err(ConsensusError::Config(
                "vote step timeouts must be positive".into(),
            ));
        }
        if self.max_future_rounds == 0 {
            return Err(ConsensusError::Config(
                "max_future_rounds must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Returns the timeout for `step` at `round`.
    pub fn timeout(&self, step: Step, round: Round) -> Duration {
        let linear = |base: u64, delta: u64| {
            Duration::from_millis(base.saturating_add(delta.saturating_mul(u64::from(round))))
        };
        match step {
            Step::NewHeight => self.commit_timeout(),
            Step::Propose => linear(self.timeout_propose_ms, self.timeout_propose_delta_ms),
            Step::Prevote => linear(self.timeout_prevote_ms, self.timeout_prevote_delta_ms),
            Step::Precommit => linear(self.timeout_precommit_ms, self.timeout_precommit_delta_ms),
            Step::Commit => linear(self.timeout_precommit_ms, self.timeout_precommit_delta_ms),
        }
    }

    /// Returns the wait between a commit and round 0 of the next height.
    pub fn commit_timeout(&self) -> Duration {
        if self.skip_timeout_commit {
            Duration::ZERO
        } else {
            Duration::from_millis(self.timeout_commit_ms)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeouts_grow_with_round() {
        let config = ConsensusConfig::default();
        for step in [Step::Propose, Step::Prevote, Step::Precommit] {
            let mut last = Duration::ZERO;
            for round in 0..20 {
                let t = config.timeout(step, round);
                assert!(t > last, "{step} timeout did not grow at round {round}");
                last = t;
            }
        }
        assert_eq!(
            config.timeout(Step::Propose, 2),
            Duration::from_millis(3000 + 2 * 500)
        );
    }

    #[test]
    fn test_skip_timeout_commit() {
        let mut config = ConsensusConfig::default();
        assert_eq!(config.timeout(Step::NewHeight, 0), Duration::from_millis(1000));
        config.skip_timeout_commit = true;
        assert_eq!(config.timeout(Step::NewHeight, 0), Duration::ZERO);
        assert_eq!(
            config.timeout(Step::Commit, 3),
            config.timeout(Step::Precommit, 3)
        );
    }

    #[test]
    fn test_validate() {
        assert!(ConsensusConfig::default().validate().is_ok());
        assert!(ConsensusConfig::fast().validate().is_ok());

        let config = ConsensusConfig {
            max_future_rounds: 0,
            ..ConsensusConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: ConsensusConfig = serde_yaml::from_str("timeout_commit_ms: 5\n").unwrap();
        assert_eq!(config.timeout_commit_ms, 5);
        assert_eq!(config.timeout_propose_ms, 3000);
    }
}
