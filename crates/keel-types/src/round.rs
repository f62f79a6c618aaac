//! Heights, rounds and steps.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one consensus instance; the first block is at height 1.
pub type Height = u64;

/// A per-height attempt counter, starting at 0.
pub type Round = u32;

/// Phase of a round. Steps only move forward within a round; `Ord` follows protocol order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Step {
    /// Waiting between the previous commit and round 0 of this height.
    NewHeight,
    /// Waiting for the round's proposal.
    Propose,
    /// Prevote cast; collecting prevotes.
    Prevote,
    /// Precommit cast; collecting precommits.
    Precommit,
    /// A block gathered +2/3 precommits; the height is decided.
    Commit,
}

impl Step {
    /// Returns the step name for logs and metrics labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::NewHeight => "new_height",
            Step::Propose => "propose",
            Step::Prevote => "prevote",
            Step::Precommit => "precommit",
            Step::Commit => "commit",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A position in the protocol, ordered lexicographically by (height, round, step).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RoundStep {
    /// Height.
    pub height: Height,
    /// Round.
    pub round: Round,
    /// Step.
    pub step: Step,
}

impl RoundStep {
    /// Creates a new position.
    pub const fn new(height: Height, round: Round, step: Step) -> Self {
        Self {
            height,
            round,
            step,
        }
    }
}

impl fmt::Display for RoundStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.height, self.round, self.step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_step_ordering() {
        let a = RoundStep::new(1, 0, Step::Precommit);
        let b = RoundStep::new(1, 1, Step::Propose);
        let c = RoundStep::new(2, 0, Step::NewHeight);
        assert!(a < b);
        assert!(b < c);
        assert!(RoundStep::new(1, 1, Step::Propose) < RoundStep::new(1, 1, Step::Prevote));
    }
}
