//! Validator set management and weighted round-robin proposer selection.
//!
//! Every validator carries a proposer priority. Each increment adds every validator's
//! voting power to its priority, selects the highest priority (ties go to the lower address)
//! and debits the selected validator by the total power. Over time each validator proposes
//! in proportion to its power. Priorities are carried from one height to the next, so
//! validator-set changes cannot be used to reset the rotation.

use crate::crypto::{Address, PublicKey};
use crate::error::{Result, TypesError};
use crate::round::Round;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Upper bound on the sum of voting power, leaving headroom for priority arithmetic.
pub const MAX_TOTAL_VOTING_POWER: u64 = (i64::MAX / 8) as u64;

/// Priorities are rescaled when their spread exceeds this multiple of the total power.
const PRIORITY_WINDOW_SIZE_FACTOR: i64 = 2;

/// A validator participating in consensus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Validator {
    /// Validator's public key.
    pub pub_key: PublicKey,

    /// Address derived from the public key.
    pub address: Address,

    /// Voting power (strictly positive).
    pub voting_power: u64,

    /// Accumulated proposer priority.
    pub proposer_priority: i64,
}

impl Validator {
    /// Creates a new validator with zero priority.
    pub fn new(pub_key: PublicKey, voting_power: u64) -> Self {
        Self {
            address: pub_key.address(),
            pub_key,
            voting_power,
            proposer_priority: 0,
        }
    }
}

/// An immutable-by-convention snapshot of the validators for one height.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorSet {
    /// Validators in canonical order; a validator's index is its position.
    validators: Vec<Validator>,

    /// Index of the current proposer.
    proposer: usize,

    /// Cached sum of voting power.
    total_power: u64,

    #[serde(skip)]
    index: HashMap<Address, usize>,
}

impl ValidatorSet {
    /// Creates a validator set and performs the initial priority increment.
    pub fn new(validators: Vec<Validator>) -> Result<Self> {
        if validators.is_empty() {
            return Err(TypesError::InvalidValidatorSet("no validators".into()));
        }

        let mut total: u64 = 0;
        let mut index = HashMap::with_capacity(validators.len());
        for (i, v) in validators.iter().enumerate() {
            if v.voting_power == 0 {
                return Err(TypesError::InvalidValidatorSet(format!(
                    "validator {} has zero voting power",
                    v.address
                )));
            }
            if v.address != v.pub_key.address() {
                return Err(TypesError::InvalidValidatorSet(format!(
                    "validator {} address does not match its key",
                    v.address
                )));
            }
            if index.insert(v.address, i).is_some() {
                return Err(TypesError::InvalidValidatorSet(format!(
                    "duplicate validator {}",
                    v.address
                )));
            }
            total = total
                .checked_add(v.voting_power)
                .filter(|t| *t <= MAX_TOTAL_VOTING_POWER)
                .ok_or_else(|| {
                    TypesError::InvalidValidatorSet(format!(
                        "total voting power exceeds {MAX_TOTAL_VOTING_POWER}"
                    ))
                })?;
        }

        let mut set = Self {
            validators,
            proposer: 0,
            total_power: total,
            index,
        };
        set.increment_proposer_priority(1);
        Ok(set)
    }

    /// Rebuilds the address index after deserialization.
    pub fn rebuild_index(&mut self) {
        self.index = self
            .validators
            .iter()
            .enumerate()
            .map(|(i, v)| (v.address, i))
            .collect();
    }

    /// Returns all validators in canonical order.
    pub fn validators(&self) -> &[Validator] {
        &self.validators
    }

    /// Returns the number of validators.
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// Returns true if the set is empty (never true for a constructed set).
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Returns the total voting power.
    pub fn total_power(&self) -> u64 {
        self.total_power
    }

    /// Returns the smallest power that is strictly more than two thirds of the total.
    pub fn quorum_power(&self) -> u64 {
        self.total_power * 2 / 3 + 1
    }

    /// Whether `power` is strictly more than two thirds of the total.
    pub fn is_two_thirds(&self, power: u64) -> bool {
        u128::from(power) * 3 > u128::from(self.total_power) * 2
    }

    /// Whether `power` is strictly more than one third of the total.
    pub fn is_one_third(&self, power: u64) -> bool {
        u128::from(power) * 3 > u128::from(self.total_power)
    }

    /// Looks up a validator and its index by address.
    pub fn get_by_address(&self, address: &Address) -> Option<(usize, &Validator)> {
        let idx = match self.index.get(address) {
            Some(idx) => *idx,
            // Deserialized sets may not have an index yet.
            None => self.validators.iter().position(|v| &v.address == address)?,
        };
        self.validators.get(idx).map(|v| (idx, v))
    }

    /// Looks up a validator by index.
    pub fn get_by_index(&self, index: usize) -> Option<&Validator> {
        self.validators.get(index)
    }

    /// Checks whether an address belongs to the set.
    pub fn has_address(&self, address: &Address) -> bool {
        self.get_by_address(address).is_some()
    }

    /// Returns the current proposer.
    pub fn proposer(&self) -> &Validator {
        &self.validators[self.proposer]
    }

    /// Returns the proposer for `round` of the height this snapshot belongs to.
    pub fn proposer_for_round(&self, round: Round) -> Validator {
        if round == 0 {
            return self.proposer().clone();
        }
        self.copy_increment_proposer_priority(round).proposer().clone()
    }

    /// Returns a copy with priorities incremented `times` times.
    pub fn copy_increment_proposer_priority(&self, times: u32) -> Self {
        let mut copy = self.clone();
        copy.increment_proposer_priority(times);
        copy
    }

    /// Advances the rotation `times` steps.
    pub fn increment_proposer_priority(&mut self, times: u32) {
        if times == 0 {
            return;
        }
        let total = self.total_power as i64;
        self.rescale_priorities(PRIORITY_WINDOW_SIZE_FACTOR * total);
        self.shift_by_average_priority();

        for _ in 0..times {
            for v in &mut self.validators {
                v.proposer_priority += v.voting_power as i64;
            }
            let chosen = self.highest_priority_index();
            self.validators[chosen].proposer_priority -= total;
            self.proposer = chosen;
        }
    }

    fn highest_priority_index(&self) -> usize {
        let mut best = 0;
        for (i, v) in self.validators.iter().enumerate().skip(1) {
            let b = &self.validators[best];
            if v.proposer_priority > b.proposer_priority
                || (v.proposer_priority == b.proposer_priority && v.address < b.address)
            {
                best = i;
            }
        }
        best
    }

    fn rescale_priorities(&mut self, diff_max: i64) {
        if diff_max <= 0 {
            return;
        }
        let max = self.validators.iter().map(|v| v.proposer_priority).max();
        let min = self.validators.iter().map(|v| v.proposer_priority).min();
        let (Some(max), Some(min)) = (max, min) else {
            return;
        };
        let diff = max - min;
        if diff > diff_max {
            let ratio = (diff + diff_max - 1) / diff_max;
            for v in &mut self.validators {
                v.proposer_priority /= ratio;
            }
        }
    }

    fn shift_by_average_priority(&mut self) {
        let n = self.validators.len() as i128;
        let sum: i128 = self
            .validators
            .iter()
            .map(|v| i128::from(v.proposer_priority))
            .sum();
        let avg = sum.div_euclid(n) as i64;
        for v in &mut self.validators {
            v.proposer_priority -= avg;
        }
    }
}

impl PartialEq for ValidatorSet {
    fn eq(&self, other: &Self) -> bool {
        self.validators == other.validators
            && self.proposer == other.proposer
            && self.total_power == other.total_power
    }
}

impl Eq for ValidatorSet {}
