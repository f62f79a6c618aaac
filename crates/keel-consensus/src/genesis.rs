//! Genesis document for a Keel network.
//!
//! The genesis document defines the chain id, the initial validator set and the consensus
//! parameters every node must agree on.

use crate::config::ConsensusConfig;
use crate::error::{ConsensusError, Result};
use keel_types::{ChainState, Keypair, PublicKey, Validator, ValidatorSet};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Chain id used by [`generate_devnet_genesis`].
pub const DEVNET_CHAIN_ID: &str = "keel-devnet";

/// A validator listed in the genesis document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisValidator {
    /// Human-readable name.
    pub name: String,

    /// Ed25519 public key (hex-encoded).
    pub public_key: String,

    /// Voting power.
    pub power: u64,
}

impl GenesisValidator {
    /// Converts to a [`Validator`].
    pub fn to_validator(&self) -> Result<Validator> {
        let pub_key = PublicKey::from_hex(&self.public_key).map_err(|e| {
            ConsensusError::Genesis(format!("validator {}: {}", self.name, e))
        })?;
        Ok(Validator::new(pub_key, self.power))
    }
}

/// Complete genesis document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Genesis {
    /// Network identifier, part of every signature.
    pub chain_id: String,

    /// Genesis time (unix milliseconds).
    pub genesis_time_ms: u64,

    /// Initial validators.
    pub validators: Vec<GenesisValidator>,

    /// Consensus parameters.
    #[serde(default)]
    pub consensus: ConsensusConfig,
}

impl Genesis {
    /// Creates an empty genesis document.
    pub fn new(chain_id: impl Into<String>, genesis_time_ms: u64) -> Self {
        Self {
            chain_id: chain_id.into(),
            genesis_time_ms,
            validators: Vec::new(),
            consensus: ConsensusConfig::default(),
        }
    }

    /// Adds a validator.
    pub fn with_validator(mut self, validator: GenesisValidator) -> Self {
        self.validators.push(validator);
        self
    }

    /// Sets the consensus parameters.
    pub fn with_consensus(mut self, consensus: ConsensusConfig) -> Self {
        self.consensus = consensus;
        self
    }

    /// Loads a genesis document, as YAML when the extension is `yaml`/`yml`, JSON otherwise.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::load_yaml(path),
            _ => Self::load_json(path),
        }
    }

    /// Loads genesis from a JSON file.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let content = read(path.as_ref())?;
        let genesis: Genesis = serde_json::from_str(&content)
            .map_err(|e| ConsensusError::Genesis(e.to_string()))?;
        genesis.validate()?;
        Ok(genesis)
    }

    /// Loads genesis from a YAML file.
    pub fn load_yaml(path: impl AsRef<Path>) -> Result<Self> {
        let content = read(path.as_ref())?;
        let genesis: Genesis = serde_yaml::from_str(&content)
            .map_err(|e| ConsensusError::Genesis(e.to_string()))?;
        genesis.validate()?;
        Ok(genesis)
    }

    /// Saves genesis to a JSON file.
    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConsensusError::Genesis(e.to_string()))?;
        write(path.as_ref(), content)
    }

    /// Saves genesis to a YAML file.
    pub fn save_yaml(&self, path: impl AsRef<Path>) -> Result<()> {
        let content =
            serde_yaml::to_string(self).map_err(|e| ConsensusError::Genesis(e.to_string()))?;
        write(path.as_ref(), content)
    }

    /// Validates the document.
    pub fn validate(&self) -> Result<()> {
        if self.chain_id.is_empty() {
            return Err(ConsensusError::Genesis("chain_id is empty".into()));
        }
        if self.chain_id.len() > u16::MAX as usize {
            return Err(ConsensusError::Genesis("chain_id is too long".into()));
        }
        if self.validators.is_empty() {
            return Err(ConsensusError::Genesis("no validators".into()));
        }

        let mut seen_names = HashSet::new();
        for v in &self.validators {
            if !seen_names.insert(&v.name) {
                return Err(ConsensusError::Genesis(format!(
                    "duplicate validator name: {}",
                    v.name
                )));
            }
        }

        self.consensus
            .validate()
            .map_err(|e| ConsensusError::Genesis(e.to_string()))?;
        // Key format, zero power, duplicate keys and total power are checked by the set.
        self.validator_set()?;
        Ok(())
    }

    /// Builds the initial validator set.
    pub fn validator_set(&self) -> Result<ValidatorSet> {
        let validators = self
            .validators
            .iter()
            .map(GenesisValidator::to_validator)
            .collect::<Result<Vec<_>>>()?;
        ValidatorSet::new(validators).map_err(|e| ConsensusError::Genesis(e.to_string()))
    }

    /// The chain state before the first block.
    pub fn chain_state(&self) -> Result<ChainState> {
        Ok(ChainState::genesis(
            self.chain_id.clone(),
            self.validator_set()?,
        ))
    }
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| {
        ConsensusError::Genesis(format!("failed to read {}: {}", path.display(), e))
    })
}

fn write(path: &Path, content: String) -> Result<()> {
    std::fs::write(path, content).map_err(|e| {
        ConsensusError::Genesis(format!("failed to write {}: {}", path.display(), e))
    })
}

/// Deterministic key of devnet validator `index`.
pub fn devnet_keypair(index: usize) -> Keypair {
    Keypair::from_seed(index as u64)
}

/// Generates a devnet genesis with `validator_count` validators of power 1.
pub fn generate_devnet_genesis(validator_count: usize, genesis_time_ms: u64) -> Genesis {
    let validators = (0..validator_count)
        .map(|i| GenesisValidator {
            name: format!("validator-{}", i + 1),
            public_key: devnet_keypair(i).public_key().to_string(),
            power: 1,
        })
        .collect();

    Genesis {
        chain_id: DEVNET_CHAIN_ID.into(),
        genesis_time_ms,
        validators,
        consensus: ConsensusConfig::fast(),
    }
}
