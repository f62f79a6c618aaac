//! Node configuration.
//!
//! Values come from, in increasing priority: defaults, an optional config file (format by
//! extension) and `KEEL_*` environment variables, e.g. `KEEL_TARGET_HEIGHT=20`.

use anyhow::{ensure, Context, Result};
use keel_consensus::RETAINED_DECISIONS;
use keel_types::Height;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "KEEL";

/// Configuration for the node binary and its devnet.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Directory holding one write-ahead log per validator.
    pub data_dir: PathBuf,
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Log format (pretty, json).
    pub log_format: String,
    /// Genesis document; a devnet genesis is generated when unset.
    pub genesis: Option<PathBuf>,
    /// Validators in a generated genesis.
    pub validators: usize,
    /// Height every node must decide before the devnet stops.
    pub target_height: Height,
    /// Transactions per block.
    pub txs_per_block: usize,
    /// Validator index kept offline until the others reach the target.
    pub offline_validator: Option<usize>,
    /// Print the Prometheus text exposition when the devnet stops.
    pub print_metrics: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            genesis: None,
            validators: 4,
            target_height: 5,
            txs_per_block: 10,
            offline_validator: None,
            print_metrics: false,
        }
    }
}

impl NodeConfig {
    /// Loads the configuration with the `KEEL_` environment prefix.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    /// Loads the configuration reading environment variables under `prefix`.
    pub fn load_with_prefix(path: Option<&Path>, prefix: &str) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(config::Environment::with_prefix(prefix).try_parsing(true));

        let config: NodeConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .context("failed to load node configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values the devnet cannot run with.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.validators > 0, "validators must be at least 1");
        ensure!(self.target_height > 0, "target_height must be at least 1");
        ensure!(self.txs_per_block > 0, "txs_per_block must be at least 1");
        if let Some(index) = self.offline_validator {
            ensure!(
                index < self.validators,
                "offline_validator {index} is out of range for {} validators",
                self.validators
            );
            ensure!(self.validators > 1, "a single validator cannot be offline");
            // The returning node is served from decisions its peers still retain.
            ensure!(
                self.target_height as usize <= RETAINED_DECISIONS,
                "target_height must be at most {RETAINED_DECISIONS} with an offline validator"
            );
        }
        Ok(())
    }

    /// The configuration as YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("failed to encode configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = NodeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.validators, 4);
        assert_eq!(config.offline_validator, None);
    }

    #[test]
    fn test_load_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.yaml");
        std::fs::write(
            &path,
            "validators: 7\ntarget_height: 3\noffline_validator: 2\nlog_format: json\n",
        )
        .unwrap();

        let config = NodeConfig::load_with_prefix(Some(&path), "KEEL_TEST_FILE").unwrap();
        assert_eq!(config.validators, 7);
        assert_eq!(config.target_height, 3);
        assert_eq!(config.offline_validator, Some(2));
        assert_eq!(config.log_format, "json");
        assert_eq!(config.txs_per_block, 10);
    }

    #[test]
    fn test_environment_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.yaml");
        std::fs::write(&path, "validators: 7\ntarget_height: 3\n").unwrap();

        std::env::set_var("KEEL_TEST_ENV_TARGET_HEIGHT", "9");
        let config = NodeConfig::load_with_prefix(Some(&path), "KEEL_TEST_ENV").unwrap();
        std::env::remove_var("KEEL_TEST_ENV_TARGET_HEIGHT");

        assert_eq!(config.validators, 7);
        assert_eq!(config.target_height, 9);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.yaml");
        assert!(NodeConfig::load_with_prefix(Some(&path), "KEEL_TEST_MISSING").is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = NodeConfig {
            validators: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = NodeConfig {
            offline_validator: Some(4),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = NodeConfig {
            offline_validator: Some(0),
            target_height: RETAINED_DECISIONS as Height + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_output_loads_back() {
        let config = NodeConfig {
            offline_validator: Some(1),
            ..Default::default()
        };
        let yaml = config.to_yaml().unwrap();
        let parsed: NodeConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, config);
    }
}
