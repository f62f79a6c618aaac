//! # Keel Node
//!
//! Composition layer around [`keel_consensus`]: node configuration, logging setup and an
//! in-process devnet that runs several validators over the local gossip hub.
//!
//! ## Quick Start
//!
//! ```bash
//! cargo run --bin keel-node -- devnet --validators 4 --height 10 --offline 3
//! ```
//!
//! ## Modules
//!
//! - [`config`] - Node configuration (file + `KEEL_*` environment)
//! - [`devnet`] - In-process validator network
//! - [`logging`] - Tracing subscriber setup

pub mod config;
pub mod devnet;
pub mod logging;

pub use config::NodeConfig;
pub use devnet::{load_genesis, run_devnet, DevnetReport};
