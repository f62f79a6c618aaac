//! Keel Consensus
//!
//! A Tendermint-style BFT consensus core. Validators agree, height by height, on a single
//! sequence of blocks while tolerating fewer than a third of the voting power being faulty.
//!
//! # Components
//!
//! - [`VoteSet`] / [`HeightVoteSet`]: signed vote aggregation and quorum queries
//! - [`ConsensusState`]: the deterministic, sans-IO round state machine
//! - [`TimeoutScheduler`]: single-slot step timeouts on tokio tasks
//! - [`Wal`]: the write-ahead log replayed after a crash ([`FileWal`], [`MemoryWal`])
//! - [`ConsensusEngine`]: the async driver wiring the machine to [`Gossip`], [`Application`],
//!   [`EvidenceSink`] and the log
//! - [`Genesis`]: the initial validator set and parameters
//!
//! # Round Flow
//!
//! ```text
//!  NewHeight ──timeout──▶ Propose(r) ──proposal / timeout──▶ Prevote(r)
//!                             ▲                                  │
//!                             │                          +2/3 prevotes / timeout
//!                    +2/3 nil precommits                         ▼
//!                        / timeout       ◀──────────────── Precommit(r)
//!                                                                │
//!                                                  +2/3 precommits for a block
//!                                                                ▼
//!                                                  Commit ──▶ NewHeight(h+1)
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use keel_consensus::{
//!     generate_devnet_genesis, devnet_keypair, ConsensusEngine, LocalNetwork,
//!     MemoryApplication, MemoryEvidence, MemoryWal,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> keel_consensus::Result<()> {
//! let genesis = generate_devnet_genesis(1, 0);
//! let network = LocalNetwork::new();
//! let key = devnet_keypair(0);
//! let engine = ConsensusEngine::new(
//!     genesis.consensus.clone(),
//!     genesis.chain_state()?,
//!     Some(key.clone()),
//!     Arc::new(network.gossip(key.address())),
//!     Arc::new(MemoryApplication::new()),
//!     Arc::new(MemoryEvidence::new()),
//!     MemoryWal::new(),
//! );
//! let handle = engine.handle();
//! network.register(key.address(), handle.clone());
//! tokio::spawn(engine.run());
//! handle.wait_for_height(1).await?;
//! # Ok(())
//! # }
//! ```

mod application;
mod config;
mod engine;
mod error;
mod genesis;
mod height_vote_set;
mod local;
mod message;
mod metrics;
mod state;
mod timeout;
mod traits;
mod vote_set;
pub mod wal;

pub use application::{next_app_hash, MemoryApplication, DEFAULT_MAX_TXS_PER_BLOCK};
pub use config::ConsensusConfig;
pub use engine::{
    ConsensusEngine, ConsensusEvent, EngineHandle, EngineInput, INPUT_QUEUE_CAPACITY,
    RETAINED_DECISIONS,
};
pub use error::{ConsensusError, Result, VoteError};
pub use genesis::{
    devnet_keypair, generate_devnet_genesis, Genesis, GenesisValidator, DEVNET_CHAIN_ID,
};
pub use height_vote_set::HeightVoteSet;
pub use local::{LocalGossip, LocalNetwork};
pub use message::{
    Channel, ConsensusMessage, VoteSetBits, DATA_CHANNEL, VOTE_CHANNEL, VOTE_SET_BITS_CHANNEL,
};
pub use metrics::{encode_text, ConsensusMetrics, MessageLabels, StepLabels};
pub use state::{Action, ConsensusState, Event, RoundStatus};
pub use timeout::{TimeoutHandle, TimeoutInfo, TimeoutScheduler};
pub use traits::{Application, EvidenceSink, Gossip, MemoryEvidence};
pub use vote_set::{AddVoteResult, VoteBits, VoteSet};
pub use wal::{FileWal, MemoryWal, Wal, WalEntry, WalError, WalRecord};
