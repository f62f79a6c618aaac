//! In-process validator devnet.
//!
//! Every validator runs a full [`ConsensusEngine`] with a file-backed write-ahead log, connected
//! through a [`LocalNetwork`]. Each node's mempool is loaded with the same workload and empty
//! blocks are disabled, so the network decides exactly `target_height` blocks and then idles.
//!
//! With an offline validator, the node stays disconnected until the others reach the target,
//! then rejoins and catches up from the decisions its peers retain.

use crate::config::NodeConfig;
use anyhow::{bail, ensure, Context, Result};
use futures::future::try_join_all;
use keel_consensus::{
    devnet_keypair, encode_text, generate_devnet_genesis, ConsensusEngine, ConsensusMetrics,
    EngineHandle, FileWal, Genesis, LocalNetwork, MemoryApplication, MemoryEvidence,
};
use keel_types::{Address, BlockId, Height};
use prometheus_client::registry::Registry;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// WAL file name inside each node directory.
pub const WAL_FILE: &str = "consensus.wal";

/// Outcome of a devnet run.
#[derive(Debug, Clone)]
pub struct DevnetReport {
    /// Chain the validators ran.
    pub chain_id: String,
    /// Decided block per height, starting at height 1.
    pub blocks: Vec<BlockId>,
    /// Transactions executed.
    pub transactions: usize,
    /// Evidence reports across all nodes.
    pub evidence: usize,
    /// Prometheus text exposition of every node's metrics.
    pub metrics: String,
}

impl DevnetReport {
    /// Highest height every node decided.
    pub fn height(&self) -> Height {
        self.blocks.len() as Height
    }
}

struct DevnetNode {
    name: String,
    address: Address,
    app: Arc<MemoryApplication>,
    evidence: Arc<MemoryEvidence>,
    handle: EngineHandle,
    task: JoinHandle<keel_consensus::Result<()>>,
}

/// The genesis named by the configuration, or a fresh devnet genesis.
pub fn load_genesis(config: &NodeConfig) -> Result<Genesis> {
    match &config.genesis {
        Some(path) => Genesis::load(path)
            .with_context(|| format!("failed to load genesis from {}", path.display())),
        None => Ok(generate_devnet_genesis(config.validators, now_ms())),
    }
}

/// Write-ahead log path of the named node.
pub fn wal_path(config: &NodeConfig, node: &str) -> PathBuf {
    config.data_dir.join(node).join(WAL_FILE)
}

/// Runs the devnet until every node decides `config.target_height`.
pub async fn run_devnet(config: &NodeConfig, genesis: Genesis) -> Result<DevnetReport> {
    config.validate()?;
    genesis.validate()?;
    let chain = genesis.chain_state()?;
    if let Some(index) = config.offline_validator {
        ensure!(
            index < genesis.validators.len(),
            "offline validator {index} is not in the genesis"
        );
    }

    info!(
        chain_id = %genesis.chain_id,
        validators = genesis.validators.len(),
        target = config.target_height,
        offline = ?config.offline_validator,
        data_dir = %config.data_dir.display(),
        "starting devnet"
    );

    let workload: Vec<Vec<u8>> = (0..config.target_height as usize * config.txs_per_block)
        .map(|i| format!("tx-{i:06}").into_bytes())
        .collect();
    let mut registry = Registry::default();
    let network = LocalNetwork::new();
    let mut nodes = Vec::with_capacity(genesis.validators.len());

    for (index, validator) in genesis.validators.iter().enumerate() {
        let key = devnet_keypair(index);
        let address = key.address();
        if key.public_key().to_string() != validator.public_key {
            warn!(
                node = %validator.name,
                "devnet key does not match the genesis entry, node will not vote"
            );
        }

        let path = wal_path(config, &validator.name);
        let wal = FileWal::open(&path, genesis.consensus.wal_max_size_bytes)
            .with_context(|| format!("failed to open {}", path.display()))?;
        if !wal.is_empty() {
            bail!(
                "{} holds a previous run, remove {} or choose another data directory",
                path.display(),
                config.data_dir.display()
            );
        }

        let app = Arc::new(
            MemoryApplication::new()
                .with_max_txs_per_block(config.txs_per_block)
                .with_empty_blocks(false),
        );
        for tx in &workload {
            app.submit(tx.clone());
        }
        let evidence = Arc::new(MemoryEvidence::new());
        let metrics = ConsensusMetrics::register(
            registry.sub_registry_with_label(("node".into(), validator.name.clone().into())),
        );

        let engine = ConsensusEngine::new(
            genesis.consensus.clone(),
            chain.clone(),
            Some(key),
            Arc::new(network.gossip(address)),
            app.clone(),
            evidence.clone(),
            wal,
        )
        .with_metrics(metrics);
        let handle = engine.handle();

        if config.offline_validator == Some(index) {
            network.set_online(address, false);
        }
        network.register(address, handle.clone());
        nodes.push(DevnetNode {
            name: validator.name.clone(),
            address,
            app,
            evidence,
            handle,
            task: tokio::spawn(engine.run()),
        });
    }

    let target = config.target_height;
    let outcome = match config.offline_validator {
        Some(index) => {
            let online: Vec<&DevnetNode> = nodes
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != index)
                .map(|(_, node)| node)
                .collect();
            match wait_for(&online, target).await {
                Ok(()) => {
                    info!(node = %nodes[index].name, "bringing offline validator back");
                    network.set_online(nodes[index].address, true);
                    wait_for(&[&nodes[index]], target).await
                }
                Err(e) => Err(e),
            }
        }
        None => wait_for(&nodes.iter().collect::<Vec<_>>(), target).await,
    };

    let report = outcome.and_then(|()| verify(&genesis.chain_id, &nodes, target));
    let stopped = shutdown(nodes).await;
    let mut report = match (report, stopped) {
        (Ok(report), Ok(())) => report,
        (Err(e), _) | (Ok(_), Err(e)) => return Err(e),
    };
    report.metrics = encode_text(&registry);
    Ok(report)
}

async fn wait_for(nodes: &[&DevnetNode], height: Height) -> Result<()> {
    let decided = try_join_all(nodes.iter().map(|node| node.handle.wait_for_height(height)))
        .await
        .context("a node stopped before reaching the target height")?;
    info!(height, nodes = decided.len(), "nodes reached height");
    Ok(())
}

fn verify(chain_id: &str, nodes: &[DevnetNode], target: Height) -> Result<DevnetReport> {
    let mut blocks = Vec::with_capacity(target as usize);
    let mut transactions = 0;
    for height in 1..=target {
        let mut decided: Option<BlockId> = None;
        for node in nodes {
            let block = node
                .app
                .block(height)
                .with_context(|| format!("{} has no block at height {height}", node.name))?;
            match decided {
                None => {
                    decided = Some(block.id());
                    transactions += block.tx_count();
                }
                Some(id) if id != block.id() => {
                    bail!(
                        "{} decided {} at height {height}, others decided {}",
                        node.name,
                        block.id(),
                        id
                    )
                }
                Some(_) => {}
            }
        }
        if let Some(id) = decided {
            blocks.push(id);
        }
    }

    Ok(DevnetReport {
        chain_id: chain_id.to_string(),
        blocks,
        transactions,
        evidence: nodes.iter().map(|n| n.evidence.reported().len()).sum(),
        metrics: String::new(),
    })
}

async fn shutdown(nodes: Vec<DevnetNode>) -> Result<()> {
    for node in &nodes {
        node.handle.shutdown().await;
    }
    for node in nodes {
        node.task
            .await
            .with_context(|| format!("{} panicked", node.name))?
            .with_context(|| format!("{} failed", node.name))?;
    }
    Ok(())
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
