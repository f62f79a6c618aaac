//! An in-memory application for devnets and tests.
//!
//! Transactions are opaque byte strings. The application hash chains every executed
//! transaction through SHA-256, so two nodes that executed the same blocks agree on it.

use crate::error::{ConsensusError, Result};
use crate::traits::Application;
use async_trait::async_trait;
use keel_types::{Address, Block, ChainState, Commit, Height};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Default maximum transactions per block.
pub const DEFAULT_MAX_TXS_PER_BLOCK: usize = 1000;

#[derive(Debug)]
struct Inner {
    pending: VecDeque<Vec<u8>>,
    committed: BTreeMap<Height, (Block, ChainState)>,
    last_height: Height,
}

/// Application keeping pending transactions and executed blocks in memory.
#[derive(Debug, Clone)]
pub struct MemoryApplication {
    inner: Arc<Mutex<Inner>>,
    max_txs_per_block: usize,
    propose_empty: bool,
}

impl Default for MemoryApplication {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryApplication {
    /// Creates an application that also proposes empty blocks.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                pending: VecDeque::new(),
                committed: BTreeMap::new(),
                last_height: 0,
            })),
            max_txs_per_block: DEFAULT_MAX_TXS_PER_BLOCK,
            propose_empty: true,
        }
    }

    /// Sets the maximum transactions per block.
    pub fn with_max_txs_per_block(mut self, max: usize) -> Self {
        self.max_txs_per_block = max;
        self
    }

    /// Whether to propose blocks without transactions.
    pub fn with_empty_blocks(mut self, propose_empty: bool) -> Self {
        self.propose_empty = propose_empty;
        self
    }

    /// Queues a transaction for inclusion.
    pub fn submit(&self, tx: impl Into<Vec<u8>>) {
        self.inner.lock().pending.push_back(tx.into());
    }

    /// Number of transactions waiting for inclusion.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// The executed block at `height`.
    pub fn block(&self, height: Height) -> Option<Block> {
        self.inner.lock().committed.get(&height).map(|(b, _)| b.clone())
    }

    /// All executed blocks, in height order.
    pub fn blocks(&self) -> Vec<Block> {
        self.inner
            .lock()
            .committed
            .values()
            .map(|(b, _)| b.clone())
            .collect()
    }

    /// The state after executing `height`.
    pub fn state(&self, height: Height) -> Option<ChainState> {
        self.inner.lock().committed.get(&height).map(|(_, s)| s.clone())
    }
}

/// Hash of the application state after executing `transactions` on `previous`.
pub fn next_app_hash(previous: &[u8; 32], transactions: &[Vec<u8>]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(previous);
    for tx in transactions {
        hasher.update((tx.len() as u64).to_le_bytes());
        hasher.update(tx);
    }
    hasher.finalize().into()
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[async_trait]
impl Application for MemoryApplication {
    async fn create_candidate_block(
        &self,
        state: &ChainState,
        proposer: Address,
    ) -> Option<Block> {
        let transactions: Vec<Vec<u8>> = {
            let inner = self.inner.lock();
            inner
                .pending
                .iter()
                .take(self.max_txs_per_block)
                .cloned()
                .collect()
        };
        if transactions.is_empty() && !self.propose_empty {
            return None;
        }
        Some(Block::new(
            state.next_height(),
            state.last_block_id,
            proposer,
            now_ms(),
            transactions,
            state.app_hash,
        ))
    }

    async fn validate_block(&self, state: &ChainState, block: &Block) -> bool {
        block.height() == state.next_height()
            && block.parent() == state.last_block_id
            && block.header.app_hash == state.app_hash
            && block.tx_count() <= self.max_txs_per_block
            && block.verify_tx_root()
    }

    async fn apply_block(&self, state: &ChainState, commit: &Commit) -> Result<ChainState> {
        let mut inner = self.inner.lock();
        if commit.height <= inner.last_height {
            return inner
                .committed
                .get(&commit.height)
                .map(|(_, s)| s.clone())
                .ok_or_else(|| {
                    ConsensusError::Application(format!(
                        "height {} executed but not retained",
                        commit.height
                    ))
                });
        }

        let app_hash = next_app_hash(&state.app_hash, &commit.block.transactions);
        let next = state.advance(commit, app_hash)?;
        let included = &commit.block.transactions;
        inner.pending.retain(|tx| !included.contains(tx));
        inner
            .committed
            .insert(commit.height, (commit.block.clone(), next.clone()));
        inner.last_height = commit.height;
        tracing::debug!(
            height = commit.height,
            txs = commit.block.tx_count(),
            app_hash = %hex::encode(&app_hash[..8]),
            "executed block"
        );
        Ok(next)
    }

    fn last_height(&self) -> Height {
        self.inner.lock().last_height
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_types::{Keypair, Validator, ValidatorSet};

    fn genesis() -> ChainState {
        let kp = Keypair::from_seed(0);
        let set = ValidatorSet::new(vec![Validator::new(kp.public_key(), 1)]).unwrap();
        ChainState::genesis("keel-test", set)
    }

    fn commit_of(block: Block) -> Commit {
        Commit {
            height: block.height(),
            round: 0,
            block,
            precommits: vec![],
        }
    }

    #[tokio::test]
    async fn test_candidate_and_apply() {
        let app = MemoryApplication::new();
        let state = genesis();
        app.submit(b"tx-1".to_vec());
        app.submit(b"tx-2".to_vec());

        let proposer = Keypair::from_seed(0).address();
        let block = app.create_candidate_block(&state, proposer).await.unwrap();
        assert_eq!(block.tx_count(), 2);
        assert!(app.validate_block(&state, &block).await);

        let next = app.apply_block(&state, &commit_of(block.clone())).await.unwrap();
        assert_eq!(next.last_height, 1);
        assert_eq!(next.last_block_id, block.id());
        assert_eq!(next.app_hash, next_app_hash(&[0u8; 32], &block.transactions));
        assert_eq!(app.last_height(), 1);
        assert_eq!(app.pending_count(), 0);
        assert_eq!(app.blocks(), vec![block]);
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let app = MemoryApplication::new();
        let state = genesis();
        let proposer = Keypair::from_seed(0).address();
        let block = app.create_candidate_block(&state, proposer).await.unwrap();
        let commit = commit_of(block);

        let first = app.apply_block(&state, &commit).await.unwrap();
        let again = app.apply_block(&state, &commit).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(app.blocks().len(), 1);
    }

    #[tokio::test]
    async fn test_validate_rejects_foreign_blocks() {
        let app = MemoryApplication::new().with_max_txs_per_block(1);
        let state = genesis();
        let proposer = Keypair::from_seed(0).address();

        let wrong_hash = Block::new(1, state.last_block_id, proposer, 0, vec![], [9u8; 32]);
        assert!(!app.validate_block(&state, &wrong_hash).await);

        let too_big = Block::new(
            1,
            state.last_block_id,
            proposer,
            0,
            vec![b"a".to_vec(), b"b".to_vec()],
            state.app_hash,
        );
        assert!(!app.validate_block(&state, &too_big).await);

        let wrong_height = Block::new(2, state.last_block_id, proposer, 0, vec![], state.app_hash);
        assert!(!app.validate_block(&state, &wrong_height).await);
    }

    #[tokio::test]
    async fn test_no_empty_blocks() {
        let app = MemoryApplication::new().with_empty_blocks(false);
        let proposer = Keypair::from_seed(0).address();
        assert!(app.create_candidate_block(&genesis(), proposer).await.is_none());
    }
}
