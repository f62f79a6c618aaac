//! Blocks: the values consensus decides on.

use crate::crypto::Address;
use crate::round::Height;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A block identifier (SHA-256 of the JSON-encoded header).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId([u8; 32]);

impl BlockId {
    /// Parent of the first block.
    pub const GENESIS_PARENT: Self = Self([0u8; 32]);

    /// Creates a block ID from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Returns the hex representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses a hex string.
    pub fn from_hex(hex_str: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(hex_str, &mut bytes)?;
        Ok(Self(bytes))
    }

    /// Returns the first 6 bytes as hex, for logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", self.short())
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

hex_serde!(BlockId, 32);

/// Block metadata. The block ID commits to the header only; the header commits to the
/// transactions through `tx_root`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block height.
    pub height: Height,

    /// ID of the previous block.
    pub parent: BlockId,

    /// Address of the validator that built the block.
    pub proposer: Address,

    /// Timestamp chosen by the proposer (unix milliseconds).
    pub timestamp_ms: u64,

    /// Merkle root of the transactions.
    pub tx_root: [u8; 32],

    /// Application state hash after the parent block.
    pub app_hash: [u8; 32],

    /// Number of transactions.
    pub tx_count: u32,
}

impl BlockHeader {
    /// Computes the block ID.
    pub fn id(&self) -> BlockId {
        // A struct of plain fields always serializes.
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        BlockId(Sha256::digest(bytes).into())
    }
}

/// A block: header plus opaque, ordered transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Header.
    pub header: BlockHeader,

    /// Transactions, opaque to consensus.
    pub transactions: Vec<Vec<u8>>,
}

impl Block {
    /// Builds a block, deriving `tx_root` and `tx_count` from the transactions.
    pub fn new(
        height: Height,
        parent: BlockId,
        proposer: Address,
        timestamp_ms: u64,
        transactions: Vec<Vec<u8>>,
        app_hash: [u8; 32],
    ) -> Self {
        let header = BlockHeader {
            height,
            parent,
            proposer,
            timestamp_ms,
            tx_root: Self::compute_tx_root(&transactions),
            app_hash,
            tx_count: transactions.len() as u32,
        };
        Self {
            header,
            transactions,
        }
    }

    /// Returns the block ID.
    pub fn id(&self) -> BlockId {
        self.header.id()
    }

    /// Returns the block height.
    pub fn height(&self) -> Height {
        self.header.height
    }

    /// Returns the parent block ID.
    pub fn parent(&self) -> BlockId {
        self.header.parent
    }

    /// Returns the number of transactions.
    pub fn tx_count(&self) -> usize {
        self.transactions.len()
    }

    /// Checks that the header's transaction commitment matches the body.
    pub fn verify_tx_root(&self) -> bool {
        self.header.tx_count as usize == self.transactions.len()
            && Self::compute_tx_root(&self.transactions) == self.header.tx_root
    }

    fn compute_tx_root(transactions: &[Vec<u8>]) -> [u8; 32] {
        if transactions.is_empty() {
            return [0u8; 32];
        }

        let mut level: Vec<[u8; 32]> = transactions
            .iter()
            .map(|tx| Sha256::digest(tx).into())
            .collect();

        while level.len() > 1 {
            level = level
                .chunks(2)
                .map(|pair| {
                    let mut hasher = Sha256::new();
                    hasher.update(pair[0]);
                    // Odd levels duplicate the last node.
                    hasher.update(pair.get(1).unwrap_or(&pair[0]));
                    hasher.finalize().into()
                })
                .collect();
        }

        level[0]
    }
}
