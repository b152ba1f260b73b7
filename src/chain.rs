//! Capability traits the processor is written against. Each is deliberately
//! narrow so tests can substitute in-memory fakes for live nodes.

use async_trait::async_trait;
use ethers::types::{Block, Bytes, H256, TransactionReceipt, U256};

use crate::error::ChainError;
use crate::revert::RevertReason;
use crate::types::{Message, OnChainStatus};

/// Read access to a chain's blocks.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// `None` fetches the latest block.
    async fn block_by_number(&self, number: Option<u64>) -> Result<Option<Block<H256>>, ChainError>;

    async fn block_by_hash(&self, hash: H256) -> Result<Option<Block<H256>>, ChainError>;

    /// Height of the chain head.
    async fn block_number(&self) -> Result<u64, ChainError>;
}

/// Signed access to the destination chain's bridge.
#[async_trait]
pub trait TransactionSender: Send + Sync {
    /// Current gas price, read fresh on every call.
    async fn gas_price(&self) -> Result<U256, ChainError>;

    /// Gas `processMessage` would use with this proof attached.
    async fn estimate_process_message(
        &self,
        message: &Message,
        proof: &Bytes,
    ) -> Result<U256, ChainError>;

    /// Signs and broadcasts `processMessage`, returning the transaction hash.
    async fn process_message(
        &self,
        message: &Message,
        proof: &Bytes,
        gas: U256,
    ) -> Result<H256, ChainError>;

    /// `None` until the transaction is mined.
    async fn transaction_receipt(&self, tx_hash: H256) -> Result<Option<TransactionReceipt>, ChainError>;

    /// Replays a mined, reverted transaction to recover its revert reason.
    async fn revert_reason(&self, tx_hash: H256) -> Result<RevertReason, ChainError>;

    /// Status the bridge holds for a message hash.
    async fn message_status(&self, msg_hash: H256) -> Result<OnChainStatus, ChainError>;
}

/// A contract that records another chain's block hashes.
#[async_trait]
pub trait HeaderSyncer: Send + Sync {
    /// Hash of the most recent block of the synced chain, as recorded at
    /// block `at` of the chain hosting the contract (`None` reads the latest
    /// state). Zero if nothing had been synced yet.
    async fn synced_hash(&self, at: Option<H256>) -> Result<H256, ChainError>;
}

/// Merkle proof that a slot of the signal service holds a value at a block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageProof {
    pub storage_root: H256,
    pub account_proof: Vec<Bytes>,
    pub storage_proof: Vec<Bytes>,
    pub value: U256,
}

#[async_trait]
pub trait SignalService: Send + Sync {
    /// Account and storage proof of `slot` at `block_hash`.
    async fn signal_proof(&self, slot: H256, block_hash: H256) -> Result<StorageProof, ChainError>;
}
