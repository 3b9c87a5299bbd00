//! Store contracts and row records.

pub mod pg;

use crate::node::{ChainBlock, ChainLog, ChainTransaction};
use alloy::primitives::{Address, Bloom, Bytes, B256, B64, U256};
use async_trait::async_trait;
use eyre::Result;

/// Block row at insert time. `transaction_count` is derived from the node's
/// reported transaction set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    pub nonce: B64,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub timestamp: u64,
    pub sha3_uncles: B256,
    pub logs_bloom: Bloom,
    pub transactions_root: B256,
    pub receipts_root: B256,
    pub state_root: B256,
    pub mix_hash: B256,
    pub miner: Address,
    pub difficulty: U256,
    pub extra_data: Bytes,
    pub size: Option<u64>,
    pub transaction_count: u64,
}

impl BlockRecord {
    pub fn from_chain(block: &ChainBlock) -> Self {
        Self {
            number: block.number,
            hash: block.hash,
            parent_hash: block.parent_hash,
            nonce: block.nonce,
            gas_limit: block.gas_limit,
            gas_used: block.gas_used,
            timestamp: block.timestamp,
            sha3_uncles: block.sha3_uncles,
            logs_bloom: block.logs_bloom,
            transactions_root: block.transactions_root,
            receipts_root: block.receipts_root,
            state_root: block.state_root,
            mix_hash: block.mix_hash,
            miner: block.miner,
            difficulty: block.difficulty,
            extra_data: block.extra_data.clone(),
            size: block.size,
            transaction_count: block.transactions.len() as u64,
        }
    }
}

/// Transaction row, carrying receipt-derived status and contract address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    pub block_hash: B256,
    pub hash: B256,
    pub nonce: u64,
    pub transaction_index: Option<u64>,
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    pub gas_price: Option<u128>,
    pub gas: u128,
    pub input: Bytes,
    pub status: bool,
    pub contract_address: Option<Address>,
    pub v: Option<u64>,
    pub r: Option<U256>,
    pub s: Option<U256>,
}

impl TransactionRecord {
    pub fn from_chain(
        block_hash: B256,
        tx: &ChainTransaction,
        status: bool,
        contract_address: Option<Address>,
    ) -> Self {
        Self {
            block_hash,
            hash: tx.hash,
            nonce: tx.nonce,
            transaction_index: tx.transaction_index,
            from: tx.from,
            to: tx.to,
            value: tx.value,
            gas_price: tx.gas_price,
            gas: tx.gas,
            input: tx.input.clone(),
            status,
            contract_address,
            v: tx.signature.map(|signature| signature.v),
            r: tx.signature.map(|signature| signature.r),
            s: tx.signature.map(|signature| signature.s),
        }
    }
}

/// Log row with the fixed 4-slot topic vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub transaction_hash: B256,
    pub block_number: u64,
    pub log_index: u64,
    pub address: Address,
    pub data: Bytes,
    pub topics: [Option<B256>; 4],
}

impl LogRecord {
    /// Build a log row, falling back to block context where the receipt
    /// omits positional metadata.
    pub fn from_chain(
        transaction_hash: B256,
        block_number: u64,
        fallback_index: u64,
        log: &ChainLog,
    ) -> Self {
        Self {
            transaction_hash,
            block_number: log.block_number.unwrap_or(block_number),
            log_index: log.log_index.unwrap_or(fallback_index),
            address: log.address,
            data: log.data.clone(),
            topics: topic_slots(&log.topics),
        }
    }
}

/// Decoded event row written through the log-decoder dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEvent {
    pub log_id: i64,
    pub address: Address,
    pub name: String,
    pub signature: String,
}

/// Stored block fields consulted by the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredBlock {
    pub transaction_count: u64,
}

/// Normalise a variadic topic list into the 4-slot insert shape.
pub fn topic_slots(topics: &[B256]) -> [Option<B256>; 4] {
    let mut slots = [None; 4];
    for (slot, topic) in slots.iter_mut().zip(topics.iter()) {
        *slot = Some(*topic);
    }
    slots
}

/// Store handle consumed by the monitor. Auto-commit operations run on the
/// session pool; `begin` hands out one transaction per pipeline iteration.
#[async_trait]
pub trait Store: Send + Sync {
    /// Highest stored block number for the chain, if any.
    async fn latest_block_number(&self, blockchain_id: &str) -> Result<Option<u64>>;
    async fn block_by_hash(&self, blockchain_id: &str, hash: B256) -> Result<Option<StoredBlock>>;
    /// Transaction rows summed across all block rows at `number`.
    async fn transaction_count_at(&self, blockchain_id: &str, number: u64) -> Result<u64>;
    /// Insert a block row outside any transaction; returns rows affected.
    async fn insert_block(&self, blockchain_id: &str, block: &BlockRecord) -> Result<u64>;
    /// Delete logs, transactions, ommers, and block rows at `number`.
    async fn flush_height(&self, blockchain_id: &str, number: u64) -> Result<()>;
    async fn begin(&self) -> Result<Box<dyn StoreTx>>;
}

/// One open transaction over the store.
#[async_trait]
pub trait StoreTx: Send {
    async fn delete_logs_at(&mut self, blockchain_id: &str, number: u64) -> Result<u64>;
    async fn delete_transactions_at(&mut self, blockchain_id: &str, number: u64) -> Result<u64>;
    async fn insert_ommer(
        &mut self,
        blockchain_id: &str,
        ommer_hash: B256,
        nibling_hash: B256,
    ) -> Result<()>;
    /// Returns rows affected.
    async fn insert_transaction(
        &mut self,
        blockchain_id: &str,
        tx: &TransactionRecord,
    ) -> Result<u64>;
    async fn delete_logs_by_transaction(&mut self, transaction_hash: B256) -> Result<u64>;
    /// Returns the assigned log id, or `None` when no row was written.
    async fn insert_log(&mut self, blockchain_id: &str, log: &LogRecord) -> Result<Option<i64>>;
    async fn insert_decoded_event(&mut self, event: &DecodedEvent) -> Result<()>;
    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}
