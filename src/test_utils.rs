//! Shared mocks and builders for tests.

use crate::node::{ChainBlock, ChainLog, ChainReceipt, ChainSignature, ChainTransaction, NodeClient};
use crate::store::{
    BlockRecord, DecodedEvent, LogRecord, Store, StoreTx, StoredBlock, TransactionRecord,
};
use alloy::primitives::{b256, Address, Bytes, B256, U256};
use async_trait::async_trait;
use eyre::{eyre, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

pub const TRANSFER_SIGNATURE: &str = "Transfer(address,address,uint256)";
pub const TRANSFER_TOPIC: B256 =
    b256!("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef");

pub fn temp_dir(prefix: &str) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time moves forward")
        .as_nanos();
    let suffix = COUNTER.fetch_add(1, Ordering::SeqCst);
    let mut path = std::env::temp_dir();
    path.push(format!(
        "chain-cache-monitor-{prefix}-test-{now}-{}-{suffix}",
        std::process::id()
    ));
    path
}

pub fn hash_from_u64(value: u64) -> B256 {
    let mut bytes = [0u8; 32];
    bytes[24..].copy_from_slice(&value.to_be_bytes());
    B256::from(bytes)
}

pub fn address_from_u64(value: u64) -> Address {
    let mut bytes = [0u8; 20];
    bytes[12..].copy_from_slice(&value.to_be_bytes());
    Address::from_slice(&bytes)
}

pub fn chain_transaction(seed: u64) -> ChainTransaction {
    ChainTransaction {
        hash: hash_from_u64(777_000 + seed),
        nonce: seed,
        transaction_index: Some(seed % 16),
        from: address_from_u64(seed),
        to: Some(address_from_u64(seed + 1)),
        value: U256::from(seed * 1000),
        gas_price: Some(1_000_000_000),
        gas: 21_000,
        input: Bytes::new(),
        signature: Some(ChainSignature {
            v: 27,
            r: U256::from(seed + 2),
            s: U256::from(seed + 3),
        }),
    }
}

pub fn block_with_transactions(
    number: u64,
    hash: B256,
    transactions: Vec<ChainTransaction>,
) -> ChainBlock {
    ChainBlock {
        number,
        hash,
        parent_hash: hash_from_u64(number),
        gas_limit: 30_000_000,
        gas_used: 21_000 * transactions.len() as u64,
        timestamp: 1_700_000_000 + number * 12,
        size: Some(512),
        transactions,
        ..ChainBlock::default()
    }
}

pub fn chain_log(topics: Vec<B256>) -> ChainLog {
    ChainLog {
        address: address_from_u64(0xFEED),
        topics,
        data: Bytes::from(vec![0x01]),
        block_number: None,
        log_index: None,
    }
}

pub fn receipt_with_logs(logs: Vec<ChainLog>) -> ChainReceipt {
    ChainReceipt {
        status: true,
        contract_address: None,
        logs,
    }
}

/// Node client mock with scripted blocks, receipts, delays, and failures.
pub struct MockNode {
    blocks: Mutex<HashMap<u64, ChainBlock>>,
    /// Receipt plus the number of requests that still return `None`.
    receipts: Mutex<HashMap<B256, (ChainReceipt, u32)>>,
    /// Fetches of a height that return empty before the block appears.
    delays: Mutex<HashMap<u64, u32>>,
    /// Scripted errors per height: (message, remaining firings).
    failures: Mutex<HashMap<u64, (String, u32)>>,
    fetch_counts: Mutex<HashMap<u64, u64>>,
    version: AtomicU64,
    cycles: AtomicU64,
}

impl MockNode {
    pub fn new() -> Self {
        Self {
            blocks: Mutex::new(HashMap::new()),
            receipts: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            fetch_counts: Mutex::new(HashMap::new()),
            version: AtomicU64::new(0),
            cycles: AtomicU64::new(0),
        }
    }

    pub fn add_block(&self, block: ChainBlock) {
        self.blocks.lock().unwrap().insert(block.number, block);
    }

    pub fn block(&self, number: u64) -> Option<ChainBlock> {
        self.blocks.lock().unwrap().get(&number).cloned()
    }

    pub fn add_receipt(&self, hash: B256, receipt: ChainReceipt) {
        self.receipts.lock().unwrap().insert(hash, (receipt, 0));
    }

    /// Receipt that becomes available only after `unavailable` requests.
    pub fn add_receipt_after(&self, hash: B256, receipt: ChainReceipt, unavailable: u32) {
        self.receipts
            .lock()
            .unwrap()
            .insert(hash, (receipt, unavailable));
    }

    /// Return empty for the first `polls` fetches of `number`.
    pub fn delay_block(&self, number: u64, polls: u32) {
        self.delays.lock().unwrap().insert(number, polls);
    }

    /// Fail the next `times` fetches of `number` with `message`.
    pub fn fail_block_fetch(&self, number: u64, message: &str, times: u32) {
        self.failures
            .lock()
            .unwrap()
            .insert(number, (message.to_string(), times));
    }

    pub fn cycle_count(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    pub fn fetches_for(&self, number: u64) -> u64 {
        self.fetch_counts
            .lock()
            .unwrap()
            .get(&number)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_fetches(&self) -> u64 {
        self.fetch_counts.lock().unwrap().values().sum()
    }
}

impl Default for MockNode {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeClient for MockNode {
    async fn block_by_number(&self, number: u64) -> Result<Option<ChainBlock>> {
        *self.fetch_counts.lock().unwrap().entry(number).or_insert(0) += 1;

        if let Some((message, remaining)) = self.failures.lock().unwrap().get_mut(&number) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(eyre!("{message}"));
            }
        }
        if let Some(remaining) = self.delays.lock().unwrap().get_mut(&number) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(None);
            }
        }
        Ok(self.blocks.lock().unwrap().get(&number).cloned())
    }

    async fn transaction_receipt(&self, hash: B256) -> Result<Option<ChainReceipt>> {
        let mut receipts = self.receipts.lock().unwrap();
        match receipts.get_mut(&hash) {
            Some((_, remaining)) if *remaining > 0 => {
                *remaining -= 1;
                Ok(None)
            }
            Some((receipt, _)) => Ok(Some(receipt.clone())),
            None => Ok(None),
        }
    }

    fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    fn cycle(&self, observed: u64) -> u64 {
        match self.version.compare_exchange(
            observed,
            observed.wrapping_add(1),
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {
                self.cycles.fetch_add(1, Ordering::SeqCst);
                observed.wrapping_add(1)
            }
            Err(current) => current,
        }
    }
}

/// Stored rows, shared between a `MemoryStore` and its open transactions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryState {
    pub blocks: Vec<(String, BlockRecord)>,
    pub ommers: Vec<(String, B256, B256)>,
    pub transactions: Vec<(String, TransactionRecord)>,
    pub logs: Vec<(String, LogRecord, i64)>,
    pub decoded: Vec<DecodedEvent>,
    pub next_log_id: i64,
}

impl MemoryState {
    fn block_hashes_at(&self, blockchain_id: &str, number: u64) -> Vec<B256> {
        self.blocks
            .iter()
            .filter(|(chain, block)| chain == blockchain_id && block.number == number)
            .map(|(_, block)| block.hash)
            .collect()
    }

    fn transaction_rows_at(&self, blockchain_id: &str, number: u64) -> usize {
        let hashes = self.block_hashes_at(blockchain_id, number);
        self.transactions
            .iter()
            .filter(|(chain, tx)| chain == blockchain_id && hashes.contains(&tx.block_hash))
            .count()
    }

    /// Remove decoded rows whose backing log ids are about to be deleted.
    fn drop_decoded(&mut self, log_ids: &[i64]) {
        self.decoded.retain(|event| !log_ids.contains(&event.log_id));
    }

    pub fn is_empty_state(&self) -> bool {
        self.blocks.is_empty()
            && self.ommers.is_empty()
            && self.transactions.is_empty()
            && self.logs.is_empty()
            && self.decoded.is_empty()
    }
}

/// In-memory store with clone-on-begin transaction semantics: a transaction
/// mutates a working copy which replaces the shared state on commit.
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    fail_transaction_inserts: Arc<AtomicBool>,
    fail_log_inserts: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                next_log_id: 1,
                ..MemoryState::default()
            })),
            fail_transaction_inserts: Arc::new(AtomicBool::new(false)),
            fail_log_inserts: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn fail_transaction_inserts(&self, fail: bool) {
        self.fail_transaction_inserts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_log_inserts(&self, fail: bool) {
        self.fail_log_inserts.store(fail, Ordering::SeqCst);
    }

    /// Seed a block row plus all of its transaction rows, with one log each.
    pub fn seed_block(&self, blockchain_id: &str, block: &ChainBlock) {
        self.seed_block_partial(blockchain_id, block, block.transactions.len());
    }

    /// Seed a block row but only the first `stored` of its transactions, as
    /// left behind by an interrupted or receipt-starved persist.
    pub fn seed_block_partial(&self, blockchain_id: &str, block: &ChainBlock, stored: usize) {
        let mut state = self.state.lock().unwrap();
        state
            .blocks
            .push((blockchain_id.to_string(), BlockRecord::from_chain(block)));
        for txn in block.transactions.iter().take(stored) {
            let record = TransactionRecord::from_chain(block.hash, txn, true, None);
            state.transactions.push((blockchain_id.to_string(), record));
            let log_id = state.next_log_id;
            state.next_log_id += 1;
            state.logs.push((
                blockchain_id.to_string(),
                LogRecord::from_chain(txn.hash, block.number, 0, &chain_log(vec![])),
                log_id,
            ));
        }
    }

    /// Canonical copy for equality assertions: rows are sorted and the
    /// store-assigned log ids are erased.
    pub fn snapshot(&self) -> MemoryState {
        let mut state = self.state.lock().unwrap().clone();
        state.blocks.sort_by(|a, b| {
            (a.0.as_str(), a.1.number, a.1.hash).cmp(&(b.0.as_str(), b.1.number, b.1.hash))
        });
        state.ommers.sort();
        state.transactions.sort_by(|a, b| {
            (a.0.as_str(), a.1.block_hash, a.1.hash).cmp(&(b.0.as_str(), b.1.block_hash, b.1.hash))
        });
        state.logs.sort_by(|a, b| {
            (a.0.as_str(), a.1.block_number, a.1.transaction_hash, a.1.log_index)
                .cmp(&(b.0.as_str(), b.1.block_number, b.1.transaction_hash, b.1.log_index))
        });
        for (_, _, log_id) in &mut state.logs {
            *log_id = 0;
        }
        state.decoded.sort_by(|a, b| {
            (a.address, a.name.as_str()).cmp(&(b.address, b.name.as_str()))
        });
        for event in &mut state.decoded {
            event.log_id = 0;
        }
        state.next_log_id = 0;
        state
    }

    pub fn block_rows_at(&self, blockchain_id: &str, number: u64) -> usize {
        self.state
            .lock()
            .unwrap()
            .block_hashes_at(blockchain_id, number)
            .len()
    }

    pub fn has_block_hash(&self, blockchain_id: &str, hash: B256) -> bool {
        self.state
            .lock()
            .unwrap()
            .blocks
            .iter()
            .any(|(chain, block)| chain == blockchain_id && block.hash == hash)
    }

    pub fn ommer_count(&self, blockchain_id: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .ommers
            .iter()
            .filter(|(chain, _, _)| chain == blockchain_id)
            .count()
    }

    pub fn transaction_rows_at(&self, blockchain_id: &str, number: u64) -> usize {
        self.state
            .lock()
            .unwrap()
            .transaction_rows_at(blockchain_id, number)
    }

    pub fn transactions_for_block(&self, blockchain_id: &str, block_hash: B256) -> usize {
        self.state
            .lock()
            .unwrap()
            .transactions
            .iter()
            .filter(|(chain, tx)| chain == blockchain_id && tx.block_hash == block_hash)
            .count()
    }

    pub fn has_transaction(&self, blockchain_id: &str, hash: B256) -> bool {
        self.state
            .lock()
            .unwrap()
            .transactions
            .iter()
            .any(|(chain, tx)| chain == blockchain_id && tx.hash == hash)
    }

    pub fn log_rows_at(&self, blockchain_id: &str, number: u64) -> usize {
        self.state
            .lock()
            .unwrap()
            .logs
            .iter()
            .filter(|(chain, log, _)| chain == blockchain_id && log.block_number == number)
            .count()
    }

    pub fn decoded_event_names(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .decoded
            .iter()
            .map(|event| event.name.clone())
            .collect()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn latest_block_number(&self, blockchain_id: &str) -> Result<Option<u64>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .blocks
            .iter()
            .filter(|(chain, _)| chain == blockchain_id)
            .map(|(_, block)| block.number)
            .max())
    }

    async fn block_by_hash(&self, blockchain_id: &str, hash: B256) -> Result<Option<StoredBlock>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .blocks
            .iter()
            .find(|(chain, block)| chain == blockchain_id && block.hash == hash)
            .map(|(_, block)| StoredBlock {
                transaction_count: block.transaction_count,
            }))
    }

    async fn transaction_count_at(&self, blockchain_id: &str, number: u64) -> Result<u64> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .transaction_rows_at(blockchain_id, number) as u64)
    }

    async fn insert_block(&self, blockchain_id: &str, block: &BlockRecord) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        let exists = state
            .blocks
            .iter()
            .any(|(chain, stored)| chain == blockchain_id && stored.hash == block.hash);
        if exists {
            return Ok(0);
        }
        state
            .blocks
            .push((blockchain_id.to_string(), block.clone()));
        Ok(1)
    }

    async fn flush_height(&self, blockchain_id: &str, number: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let hashes = state.block_hashes_at(blockchain_id, number);
        let removed_log_ids: Vec<i64> = state
            .logs
            .iter()
            .filter(|(chain, log, _)| chain == blockchain_id && log.block_number == number)
            .map(|(_, _, log_id)| *log_id)
            .collect();
        state.drop_decoded(&removed_log_ids);
        state
            .logs
            .retain(|(chain, log, _)| !(chain == blockchain_id && log.block_number == number));
        state
            .transactions
            .retain(|(chain, tx)| !(chain == blockchain_id && hashes.contains(&tx.block_hash)));
        state
            .ommers
            .retain(|(chain, _, nibling)| !(chain == blockchain_id && hashes.contains(nibling)));
        state
            .blocks
            .retain(|(chain, block)| !(chain == blockchain_id && block.number == number));
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn StoreTx>> {
        let working = self.state.lock().unwrap().clone();
        Ok(Box::new(MemoryTx {
            shared: Arc::clone(&self.state),
            working,
            fail_transaction_inserts: Arc::clone(&self.fail_transaction_inserts),
            fail_log_inserts: Arc::clone(&self.fail_log_inserts),
        }))
    }
}

struct MemoryTx {
    shared: Arc<Mutex<MemoryState>>,
    working: MemoryState,
    fail_transaction_inserts: Arc<AtomicBool>,
    fail_log_inserts: Arc<AtomicBool>,
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn delete_logs_at(&mut self, blockchain_id: &str, number: u64) -> Result<u64> {
        let removed_log_ids: Vec<i64> = self
            .working
            .logs
            .iter()
            .filter(|(chain, log, _)| chain == blockchain_id && log.block_number == number)
            .map(|(_, _, log_id)| *log_id)
            .collect();
        self.working.drop_decoded(&removed_log_ids);
        let before = self.working.logs.len();
        self.working
            .logs
            .retain(|(chain, log, _)| !(chain == blockchain_id && log.block_number == number));
        Ok((before - self.working.logs.len()) as u64)
    }

    async fn delete_transactions_at(&mut self, blockchain_id: &str, number: u64) -> Result<u64> {
        let hashes = self.working.block_hashes_at(blockchain_id, number);
        let before = self.working.transactions.len();
        self.working
            .transactions
            .retain(|(chain, tx)| !(chain == blockchain_id && hashes.contains(&tx.block_hash)));
        Ok((before - self.working.transactions.len()) as u64)
    }

    async fn insert_ommer(
        &mut self,
        blockchain_id: &str,
        ommer_hash: B256,
        nibling_hash: B256,
    ) -> Result<()> {
        let entry = (blockchain_id.to_string(), ommer_hash, nibling_hash);
        if !self.working.ommers.contains(&entry) {
            self.working.ommers.push(entry);
        }
        Ok(())
    }

    async fn insert_transaction(
        &mut self,
        blockchain_id: &str,
        tx: &TransactionRecord,
    ) -> Result<u64> {
        if self.fail_transaction_inserts.load(Ordering::SeqCst) {
            return Ok(0);
        }
        self.working
            .transactions
            .push((blockchain_id.to_string(), tx.clone()));
        Ok(1)
    }

    async fn delete_logs_by_transaction(&mut self, transaction_hash: B256) -> Result<u64> {
        let removed_log_ids: Vec<i64> = self
            .working
            .logs
            .iter()
            .filter(|(_, log, _)| log.transaction_hash == transaction_hash)
            .map(|(_, _, log_id)| *log_id)
            .collect();
        self.working.drop_decoded(&removed_log_ids);
        let before = self.working.logs.len();
        self.working
            .logs
            .retain(|(_, log, _)| log.transaction_hash != transaction_hash);
        Ok((before - self.working.logs.len()) as u64)
    }

    async fn insert_log(&mut self, blockchain_id: &str, log: &LogRecord) -> Result<Option<i64>> {
        if self.fail_log_inserts.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let log_id = self.working.next_log_id;
        self.working.next_log_id += 1;
        self.working
            .logs
            .push((blockchain_id.to_string(), log.clone(), log_id));
        Ok(Some(log_id))
    }

    async fn insert_decoded_event(&mut self, event: &DecodedEvent) -> Result<()> {
        self.working.decoded.push(event.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        *self.shared.lock().unwrap() = self.working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
