//! Node client with endpoint failover.

use alloy::primitives::{Address, Bloom, Bytes, B256, B64, U256};
use alloy::providers::{Provider, RootProvider};
use alloy::rpc::types::{Block as RpcBlock, BlockNumberOrTag, BlockTransactionsKind};
use alloy::rpc::types::{Transaction as RpcTransaction, TransactionReceipt as RpcReceipt};
use alloy::transports::http::{Client, Http};
use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tracing::info;
use url::Url;

/// Full block as reported by the node, with populated transaction entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainBlock {
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
    pub transactions: Vec<ChainTransaction>,
    pub uncles: Vec<B256>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainTransaction {
    pub hash: B256,
    pub nonce: u64,
    pub transaction_index: Option<u64>,
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    pub gas_price: Option<u128>,
    pub gas: u128,
    pub input: Bytes,
    pub signature: Option<ChainSignature>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChainSignature {
    pub v: u64,
    pub r: U256,
    pub s: U256,
}

/// Receipt fields consumed at persist time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainReceipt {
    pub status: bool,
    pub contract_address: Option<Address>,
    pub logs: Vec<ChainLog>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: Option<u64>,
    pub log_index: Option<u64>,
}

/// Execution node handle consumed by the monitor.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Fetch a block with full transaction objects; `None` past the head.
    async fn block_by_number(&self, number: u64) -> Result<Option<ChainBlock>>;
    /// Fetch a transaction receipt; `None` when not yet available.
    async fn transaction_receipt(&self, hash: B256) -> Result<Option<ChainReceipt>>;
    /// Current failover generation.
    fn version(&self) -> u64;
    /// Rotate to the next endpoint if `observed` is still the current
    /// generation. Returns the generation after the call, so concurrent
    /// callers observing the same error cannot rotate twice.
    fn cycle(&self, observed: u64) -> u64;
}

/// JSON-RPC client over an ordered list of HTTP endpoints.
///
/// Endpoints are immutable; the active one is `version % endpoints.len()`.
pub struct FailoverClient {
    endpoints: Vec<RootProvider<Http<Client>>>,
    urls: Vec<String>,
    version: AtomicU64,
    request_timeout: Duration,
}

impl FailoverClient {
    pub fn new(urls: &[String], request_timeout: Duration) -> Result<Self> {
        if urls.is_empty() {
            return Err(eyre!("at least one RPC endpoint is required"));
        }
        let mut endpoints = Vec::with_capacity(urls.len());
        for url in urls {
            let parsed: Url = url
                .parse()
                .wrap_err_with(|| format!("invalid RPC endpoint: {url}"))?;
            endpoints.push(RootProvider::new_http(parsed));
        }
        Ok(Self {
            endpoints,
            urls: urls.to_vec(),
            version: AtomicU64::new(0),
            request_timeout,
        })
    }

    fn active(&self) -> &RootProvider<Http<Client>> {
        let index = self.version.load(Ordering::SeqCst) as usize % self.endpoints.len();
        &self.endpoints[index]
    }

    fn active_url(&self) -> &str {
        let index = self.version.load(Ordering::SeqCst) as usize % self.urls.len();
        &self.urls[index]
    }
}

#[async_trait]
impl NodeClient for FailoverClient {
    async fn block_by_number(&self, number: u64) -> Result<Option<ChainBlock>> {
        let request = self.active().get_block_by_number(
            BlockNumberOrTag::Number(number),
            BlockTransactionsKind::Full,
        );
        match timeout(self.request_timeout, request).await {
            Ok(result) => {
                let block = result.wrap_err_with(|| format!("eth_getBlockByNumber({number})"))?;
                Ok(block.map(convert_block))
            }
            Err(_) => Err(eyre!(
                "connection timeout after {}ms fetching block {number} from {}",
                self.request_timeout.as_millis(),
                self.active_url()
            )),
        }
    }

    async fn transaction_receipt(&self, hash: B256) -> Result<Option<ChainReceipt>> {
        let request = self.active().get_transaction_receipt(hash);
        match timeout(self.request_timeout, request).await {
            Ok(result) => {
                let receipt =
                    result.wrap_err_with(|| format!("eth_getTransactionReceipt({hash})"))?;
                Ok(receipt.map(convert_receipt))
            }
            Err(_) => Err(eyre!(
                "connection timeout after {}ms fetching receipt {hash} from {}",
                self.request_timeout.as_millis(),
                self.active_url()
            )),
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
                let next = observed.wrapping_add(1);
                info!(
                    endpoint = %self.urls[next as usize % self.urls.len()],
                    generation = next,
                    "cycled to next RPC endpoint"
                );
                next
            }
            Err(current) => current,
        }
    }
}

fn convert_block(block: RpcBlock) -> ChainBlock {
    let transactions = block
        .transactions
        .into_transactions()
        .map(convert_transaction)
        .collect();
    let header = block.header;
    ChainBlock {
        number: header.inner.number,
        hash: header.hash,
        parent_hash: header.inner.parent_hash,
        nonce: header.inner.nonce,
        gas_limit: header.inner.gas_limit,
        gas_used: header.inner.gas_used,
        timestamp: header.inner.timestamp,
        sha3_uncles: header.inner.ommers_hash,
        logs_bloom: header.inner.logs_bloom,
        transactions_root: header.inner.transactions_root,
        receipts_root: header.inner.receipts_root,
        state_root: header.inner.state_root,
        mix_hash: header.inner.mix_hash,
        miner: header.inner.beneficiary,
        difficulty: header.inner.difficulty,
        extra_data: header.inner.extra_data.clone(),
        size: header.size.map(|size| size.saturating_to::<u64>()),
        transactions,
        uncles: block.uncles,
    }
}

fn convert_transaction(tx: RpcTransaction) -> ChainTransaction {
    use alloy::consensus::Transaction as _;
    use alloy::network::TransactionResponse as _;

    let signature = tx.inner.signature();
    let signature = ChainSignature {
        v: signature.v() as u64,
        r: signature.r(),
        s: signature.s(),
    };
    ChainTransaction {
        hash: tx.tx_hash(),
        nonce: tx.inner.nonce(),
        transaction_index: tx.transaction_index,
        from: tx.from,
        to: tx.inner.to(),
        value: tx.inner.value(),
        gas_price: tx.inner.gas_price(),
        gas: tx.inner.gas_limit() as u128,
        input: tx.inner.input().clone(),
        signature: Some(signature),
    }
}

fn convert_receipt(receipt: RpcReceipt) -> ChainReceipt {
    let logs = receipt
        .inner
        .logs()
        .iter()
        .map(|log| ChainLog {
            address: log.inner.address,
            topics: log.inner.data.topics().to_vec(),
            data: log.inner.data.data.clone(),
            block_number: log.block_number,
            log_index: log.log_index,
        })
        .collect();
    ChainReceipt {
        status: receipt.status(),
        contract_address: receipt.contract_address,
        logs,
    }
}
