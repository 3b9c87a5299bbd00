//! CLI and config handling.

use clap::{ArgAction, Parser};
use std::path::PathBuf;

pub const DEFAULT_BLOCKCHAIN_ID: &str = "ethereum-mainnet";
pub const DEFAULT_REVIEW_BLOCK_LIMIT: u64 = 15;
pub const DEFAULT_COMPREHENSIVE_REVIEW_BLOCK_LIMIT: u64 = 100;
pub const DEFAULT_COMPREHENSIVE_REVIEW_COUNT_MOD: u64 = 10;
pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 15_000;

/// Chain cache monitor configuration.
#[derive(Parser, Debug, Clone)]
#[command(name = "chain-cache-monitor", about = "Mirrors an EVM chain into Postgres")]
pub struct MonitorConfig {
    /// Opaque chain identifier attached to every stored row.
    #[arg(long, default_value = DEFAULT_BLOCKCHAIN_ID)]
    pub blockchain_id: String,
    /// Postgres connection string.
    #[arg(long, env = "DATABASE_URL")]
    pub db_url: String,
    /// Execution node JSON-RPC endpoint; repeat to define the failover order.
    #[arg(long = "rpc-url", required = true)]
    pub rpc_urls: Vec<String>,
    /// Resume from this height instead of the stored maximum.
    #[arg(long)]
    pub start_block: Option<u64>,
    /// Stop cleanly once the cursor reaches this height.
    #[arg(long)]
    pub end_block: Option<u64>,
    /// Trailing heights revisited after each idle head poll.
    #[arg(long, default_value_t = DEFAULT_REVIEW_BLOCK_LIMIT)]
    pub review_block_limit: u64,
    /// Trailing heights revisited on the comprehensive review cadence.
    #[arg(long, default_value_t = DEFAULT_COMPREHENSIVE_REVIEW_BLOCK_LIMIT)]
    pub comprehensive_review_block_limit: u64,
    /// Every Nth idle poll runs the comprehensive review window.
    #[arg(long, default_value_t = DEFAULT_COMPREHENSIVE_REVIEW_COUNT_MOD)]
    pub comprehensive_review_count_mod: u64,
    /// Per-request RPC deadline in milliseconds.
    #[arg(long, default_value_t = DEFAULT_RPC_TIMEOUT_MS)]
    pub rpc_timeout_ms: u64,
    /// JSON file of event signatures for log decoding.
    #[arg(long)]
    pub abi_config: Option<PathBuf>,
    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short = 'v', action = ArgAction::Count)]
    pub verbosity: u8,
}

impl MonitorConfig {
    /// Parse configuration from CLI args.
    pub fn from_args() -> Self {
        Self::parse()
    }
}
