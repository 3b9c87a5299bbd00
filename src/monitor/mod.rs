//! Cache monitor: cursor loop, review fan-out, and startup flush.

mod fetch;
mod persist;
mod reconcile;
mod review;

pub use fetch::{fetch_block, is_transient, FetchOutcome};
pub use persist::persist_block;
pub use reconcile::{reconcile, ReconcileDecision};
pub use review::{review_window, ReviewScheduler};

use crate::cli::MonitorConfig;
use crate::decode::LogDecoder;
use crate::metrics::{crossed_interval, rate_per_sec};
use crate::node::NodeClient;
use crate::store::Store;
use eyre::Result;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, info};

const MAX_CONCURRENT_REVIEWS: usize = 8;
const PROGRESS_LOG_INTERVAL: u64 = 1000;

/// Per-instance monitor options.
#[derive(Debug, Clone)]
pub struct MonitorOptions {
    pub blockchain_id: String,
    pub start_block_override: Option<u64>,
    pub end_block_override: Option<u64>,
    pub review_block_limit: u64,
    pub comprehensive_review_block_limit: u64,
    pub comprehensive_review_count_mod: u64,
}

impl From<&MonitorConfig> for MonitorOptions {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            blockchain_id: config.blockchain_id.clone(),
            start_block_override: config.start_block,
            end_block_override: config.end_block,
            review_block_limit: config.review_block_limit,
            comprehensive_review_block_limit: config.comprehensive_review_block_limit,
            comprehensive_review_count_mod: config.comprehensive_review_count_mod,
        }
    }
}

/// Whether a pipeline run serves the head cursor or a review pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineMode {
    Head,
    Review,
}

/// Outcome of one fetch-reconcile-persist pass at a height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Block persisted; the head cursor may advance.
    Advance,
    /// Block and height already fully stored.
    AlreadyExists,
    /// The node has no block at this height.
    AtHead,
    /// Endpoint was cycled; rerun the same height.
    Retry,
}

/// Single-chain ingestion monitor.
pub struct CacheMonitor {
    store: Arc<dyn Store>,
    client: Arc<dyn NodeClient>,
    decoder: Arc<dyn LogDecoder>,
    options: MonitorOptions,
    review: ReviewScheduler,
    /// Review pipelines in flight; they outlive their round and run
    /// alongside head polling.
    review_tasks: JoinSet<Result<()>>,
    review_permits: Arc<Semaphore>,
}

impl CacheMonitor {
    pub fn new(
        store: Arc<dyn Store>,
        client: Arc<dyn NodeClient>,
        decoder: Arc<dyn LogDecoder>,
        options: MonitorOptions,
    ) -> Self {
        let review = ReviewScheduler::new(
            options.review_block_limit,
            options.comprehensive_review_block_limit,
            options.comprehensive_review_count_mod,
        );
        Self {
            store,
            client,
            decoder,
            options,
            review,
            review_tasks: JoinSet::new(),
            review_permits: Arc::new(Semaphore::new(MAX_CONCURRENT_REVIEWS)),
        }
    }

    /// Run the ingestion loop until `end_block_override` is reached or a
    /// non-transient failure escalates.
    pub async fn run(mut self) -> Result<()> {
        let blockchain_id = self.options.blockchain_id.clone();

        let resume = match self.options.start_block_override {
            Some(height) => height,
            None => self
                .store
                .latest_block_number(&blockchain_id)
                .await?
                .unwrap_or(0),
        };
        // The previous run may have crashed mid-persist at this height.
        info!(
            blockchain_id = %blockchain_id,
            resume,
            "flushing resumption height before ingest"
        );
        self.store.flush_height(&blockchain_id, resume).await?;

        let mut cursor = resume;
        let started = Instant::now();
        let mut advanced: u64 = 0;
        loop {
            self.drain_finished_reviews()?;

            if let Some(end) = self.options.end_block_override {
                if cursor >= end {
                    info!(cursor, end, "end block reached; stopping");
                    while let Some(joined) = self.review_tasks.join_next().await {
                        joined??;
                    }
                    return Ok(());
                }
            }

            let outcome = run_pipeline(
                Arc::clone(&self.store),
                Arc::clone(&self.client),
                Arc::clone(&self.decoder),
                blockchain_id.clone(),
                cursor,
                PipelineMode::Head,
            )
            .await?;

            match outcome {
                PipelineOutcome::Advance => {
                    debug!(cursor, "block persisted; advancing");
                    advanced += 1;
                    if crossed_interval(advanced.saturating_sub(1), advanced, PROGRESS_LOG_INTERVAL)
                    {
                        info!(
                            cursor,
                            blocks = advanced,
                            blocks_per_sec = ?rate_per_sec(advanced, started.elapsed()),
                            "ingest progress"
                        );
                    }
                    cursor += 1;
                }
                PipelineOutcome::AlreadyExists => {
                    debug!(cursor, "block already stored; advancing");
                    cursor += 1;
                }
                PipelineOutcome::Retry => {}
                PipelineOutcome::AtHead => {
                    self.run_review(cursor).await?;
                }
            }
        }
    }

    /// Launch one review round and sleep its cadence. The spawned pipelines
    /// keep running after the pause, alongside the next head polls; only
    /// their already-finished results are collected here. Review pipelines
    /// never touch the cursor.
    async fn run_review(&mut self, cursor: u64) -> Result<()> {
        let plan = self.review.next_plan(cursor);
        debug!(
            cursor,
            heights = plan.heights.len(),
            comprehensive = plan.comprehensive,
            "at head; reviewing trailing blocks"
        );

        for height in plan.heights {
            let permits = Arc::clone(&self.review_permits);
            let store = Arc::clone(&self.store);
            let client = Arc::clone(&self.client);
            let decoder = Arc::clone(&self.decoder);
            let blockchain_id = self.options.blockchain_id.clone();
            self.review_tasks.spawn(async move {
                let _permit = permits.acquire_owned().await?;
                loop {
                    let outcome = run_pipeline(
                        Arc::clone(&store),
                        Arc::clone(&client),
                        Arc::clone(&decoder),
                        blockchain_id.clone(),
                        height,
                        PipelineMode::Review,
                    )
                    .await?;
                    if !matches!(outcome, PipelineOutcome::Retry) {
                        return Ok(());
                    }
                }
            });
        }

        sleep(plan.pause).await;
        self.drain_finished_reviews()
    }

    /// Propagate results from review pipelines that have already finished,
    /// without waiting on the ones still running.
    fn drain_finished_reviews(&mut self) -> Result<()> {
        while let Some(joined) = self.review_tasks.try_join_next() {
            joined??;
        }
        Ok(())
    }
}

/// One fetch-reconcile-persist pass at `height`.
pub async fn run_pipeline(
    store: Arc<dyn Store>,
    client: Arc<dyn NodeClient>,
    decoder: Arc<dyn LogDecoder>,
    blockchain_id: String,
    height: u64,
    mode: PipelineMode,
) -> Result<PipelineOutcome> {
    let block = match fetch_block(client.as_ref(), height).await? {
        FetchOutcome::Retry => return Ok(PipelineOutcome::Retry),
        FetchOutcome::AtHead => return Ok(PipelineOutcome::AtHead),
        FetchOutcome::Block(block) => block,
    };

    match reconcile(store.as_ref(), &blockchain_id, &block).await? {
        ReconcileDecision::AlreadyExists => Ok(PipelineOutcome::AlreadyExists),
        ReconcileDecision::RewriteAssociated => {
            info!(
                block = height,
                hash = %block.hash,
                "stale data at height; rewriting associated rows"
            );
            persist_block(
                store.as_ref(),
                client,
                decoder.as_ref(),
                &blockchain_id,
                &block,
                false,
            )
            .await?;
            Ok(PipelineOutcome::Advance)
        }
        ReconcileDecision::InsertNew => {
            if mode == PipelineMode::Review {
                info!(
                    block = height,
                    hash = %block.hash,
                    "found missing block during review"
                );
            }
            persist_block(
                store.as_ref(),
                client,
                decoder.as_ref(),
                &blockchain_id,
                &block,
                true,
            )
            .await?;
            Ok(PipelineOutcome::Advance)
        }
    }
}
