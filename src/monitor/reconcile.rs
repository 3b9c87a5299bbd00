//! Reconciliation of fetched blocks against stored state.

use crate::node::ChainBlock;
use crate::store::Store;
use eyre::Result;

/// What to do with a fetched block.
///
/// A hash already present is authoritative for its transaction set; a height
/// whose transaction total disagrees indicates uncling and is resolved by
/// trusting the current fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileDecision {
    /// Block and its height are fully stored; nothing to do.
    AlreadyExists,
    /// The block row exists but associated rows are stale; clear and rewrite
    /// without inserting a new block row.
    RewriteAssociated,
    /// No row for this hash; insert the block row and its associations.
    InsertNew,
}

pub async fn reconcile(
    store: &dyn Store,
    blockchain_id: &str,
    block: &ChainBlock,
) -> Result<ReconcileDecision> {
    let fetched_count = block.transactions.len() as u64;
    let stored = match store.block_by_hash(blockchain_id, block.hash).await? {
        Some(stored) => stored,
        None => return Ok(ReconcileDecision::InsertNew),
    };

    if stored.transaction_count != fetched_count {
        // The node re-included this hash with a different transaction set.
        return Ok(ReconcileDecision::RewriteAssociated);
    }

    let height_total = store
        .transaction_count_at(blockchain_id, block.number)
        .await?;
    if height_total == fetched_count {
        Ok(ReconcileDecision::AlreadyExists)
    } else {
        // Stale transactions from another fork linger at this height.
        Ok(ReconcileDecision::RewriteAssociated)
    }
}
