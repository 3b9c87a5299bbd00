//! Transactional block persistence.

use crate::decode::LogDecoder;
use crate::node::{ChainBlock, ChainReceipt, NodeClient};
use crate::store::{BlockRecord, LogRecord, Store, StoreTx, TransactionRecord};
use eyre::{eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, warn};

/// Pause after a failed persist before terminating.
pub const PERSIST_FAILURE_PAUSE: Duration = Duration::from_millis(1000);

/// Persist a block with its ommers, transactions, and logs.
///
/// The block row itself is written outside the transaction (skipped entirely
/// when rewriting a hash that is already stored); everything else happens in
/// one transaction: delete stale rows at the height, insert ommers, then per
/// transaction insert the row and its logs. Receipt fetches fan out
/// concurrently with a join barrier before any write.
pub async fn persist_block(
    store: &dyn Store,
    client: Arc<dyn NodeClient>,
    decoder: &dyn LogDecoder,
    blockchain_id: &str,
    block: &ChainBlock,
    insert_block_row: bool,
) -> Result<()> {
    if insert_block_row {
        let record = BlockRecord::from_chain(block);
        let rows = store.insert_block(blockchain_id, &record).await?;
        if rows == 0 {
            return Err(eyre!(
                "block insert affected no rows: {} ({})",
                block.number,
                block.hash
            ));
        }
    }

    let mut tx = store.begin().await?;
    match write_associated(tx.as_mut(), client, decoder, blockchain_id, block).await {
        Ok(()) => {
            tx.commit().await?;
            Ok(())
        }
        Err(err) => {
            error!(block = block.number, error = %err, "persist failed; rolling back");
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "rollback failed");
            }
            sleep(PERSIST_FAILURE_PAUSE).await;
            Err(err)
        }
    }
}

async fn write_associated(
    tx: &mut dyn StoreTx,
    client: Arc<dyn NodeClient>,
    decoder: &dyn LogDecoder,
    blockchain_id: &str,
    block: &ChainBlock,
) -> Result<()> {
    tx.delete_logs_at(blockchain_id, block.number).await?;
    tx.delete_transactions_at(blockchain_id, block.number)
        .await?;

    for uncle in &block.uncles {
        tx.insert_ommer(blockchain_id, *uncle, block.hash).await?;
    }

    let receipts = fetch_receipts(client, block).await?;

    for (txn, receipt) in block.transactions.iter().zip(receipts) {
        let Some(receipt) = receipt else {
            debug!(
                block = block.number,
                transaction = %txn.hash,
                "receipt not yet available; skipping transaction"
            );
            continue;
        };

        let record =
            TransactionRecord::from_chain(block.hash, txn, receipt.status, receipt.contract_address);
        let rows = tx.insert_transaction(blockchain_id, &record).await?;
        if rows == 0 {
            return Err(eyre!("transaction insert affected no rows: {}", txn.hash));
        }

        if receipt.logs.is_empty() {
            continue;
        }
        // Covers a transaction reinserted under a different block hash whose
        // logs survived the height-wide delete.
        tx.delete_logs_by_transaction(txn.hash).await?;
        for (index, log) in receipt.logs.iter().enumerate() {
            let record = LogRecord::from_chain(txn.hash, block.number, index as u64, log);
            match tx.insert_log(blockchain_id, &record).await? {
                Some(log_id) => {
                    if let Some(event) = decoder.decode(log_id, &record) {
                        tx.insert_decoded_event(&event).await?;
                    }
                }
                None => warn!(
                    transaction = %txn.hash,
                    log_index = record.log_index,
                    "log insert affected no rows; skipping"
                ),
            }
        }
    }

    Ok(())
}

/// Fetch all receipts for the block concurrently, preserving transaction
/// order. Each task binds its own index so results can be joined in any
/// completion order.
async fn fetch_receipts(
    client: Arc<dyn NodeClient>,
    block: &ChainBlock,
) -> Result<Vec<Option<ChainReceipt>>> {
    let mut receipts: Vec<Option<ChainReceipt>> = vec![None; block.transactions.len()];
    let mut tasks = JoinSet::new();
    for (index, txn) in block.transactions.iter().enumerate() {
        let client = Arc::clone(&client);
        let hash = txn.hash;
        tasks.spawn(async move {
            let receipt = client.transaction_receipt(hash).await?;
            Ok::<_, eyre::Report>((index, receipt))
        });
    }
    while let Some(joined) = tasks.join_next().await {
        let (index, receipt) = joined??;
        receipts[index] = receipt;
    }
    Ok(receipts)
}
