//! Block fetching and outcome classification.

use crate::node::{ChainBlock, NodeClient};
use eyre::Result;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, warn};

/// Pause before terminating on an unrecoverable node error, to keep a
/// supervisor from restarting into a tight crash loop.
pub const FATAL_EXIT_PAUSE: Duration = Duration::from_millis(2500);

/// Error fragments that are resolved by switching endpoints.
const TRANSIENT_MARKERS: [&str; 2] = ["invalid json rpc response", "connection timeout"];

/// Outcome of a single fetch attempt.
#[derive(Debug)]
pub enum FetchOutcome {
    /// The node has no block at this height yet.
    AtHead,
    Block(Box<ChainBlock>),
    /// The endpoint was cycled after a transient error; retry the same height.
    Retry,
}

/// True for errors that endpoint failover can resolve.
pub fn is_transient(err: &eyre::Report) -> bool {
    err.chain().any(|cause| {
        let message = cause.to_string().to_lowercase();
        TRANSIENT_MARKERS
            .iter()
            .any(|marker| message.contains(marker))
    })
}

/// Fetch one block and classify the result.
///
/// The failover generation is captured before the request, so a transient
/// error can rotate the endpoint at most once per fetch even when the same
/// error surfaces from more than one caller.
pub async fn fetch_block(client: &dyn NodeClient, number: u64) -> Result<FetchOutcome> {
    let observed = client.version();
    match client.block_by_number(number).await {
        Ok(Some(block)) => Ok(FetchOutcome::Block(Box::new(block))),
        Ok(None) => Ok(FetchOutcome::AtHead),
        Err(err) if is_transient(&err) => {
            warn!(block = number, error = %err, "transient node error; cycling endpoint");
            client.cycle(observed);
            Ok(FetchOutcome::Retry)
        }
        Err(err) => {
            error!(block = number, error = %err, "unrecoverable node error");
            sleep(FATAL_EXIT_PAUSE).await;
            Err(err)
        }
    }
}
