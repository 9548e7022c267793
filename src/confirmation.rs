//! Block-confirmation gate.
//!
//! Events are acted on only after the chain had time to settle: the gate
//! waits the requested number of blocks past the event and re-evaluates the
//! caller's predicate against live chain state. A predicate that flipped in
//! the meantime means the observed event sits on an abandoned fork.

use std::future::Future;

use crate::chain::{ChainError, KeepChain};

/// Extra blocks worth of predicate retries after a transient failure.
const MAX_PREDICATE_RETRIES: u32 = 5;

/// Waits until the chain is `confirmations` blocks past `start_block`, then
/// evaluates `predicate` and returns its verdict.
///
/// Transient predicate failures are retried on each new block, up to
/// [`MAX_PREDICATE_RETRIES`] times. The predicate is always re-evaluated
/// against the chain; results must never be cached across the gate.
pub async fn wait_for_block_confirmations<F, Fut>(
    chain: &dyn KeepChain,
    start_block: u64,
    confirmations: u64,
    predicate: F,
) -> Result<bool, ChainError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<bool, ChainError>>,
{
    let mut target = start_block.saturating_add(confirmations);
    let mut retries = 0u32;

    loop {
        chain.wait_for_block_height(target).await?;

        match predicate().await {
            Ok(verdict) => return Ok(verdict),
            Err(err) if err.is_transient() && retries < MAX_PREDICATE_RETRIES => {
                retries += 1;
                target = target.saturating_add(1);
                tracing::warn!(
                    retries,
                    next_block = target,
                    error = %err,
                    "confirmation check failed; retrying on next block"
                );
            }
            Err(err) => return Err(err),
        }
    }
}
