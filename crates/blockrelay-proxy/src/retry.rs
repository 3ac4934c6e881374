//! Retry queue worker
//!
//! Write contexts that could not take their range lock are parked on the
//! slot's lock list; when an unlock grants them, the lock manager sends
//! them here. A single worker drains the queue and re-dispatches each
//! context into the write engine at the lock-granted transition.

use crate::engine::{WriteContext, WriteEngine};
use crate::metrics::EngineStats;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Spawn the dedicated retry worker.
///
/// The worker itself only drains and re-dispatches; each resumed write
/// runs as its own task so a slow device cannot stall later grants.
pub fn spawn_retry_worker(
    engine: Arc<WriteEngine>,
    mut rx: mpsc::UnboundedReceiver<Box<WriteContext>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(context) = rx.recv().await {
            EngineStats::bump(&engine.stats().retries_resumed);
            debug!(
                ticket = context.ticket.unwrap_or_default(),
                "resuming queued write"
            );
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine.resume(context).await;
            });
        }
        debug!("retry queue closed, worker exiting");
    })
}
