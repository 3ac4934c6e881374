//! Proxy front-end
//!
//! Wires the directory, dispatcher, retry worker, and write engine
//! together behind the two calls the consumer transport maps onto:
//! `read` and `write`. Constructed explicitly and shut down explicitly;
//! nothing lives in globals.

use crate::directory::Directory;
use crate::engine::WriteEngine;
use crate::geometry::GeometryCache;
use crate::lifecycle::{self, ObserverCallback, ObserverHandle, ObserverRegistry};
use crate::metrics::{EngineStats, StatsSnapshot};
use crate::pool::BlockPool;
use crate::rangelock::RangeLockManager;
use crate::retry;
use crate::service::{LifecycleFilter, PhysicalService};
use blockrelay_common::{
    BlockCount, DiagnosticBuffer, IoOutcome, Lba, ProxyConfig, Result, SlotId,
};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

/// The block I/O proxy.
pub struct BlockProxy {
    engine: Arc<WriteEngine>,
    directory: Arc<Directory>,
    observers: Arc<ObserverRegistry>,
    dispatcher: JoinHandle<()>,
    retry_worker: JoinHandle<()>,
}

impl BlockProxy {
    /// Build the proxy over a physical service and bring the directory
    /// current.
    ///
    /// The lifecycle subscription is opened before the full directory
    /// query so arrivals racing the rebuild are not lost; the dispatcher
    /// re-applies anything the rebuild already saw.
    pub async fn start(config: &ProxyConfig, service: Arc<dyn PhysicalService>) -> Result<Self> {
        let directory = Arc::new(Directory::new(config.slot_count));
        let stats = Arc::new(EngineStats::default());
        let observers = Arc::new(ObserverRegistry::new(config.max_observers));

        let events = service.subscribe_lifecycle(LifecycleFilter::default());
        directory.rebuild(service.as_ref()).await?;
        let dispatcher =
            lifecycle::spawn_dispatcher(Arc::clone(&directory), Arc::clone(&observers), events);

        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let locks = RangeLockManager::new(retry_tx);
        let geometry = GeometryCache::new(
            Arc::clone(&directory),
            Arc::clone(&service),
            config.geometry,
            config.io_timeout(),
            Arc::clone(&stats),
        );
        let pool = BlockPool::new(
            "pre-read",
            config.pool.buffer_bytes,
            config.pool.buffer_count,
        );
        let engine = Arc::new(WriteEngine::new(
            service,
            Arc::clone(&directory),
            geometry,
            pool,
            locks,
            stats,
            config.io_timeout(),
        ));
        let retry_worker = retry::spawn_retry_worker(Arc::clone(&engine), retry_rx);

        info!(slots = config.slot_count, "block proxy started");
        Ok(Self {
            engine,
            directory,
            observers,
            dispatcher,
            retry_worker,
        })
    }

    /// Read `block_count` blocks from a slot.
    pub async fn read(&self, slot: SlotId, lba: Lba, block_count: BlockCount) -> Result<Bytes> {
        self.engine.submit_read(slot, lba, block_count).await
    }

    /// Write `data` to `block_count` blocks of a slot.
    ///
    /// Diagnostic records from media errors or remap requests are copied
    /// into `diagnostics` as far as its capacity allows. Exactly one
    /// completion is reported per call, whatever path the write took.
    pub async fn write(
        &self,
        slot: SlotId,
        lba: Lba,
        block_count: BlockCount,
        data: Bytes,
        diagnostics: &mut DiagnosticBuffer,
    ) -> Result<IoOutcome> {
        let record = self.engine.submit_write(slot, lba, block_count, data).await;
        for entry in record.diagnostics.entries() {
            diagnostics.push(*entry);
        }
        record.result
    }

    /// Capacity of the device behind a slot, in client blocks.
    pub async fn capacity(&self, slot: SlotId) -> Result<u64> {
        self.engine.capacity(slot).await
    }

    /// Register a device-event observer.
    pub fn register_observer(&self, callback: ObserverCallback) -> Result<ObserverHandle> {
        self.observers.register(callback)
    }

    /// Remove a device-event observer.
    pub fn deregister_observer(&self, handle: ObserverHandle) -> bool {
        self.observers.deregister(handle)
    }

    /// The live device directory.
    #[must_use]
    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Point-in-time instrumentation counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.engine.stats().snapshot()
    }

    /// Stop the dispatcher and retry worker.
    pub fn shutdown(self) {
        self.dispatcher.abort();
        self.retry_worker.abort();
        info!("block proxy stopped");
    }
}

impl Drop for BlockProxy {
    fn drop(&mut self) {
        self.dispatcher.abort();
        self.retry_worker.abort();
    }
}
