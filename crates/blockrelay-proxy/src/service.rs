//! Physical block service interface
//!
//! Everything the proxy needs from the downstream service: geometry
//! negotiation, block reads and writes, directory queries for the startup
//! rebuild, and the lifecycle notification stream. Implementations only
//! enqueue into the returned channel from their event source; the proxy's
//! dispatcher is the single consumer.

use crate::pool::SgList;
use async_trait::async_trait;
use blockrelay_common::{
    BlockCount, BlockGeometry, DeviceLocation, GeometryRequest, IoCompletion, Lba, LifecycleEvent,
    ObjectId, Result,
};
use bytes::Bytes;
use tokio::sync::mpsc;

/// Read-modify-write descriptor attached to an unaligned write.
///
/// Describes the pre-read that covers the write's rounded range so the
/// service can merge the unaligned edges into whole optimal blocks.
pub struct PreReadDescriptor<'a> {
    pub lba: Lba,
    pub block_count: BlockCount,
    pub sg_list: &'a SgList,
}

/// Which device classes a lifecycle subscription wants.
#[derive(Clone, Copy, Debug)]
pub struct LifecycleFilter {
    pub drives: bool,
    pub enclosures: bool,
}

impl Default for LifecycleFilter {
    fn default() -> Self {
        Self {
            drives: true,
            enclosures: true,
        }
    }
}

/// The downstream physical block service.
///
/// `read` and `write` return an [`IoCompletion`] rather than an error:
/// transport- and block-level failures are data for the completion
/// translator, not exceptional control flow. The remaining calls are
/// control-path requests and use plain `Result`.
#[async_trait]
pub trait PhysicalService: Send + Sync {
    /// Negotiate block geometry for an object.
    async fn negotiate_geometry(
        &self,
        object_id: ObjectId,
        requested: GeometryRequest,
    ) -> Result<BlockGeometry>;

    /// Read `block_count` blocks starting at `lba` into the scatter list.
    async fn read(
        &self,
        object_id: ObjectId,
        lba: Lba,
        block_count: BlockCount,
        sg_list: &mut SgList,
    ) -> IoCompletion;

    /// Write `data` to `block_count` blocks starting at `lba`.
    ///
    /// Writes not aligned to the object's optimal block size must carry a
    /// pre-read descriptor covering the rounded range.
    async fn write(
        &self,
        object_id: ObjectId,
        lba: Lba,
        block_count: BlockCount,
        data: &Bytes,
        pre_read: Option<PreReadDescriptor<'_>>,
    ) -> IoCompletion;

    /// Capacity of an object in client-visible blocks.
    async fn capacity(&self, object_id: ObjectId) -> Result<u64>;

    /// Object currently at a drive location, if any. Used for the startup
    /// directory rebuild.
    async fn object_at(&self, location: DeviceLocation) -> Result<Option<ObjectId>>;

    /// Enclosure object for a bus/enclosure pair, if any.
    async fn enclosure_at(&self, bus: u32, enclosure: u32) -> Result<Option<ObjectId>>;

    /// Subscribe to lifecycle notifications matching `filter`.
    ///
    /// The service sends events in the order it observes them; the
    /// receiver is drained by the proxy's single dispatcher task.
    fn subscribe_lifecycle(&self, filter: LifecycleFilter)
    -> mpsc::UnboundedReceiver<LifecycleEvent>;
}
