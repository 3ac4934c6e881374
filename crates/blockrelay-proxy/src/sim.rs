//! In-memory physical block service
//!
//! Byte-accurate simulation of the downstream service, used by the
//! integration tests and by development tooling. Devices are plain memory
//! images behind the negotiated geometry; the simulator enforces the same
//! contract a real service would: writes misaligned to the optimal block
//! size are rejected unless they carry a pre-read descriptor covering the
//! rounded range, and the descriptor's edge data is what lands on the
//! media outside the client's range.

use crate::pool::SgList;
use crate::service::{LifecycleFilter, PhysicalService, PreReadDescriptor};
use async_trait::async_trait;
use blockrelay_common::{
    BlockCount, BlockGeometry, BlockStatus, DeviceClass, DeviceLocation, Error, GeometryRequest,
    IoCompletion, Lba, LifecycleEvent, LifecycleState, ObjectId, Result, TransportStatus,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

struct SimDevice {
    geometry: BlockGeometry,
    data: Mutex<Vec<u8>>,
}

impl SimDevice {
    fn new(geometry: BlockGeometry) -> Self {
        let bytes = geometry.block_count as usize * geometry.block_size as usize;
        Self {
            geometry,
            data: Mutex::new(vec![0u8; bytes]),
        }
    }
}

/// Simulated physical block service.
pub struct SimService {
    devices: Mutex<HashMap<ObjectId, Arc<SimDevice>>>,
    locations: Mutex<HashMap<DeviceLocation, ObjectId>>,
    enclosures: Mutex<HashMap<(u32, u32), ObjectId>>,
    subscribers: Mutex<Vec<(LifecycleFilter, mpsc::UnboundedSender<LifecycleEvent>)>>,
    next_object: AtomicU32,
    read_fault: Mutex<Option<IoCompletion>>,
    write_fault: Mutex<Option<IoCompletion>>,
    io_delay: Mutex<Option<Duration>>,
}

impl SimService {
    #[must_use]
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            locations: Mutex::new(HashMap::new()),
            enclosures: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            next_object: AtomicU32::new(1),
            read_fault: Mutex::new(None),
            write_fault: Mutex::new(None),
            io_delay: Mutex::new(None),
        }
    }

    fn allocate_object(&self) -> ObjectId {
        ObjectId::new(self.next_object.fetch_add(1, Ordering::Relaxed))
    }

    /// Create a drive at `location` and announce it as ready.
    pub fn add_drive(&self, location: DeviceLocation, geometry: BlockGeometry) -> ObjectId {
        let object_id = self.allocate_object();
        self.devices
            .lock()
            .insert(object_id, Arc::new(SimDevice::new(geometry)));
        self.locations.lock().insert(location, object_id);
        self.emit(LifecycleEvent {
            object_id,
            class: DeviceClass::Drive,
            location: Some(location),
            state: LifecycleState::Ready,
        });
        object_id
    }

    /// Create an enclosure object and announce it as ready.
    pub fn add_enclosure(&self, bus: u32, enclosure: u32) -> ObjectId {
        let object_id = self.allocate_object();
        self.enclosures.lock().insert((bus, enclosure), object_id);
        self.emit(LifecycleEvent {
            object_id,
            class: DeviceClass::Enclosure,
            location: None,
            state: LifecycleState::Ready,
        });
        object_id
    }

    /// Remove a drive, announcing `state` without location coordinates,
    /// the way real destroy/fail notifications arrive.
    pub fn retire_drive(&self, object_id: ObjectId, state: LifecycleState) {
        self.devices.lock().remove(&object_id);
        self.locations.lock().retain(|_, id| *id != object_id);
        self.emit(LifecycleEvent {
            object_id,
            class: DeviceClass::Drive,
            location: None,
            state,
        });
    }

    /// Send a raw lifecycle event to all matching subscribers.
    pub fn emit(&self, event: LifecycleEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|(filter, tx)| {
            let wanted = match event.class {
                DeviceClass::Drive => filter.drives,
                DeviceClass::Enclosure => filter.enclosures,
            };
            !wanted || tx.send(event.clone()).is_ok()
        });
    }

    /// Write directly into the backing store, bypassing the I/O contract.
    pub fn load(&self, object_id: ObjectId, lba: Lba, bytes: &[u8]) {
        if let Some(device) = self.devices.lock().get(&object_id).cloned() {
            let offset = lba as usize * device.geometry.block_size as usize;
            device.data.lock()[offset..offset + bytes.len()].copy_from_slice(bytes);
        }
    }

    /// Read directly from the backing store.
    #[must_use]
    pub fn peek(&self, object_id: ObjectId, lba: Lba, block_count: BlockCount) -> Vec<u8> {
        self.devices.lock().get(&object_id).map_or_else(Vec::new, |device| {
            let block_size = device.geometry.block_size as usize;
            let offset = lba as usize * block_size;
            let len = block_count as usize * block_size;
            device.data.lock()[offset..offset + len].to_vec()
        })
    }

    /// Fail the next read with the given completion.
    pub fn inject_read_fault(&self, completion: IoCompletion) {
        *self.read_fault.lock() = Some(completion);
    }

    /// Fail the next write with the given completion.
    pub fn inject_write_fault(&self, completion: IoCompletion) {
        *self.write_fault.lock() = Some(completion);
    }

    /// Delay every subsequent I/O call, for timeout testing.
    pub fn set_io_delay(&self, delay: Option<Duration>) {
        *self.io_delay.lock() = delay;
    }

    fn device(&self, object_id: ObjectId) -> Option<Arc<SimDevice>> {
        self.devices.lock().get(&object_id).cloned()
    }

    async fn maybe_delay(&self) {
        let delay = *self.io_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    /// Outward rounding of `[lba, lba+count)` to optimal-block boundaries,
    /// clamped to the device capacity.
    fn rounded_range(geometry: &BlockGeometry, lba: Lba, count: BlockCount) -> (Lba, BlockCount) {
        let opt = geometry.lbas_per_optimal_block();
        let align = u64::from(geometry.optimal_block_alignment) % opt;
        let offset = |lba: Lba| (lba + opt - align) % opt;

        let start = lba - offset(lba);
        let end = lba + count;
        let rounded_end = if offset(end) == 0 {
            end
        } else {
            (end + opt - offset(end)).min(geometry.block_count)
        };
        (start, rounded_end - start)
    }
}

impl Default for SimService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PhysicalService for SimService {
    async fn negotiate_geometry(
        &self,
        object_id: ObjectId,
        requested: GeometryRequest,
    ) -> Result<BlockGeometry> {
        let device = self.device(object_id).ok_or(Error::NotReady)?;
        if requested.block_size != device.geometry.block_size {
            return Err(Error::InvalidRequest(format!(
                "device exports {}-byte blocks, client requested {}",
                device.geometry.block_size, requested.block_size
            )));
        }
        Ok(device.geometry)
    }

    async fn read(
        &self,
        object_id: ObjectId,
        lba: Lba,
        block_count: BlockCount,
        sg_list: &mut SgList,
    ) -> IoCompletion {
        self.maybe_delay().await;
        if let Some(fault) = self.read_fault.lock().take() {
            return fault;
        }
        let Some(device) = self.device(object_id) else {
            return IoCompletion::transport_error(TransportStatus::NoSuchDevice);
        };
        let geometry = device.geometry;
        if lba + block_count > geometry.block_count {
            return IoCompletion::block_error(BlockStatus::InvalidRequest, 0, None);
        }
        let block_size = geometry.block_size as usize;
        let len = block_count as usize * block_size;
        if sg_list.total_len() != len {
            return IoCompletion::block_error(BlockStatus::InvalidRequest, 0, None);
        }

        let data = device.data.lock();
        let offset = lba as usize * block_size;
        match sg_list.fill_from(&data[offset..offset + len]) {
            Ok(()) => IoCompletion::success(),
            Err(_) => IoCompletion::block_error(BlockStatus::InvalidRequest, 0, None),
        }
    }

    async fn write(
        &self,
        object_id: ObjectId,
        lba: Lba,
        block_count: BlockCount,
        data: &Bytes,
        pre_read: Option<PreReadDescriptor<'_>>,
    ) -> IoCompletion {
        self.maybe_delay().await;
        if let Some(fault) = self.write_fault.lock().take() {
            return fault;
        }
        let Some(device) = self.device(object_id) else {
            return IoCompletion::transport_error(TransportStatus::NoSuchDevice);
        };
        let geometry = device.geometry;
        if lba + block_count > geometry.block_count {
            return IoCompletion::block_error(BlockStatus::InvalidRequest, 0, None);
        }
        let block_size = geometry.block_size as usize;
        if data.len() != block_count as usize * block_size {
            return IoCompletion::block_error(BlockStatus::InvalidRequest, 0, None);
        }

        let (rounded_lba, rounded_blocks) = Self::rounded_range(&geometry, lba, block_count);
        let aligned = rounded_lba == lba && rounded_blocks == block_count;

        if aligned {
            let mut store = device.data.lock();
            let offset = lba as usize * block_size;
            store[offset..offset + data.len()].copy_from_slice(data);
            return IoCompletion::success();
        }

        // Unaligned writes must supply the pre-read covering the rounded
        // range; the device merges its edges from that data.
        let Some(descriptor) = pre_read else {
            return IoCompletion::block_error(BlockStatus::InvalidRequest, 0, None);
        };
        if descriptor.lba != rounded_lba
            || descriptor.block_count != rounded_blocks
            || descriptor.sg_list.total_len() != rounded_blocks as usize * block_size
        {
            return IoCompletion::block_error(BlockStatus::InvalidRequest, 0, None);
        }

        let rounded_len = rounded_blocks as usize * block_size;
        let mut merged = vec![0u8; rounded_len];
        if descriptor.sg_list.copy_out(0, &mut merged).is_err() {
            return IoCompletion::block_error(BlockStatus::InvalidRequest, 0, None);
        }
        let client_offset = (lba - rounded_lba) as usize * block_size;
        merged[client_offset..client_offset + data.len()].copy_from_slice(data);

        let mut store = device.data.lock();
        let offset = rounded_lba as usize * block_size;
        store[offset..offset + rounded_len].copy_from_slice(&merged);
        IoCompletion::success()
    }

    async fn capacity(&self, object_id: ObjectId) -> Result<u64> {
        self.device(object_id)
            .map(|device| device.geometry.block_count)
            .ok_or(Error::NotReady)
    }

    async fn object_at(&self, location: DeviceLocation) -> Result<Option<ObjectId>> {
        Ok(self.locations.lock().get(&location).copied())
    }

    async fn enclosure_at(&self, bus: u32, enclosure: u32) -> Result<Option<ObjectId>> {
        Ok(self.enclosures.lock().get(&(bus, enclosure)).copied())
    }

    fn subscribe_lifecycle(
        &self,
        filter: LifecycleFilter,
    ) -> mpsc::UnboundedReceiver<LifecycleEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push((filter, tx));
        rx
    }
}
