//! Device directory
//!
//! Fixed-size table mapping device slots to physical-service object ids,
//! with the per-slot cached geometry and the range-lock list anchored on
//! each slot. Object ids are set and cleared only by the lifecycle
//! dispatcher; everything else reads through the per-slot lock.

use crate::rangelock::LockList;
use crate::service::PhysicalService;
use blockrelay_common::{BlockGeometry, DeviceLocation, Error, ObjectId, Result, SlotId};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

/// Bus the tracked devices live on.
pub const DIRECTORY_BUS: u32 = 0;
/// Enclosure the tracked devices live in.
pub const DIRECTORY_ENCLOSURE: u32 = 0;

/// Per-slot lifecycle as seen by the directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SlotLifecycle {
    /// No physical object tracked.
    #[default]
    Unknown,
    /// Object present and usable.
    Ready,
    /// Object still present but about to go away.
    Departing,
    /// Object failed; cleared back to `Unknown` once the service confirms.
    Failed,
}

#[derive(Default)]
struct SlotState {
    object_id: Option<ObjectId>,
    /// Coordinates recorded the first time the slot went ready, used to
    /// fill in destroy/fail events that arrive without a location.
    location: Option<DeviceLocation>,
    geometry: Option<BlockGeometry>,
    lifecycle: SlotLifecycle,
}

/// One directory slot. The state and the lock list have independent locks;
/// the lock list is owned by the range-lock manager's code paths.
pub struct Slot {
    state: Mutex<SlotState>,
    pub(crate) locks: Mutex<LockList>,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::default()),
            locks: Mutex::new(LockList::default()),
        }
    }
}

/// Directory of all client-visible device slots.
///
/// Constructed once with a fixed slot count; rebuilt from a full service
/// query at startup and kept live by the lifecycle dispatcher afterwards.
pub struct Directory {
    slots: Vec<Slot>,
    enclosure: Mutex<Option<ObjectId>>,
}

impl Directory {
    #[must_use]
    pub fn new(slot_count: u16) -> Self {
        Self {
            slots: (0..slot_count).map(|_| Slot::new()).collect(),
            enclosure: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Fixed coordinates of a slot.
    #[must_use]
    pub fn location_of(&self, slot: SlotId) -> DeviceLocation {
        DeviceLocation::new(DIRECTORY_BUS, DIRECTORY_ENCLOSURE, slot.index() as u32)
    }

    pub(crate) fn slot(&self, slot: SlotId) -> Result<&Slot> {
        self.slots
            .get(slot.index())
            .ok_or_else(|| Error::InvalidParameter(format!("slot {slot} out of range")))
    }

    /// Slot tracked at the given coordinates, if any.
    #[must_use]
    pub fn slot_for_location(&self, location: DeviceLocation) -> Option<SlotId> {
        if location.bus == DIRECTORY_BUS
            && location.enclosure == DIRECTORY_ENCLOSURE
            && (location.slot as usize) < self.slots.len()
        {
            Some(SlotId::new(location.slot as u16))
        } else {
            None
        }
    }

    /// Object id currently mapped to a slot.
    #[must_use]
    pub fn resolve(&self, slot: SlotId) -> Option<ObjectId> {
        self.slots.get(slot.index())?.state.lock().object_id
    }

    /// Lifecycle state of a slot.
    #[must_use]
    pub fn lifecycle(&self, slot: SlotId) -> SlotLifecycle {
        self.slots
            .get(slot.index())
            .map_or(SlotLifecycle::Unknown, |s| s.state.lock().lifecycle)
    }

    /// Linear scan for the slot tracking `object_id`.
    #[must_use]
    pub fn find_slot_by_object(&self, object_id: ObjectId) -> Option<SlotId> {
        self.slots
            .iter()
            .position(|slot| slot.state.lock().object_id == Some(object_id))
            .map(|index| SlotId::new(index as u16))
    }

    /// Location recorded for a slot when it first went ready.
    #[must_use]
    pub fn recorded_location(&self, slot: SlotId) -> Option<DeviceLocation> {
        self.slots.get(slot.index())?.state.lock().location
    }

    /// Mark a slot ready with a new object id.
    ///
    /// Invalidates any cached geometry; the location is recorded the first
    /// time so destroy events without coordinates can be cross-referenced.
    pub fn set_ready(&self, slot: SlotId, object_id: ObjectId, location: DeviceLocation) {
        let Ok(entry) = self.slot(slot) else { return };
        let mut state = entry.state.lock();
        state.object_id = Some(object_id);
        state.geometry = None;
        state.lifecycle = SlotLifecycle::Ready;
        if state.location.is_none() {
            state.location = Some(location);
        }
        info!(%slot, %object_id, %location, "slot ready");
    }

    /// Clear the object mapping for a slot; geometry is invalidated.
    pub fn clear_object(&self, slot: SlotId) {
        let Ok(entry) = self.slot(slot) else { return };
        let mut state = entry.state.lock();
        let old = state.object_id.take();
        state.geometry = None;
        state.lifecycle = SlotLifecycle::Unknown;
        if let Some(object_id) = old {
            info!(%slot, %object_id, "slot cleared");
        }
    }

    /// Record a transient lifecycle phase without touching the mapping.
    pub fn mark_lifecycle(&self, slot: SlotId, lifecycle: SlotLifecycle) {
        if let Ok(entry) = self.slot(slot) {
            entry.state.lock().lifecycle = lifecycle;
        }
    }

    /// Cached negotiated geometry, if still valid.
    #[must_use]
    pub fn cached_geometry(&self, slot: SlotId) -> Option<BlockGeometry> {
        self.slots.get(slot.index())?.state.lock().geometry
    }

    /// Cache a freshly negotiated geometry for a slot.
    ///
    /// Only takes effect while the slot still maps the object the geometry
    /// was negotiated against; a concurrent removal wins.
    pub fn store_geometry(&self, slot: SlotId, object_id: ObjectId, geometry: BlockGeometry) {
        if let Ok(entry) = self.slot(slot) {
            let mut state = entry.state.lock();
            if state.object_id == Some(object_id) {
                state.geometry = Some(geometry);
            } else {
                debug!(%slot, %object_id, "discarding geometry for replaced object");
            }
        }
    }

    pub fn invalidate_geometry(&self, slot: SlotId) {
        if let Ok(entry) = self.slot(slot) {
            entry.state.lock().geometry = None;
        }
    }

    /// Enclosure object the tracked slots live in, if known.
    #[must_use]
    pub fn enclosure_object(&self) -> Option<ObjectId> {
        *self.enclosure.lock()
    }

    pub fn set_enclosure_object(&self, object_id: Option<ObjectId>) {
        *self.enclosure.lock() = object_id;
    }

    /// Rebuild the directory from a full service query.
    ///
    /// Slots whose location has no object stay unset; they fill in later
    /// when the ready notification arrives.
    pub async fn rebuild(&self, service: &dyn PhysicalService) -> Result<()> {
        info!(slots = self.slots.len(), "rebuilding device directory");

        match service
            .enclosure_at(DIRECTORY_BUS, DIRECTORY_ENCLOSURE)
            .await
        {
            Ok(enclosure) => self.set_enclosure_object(enclosure),
            Err(err) => {
                warn!(%err, "enclosure query failed during rebuild");
                self.set_enclosure_object(None);
            }
        }

        for index in 0..self.slots.len() {
            let slot = SlotId::new(index as u16);
            let location = self.location_of(slot);
            match service.object_at(location).await {
                Ok(Some(object_id)) => self.set_ready(slot, object_id, location),
                Ok(None) => self.clear_object(slot),
                Err(err) => {
                    warn!(%slot, %err, "slot query failed during rebuild");
                    self.clear_object(slot);
                }
            }
        }
        Ok(())
    }
}
