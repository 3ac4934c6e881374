//! Lifecycle dispatcher and observer registry
//!
//! A single task drains the physical service's notification stream,
//! updates the directory, and delivers derived device events to registered
//! observers, synchronously and in enqueue order. Directory mutation for
//! an event always happens before its observer delivery. Processing errors
//! are logged and the event dropped; the dispatcher never aborts.

use crate::directory::{Directory, SlotLifecycle};
use blockrelay_common::{
    DeviceClass, DeviceEvent, Error, LifecycleEvent, LifecycleState, ObjectId, Result, SlotId,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Callback invoked for each derived device event.
pub type ObserverCallback = Box<dyn Fn(&DeviceEvent) + Send + Sync>;

/// Handle returned by [`ObserverRegistry::register`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObserverHandle(u64);

struct ObserverEntry {
    handle: ObserverHandle,
    callback: ObserverCallback,
}

/// Registry of downstream consumers of device arrival/departure events.
pub struct ObserverRegistry {
    entries: Mutex<Vec<ObserverEntry>>,
    next_handle: AtomicU64,
    max_observers: usize,
}

impl ObserverRegistry {
    #[must_use]
    pub fn new(max_observers: usize) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_handle: AtomicU64::new(1),
            max_observers,
        }
    }

    /// Register a callback; fails once the fixed maximum is reached.
    pub fn register(&self, callback: ObserverCallback) -> Result<ObserverHandle> {
        let mut entries = self.entries.lock();
        if entries.len() >= self.max_observers {
            return Err(Error::ResourceExhausted("observer registry"));
        }
        let handle = ObserverHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        entries.push(ObserverEntry { handle, callback });
        Ok(handle)
    }

    /// Remove a registration; returns whether the handle was known.
    pub fn deregister(&self, handle: ObserverHandle) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|entry| entry.handle != handle);
        entries.len() != before
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Deliver an event to every observer, in registration order.
    fn notify(&self, event: &DeviceEvent) {
        let entries = self.entries.lock();
        for entry in entries.iter() {
            (entry.callback)(event);
        }
    }
}

/// Spawn the single dispatcher task over a lifecycle subscription.
pub fn spawn_dispatcher(
    directory: Arc<Directory>,
    registry: Arc<ObserverRegistry>,
    mut rx: mpsc::UnboundedReceiver<LifecycleEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("lifecycle dispatcher running");
        while let Some(event) = rx.recv().await {
            dispatch_event(&directory, &registry, &event);
        }
        debug!("lifecycle stream closed, dispatcher exiting");
    })
}

/// Apply one notification to the directory, then deliver derived events.
pub(crate) fn dispatch_event(
    directory: &Directory,
    registry: &ObserverRegistry,
    event: &LifecycleEvent,
) {
    let derived = match event.class {
        DeviceClass::Drive => apply_drive_event(directory, event),
        DeviceClass::Enclosure => {
            apply_enclosure_event(directory, event);
            Vec::new()
        }
    };
    for device_event in &derived {
        registry.notify(device_event);
    }
}

fn apply_drive_event(directory: &Directory, event: &LifecycleEvent) -> Vec<DeviceEvent> {
    match event.state {
        LifecycleState::Ready => {
            let Some(location) = event.location else {
                warn!(object_id = %event.object_id, "ready event without location, dropped");
                return Vec::new();
            };
            let Some(slot) = directory.slot_for_location(location) else {
                debug!(object_id = %event.object_id, %location, "ready event for untracked location");
                return Vec::new();
            };
            directory.set_ready(slot, event.object_id, location);
            vec![DeviceEvent::Arrived {
                slot,
                object_id: event.object_id,
            }]
        }

        LifecycleState::Destroy | LifecycleState::PendingDestroy | LifecycleState::PendingFail => {
            // These usually arrive without a location; resolve through the
            // object ids cached at ready time.
            let Some(slot) = locate(directory, event) else {
                return Vec::new();
            };
            directory.clear_object(slot);
            departing_then_failed(slot, event.object_id)
        }

        LifecycleState::PendingHibernate | LifecycleState::PendingOffline => {
            let Some(slot) = locate(directory, event) else {
                return Vec::new();
            };
            directory.mark_lifecycle(slot, SlotLifecycle::Failed);
            departing_then_failed(slot, event.object_id)
        }

        LifecycleState::PendingActivate => {
            let Some(slot) = locate(directory, event) else {
                return Vec::new();
            };
            // The object id stays mapped to avoid racing the re-activate;
            // observers are told to hold off I/O until the next arrival.
            directory.mark_lifecycle(slot, SlotLifecycle::Departing);
            vec![DeviceEvent::Departing {
                slot,
                object_id: event.object_id,
            }]
        }

        LifecycleState::Activate | LifecycleState::Offline => Vec::new(),

        LifecycleState::Unknown => {
            error!(object_id = %event.object_id, "notification with unknown lifecycle state");
            Vec::new()
        }
    }
}

fn apply_enclosure_event(directory: &Directory, event: &LifecycleEvent) {
    match event.state {
        LifecycleState::Ready => {
            directory.set_enclosure_object(Some(event.object_id));
            info!(object_id = %event.object_id, "enclosure ready");
        }
        LifecycleState::Destroy | LifecycleState::PendingDestroy | LifecycleState::PendingFail => {
            if directory.enclosure_object() == Some(event.object_id) {
                directory.set_enclosure_object(None);
                info!(object_id = %event.object_id, "enclosure cleared");
            }
        }
        _ => {}
    }
}

fn locate(directory: &Directory, event: &LifecycleEvent) -> Option<SlotId> {
    let slot = event
        .location
        .and_then(|location| directory.slot_for_location(location))
        .or_else(|| directory.find_slot_by_object(event.object_id));
    if slot.is_none() {
        debug!(object_id = %event.object_id, state = ?event.state, "event for untracked object, dropped");
    }
    slot
}

fn departing_then_failed(slot: SlotId, object_id: ObjectId) -> Vec<DeviceEvent> {
    vec![
        DeviceEvent::Departing { slot, object_id },
        DeviceEvent::Failed { slot, object_id },
    ]
}
