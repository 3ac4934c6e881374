//! Core type definitions for BlockRelay
//!
//! This module defines the identifiers, geometry descriptions, lifecycle
//! notifications, and completion statuses that cross the proxy's two
//! external seams (the consumer transport and the physical block service).

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical block address, in client-visible blocks.
pub type Lba = u64;

/// A count of client-visible blocks.
pub type BlockCount = u64;

/// Identifier the physical block service assigns to one of its objects.
///
/// Object ids are opaque to the proxy; they are compared for equality and
/// cached in the device directory, nothing more.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From, Into,
)]
#[display("{_0}")]
pub struct ObjectId(u32);

impl ObjectId {
    /// Create an object id from its raw service-side value.
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw service-side value.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId(0x{:x})", self.0)
    }
}

/// Index of a client-visible logical device tracked by the directory.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From, Into,
)]
#[display("{_0}")]
pub struct SlotId(u16);

impl SlotId {
    #[must_use]
    pub const fn new(index: u16) -> Self {
        Self(index)
    }

    /// Slot index as a usize, for directory table lookups.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SlotId({})", self.0)
    }
}

/// Physical coordinates of a device: bus / enclosure / slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceLocation {
    pub bus: u32,
    pub enclosure: u32,
    pub slot: u32,
}

impl DeviceLocation {
    #[must_use]
    pub const fn new(bus: u32, enclosure: u32, slot: u32) -> Self {
        Self {
            bus,
            enclosure,
            slot,
        }
    }
}

impl fmt::Display for DeviceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.bus, self.enclosure, self.slot)
    }
}

/// Negotiated block geometry for one device.
///
/// All sizes are in bytes; `optimal_block_size` is always a whole multiple
/// of `block_size`. Writes not aligned to the optimal block require a
/// read-modify-write sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockGeometry {
    /// Client-visible block size in bytes.
    pub block_size: u32,
    /// Preferred I/O granularity in bytes.
    pub optimal_block_size: u32,
    /// LBA offset of the first optimal-block boundary.
    pub optimal_block_alignment: u32,
    /// Device capacity in client-visible blocks.
    pub block_count: u64,
    /// Native block size of the underlying media, in bytes.
    pub physical_block_size: u32,
}

impl BlockGeometry {
    /// Client blocks per optimal block.
    #[must_use]
    pub const fn lbas_per_optimal_block(&self) -> u64 {
        (self.optimal_block_size / self.block_size) as u64
    }
}

/// Geometry parameters requested during negotiation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeometryRequest {
    pub block_size: u32,
    pub optimal_block_size: u32,
    pub optimal_block_alignment: u32,
}

/// Which kind of service object a lifecycle event refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceClass {
    Drive,
    Enclosure,
}

/// Lifecycle state reported by the physical block service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    Ready,
    Activate,
    Offline,
    PendingActivate,
    PendingHibernate,
    PendingFail,
    PendingOffline,
    PendingDestroy,
    Destroy,
    Unknown,
}

/// One lifecycle notification from the physical block service.
///
/// Destroy/fail notifications often arrive without location coordinates;
/// the directory resolves those by scanning its cached object ids.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub object_id: ObjectId,
    pub class: DeviceClass,
    pub location: Option<DeviceLocation>,
    pub state: LifecycleState,
}

/// Derived device event delivered to registered observers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceEvent {
    /// The device at `slot` came online as `object_id`.
    Arrived { slot: SlotId, object_id: ObjectId },
    /// The device is about to go away; hold off new I/O.
    Departing { slot: SlotId, object_id: ObjectId },
    /// The device is gone or failed.
    Failed { slot: SlotId, object_id: ObjectId },
}

impl DeviceEvent {
    /// Slot the event refers to.
    #[must_use]
    pub const fn slot(&self) -> SlotId {
        match self {
            Self::Arrived { slot, .. } | Self::Departing { slot, .. } | Self::Failed { slot, .. } => {
                *slot
            }
        }
    }
}

/// Transport-level status of a physical-service call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportStatus {
    Ok,
    TimedOut,
    Canceled,
    Busy,
    NoSuchDevice,
    InternalError,
}

/// Block-operation status, meaningful only when the transport succeeded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockStatus {
    Success,
    MediaError,
    IoFailed,
    Aborted,
    NotReady,
    InvalidRequest,
    Invalid,
}

/// Qualifier refining a `BlockStatus`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum BlockQualifier {
    #[default]
    None,
    /// The operation succeeded but the affected region should be remapped.
    RemapRequired,
}

/// Full completion record of one physical-service I/O.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoCompletion {
    pub transport: TransportStatus,
    pub block: BlockStatus,
    pub qualifier: BlockQualifier,
    /// Service-specific error code, carried into diagnostics verbatim.
    pub error_code: u32,
    /// LBA of the media error, when the service reports one.
    pub media_error_lba: Option<Lba>,
}

impl IoCompletion {
    /// A fully successful completion.
    #[must_use]
    pub const fn success() -> Self {
        Self {
            transport: TransportStatus::Ok,
            block: BlockStatus::Success,
            qualifier: BlockQualifier::None,
            error_code: 0,
            media_error_lba: None,
        }
    }

    /// A completion that failed at the transport layer.
    #[must_use]
    pub const fn transport_error(transport: TransportStatus) -> Self {
        Self {
            transport,
            block: BlockStatus::Invalid,
            qualifier: BlockQualifier::None,
            error_code: 0,
            media_error_lba: None,
        }
    }

    /// A completion that failed at the block-operation layer.
    #[must_use]
    pub const fn block_error(block: BlockStatus, error_code: u32, lba: Option<Lba>) -> Self {
        Self {
            transport: TransportStatus::Ok,
            block,
            qualifier: BlockQualifier::None,
            error_code,
            media_error_lba: lba,
        }
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.transport, TransportStatus::Ok) && matches!(self.block, BlockStatus::Success)
    }
}

/// Client-visible outcome of a successful write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoOutcome {
    Success,
    /// The write succeeded but the service asked for a remap of the range.
    RemapRequired,
}

/// One sense-like diagnostic record attached to a completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiagnosticInfo {
    pub error_code: u32,
    pub lba: Option<Lba>,
}

/// Bounded, caller-provided buffer for diagnostic records.
///
/// Records past the capacity are dropped, mirroring the "when space is
/// available" contract of the completion translator.
#[derive(Clone, Debug)]
pub struct DiagnosticBuffer {
    entries: Vec<DiagnosticInfo>,
    capacity: usize,
}

impl DiagnosticBuffer {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Record a diagnostic if space remains; returns whether it was kept.
    pub fn push(&mut self, info: DiagnosticInfo) -> bool {
        if self.entries.len() < self.capacity {
            self.entries.push(info);
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn entries(&self) -> &[DiagnosticInfo] {
        &self.entries
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for DiagnosticBuffer {
    fn default() -> Self {
        Self::with_capacity(4)
    }
}
