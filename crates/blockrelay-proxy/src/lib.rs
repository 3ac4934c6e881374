//! BlockRelay Proxy
//!
//! Sits between a consumer issuing fixed-size logical block I/O and a
//! physical block service with its own negotiated geometry. Reads pass
//! through; writes that are misaligned to the device's optimal block size
//! go through a read-modify-write engine that pre-reads the edge blocks,
//! locks the affected LBA range, and hands the service a composite
//! scatter list so it can merge the unaligned edges.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │   Consumer I/O   │  submit_read / submit_write
//! └────────┬─────────┘
//!          │
//! ┌────────▼─────────┐
//! │   BlockProxy     │
//! │  - WriteEngine   │  alignment check, pre-read, range lock
//! │  - Directory     │  slot → object id, cached geometry
//! │  - Dispatcher    │  lifecycle events → directory + observers
//! └────────┬─────────┘
//!          │
//! ┌────────▼─────────┐
//! │ Physical service │  negotiate / read / write / lifecycle
//! └──────────────────┘
//! ```

pub mod directory;
pub mod engine;
pub mod geometry;
pub mod lifecycle;
pub mod metrics;
pub mod pool;
pub mod proxy;
pub mod rangelock;
pub mod retry;
pub mod service;
pub mod sim;
pub mod status;

pub use directory::{Directory, SlotLifecycle};
pub use engine::WriteEngine;
pub use geometry::GeometryCache;
pub use lifecycle::{ObserverCallback, ObserverHandle, ObserverRegistry};
pub use metrics::{EngineStats, StatsSnapshot};
pub use pool::{BlockPool, PoolBlock, SgList};
pub use proxy::BlockProxy;
pub use service::{LifecycleFilter, PhysicalService, PreReadDescriptor};
pub use sim::SimService;
