//! Configuration types for BlockRelay
//!
//! Defaults match the shipped deployment: a small fixed directory of boot
//! devices on bus 0 / enclosure 0, 512-byte client blocks, and bounded
//! pre-allocated buffer pools.

use crate::types::GeometryRequest;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for the proxy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Number of device slots in the directory.
    pub slot_count: u16,
    /// Geometry requested during negotiation.
    pub geometry: GeometryDefaults,
    /// Buffer pool sizing.
    pub pool: PoolConfig,
    /// Per-call timeout for physical-service I/O, in milliseconds.
    pub io_timeout_ms: u64,
    /// Maximum number of registered lifecycle observers.
    pub max_observers: usize,
}

impl ProxyConfig {
    /// I/O timeout as a [`Duration`].
    #[must_use]
    pub const fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            slot_count: 4,
            geometry: GeometryDefaults::default(),
            pool: PoolConfig::default(),
            io_timeout_ms: 30_000,
            max_observers: 8,
        }
    }
}

/// Block geometry requested from the physical service when a slot's
/// geometry has not been negotiated yet.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct GeometryDefaults {
    /// Requested client block size in bytes.
    pub block_size: u32,
    /// Requested optimal block size in bytes.
    pub optimal_block_size: u32,
    /// Requested alignment offset of the first optimal block, in LBAs.
    pub optimal_block_alignment: u32,
}

impl GeometryDefaults {
    /// The negotiation request derived from these defaults.
    #[must_use]
    pub const fn request(&self) -> GeometryRequest {
        GeometryRequest {
            block_size: self.block_size,
            optimal_block_size: self.optimal_block_size,
            optimal_block_alignment: self.optimal_block_alignment,
        }
    }
}

impl Default for GeometryDefaults {
    fn default() -> Self {
        Self {
            block_size: 512,
            optimal_block_size: 4096,
            optimal_block_alignment: 0,
        }
    }
}

/// Bounded pool sizing for pre-read buffers.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of pre-allocated buffers.
    pub buffer_count: usize,
    /// Size of each buffer in bytes; must cover one optimal block of any
    /// device behind the proxy.
    pub buffer_bytes: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            buffer_count: 1024,
            buffer_bytes: 8192,
        }
    }
}
