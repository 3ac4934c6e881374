//! Block geometry cache
//!
//! Lazily negotiates block geometry per slot and caches it on the
//! directory entry. The cache is invalidated whenever the slot's object id
//! is cleared, so a re-arrived device renegotiates on its next I/O.

use crate::directory::Directory;
use crate::metrics::EngineStats;
use crate::service::PhysicalService;
use blockrelay_common::{BlockGeometry, Error, GeometryDefaults, Result, SlotId};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Geometry lookup front-end over the directory and the physical service.
pub struct GeometryCache {
    directory: Arc<Directory>,
    service: Arc<dyn PhysicalService>,
    defaults: GeometryDefaults,
    timeout: Duration,
    stats: Arc<EngineStats>,
}

impl GeometryCache {
    pub fn new(
        directory: Arc<Directory>,
        service: Arc<dyn PhysicalService>,
        defaults: GeometryDefaults,
        timeout: Duration,
        stats: Arc<EngineStats>,
    ) -> Self {
        Self {
            directory,
            service,
            defaults,
            timeout,
            stats,
        }
    }

    /// Geometry for a slot: cached when valid, negotiated otherwise.
    ///
    /// `NotReady` when the slot has no physical object. A failed
    /// negotiation leaves the cache untouched.
    pub async fn get(&self, slot: SlotId) -> Result<BlockGeometry> {
        let Some(object_id) = self.directory.resolve(slot) else {
            return Err(Error::NotReady);
        };

        if let Some(geometry) = self.directory.cached_geometry(slot) {
            return Ok(geometry);
        }

        EngineStats::bump(&self.stats.geometry_negotiations);
        let negotiation = tokio::time::timeout(
            self.timeout,
            self.service
                .negotiate_geometry(object_id, self.defaults.request()),
        )
        .await;

        let geometry = match negotiation {
            Ok(Ok(geometry)) => geometry,
            Ok(Err(err)) => {
                warn!(%slot, %object_id, %err, "geometry negotiation failed");
                return Err(err);
            }
            Err(_) => {
                warn!(%slot, %object_id, "geometry negotiation timed out");
                EngineStats::bump(&self.stats.timeouts);
                return Err(Error::Timeout);
            }
        };

        if geometry.block_size == 0
            || geometry.optimal_block_size == 0
            || geometry.optimal_block_size % geometry.block_size != 0
        {
            warn!(%slot, ?geometry, "service returned inconsistent geometry");
            return Err(Error::IoFailed);
        }

        debug!(%slot, %object_id, ?geometry, "negotiated geometry");
        self.directory.store_geometry(slot, object_id, geometry);
        Ok(geometry)
    }
}
