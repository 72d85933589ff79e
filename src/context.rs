//! Process-scoped SDK state.
//!
//! Everything that would otherwise be a global lives here: configuration,
//! the device table, the profiler, the shared frame pool and owner ids.

use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::info;

use crate::capture::pool::FramePool;
use crate::device::registry::DeviceRegistry;
use crate::device::sensor::SensorDriver;
use crate::device::DeviceBackend;
use crate::error::Result;
use crate::pipeline::router::{OwnerId, OwnerIds};
use crate::profiler::Profiler;
use crate::utils::init_tracing;
use crate::Config;

pub struct SdkContext {
    config: ArcSwap<Config>,
    registry: DeviceRegistry,
    profiler: Profiler,
    pool: FramePool,
    owners: OwnerIds,
}

impl SdkContext {
    /// Builds a context and registers the built-in sensor drivers.
    pub fn new(config: Config) -> Self {
        let pool = FramePool::new(config.pool.preallocate, config.pool.frame_capacity);
        let owners = OwnerIds::new();
        let registry = DeviceRegistry::new();
        registry.register_driver(Arc::new(SensorDriver::primesense(
            pool.clone(),
            owners.clone(),
            config.streams.clone(),
        )));
        registry.register_driver(Arc::new(SensorDriver::kinect(
            pool.clone(),
            owners.clone(),
            config.streams.clone(),
        )));
        let profiler = Profiler::new(config.logging.enable_profiling);
        info!(preallocated = config.pool.preallocate, "sdk context created");
        Self {
            config: ArcSwap::from_pointee(config),
            registry,
            profiler,
            pool,
            owners,
        }
    }

    /// Loads [`Config`] from `path` and the environment, then builds the
    /// context.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Config::load(Some(path.as_ref()))?))
    }

    /// Installs the tracing subscriber using the configured filter.
    pub fn init_logging(&self) {
        init_tracing(&self.config.load().logging.filter);
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.load_full()
    }

    /// Swaps the configuration. Drivers keep the stream settings they were
    /// created with; the profiler follows immediately.
    pub fn update_config(&self, config: Config) {
        self.profiler.set_enabled(config.logging.enable_profiling);
        self.config.store(Arc::new(config));
        info!("configuration updated");
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn profiler(&self) -> &Profiler {
        &self.profiler
    }

    pub fn pool(&self) -> &FramePool {
        &self.pool
    }

    pub fn next_owner(&self) -> OwnerId {
        self.owners.next()
    }

    pub fn open_device(&self, uri: &str) -> Result<Box<dyn DeviceBackend>> {
        let _section = self.profiler.section("open_device");
        self.registry.open_device(uri)
    }
}

impl Default for SdkContext {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl std::fmt::Debug for SdkContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SdkContext")
            .field("config", &self.config.load())
            .field("registry", &self.registry)
            .field("pool", &self.pool.stats())
            .finish()
    }
}
