//! Process-wide shared components.
//!
//! Device hosts usually run several communicators that should share one
//! string pool and one serialization optimizer. A [`CommContext`] owns
//! those defaults plus a registry of named extras, is constructed
//! explicitly at program start, and is passed to whoever needs it. For
//! callers that genuinely need ambient lookup there is a single global
//! handle with an explicit install/shutdown lifecycle — nothing is
//! created behind the caller's back.

use std::any::Any;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use tracing::info;

use crate::batch::MessageBatcher;
use crate::config::{MemoryPoolConfig, SerializationOptimizerConfig};
use crate::pool::{BytesPool, MemoryPool, StringPool};
use crate::serialize::SerializationOptimizer;

/// Shared performance components for one process.
pub struct CommContext {
    string_pool: Arc<StringPool>,
    bytes_pool: Arc<BytesPool>,
    optimizer: Arc<SerializationOptimizer>,
    pools: DashMap<String, Arc<dyn Any + Send + Sync>>,
    optimizers: DashMap<String, Arc<SerializationOptimizer>>,
    batchers: DashMap<String, Arc<MessageBatcher>>,
}

impl CommContext {
    /// Builds and starts the default components.
    pub async fn initialize(
        pool_config: MemoryPoolConfig,
        optimizer_config: SerializationOptimizerConfig,
    ) -> Arc<Self> {
        let string_pool = StringPool::with_default(pool_config.clone());
        string_pool.start().await;
        let bytes_pool = BytesPool::with_default(pool_config);
        bytes_pool.start().await;
        let optimizer = SerializationOptimizer::new(optimizer_config);
        optimizer.start().await;

        info!("CommContext: initialized");
        Arc::new(Self {
            string_pool,
            bytes_pool,
            optimizer,
            pools: DashMap::new(),
            optimizers: DashMap::new(),
            batchers: DashMap::new(),
        })
    }

    /// Defaults sized by the stock configurations.
    pub async fn with_defaults() -> Arc<Self> {
        Self::initialize(MemoryPoolConfig::default(), SerializationOptimizerConfig::default())
            .await
    }

    /// Stops the owned components plus every registered batcher and
    /// optimizer. Registered typed pools are type-erased here, so
    /// shutting those down stays with whoever registered them.
    pub async fn shutdown(&self) {
        for entry in self.batchers.iter() {
            entry.value().stop().await;
        }
        for entry in self.optimizers.iter() {
            entry.value().stop().await;
        }
        self.optimizer.stop().await;
        self.string_pool.shutdown().await;
        self.bytes_pool.shutdown().await;
        info!("CommContext: shut down");
    }

    pub fn string_pool(&self) -> Arc<StringPool> {
        Arc::clone(&self.string_pool)
    }

    pub fn bytes_pool(&self) -> Arc<BytesPool> {
        Arc::clone(&self.bytes_pool)
    }

    pub fn optimizer(&self) -> Arc<SerializationOptimizer> {
        Arc::clone(&self.optimizer)
    }

    /// Registers a typed pool under a name.
    pub fn register_pool<T: Send + Sync + 'static>(
        &self,
        name: impl Into<String>,
        pool: Arc<MemoryPool<T>>,
    ) {
        self.pools.insert(name.into(), pool);
    }

    /// Looks a typed pool back up. Returns `None` when the name is
    /// unknown or registered under a different type.
    pub fn pool<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<MemoryPool<T>>> {
        let entry = self.pools.get(name)?;
        Arc::clone(entry.value()).downcast::<MemoryPool<T>>().ok()
    }

    pub fn unregister_pool(&self, name: &str) {
        self.pools.remove(name);
    }

    pub fn register_optimizer(&self, name: impl Into<String>, optimizer: Arc<SerializationOptimizer>) {
        self.optimizers.insert(name.into(), optimizer);
    }

    pub fn named_optimizer(&self, name: &str) -> Option<Arc<SerializationOptimizer>> {
        self.optimizers.get(name).map(|e| Arc::clone(e.value()))
    }

    pub fn register_batcher(&self, name: impl Into<String>, batcher: Arc<MessageBatcher>) {
        self.batchers.insert(name.into(), batcher);
    }

    pub fn named_batcher(&self, name: &str) -> Option<Arc<MessageBatcher>> {
        self.batchers.get(name).map(|e| Arc::clone(e.value()))
    }
}

static GLOBAL: Lazy<Mutex<Option<Arc<CommContext>>>> = Lazy::new(|| Mutex::new(None));

/// Installs a context as the process-wide handle. Replacing an existing
/// handle is allowed; the old one keeps running for holders of its Arc.
pub fn init_global(context: Arc<CommContext>) {
    *GLOBAL.lock().unwrap() = Some(context);
}

/// The installed context, if any.
pub fn global() -> Option<Arc<CommContext>> {
    GLOBAL.lock().unwrap().clone()
}

/// Removes and shuts down the process-wide handle.
pub async fn shutdown_global() {
    let context = GLOBAL.lock().unwrap().take();
    if let Some(context) = context {
        context.shutdown().await;
    }
}
