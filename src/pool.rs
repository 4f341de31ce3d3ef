//! Generic object pool with RAII hand-back.
//!
//! A [`MemoryPool`] recycles expensive-to-build values (string buffers,
//! scratch JSON documents) between uses. Acquiring yields a
//! [`PooledHandle`] that derefs to the value; dropping the handle returns
//! the value to the pool while the pool is running and under capacity,
//! and destroys it otherwise. A background sweeper retires stale objects
//! and resizes the pool toward its observed utilization.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::MemoryPoolConfig;

/// A pooled value plus its bookkeeping.
struct PooledObject<T> {
    inner: T,
    created_at: Instant,
    last_used: Instant,
    usage_count: u64,
}

impl<T> PooledObject<T> {
    fn new(inner: T) -> Self {
        let now = Instant::now();
        Self {
            inner,
            created_at: now,
            last_used: now,
            usage_count: 0,
        }
    }
}

/// Live counters. Averages and sizes are sampled into a
/// [`MemoryPoolMetrics`] snapshot on request.
#[derive(Default)]
struct PoolCounters {
    total_allocations: AtomicU64,
    total_deallocations: AtomicU64,
    pool_hits: AtomicU64,
    pool_misses: AtomicU64,
    peak_pool_size: AtomicU64,
    peak_active_objects: AtomicU64,
    total_memory_allocated: AtomicU64,
}

/// Snapshot of pool metrics, serializable for status reporting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryPoolMetrics {
    pub total_allocations: u64,
    pub total_deallocations: u64,
    pub pool_hits: u64,
    pub pool_misses: u64,
    pub current_pool_size: usize,
    pub current_active_objects: usize,
    pub peak_pool_size: u64,
    pub peak_active_objects: u64,
    pub hit_ratio: f64,
    pub total_memory_allocated: u64,
}

struct PoolInner<T> {
    idle: Vec<PooledObject<T>>,
    active: usize,
}

struct PoolShared<T> {
    config: MemoryPoolConfig,
    inner: Mutex<PoolInner<T>>,
    counters: PoolCounters,
    running: AtomicBool,
}

impl<T> PoolShared<T> {
    fn destroy(&self, object: PooledObject<T>) {
        drop(object);
        self.counters.total_deallocations.fetch_add(1, Ordering::Relaxed);
    }
}

/// Object factory. Returning `None` counts as an acquire miss and leaves
/// the pool healthy.
pub type ObjectFactory<T> = Arc<dyn Fn() -> Option<T> + Send + Sync>;

/// Generic pool of reusable `T` instances with auto-sizing.
///
/// All state sits behind a single lock; acquire and release are O(1)
/// under it. The configuration's `enable_thread_safety` flag is carried
/// for persistence compatibility only: the pool is always safe to share.
pub struct MemoryPool<T: Send + 'static> {
    shared: Arc<PoolShared<T>>,
    factory: ObjectFactory<T>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    stop_sweeper: Arc<Notify>,
}

/// Pool of reusable string buffers.
pub type StringPool = MemoryPool<String>;
/// Pool of reusable byte buffers.
pub type BytesPool = MemoryPool<Vec<u8>>;

impl<T: Send + 'static> MemoryPool<T> {
    pub fn new(config: MemoryPoolConfig, factory: ObjectFactory<T>) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(PoolShared {
                config,
                inner: Mutex::new(PoolInner {
                    idle: Vec::new(),
                    active: 0,
                }),
                counters: PoolCounters::default(),
                running: AtomicBool::new(false),
            }),
            factory,
            sweeper: Mutex::new(None),
            stop_sweeper: Arc::new(Notify::new()),
        })
    }

    /// Pre-allocates `initial_pool_size` objects and starts the sweeper
    /// when `enable_auto_cleanup` is set.
    pub async fn start(self: &Arc<Self>) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }

        self.expand(self.shared.config.initial_pool_size);

        if self.shared.config.enable_auto_cleanup {
            let shared = Arc::clone(&self.shared);
            let factory = Arc::clone(&self.factory);
            let stop = Arc::clone(&self.stop_sweeper);
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(shared.config.cleanup_interval());
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if !shared.running.load(Ordering::SeqCst) {
                                break;
                            }
                            sweep(&shared, &factory);
                        }
                        _ = stop.notified() => break,
                    }
                }
                debug!("MemoryPool: sweeper stopped");
            });
            *self.sweeper.lock().unwrap() = Some(handle);
        }
    }

    /// Stops the sweeper and destroys every idle object. Outstanding
    /// handles survive; their objects are destroyed on return.
    pub async fn shutdown(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.stop_sweeper.notify_waiters();
        let handle = self.sweeper.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.clear();
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Returns a handle to a recycled or freshly constructed object, or
    /// `None` when the pool is shut down, exhausted, or the factory
    /// declined to build one.
    pub fn acquire(&self) -> Option<PooledHandle<T>> {
        if !self.is_running() {
            return None;
        }

        let mut inner = self.shared.inner.lock().unwrap();

        let object = if let Some(mut object) = inner.idle.pop() {
            object.last_used = Instant::now();
            object.usage_count += 1;
            self.shared.counters.pool_hits.fetch_add(1, Ordering::Relaxed);
            object
        } else if inner.active < self.shared.config.max_pool_size {
            self.shared.counters.pool_misses.fetch_add(1, Ordering::Relaxed);
            // A factory refusal is just a miss; the pool stays healthy.
            let value = (self.factory)()?;
            self.shared.counters.total_allocations.fetch_add(1, Ordering::Relaxed);
            self.shared
                .counters
                .total_memory_allocated
                .fetch_add(std::mem::size_of::<T>() as u64, Ordering::Relaxed);
            let mut object = PooledObject::new(value);
            object.usage_count = 1;
            object
        } else {
            warn!("MemoryPool: exhausted, acquire denied");
            return None;
        };

        inner.active += 1;
        let peak = inner.active as u64;
        self.shared
            .counters
            .peak_active_objects
            .fetch_max(peak, Ordering::Relaxed);

        Some(PooledHandle {
            object: Some(object),
            pool: Arc::downgrade(&self.shared),
        })
    }

    /// Pre-allocates up to `n` more idle objects, bounded by
    /// `max_pool_size`.
    pub fn expand(&self, n: usize) {
        let mut inner = self.shared.inner.lock().unwrap();
        expand_locked(&self.shared, &self.factory, &mut inner, n);
    }

    /// Destroys up to `n` idle objects. Active objects are never touched.
    pub fn shrink(&self, n: usize) {
        let mut inner = self.shared.inner.lock().unwrap();
        for _ in 0..n {
            match inner.idle.pop() {
                Some(object) => self.shared.destroy(object),
                None => break,
            }
        }
    }

    /// Destroys every idle object.
    pub fn clear(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        let drained: Vec<_> = inner.idle.drain(..).collect();
        drop(inner);
        for object in drained {
            self.shared.destroy(object);
        }
    }

    pub fn pool_size(&self) -> usize {
        self.shared.inner.lock().unwrap().idle.len()
    }

    pub fn active_count(&self) -> usize {
        self.shared.inner.lock().unwrap().active
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.shared.counters.pool_hits.load(Ordering::Relaxed) as f64;
        let misses = self.shared.counters.pool_misses.load(Ordering::Relaxed) as f64;
        if hits + misses == 0.0 {
            0.0
        } else {
            hits / (hits + misses)
        }
    }

    /// Fraction of known objects currently handed out.
    pub fn utilization(&self) -> f64 {
        let inner = self.shared.inner.lock().unwrap();
        utilization_of(inner.active, inner.idle.len())
    }

    pub fn metrics(&self) -> MemoryPoolMetrics {
        let (idle, active) = {
            let inner = self.shared.inner.lock().unwrap();
            (inner.idle.len(), inner.active)
        };
        let counters = &self.shared.counters;
        MemoryPoolMetrics {
            total_allocations: counters.total_allocations.load(Ordering::Relaxed),
            total_deallocations: counters.total_deallocations.load(Ordering::Relaxed),
            pool_hits: counters.pool_hits.load(Ordering::Relaxed),
            pool_misses: counters.pool_misses.load(Ordering::Relaxed),
            current_pool_size: idle,
            current_active_objects: active,
            peak_pool_size: counters.peak_pool_size.load(Ordering::Relaxed),
            peak_active_objects: counters.peak_active_objects.load(Ordering::Relaxed),
            hit_ratio: self.hit_ratio(),
            total_memory_allocated: counters.total_memory_allocated.load(Ordering::Relaxed),
        }
    }

    pub fn configuration(&self) -> &MemoryPoolConfig {
        &self.shared.config
    }
}

impl<T: Default + Send + 'static> MemoryPool<T> {
    /// Pool over `T::default()` — the common case for buffer pools.
    pub fn with_default(config: MemoryPoolConfig) -> Arc<Self> {
        Self::new(config, Arc::new(|| Some(T::default())))
    }
}

fn utilization_of(active: usize, idle: usize) -> f64 {
    let total = active + idle;
    if total == 0 {
        0.0
    } else {
        active as f64 / total as f64
    }
}

fn expand_locked<T>(
    shared: &Arc<PoolShared<T>>,
    factory: &ObjectFactory<T>,
    inner: &mut PoolInner<T>,
    n: usize,
) {
    let total = inner.idle.len() + inner.active;
    let room = shared.config.max_pool_size.saturating_sub(total);
    for _ in 0..n.min(room) {
        match factory() {
            Some(value) => {
                shared.counters.total_allocations.fetch_add(1, Ordering::Relaxed);
                shared
                    .counters
                    .total_memory_allocated
                    .fetch_add(std::mem::size_of::<T>() as u64, Ordering::Relaxed);
                inner.idle.push(PooledObject::new(value));
            }
            None => break,
        }
    }
    shared
        .counters
        .peak_pool_size
        .fetch_max((inner.idle.len() + inner.active) as u64, Ordering::Relaxed);
}

/// One sweeper pass: retire stale idle objects, then resize toward the
/// configured utilization band. The lock is released between the two
/// phases so acquire/release never stall behind a full sweep.
fn sweep<T>(shared: &Arc<PoolShared<T>>, factory: &ObjectFactory<T>) {
    let timeout = shared.config.object_timeout();

    {
        let mut inner = shared.inner.lock().unwrap();
        let now = Instant::now();
        let before = inner.idle.len();
        let mut kept = Vec::with_capacity(before);
        let mut retired = Vec::new();
        for object in inner.idle.drain(..) {
            if now.duration_since(object.last_used) > timeout {
                retired.push(object);
            } else {
                kept.push(object);
            }
        }
        inner.idle = kept;
        drop(inner);
        let retired_count = retired.len();
        for object in retired {
            shared.destroy(object);
        }
        if retired_count > 0 {
            debug!("MemoryPool: retired {} stale objects", retired_count);
        }
    }

    let mut inner = shared.inner.lock().unwrap();
    let utilization = utilization_of(inner.active, inner.idle.len());
    let total = inner.active + inner.idle.len();

    if utilization > shared.config.growth_threshold && total < shared.config.max_pool_size {
        expand_locked(shared, factory, &mut inner, shared.config.growth_increment);
    } else if utilization < shared.config.shrink_threshold
        && total > shared.config.initial_pool_size
    {
        let surplus = total - shared.config.initial_pool_size;
        for _ in 0..surplus {
            match inner.idle.pop() {
                Some(object) => shared.destroy(object),
                None => break,
            }
        }
    }
}

/// Owned handle to a pooled object. Drop returns the object to the pool
/// if the pool is still alive, running and under capacity; otherwise the
/// object is destroyed in place.
pub struct PooledHandle<T: Send + 'static> {
    object: Option<PooledObject<T>>,
    pool: Weak<PoolShared<T>>,
}

impl<T: Send + 'static> PooledHandle<T> {
    pub fn usage_count(&self) -> u64 {
        self.object.as_ref().map(|o| o.usage_count).unwrap_or(0)
    }

    pub fn age(&self) -> std::time::Duration {
        self.object
            .as_ref()
            .map(|o| o.created_at.elapsed())
            .unwrap_or_default()
    }
}

impl<T: Send + 'static> Deref for PooledHandle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.object.as_ref().expect("handle already released").inner
    }
}

impl<T: Send + 'static> DerefMut for PooledHandle<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.object.as_mut().expect("handle already released").inner
    }
}

impl<T: Send + 'static> Drop for PooledHandle<T> {
    fn drop(&mut self) {
        let Some(mut object) = self.object.take() else {
            return;
        };
        let Some(shared) = self.pool.upgrade() else {
            return; // pool is gone, object dies here
        };

        let mut inner = shared.inner.lock().unwrap();
        inner.active = inner.active.saturating_sub(1);

        if shared.running.load(Ordering::SeqCst)
            && inner.idle.len() < shared.config.max_pool_size
        {
            object.last_used = Instant::now();
            inner.idle.push(object);
        } else {
            drop(inner);
            shared.destroy(object);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(initial: usize, max: usize) -> MemoryPoolConfig {
        MemoryPoolConfig {
            initial_pool_size: initial,
            max_pool_size: max,
            growth_increment: 2,
            enable_auto_cleanup: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn acquire_before_start_returns_none() {
        let pool: Arc<StringPool> = MemoryPool::with_default(test_config(1, 4));
        assert!(pool.acquire().is_none());
    }

    #[tokio::test]
    async fn preallocates_initial_size() {
        let pool: Arc<StringPool> = MemoryPool::with_default(test_config(3, 8));
        pool.start().await;
        assert_eq!(pool.pool_size(), 3);
        assert_eq!(pool.active_count(), 0);
    }

    #[tokio::test]
    async fn release_recycles_object() {
        let pool: Arc<StringPool> = MemoryPool::with_default(test_config(1, 4));
        pool.start().await;

        {
            let mut handle = pool.acquire().expect("acquire");
            handle.push_str("scratch");
            assert_eq!(pool.active_count(), 1);
        }

        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.pool_size(), 1);

        let handle = pool.acquire().expect("acquire again");
        // Recycled, so the hit counter moved and the content survived.
        assert!(pool.hit_ratio() > 0.0);
        assert_eq!(&*handle, "scratch");
    }

    #[tokio::test]
    async fn exhausted_pool_denies_acquire() {
        let pool: Arc<StringPool> = MemoryPool::with_default(test_config(0, 2));
        pool.start().await;

        let a = pool.acquire().expect("first");
        let b = pool.acquire().expect("second");
        assert!(pool.acquire().is_none());
        drop(a);
        assert!(pool.acquire().is_some());
        drop(b);
    }

    #[tokio::test]
    async fn max_equal_to_initial_never_grows() {
        let pool: Arc<StringPool> = MemoryPool::with_default(test_config(2, 2));
        pool.start().await;
        pool.expand(5);
        assert_eq!(pool.pool_size() + pool.active_count(), 2);
    }

    #[tokio::test]
    async fn factory_failure_is_a_miss() {
        let pool: Arc<MemoryPool<String>> =
            MemoryPool::new(test_config(0, 4), Arc::new(|| None));
        pool.start().await;
        assert!(pool.acquire().is_none());
        assert!(pool.is_running());
    }

    #[tokio::test]
    async fn shutdown_destroys_idle_and_returned_objects() {
        let pool: Arc<StringPool> = MemoryPool::with_default(test_config(2, 4));
        pool.start().await;
        let handle = pool.acquire().expect("acquire");
        pool.shutdown().await;
        assert_eq!(pool.pool_size(), 0);
        drop(handle);
        // Returned after shutdown: destroyed, not requeued.
        assert_eq!(pool.pool_size(), 0);
        assert!(pool.acquire().is_none());
    }

    #[tokio::test]
    async fn shrink_never_touches_active() {
        let pool: Arc<StringPool> = MemoryPool::with_default(test_config(2, 6));
        pool.start().await;
        let _held = pool.acquire().expect("acquire");
        pool.shrink(10);
        assert_eq!(pool.pool_size(), 0);
        assert_eq!(pool.active_count(), 1);
    }

    #[tokio::test]
    async fn metrics_track_hits_and_misses() {
        let pool: Arc<StringPool> = MemoryPool::with_default(test_config(0, 4));
        pool.start().await;
        {
            let _h = pool.acquire().expect("miss");
        }
        let _h = pool.acquire().expect("hit");
        let metrics = pool.metrics();
        assert_eq!(metrics.pool_misses, 1);
        assert_eq!(metrics.pool_hits, 1);
        assert_eq!(metrics.current_active_objects, 1);
        assert!(metrics.total_memory_allocated > 0);
    }
}
