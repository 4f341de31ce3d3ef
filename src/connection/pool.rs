//! Pool of abstract connections with health checks and lifecycle
//! management.
//!
//! The pool fronts a [`ConnectionFactory`] and hands out healthy
//! connections up to `max_connections`. Callers hold a
//! [`PooledConnectionHandle`]; dropping it routes the connection through
//! a release worker that revalidates it and either requeues it idle or
//! destroys it, freeing the slot either way.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ConnectionPoolConfig;
use crate::error::{CommError, Result};

/// Minimum contract a pooled connection must honor. Implementations keep
/// their own interior state; the pool only ever holds shared references.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn connect(&self) -> bool;
    async fn disconnect(&self);
    async fn is_connected(&self) -> bool;
    async fn is_healthy(&self) -> bool;
    fn id(&self) -> String;
    fn metadata(&self) -> Value;
}

/// Builds and validates connections on behalf of the pool.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create_connection(&self) -> Option<Arc<dyn Connection>>;
    async fn validate_connection(&self, connection: &Arc<dyn Connection>) -> bool;
    fn connection_type(&self) -> &str;
}

/// A pooled connection plus its bookkeeping.
#[derive(Clone)]
struct PooledConnection {
    connection: Arc<dyn Connection>,
    id: String,
    created_at: Instant,
    last_used: Instant,
    last_health_check: Instant,
    usage_count: u64,
}

impl PooledConnection {
    fn new(connection: Arc<dyn Connection>) -> Self {
        let now = Instant::now();
        Self {
            id: connection.id(),
            connection,
            created_at: now,
            last_used: now,
            last_health_check: now,
            usage_count: 0,
        }
    }

    fn is_expired(&self, max_lifetime: std::time::Duration) -> bool {
        self.created_at.elapsed() > max_lifetime
    }

    fn is_idle_expired(&self, idle_timeout: std::time::Duration) -> bool {
        self.last_used.elapsed() > idle_timeout
    }
}

#[derive(Default)]
struct PoolCounters {
    connections_created: AtomicU64,
    connections_destroyed: AtomicU64,
    connections_acquired: AtomicU64,
    connections_released: AtomicU64,
    acquisition_timeouts: AtomicU64,
    health_check_failures: AtomicU64,
    average_acquisition_time: AtomicU64,
}

/// Snapshot of connection pool metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionPoolMetrics {
    pub total_connections: usize,
    pub active_connections: usize,
    pub idle_connections: usize,
    pub connections_created: u64,
    pub connections_destroyed: u64,
    pub connections_acquired: u64,
    pub connections_released: u64,
    pub acquisition_timeouts: u64,
    pub health_check_failures: u64,
    pub average_acquisition_time: f64,
    pub pool_utilization: f64,
}

struct PoolInner {
    idle: VecDeque<PooledConnection>,
    active: HashMap<String, PooledConnection>,
    /// Slots claimed by in-flight connection creation. Counted into the
    /// total so concurrent creators can never push past the cap.
    reserved: usize,
}

impl PoolInner {
    fn total(&self) -> usize {
        self.idle.len() + self.active.len() + self.reserved
    }
}

struct PoolState {
    config: ConnectionPoolConfig,
    inner: Mutex<PoolInner>,
    counters: PoolCounters,
    running: AtomicBool,
    available: Notify,
    release_tx: Mutex<Option<mpsc::UnboundedSender<PooledConnection>>>,
}

impl PoolState {
    fn destroy_counted(&self) {
        self.counters.connections_destroyed.fetch_add(1, Ordering::Relaxed);
        // notify_one stores a permit, so a waiter that registers late
        // still sees the freed slot.
        self.available.notify_one();
    }
}

/// Pool of reusable [`Connection`]s.
pub struct ConnectionPool {
    state: Arc<PoolState>,
    factory: Arc<dyn ConnectionFactory>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stop: Arc<Notify>,
}

impl ConnectionPool {
    pub fn new(factory: Arc<dyn ConnectionFactory>, config: ConnectionPoolConfig) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(PoolState {
                config,
                inner: Mutex::new(PoolInner {
                    idle: VecDeque::new(),
                    active: HashMap::new(),
                    reserved: 0,
                }),
                counters: PoolCounters::default(),
                running: AtomicBool::new(false),
                available: Notify::new(),
                release_tx: Mutex::new(None),
            }),
            factory,
            workers: Mutex::new(Vec::new()),
            stop: Arc::new(Notify::new()),
        })
    }

    /// Creates the initial connections and starts the release, health
    /// check and maintenance workers.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.state.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let initial = self
            .state
            .config
            .initial_connections
            .min(self.state.config.max_connections);
        for _ in 0..initial {
            if !self.add_idle_connection().await {
                warn!(
                    "ConnectionPool: failed to create an initial {} connection",
                    self.factory.connection_type()
                );
                break;
            }
        }

        let (release_tx, mut release_rx) = mpsc::unbounded_channel::<PooledConnection>();
        *self.state.release_tx.lock().unwrap() = Some(release_tx);

        let mut workers = self.workers.lock().unwrap();

        // Release worker: revalidate returned connections off the caller
        // thread, then requeue or destroy.
        {
            let pool = Arc::clone(self);
            workers.push(tokio::spawn(async move {
                while let Some(pooled) = release_rx.recv().await {
                    pool.process_release(pooled).await;
                }
                debug!("ConnectionPool: release worker stopped");
            }));
        }

        if self.state.config.enable_health_checks {
            let pool = Arc::clone(self);
            let stop = Arc::clone(&self.stop);
            workers.push(tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(pool.state.config.health_check_interval());
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => pool.perform_health_check().await,
                        _ = stop.notified() => break,
                    }
                }
                debug!("ConnectionPool: health check worker stopped");
            }));
        }

        {
            let pool = Arc::clone(self);
            let stop = Arc::clone(&self.stop);
            workers.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(pool.state.config.cleanup_interval());
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => pool.perform_maintenance().await,
                        _ = stop.notified() => break,
                    }
                }
                debug!("ConnectionPool: maintenance worker stopped");
            }));
        }

        Ok(())
    }

    /// Stops the workers, wakes every waiter and destroys all
    /// connections, idle and active alike.
    pub async fn shutdown(&self) {
        if !self.state.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.stop.notify_waiters();
        self.state.available.notify_waiters();
        self.state.release_tx.lock().unwrap().take();

        // The release worker drains until every handle-held sender is
        // gone; give stragglers a grace period, then cut them off.
        let workers: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        for mut worker in workers {
            if tokio::time::timeout(std::time::Duration::from_secs(1), &mut worker)
                .await
                .is_err()
            {
                worker.abort();
                let _ = worker.await;
            }
        }

        let (idle, active) = {
            let mut inner = self.state.inner.lock().unwrap();
            let idle: Vec<_> = inner.idle.drain(..).collect();
            let active: Vec<_> = inner.active.drain().map(|(_, c)| c).collect();
            (idle, active)
        };
        for pooled in idle.into_iter().chain(active) {
            pooled.connection.disconnect().await;
            self.state.counters.connections_destroyed.fetch_add(1, Ordering::Relaxed);
        }
        info!("ConnectionPool: shut down");
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    /// Acquires a healthy connection, waiting up to `acquire_timeout`
    /// for a slot when the pool is saturated.
    pub async fn acquire(&self) -> Result<PooledConnectionHandle> {
        if !self.is_running() {
            return Err(CommError::PoolShutdown);
        }

        let started = Instant::now();
        let timeout = self.state.config.acquire_timeout();

        loop {
            // 1. Reuse an idle connection when one validates.
            if let Some(pooled) = self.pop_valid_idle().await {
                return Ok(self.hand_out(pooled, started, false));
            }

            if !self.is_running() {
                return Err(CommError::PoolShutdown);
            }

            // 2. Grow when under the cap, holding a reserved slot for
            //    the duration of the dial.
            if self.try_reserve() {
                match self.create_connection().await {
                    Some(pooled) => return Ok(self.hand_out(pooled, started, true)),
                    None => self.unreserve(),
                }
            }

            // 3. Wait for a release, bounded by what is left of the
            //    acquire timeout.
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                self.state
                    .counters
                    .acquisition_timeouts
                    .fetch_add(1, Ordering::Relaxed);
                return Err(CommError::AcquireTimeout);
            }
            let remaining = timeout - elapsed;
            let _ = tokio::time::timeout(remaining, self.state.available.notified()).await;
        }
    }

    pub fn active_count(&self) -> usize {
        self.state.inner.lock().unwrap().active.len()
    }

    pub fn idle_count(&self) -> usize {
        self.state.inner.lock().unwrap().idle.len()
    }

    pub fn total_count(&self) -> usize {
        self.state.inner.lock().unwrap().total()
    }

    pub fn utilization(&self) -> f64 {
        let inner = self.state.inner.lock().unwrap();
        let total = inner.total();
        if total == 0 {
            0.0
        } else {
            inner.active.len() as f64 / total as f64
        }
    }

    pub fn metrics(&self) -> ConnectionPoolMetrics {
        let (idle, active) = {
            let inner = self.state.inner.lock().unwrap();
            (inner.idle.len(), inner.active.len())
        };
        let c = &self.state.counters;
        let total = idle + active;
        ConnectionPoolMetrics {
            total_connections: total,
            active_connections: active,
            idle_connections: idle,
            connections_created: c.connections_created.load(Ordering::Relaxed),
            connections_destroyed: c.connections_destroyed.load(Ordering::Relaxed),
            connections_acquired: c.connections_acquired.load(Ordering::Relaxed),
            connections_released: c.connections_released.load(Ordering::Relaxed),
            acquisition_timeouts: c.acquisition_timeouts.load(Ordering::Relaxed),
            health_check_failures: c.health_check_failures.load(Ordering::Relaxed),
            average_acquisition_time: f64::from_bits(
                c.average_acquisition_time.load(Ordering::Relaxed),
            ),
            pool_utilization: if total == 0 {
                0.0
            } else {
                active as f64 / total as f64
            },
        }
    }

    pub fn configuration(&self) -> &ConnectionPoolConfig {
        &self.state.config
    }

    // --- internals ---

    async fn create_connection(&self) -> Option<PooledConnection> {
        let connection = self.factory.create_connection().await?;
        if !connection.connect().await {
            debug!("ConnectionPool: new connection failed to connect");
            return None;
        }
        self.state
            .counters
            .connections_created
            .fetch_add(1, Ordering::Relaxed);
        Some(PooledConnection::new(connection))
    }

    /// Pops idle connections until one passes validation. Invalid ones
    /// are destroyed on the spot.
    async fn pop_valid_idle(&self) -> Option<PooledConnection> {
        loop {
            let candidate = self.state.inner.lock().unwrap().idle.pop_front()?;
            if self.validate(&candidate).await {
                return Some(candidate);
            }
            candidate.connection.disconnect().await;
            self.state.destroy_counted();
        }
    }

    async fn validate(&self, pooled: &PooledConnection) -> bool {
        if pooled.is_expired(self.state.config.max_lifetime()) {
            return false;
        }
        self.factory.validate_connection(&pooled.connection).await
            && pooled.connection.is_connected().await
            && pooled.connection.is_healthy().await
    }

    /// Claims one slot for an in-flight creation if the cap allows.
    fn try_reserve(&self) -> bool {
        let mut inner = self.state.inner.lock().unwrap();
        if inner.total() < self.state.config.max_connections {
            inner.reserved += 1;
            true
        } else {
            false
        }
    }

    fn unreserve(&self) {
        let mut inner = self.state.inner.lock().unwrap();
        inner.reserved = inner.reserved.saturating_sub(1);
    }

    /// Reserve, create and park one idle connection. Returns `false`
    /// when the cap is reached or creation failed.
    async fn add_idle_connection(&self) -> bool {
        if !self.try_reserve() {
            return false;
        }
        match self.create_connection().await {
            Some(pooled) => {
                let mut inner = self.state.inner.lock().unwrap();
                inner.reserved = inner.reserved.saturating_sub(1);
                inner.idle.push_back(pooled);
                drop(inner);
                self.state.available.notify_one();
                true
            }
            None => {
                self.unreserve();
                false
            }
        }
    }

    fn hand_out(
        &self,
        mut pooled: PooledConnection,
        started: Instant,
        was_reserved: bool,
    ) -> PooledConnectionHandle {
        pooled.last_used = Instant::now();
        pooled.usage_count += 1;

        {
            let mut inner = self.state.inner.lock().unwrap();
            if was_reserved {
                inner.reserved = inner.reserved.saturating_sub(1);
            }
            inner.active.insert(pooled.id.clone(), pooled.clone());
        }

        let c = &self.state.counters;
        c.connections_acquired.fetch_add(1, Ordering::Relaxed);
        let sample = started.elapsed().as_secs_f64() * 1000.0;
        let current = f64::from_bits(c.average_acquisition_time.load(Ordering::Relaxed));
        let next = (current + sample) / 2.0;
        c.average_acquisition_time.store(next.to_bits(), Ordering::Relaxed);

        PooledConnectionHandle {
            pooled: Some(pooled),
            release_tx: self.state.release_tx.lock().unwrap().clone(),
        }
    }

    /// Runs on the release worker for every returned connection.
    async fn process_release(&self, mut pooled: PooledConnection) {
        self.state
            .counters
            .connections_released
            .fetch_add(1, Ordering::Relaxed);

        let registered = {
            let mut inner = self.state.inner.lock().unwrap();
            inner.active.remove(&pooled.id).is_some()
        };

        // Evicted by a health sweep while the caller held it, or the
        // pool stopped: destroy in place.
        if !registered || !self.is_running() {
            pooled.connection.disconnect().await;
            self.state.destroy_counted();
            return;
        }

        if self.validate(&pooled).await {
            pooled.last_used = Instant::now();
            self.state.inner.lock().unwrap().idle.push_back(pooled);
            self.state.available.notify_one();
        } else {
            pooled.connection.disconnect().await;
            self.state.destroy_counted();
        }
    }

    /// Validates every known connection, destroying unhealthy and
    /// expired ones. Active connections that fail are unregistered so
    /// the release path destroys them on return.
    pub async fn perform_health_check(&self) {
        let idle_snapshot: Vec<PooledConnection> = {
            let inner = self.state.inner.lock().unwrap();
            inner.idle.iter().cloned().collect()
        };

        for pooled in idle_snapshot {
            let healthy = self.validate(&pooled).await;
            let removed = {
                let mut inner = self.state.inner.lock().unwrap();
                if let Some(pos) = inner.idle.iter().position(|c| c.id == pooled.id) {
                    if healthy {
                        if let Some(entry) = inner.idle.get_mut(pos) {
                            entry.last_health_check = Instant::now();
                        }
                        false
                    } else {
                        let _ = inner.idle.remove(pos);
                        true
                    }
                } else {
                    false
                }
            };
            if removed {
                pooled.connection.disconnect().await;
                self.state
                    .counters
                    .health_check_failures
                    .fetch_add(1, Ordering::Relaxed);
                self.state.destroy_counted();
            }
        }

        let active_snapshot: Vec<PooledConnection> = {
            let inner = self.state.inner.lock().unwrap();
            inner.active.values().cloned().collect()
        };
        for pooled in active_snapshot {
            if !self.validate(&pooled).await {
                let evicted = {
                    let mut inner = self.state.inner.lock().unwrap();
                    inner.active.remove(&pooled.id).is_some()
                };
                if evicted {
                    self.state
                        .counters
                        .health_check_failures
                        .fetch_add(1, Ordering::Relaxed);
                    // The caller's handle still works; the connection is
                    // destroyed once it comes back.
                    warn!("ConnectionPool: evicted unhealthy active connection {}", pooled.id);
                }
            }
        }

        // Backfill toward the minimum after evictions.
        self.ensure_min_connections().await;
    }

    /// Idle cleanup and utilization-driven sizing.
    pub async fn perform_maintenance(&self) {
        let idle_timeout = self.state.config.idle_timeout();
        let min = self.state.config.min_connections;

        loop {
            let victim = {
                let mut inner = self.state.inner.lock().unwrap();
                if inner.total() <= min {
                    None
                } else {
                    match inner.idle.front() {
                        Some(front) if front.is_idle_expired(idle_timeout) => {
                            inner.idle.pop_front()
                        }
                        _ => None,
                    }
                }
            };
            match victim {
                Some(pooled) => {
                    debug!("ConnectionPool: closing idle connection {}", pooled.id);
                    pooled.connection.disconnect().await;
                    self.state.destroy_counted();
                }
                None => break,
            }
        }

        let (total, utilization) = {
            let inner = self.state.inner.lock().unwrap();
            let total = inner.total();
            let utilization = if total == 0 {
                0.0
            } else {
                inner.active.len() as f64 / total as f64
            };
            (total, utilization)
        };

        if utilization > 0.8 && total < self.state.config.max_connections {
            let growth = ((total as f64) * (self.state.config.growth_factor - 1.0)) as usize;
            let growth = growth
                .max(1)
                .min(self.state.config.max_connections - total);
            for _ in 0..growth {
                if !self.add_idle_connection().await {
                    break;
                }
            }
        }

        if self.state.config.enable_metrics {
            let metrics = self.metrics();
            info!(
                "ConnectionPool[{}]: total={} active={} idle={} created={} destroyed={}",
                self.factory.connection_type(),
                metrics.total_connections,
                metrics.active_connections,
                metrics.idle_connections,
                metrics.connections_created,
                metrics.connections_destroyed,
            );
        }
    }

    async fn ensure_min_connections(&self) {
        loop {
            let below_min = {
                let inner = self.state.inner.lock().unwrap();
                inner.total() < self.state.config.min_connections
            };
            if !below_min || !self.is_running() {
                break;
            }
            if !self.add_idle_connection().await {
                break;
            }
        }
    }
}

/// Caller-held handle to a pooled connection. Dropping it returns the
/// connection to its pool for revalidation.
pub struct PooledConnectionHandle {
    pooled: Option<PooledConnection>,
    release_tx: Option<mpsc::UnboundedSender<PooledConnection>>,
}

impl std::fmt::Debug for PooledConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnectionHandle")
            .field("id", &self.pooled.as_ref().map(|p| &p.id))
            .finish()
    }
}

impl PooledConnectionHandle {
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self
            .pooled
            .as_ref()
            .expect("handle already released")
            .connection
    }

    pub fn id(&self) -> &str {
        &self.pooled.as_ref().expect("handle already released").id
    }

    pub fn usage_count(&self) -> u64 {
        self.pooled.as_ref().map(|p| p.usage_count).unwrap_or(0)
    }
}

impl Drop for PooledConnectionHandle {
    fn drop(&mut self) {
        if let Some(pooled) = self.pooled.take() {
            if let Some(tx) = self.release_tx.take() {
                // A failed send means the pool is gone; the connection
                // drops (and closes) here.
                let _ = tx.send(pooled);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tcp::MockConnectionFactory;
    use std::time::Duration;

    fn test_config(initial: usize, max: usize) -> ConnectionPoolConfig {
        ConnectionPoolConfig {
            min_connections: 1,
            max_connections: max,
            initial_connections: initial,
            acquire_timeout: 500,
            enable_health_checks: false,
            enable_metrics: false,
            cleanup_interval: 3_600_000,
            health_check_interval: 3_600_000,
            ..Default::default()
        }
    }

    async fn drain_releases(pool: &Arc<ConnectionPool>) {
        // The release worker runs as its own task; give it a beat.
        for _ in 0..50 {
            if pool.active_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn starts_with_initial_connections() {
        let factory = Arc::new(MockConnectionFactory::new());
        let pool = ConnectionPool::new(factory, test_config(3, 10));
        pool.start().await.unwrap();
        assert_eq!(pool.idle_count(), 3);
        assert_eq!(pool.active_count(), 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn acquire_grows_under_pressure_and_recycles() {
        let factory = Arc::new(MockConnectionFactory::new());
        let pool = ConnectionPool::new(Arc::clone(&factory) as _, test_config(3, 10));
        pool.start().await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..5 {
            handles.push(pool.acquire().await.unwrap());
        }
        assert_eq!(pool.total_count(), 5);
        assert_eq!(pool.active_count(), 5);

        let first_ids: Vec<String> = handles.iter().map(|h| h.id().to_owned()).collect();
        handles.clear();
        drain_releases(&pool).await;

        let mut reused = 0;
        let mut again = Vec::new();
        for _ in 0..5 {
            let handle = pool.acquire().await.unwrap();
            if first_ids.contains(&handle.id().to_owned()) {
                reused += 1;
            }
            again.push(handle);
        }
        assert!(reused >= 1, "expected at least one recycled connection");
        assert_eq!(factory.created_count(), 5);
        drop(again);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn total_never_exceeds_max() {
        let factory = Arc::new(MockConnectionFactory::new());
        let pool = ConnectionPool::new(factory, test_config(0, 3));
        pool.start().await.unwrap();

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let c = pool.acquire().await.unwrap();
        assert_eq!(pool.total_count(), 3);

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, CommError::AcquireTimeout));
        assert_eq!(pool.metrics().acquisition_timeouts, 1);

        drop((a, b, c));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn release_unblocks_waiter() {
        let factory = Arc::new(MockConnectionFactory::new());
        let pool = ConnectionPool::new(
            factory,
            ConnectionPoolConfig {
                acquire_timeout: 2_000,
                ..test_config(0, 1)
            },
        );
        pool.start().await.unwrap();

        let held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(held);

        let handle = waiter.await.unwrap().expect("waiter should acquire");
        assert_eq!(pool.total_count(), 1);
        drop(handle);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn zero_timeout_fails_fast_when_saturated() {
        let factory = Arc::new(MockConnectionFactory::new());
        let pool = ConnectionPool::new(
            factory,
            ConnectionPoolConfig {
                acquire_timeout: 0,
                ..test_config(0, 1)
            },
        );
        pool.start().await.unwrap();

        let held = pool.acquire().await.expect("first acquire succeeds");
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, CommError::AcquireTimeout));
        drop(held);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn unhealthy_connection_removed_by_health_check() {
        let factory = Arc::new(MockConnectionFactory::new());
        let pool = ConnectionPool::new(Arc::clone(&factory) as _, test_config(3, 10));
        pool.start().await.unwrap();

        factory.poison_one();
        pool.perform_health_check().await;

        assert_eq!(pool.metrics().health_check_failures, 1);
        // One destroyed, backfilled toward min_connections (1), so the
        // two healthy ones remain.
        assert_eq!(pool.total_count(), 2);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn health_check_backfills_to_minimum() {
        let factory = Arc::new(MockConnectionFactory::new());
        let pool = ConnectionPool::new(
            Arc::clone(&factory) as _,
            ConnectionPoolConfig {
                min_connections: 2,
                ..test_config(2, 10)
            },
        );
        pool.start().await.unwrap();

        factory.poison_one();
        factory.poison_one();
        pool.perform_health_check().await;

        assert_eq!(pool.total_count(), 2);
        assert_eq!(pool.metrics().health_check_failures, 2);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_rejects_acquire() {
        let factory = Arc::new(MockConnectionFactory::new());
        let pool = ConnectionPool::new(factory, test_config(1, 4));
        pool.start().await.unwrap();
        pool.shutdown().await;
        assert!(matches!(pool.acquire().await, Err(CommError::PoolShutdown)));
        assert_eq!(pool.total_count(), 0);
    }

    #[tokio::test]
    async fn failing_factory_times_out_acquire() {
        let factory = Arc::new(MockConnectionFactory::new());
        factory.set_create_should_fail(true);
        let pool = ConnectionPool::new(
            Arc::clone(&factory) as _,
            ConnectionPoolConfig {
                acquire_timeout: 100,
                ..test_config(0, 4)
            },
        );
        pool.start().await.unwrap();
        assert!(matches!(pool.acquire().await, Err(CommError::AcquireTimeout)));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn maintenance_reaps_idle_but_keeps_minimum() {
        let factory = Arc::new(MockConnectionFactory::new());
        let pool = ConnectionPool::new(
            factory,
            ConnectionPoolConfig {
                min_connections: 1,
                idle_timeout: 0,
                ..test_config(3, 10)
            },
        );
        pool.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.perform_maintenance().await;
        assert_eq!(pool.total_count(), 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn evicted_active_connection_dies_on_return() {
        let factory = Arc::new(MockConnectionFactory::new());
        let pool = ConnectionPool::new(Arc::clone(&factory) as _, test_config(1, 4));
        pool.start().await.unwrap();

        let handle = pool.acquire().await.unwrap();
        factory.poison(handle.id());

        pool.perform_health_check().await;
        assert_eq!(pool.active_count(), 0);

        drop(handle);
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Destroyed on return, never requeued.
        assert!(pool.idle_count() <= 1);
        pool.shutdown().await;
    }
}
