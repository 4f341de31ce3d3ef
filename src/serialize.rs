//! JSON serialization with content-addressed caching, optional deflate
//! compression of cache entries, and an async worker pool.
//!
//! The optimizer wraps `serde_json` rather than replacing it: the value of
//! the component is the cache (repeated status payloads serialize once),
//! the compression of large cached entries, and the ability to move bulk
//! serialization off latency-sensitive tasks.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::config::SerializationOptimizerConfig;
use crate::error::{CommError, Result};

/// One cached serialization result. `data` holds the deflate-compressed
/// bytes when `is_compressed` is set, otherwise the UTF-8 JSON itself.
struct CacheEntry {
    data: Vec<u8>,
    is_compressed: bool,
    created_at: Instant,
    last_accessed: Instant,
    access_count: u64,
    original_size: usize,
}

impl CacheEntry {
    fn new(data: Vec<u8>, is_compressed: bool, original_size: usize) -> Self {
        let now = Instant::now();
        Self {
            data,
            is_compressed,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            original_size,
        }
    }

    fn touch(&mut self) {
        self.last_accessed = Instant::now();
        self.access_count += 1;
    }

    fn is_expired(&self, timeout: std::time::Duration) -> bool {
        self.last_accessed.elapsed() > timeout
    }
}

enum SerializationTask {
    Serialize(Value, oneshot::Sender<Result<String>>),
    Deserialize(String, oneshot::Sender<Result<Value>>),
}

#[derive(Default)]
struct OptimizerCounters {
    total_serializations: AtomicU64,
    total_deserializations: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    compression_operations: AtomicU64,
    async_operations: AtomicU64,
    // f64 running averages stored as bit patterns
    average_serialization_time: AtomicU64,
    average_deserialization_time: AtomicU64,
    total_bytes_processed: AtomicU64,
    total_bytes_compressed: AtomicU64,
}

impl OptimizerCounters {
    fn record_average(cell: &AtomicU64, sample_ms: f64) {
        // Racy read-modify-write is acceptable for a smoothed average.
        let current = f64::from_bits(cell.load(Ordering::Relaxed));
        let next = (current + sample_ms) / 2.0;
        cell.store(next.to_bits(), Ordering::Relaxed);
    }
}

/// Snapshot of optimizer metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializationMetrics {
    pub total_serializations: u64,
    pub total_deserializations: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub compression_operations: u64,
    pub async_operations: u64,
    pub average_serialization_time: f64,
    pub average_deserialization_time: f64,
    pub cache_hit_ratio: f64,
    pub total_bytes_processed: u64,
    pub total_bytes_compressed: u64,
}

/// JSON ↔ string conversion with an LRU-evicted cache and a worker pool
/// for async callers.
pub struct SerializationOptimizer {
    config: SerializationOptimizerConfig,
    cache: Mutex<HashMap<String, CacheEntry>>,
    counters: OptimizerCounters,
    running: AtomicBool,
    task_tx: Mutex<Option<mpsc::Sender<SerializationTask>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    stop: Arc<Notify>,
}

const TASK_QUEUE_DEPTH: usize = 1024;

impl SerializationOptimizer {
    pub fn new(config: SerializationOptimizerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            cache: Mutex::new(HashMap::new()),
            counters: OptimizerCounters::default(),
            running: AtomicBool::new(false),
            task_tx: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            sweeper: Mutex::new(None),
            stop: Arc::new(Notify::new()),
        })
    }

    /// Starts the worker pool (when async serialization is enabled) and
    /// the cache-expiry sweeper (when caching is enabled).
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        if self.config.enable_async_serialization {
            let (tx, rx) = mpsc::channel(TASK_QUEUE_DEPTH);
            *self.task_tx.lock().unwrap() = Some(tx);
            let rx = Arc::new(tokio::sync::Mutex::new(rx));

            let mut workers = self.workers.lock().unwrap();
            for worker_id in 0..self.config.worker_threads.max(1) {
                let optimizer = Arc::clone(self);
                let rx = Arc::clone(&rx);
                workers.push(tokio::spawn(async move {
                    loop {
                        let task = { rx.lock().await.recv().await };
                        let Some(task) = task else { break };
                        optimizer.run_task(task);
                    }
                    debug!("SerializationOptimizer: worker {} stopped", worker_id);
                }));
            }
        }

        if self.config.enable_caching {
            let optimizer = Arc::clone(self);
            let stop = Arc::clone(&self.stop);
            *self.sweeper.lock().unwrap() = Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(optimizer.config.cache_timeout());
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => optimizer.cleanup_expired_entries(),
                        _ = stop.notified() => break,
                    }
                }
            }));
        }
    }

    /// Signals the workers, drains the queue and joins. Futures still
    /// waiting on the queue resolve with [`CommError::PoolShutdown`].
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        // Closing the channel lets workers finish queued tasks and exit.
        self.task_tx.lock().unwrap().take();
        self.stop.notify_waiters();

        let workers: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        for worker in workers {
            let _ = worker.await;
        }
        let sweeper = self.sweeper.lock().unwrap().take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Serializes `value` to a JSON string, consulting the cache first.
    pub fn serialize(&self, value: &Value) -> Result<String> {
        if !self.is_running() {
            return Err(CommError::PoolShutdown);
        }

        let started = Instant::now();
        let dumped = serde_json::to_string(value)?;

        let result = if self.config.enable_caching {
            let key = cache_key(&dumped);
            match self.cache_lookup(&key) {
                Some(cached) => {
                    self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                    cached?
                }
                None => {
                    self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
                    self.cache_store(key, &dumped);
                    dumped
                }
            }
        } else {
            dumped
        };

        OptimizerCounters::record_average(
            &self.counters.average_serialization_time,
            started.elapsed().as_secs_f64() * 1000.0,
        );
        self.counters.total_serializations.fetch_add(1, Ordering::Relaxed);
        self.counters
            .total_bytes_processed
            .fetch_add(result.len() as u64, Ordering::Relaxed);

        Ok(result)
    }

    /// Parses a JSON string. When compression is enabled the input is
    /// first probed as deflate data; an inflate failure simply means the
    /// input was never compressed.
    pub fn deserialize(&self, data: &str) -> Result<Value> {
        if !self.is_running() {
            return Err(CommError::PoolShutdown);
        }

        let started = Instant::now();

        let text = if self.config.enable_compression {
            match inflate(data.as_bytes()).and_then(|bytes| {
                String::from_utf8(bytes)
                    .map_err(|e| CommError::Serialization(e.to_string()))
            }) {
                Ok(inflated) => inflated,
                Err(_) => data.to_owned(),
            }
        } else {
            data.to_owned()
        };

        let value: Value = serde_json::from_str(&text)
            .map_err(|e| CommError::Serialization(e.to_string()))?;

        OptimizerCounters::record_average(
            &self.counters.average_deserialization_time,
            started.elapsed().as_secs_f64() * 1000.0,
        );
        self.counters.total_deserializations.fetch_add(1, Ordering::Relaxed);

        Ok(value)
    }

    /// Queues serialization on the worker pool and awaits the result
    /// under `async_timeout`. Falls back to the synchronous path when
    /// async serialization is disabled.
    pub async fn serialize_async(&self, value: Value) -> Result<String> {
        if !self.config.enable_async_serialization {
            return self.serialize(&value);
        }
        let (tx, rx) = oneshot::channel();
        self.enqueue(SerializationTask::Serialize(value, tx)).await?;
        self.await_task(rx).await
    }

    /// Async counterpart of [`deserialize`](Self::deserialize).
    pub async fn deserialize_async(&self, data: String) -> Result<Value> {
        if !self.config.enable_async_serialization {
            return self.deserialize(&data);
        }
        let (tx, rx) = oneshot::channel();
        self.enqueue(SerializationTask::Deserialize(data, tx)).await?;
        self.await_task(rx).await
    }

    pub fn serialize_batch(&self, values: &[Value]) -> Vec<Result<String>> {
        values.iter().map(|v| self.serialize(v)).collect()
    }

    pub fn deserialize_batch(&self, items: &[String]) -> Vec<Result<Value>> {
        items.iter().map(|s| self.deserialize(s)).collect()
    }

    pub fn clear_cache(&self) {
        self.cache.lock().unwrap().clear();
    }

    /// Drops every cache entry whose last access is older than
    /// `cache_timeout`.
    pub fn cleanup_expired_entries(&self) {
        let timeout = self.config.cache_timeout();
        let mut cache = self.cache.lock().unwrap();
        let before = cache.len();
        cache.retain(|_, entry| !entry.is_expired(timeout));
        let removed = before - cache.len();
        if removed > 0 {
            debug!("SerializationOptimizer: expired {} cache entries", removed);
        }
    }

    pub fn cache_size(&self) -> usize {
        self.cache.lock().unwrap().len()
    }

    pub fn metrics(&self) -> SerializationMetrics {
        let c = &self.counters;
        let hits = c.cache_hits.load(Ordering::Relaxed);
        let misses = c.cache_misses.load(Ordering::Relaxed);
        let ratio = if hits + misses == 0 {
            0.0
        } else {
            hits as f64 / (hits + misses) as f64
        };
        SerializationMetrics {
            total_serializations: c.total_serializations.load(Ordering::Relaxed),
            total_deserializations: c.total_deserializations.load(Ordering::Relaxed),
            cache_hits: hits,
            cache_misses: misses,
            compression_operations: c.compression_operations.load(Ordering::Relaxed),
            async_operations: c.async_operations.load(Ordering::Relaxed),
            average_serialization_time: f64::from_bits(
                c.average_serialization_time.load(Ordering::Relaxed),
            ),
            average_deserialization_time: f64::from_bits(
                c.average_deserialization_time.load(Ordering::Relaxed),
            ),
            cache_hit_ratio: ratio,
            total_bytes_processed: c.total_bytes_processed.load(Ordering::Relaxed),
            total_bytes_compressed: c.total_bytes_compressed.load(Ordering::Relaxed),
        }
    }

    pub fn configuration(&self) -> &SerializationOptimizerConfig {
        &self.config
    }

    // --- internals ---

    fn run_task(&self, task: SerializationTask) {
        self.counters.async_operations.fetch_add(1, Ordering::Relaxed);
        match task {
            SerializationTask::Serialize(value, reply) => {
                let _ = reply.send(self.serialize(&value));
            }
            SerializationTask::Deserialize(data, reply) => {
                let _ = reply.send(self.deserialize(&data));
            }
        }
    }

    async fn enqueue(&self, task: SerializationTask) -> Result<()> {
        let tx = self
            .task_tx
            .lock()
            .unwrap()
            .clone()
            .ok_or(CommError::PoolShutdown)?;
        tx.send(task).await.map_err(|_| CommError::PoolShutdown)
    }

    async fn await_task<T>(&self, rx: oneshot::Receiver<Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.config.async_timeout(), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CommError::PoolShutdown),
            Err(_) => Err(CommError::Internal(String::from(
                "async serialization timed out",
            ))),
        }
    }

    /// Returns `Some(decoded)` on a live hit, removing expired entries on
    /// the way.
    fn cache_lookup(&self, key: &str) -> Option<Result<String>> {
        let timeout = self.config.cache_timeout();
        let mut cache = self.cache.lock().unwrap();
        let entry = cache.get_mut(key)?;
        if entry.is_expired(timeout) {
            cache.remove(key);
            return None;
        }
        entry.touch();
        let decoded = if entry.is_compressed {
            inflate(&entry.data).and_then(|bytes| {
                String::from_utf8(bytes)
                    .map_err(|e| CommError::Serialization(e.to_string()))
            })
        } else {
            String::from_utf8(entry.data.clone())
                .map_err(|e| CommError::Serialization(e.to_string()))
        };
        Some(decoded)
    }

    fn cache_store(&self, key: String, dumped: &str) {
        let mut cache = self.cache.lock().unwrap();
        if cache.len() >= self.config.cache_max_size {
            evict_least_recently_used(&mut cache);
        }

        let mut data = dumped.as_bytes().to_vec();
        let mut compressed = false;
        if self.config.enable_compression && dumped.len() >= self.config.compression_threshold {
            if let Ok(deflated) = deflate(dumped.as_bytes()) {
                if deflated.len() < data.len() {
                    self.counters
                        .total_bytes_compressed
                        .fetch_add((data.len() - deflated.len()) as u64, Ordering::Relaxed);
                    data = deflated;
                    compressed = true;
                }
                self.counters
                    .compression_operations
                    .fetch_add(1, Ordering::Relaxed);
            } else {
                error!("SerializationOptimizer: deflate failed, storing raw entry");
            }
        }

        cache.insert(key, CacheEntry::new(data, compressed, dumped.len()));
    }
}

fn cache_key(dumped: &str) -> String {
    let mut hasher = DefaultHasher::new();
    dumped.hash(&mut hasher);
    format!("cache_{:x}", hasher.finish())
}

/// Linear scan for the oldest `last_accessed`. The cache is bounded by
/// `cache_max_size`, so the scan stays cheap.
fn evict_least_recently_used(cache: &mut HashMap<String, CacheEntry>) {
    let oldest = cache
        .iter()
        .min_by_key(|(_, entry)| entry.last_accessed)
        .map(|(key, _)| key.clone());
    if let Some(key) = oldest {
        cache.remove(&key);
    }
}

fn deflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| CommError::Serialization(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| CommError::Serialization(e.to_string()))
}

fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| CommError::Serialization(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn started(config: SerializationOptimizerConfig) -> Arc<SerializationOptimizer> {
        let optimizer = SerializationOptimizer::new(config);
        optimizer.start().await;
        optimizer
    }

    #[tokio::test]
    async fn serialize_before_start_fails() {
        let optimizer = SerializationOptimizer::new(Default::default());
        assert!(matches!(
            optimizer.serialize(&json!({"a": 1})),
            Err(CommError::PoolShutdown)
        ));
    }

    #[tokio::test]
    async fn cache_hit_roundtrips() {
        let optimizer = started(SerializationOptimizerConfig {
            enable_async_serialization: false,
            ..Default::default()
        })
        .await;

        let value = json!({"device": "mount", "ra": 12.5, "dec": -30.25});
        let first = optimizer.serialize(&value).unwrap();
        let second = optimizer.serialize(&value).unwrap();
        assert_eq!(first, second);
        assert_eq!(optimizer.metrics().cache_hits, 1);
        assert_eq!(optimizer.metrics().cache_misses, 1);

        let parsed = optimizer.deserialize(&second).unwrap();
        assert_eq!(parsed, value);
        optimizer.stop().await;
    }

    #[tokio::test]
    async fn compressed_entries_decode_identically() {
        let optimizer = started(SerializationOptimizerConfig {
            enable_compression: true,
            compression_threshold: 16,
            enable_async_serialization: false,
            ..Default::default()
        })
        .await;

        // Repetitive payload so deflate actually wins.
        let value = json!({"samples": vec!["calibration frame"; 64]});
        let miss = optimizer.serialize(&value).unwrap();
        let hit = optimizer.serialize(&value).unwrap();
        assert_eq!(miss, hit);
        assert!(optimizer.metrics().compression_operations >= 1);
        assert_eq!(optimizer.deserialize(&hit).unwrap(), value);
        optimizer.stop().await;
    }

    #[tokio::test]
    async fn lru_eviction_keeps_cache_bounded() {
        let optimizer = started(SerializationOptimizerConfig {
            cache_max_size: 4,
            enable_async_serialization: false,
            ..Default::default()
        })
        .await;

        for i in 0..10 {
            optimizer.serialize(&json!({"i": i})).unwrap();
        }
        assert!(optimizer.cache_size() <= 4);
        optimizer.stop().await;
    }

    #[tokio::test]
    async fn deserialize_rejects_bad_input() {
        let optimizer = started(SerializationOptimizerConfig {
            enable_async_serialization: false,
            ..Default::default()
        })
        .await;
        assert!(matches!(
            optimizer.deserialize("{ not json"),
            Err(CommError::Serialization(_))
        ));
        optimizer.stop().await;
    }

    #[tokio::test]
    async fn async_path_matches_sync_path() {
        let optimizer = started(SerializationOptimizerConfig {
            worker_threads: 2,
            ..Default::default()
        })
        .await;

        let value = json!({"filter": "Ha", "exposure": 300});
        let via_worker = optimizer.serialize_async(value.clone()).await.unwrap();
        let direct = optimizer.serialize(&value).unwrap();
        assert_eq!(via_worker, direct);

        let parsed = optimizer.deserialize_async(via_worker).await.unwrap();
        assert_eq!(parsed, value);
        assert!(optimizer.metrics().async_operations >= 1);
        optimizer.stop().await;
    }

    #[tokio::test]
    async fn async_disabled_falls_back_to_sync() {
        let optimizer = started(SerializationOptimizerConfig {
            enable_async_serialization: false,
            ..Default::default()
        })
        .await;
        let value = json!([1, 2, 3]);
        assert_eq!(
            optimizer.serialize_async(value.clone()).await.unwrap(),
            serde_json::to_string(&value).unwrap()
        );
        optimizer.stop().await;
    }

    #[tokio::test]
    async fn stop_fails_pending_queue_users() {
        let optimizer = started(Default::default()).await;
        optimizer.stop().await;
        assert!(matches!(
            optimizer.serialize_async(json!({})).await,
            Err(CommError::PoolShutdown)
        ));
    }

    #[tokio::test]
    async fn clear_cache_resets_size() {
        let optimizer = started(SerializationOptimizerConfig {
            enable_async_serialization: false,
            ..Default::default()
        })
        .await;
        optimizer.serialize(&json!({"x": 1})).unwrap();
        assert_eq!(optimizer.cache_size(), 1);
        optimizer.clear_cache();
        assert_eq!(optimizer.cache_size(), 0);
        optimizer.stop().await;
    }
}
