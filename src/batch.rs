//! Outbound message batching.
//!
//! Messages are queued under a `(destination, priority)` key and grouped
//! into [`MessageBatch`]es once a queue is long enough, heavy enough, or
//! old enough. A batching worker sweeps the queues on `flush_interval`;
//! a dispatch worker hands ready batches to the registered callback.
//! Within one key the delivery order is the insertion order; there is no
//! ordering guarantee across keys.

use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::MessageBatcherConfig;
use crate::error::{CommError, Result};
use crate::message::now_millis;

/// A single message as the batcher sees it. `size` is precomputed at
/// construction so the byte-budget checks stay O(1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub destination: String,
    pub payload: Value,
    pub priority: i32,
    pub size: usize,
    pub timestamp: i64,
    pub metadata: Value,
}

impl Default for Message {
    fn default() -> Self {
        Self {
            id: String::new(),
            message_type: String::new(),
            destination: String::new(),
            payload: Value::Null,
            priority: 0,
            size: 0,
            timestamp: now_millis(),
            metadata: Value::Null,
        }
    }
}

impl Message {
    pub fn new(
        id: impl Into<String>,
        message_type: impl Into<String>,
        destination: impl Into<String>,
        payload: Value,
    ) -> Self {
        let mut message = Self {
            id: id.into(),
            message_type: message_type.into(),
            destination: destination.into(),
            payload,
            priority: 0,
            size: 0,
            timestamp: now_millis(),
            metadata: Value::Null,
        };
        message.calculate_size();
        message
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Recomputes the byte size from the current fields.
    pub fn calculate_size(&mut self) {
        let payload_len = serde_json::to_string(&self.payload)
            .map(|s| s.len())
            .unwrap_or(0);
        let metadata_len = serde_json::to_string(&self.metadata)
            .map(|s| s.len())
            .unwrap_or(0);
        self.size = self.id.len()
            + self.message_type.len()
            + self.destination.len()
            + payload_len
            + metadata_len;
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_json(value: &Value) -> Result<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }
}

/// An ordered group of messages sharing a destination (and a priority
/// bucket when priority batching is on), delivered as a unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageBatch {
    pub batch_id: String,
    pub messages: Vec<Message>,
    pub destination: String,
    pub average_priority: i32,
    pub total_size: usize,
    pub created_at: i64,
    pub scheduled_at: i64,
}

impl MessageBatch {
    fn new(destination: impl Into<String>) -> Self {
        Self {
            batch_id: generate_batch_id(),
            messages: Vec::new(),
            destination: destination.into(),
            average_priority: 0,
            total_size: 0,
            created_at: now_millis(),
            scheduled_at: 0,
        }
    }

    fn add_message(&mut self, message: Message) {
        self.total_size += message.size;
        if self.destination.is_empty() && !message.destination.is_empty() {
            self.destination = message.destination.clone();
        }
        self.messages.push(message);
        let total: i64 = self.messages.iter().map(|m| m.priority as i64).sum();
        self.average_priority = (total / self.messages.len() as i64) as i32;
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn generate_batch_id() -> String {
    format!("batch_{}", Uuid::new_v4().simple())
}

/// Callback invoked with every ready batch. Returning `Err` marks the
/// batch as failed without disturbing the dispatch worker.
pub type BatchReadyCallback =
    Arc<dyn Fn(&MessageBatch) -> std::result::Result<(), String> + Send + Sync>;

/// Callback reporting the outcome of each dispatched batch:
/// `(batch_id, success, error)`.
pub type BatchProcessedCallback = Arc<dyn Fn(&str, bool, &str) + Send + Sync>;

#[derive(Default)]
struct BatcherCounters {
    messages_received: AtomicU64,
    messages_batched: AtomicU64,
    batches_created: AtomicU64,
    batches_processed: AtomicU64,
    batches_failed: AtomicU64,
    callback_panics: AtomicU64,
    bytes_processed: AtomicU64,
    average_batch_size: AtomicU64,
    pending_batches: AtomicUsize,
}

/// Snapshot of batcher metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatcherMetrics {
    pub messages_received: u64,
    pub messages_batched: u64,
    pub batches_created: u64,
    pub batches_processed: u64,
    pub batches_failed: u64,
    pub callback_panics: u64,
    pub bytes_processed: u64,
    pub average_batch_size: f64,
}

struct QueuedMessage {
    message: Message,
    enqueued_at: Instant,
}

#[derive(Default)]
struct BatchingQueue {
    messages: VecDeque<QueuedMessage>,
    total_size: usize,
}

impl BatchingQueue {
    fn push(&mut self, message: Message) {
        self.total_size += message.size;
        self.messages.push_back(QueuedMessage {
            message,
            enqueued_at: Instant::now(),
        });
    }

    fn oldest_age(&self) -> Option<std::time::Duration> {
        self.messages.front().map(|m| m.enqueued_at.elapsed())
    }
}

type BatchKey = (String, i32);

struct BatcherShared {
    config: MessageBatcherConfig,
    queues: Mutex<HashMap<BatchKey, BatchingQueue>>,
    counters: BatcherCounters,
    running: AtomicBool,
    ready_tx: Mutex<Option<mpsc::UnboundedSender<MessageBatch>>>,
    batch_ready: Mutex<Option<BatchReadyCallback>>,
    batch_processed: Mutex<Option<BatchProcessedCallback>>,
}

/// Groups outbound messages by `(destination, priority)` into size- and
/// time-bounded batches and feeds them to a downstream callback.
pub struct MessageBatcher {
    shared: Arc<BatcherShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stop: Arc<Notify>,
}

impl MessageBatcher {
    pub fn new(config: MessageBatcherConfig) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(BatcherShared {
                config,
                queues: Mutex::new(HashMap::new()),
                counters: BatcherCounters::default(),
                running: AtomicBool::new(false),
                ready_tx: Mutex::new(None),
                batch_ready: Mutex::new(None),
                batch_processed: Mutex::new(None),
            }),
            workers: Mutex::new(Vec::new()),
            stop: Arc::new(Notify::new()),
        })
    }

    pub fn set_batch_ready_callback(&self, callback: BatchReadyCallback) {
        *self.shared.batch_ready.lock().unwrap() = Some(callback);
    }

    pub fn set_batch_processed_callback(&self, callback: BatchProcessedCallback) {
        *self.shared.batch_processed.lock().unwrap() = Some(callback);
    }

    /// Starts the batching and dispatch workers.
    pub async fn start(self: &Arc<Self>) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<MessageBatch>();
        *self.shared.ready_tx.lock().unwrap() = Some(tx);

        let mut workers = self.workers.lock().unwrap();

        // Batching worker: sweep queues on every flush tick.
        {
            let shared = Arc::clone(&self.shared);
            let stop = Arc::clone(&self.stop);
            workers.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(shared.config.flush_interval());
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if !shared.running.load(Ordering::SeqCst) {
                                break;
                            }
                            sweep_queues(&shared);
                        }
                        _ = stop.notified() => break,
                    }
                }
                debug!("MessageBatcher: batching worker stopped");
            }));
        }

        // Dispatch worker: drain the ready queue into the callbacks.
        {
            let shared = Arc::clone(&self.shared);
            workers.push(tokio::spawn(async move {
                while let Some(batch) = rx.recv().await {
                    shared.counters.pending_batches.fetch_sub(1, Ordering::Relaxed);
                    dispatch_batch(&shared, batch);
                }
                debug!("MessageBatcher: dispatch worker stopped");
            }));
        }
    }

    /// Stops both workers. Batches already on the ready queue are still
    /// dispatched before the dispatch worker exits.
    pub async fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.stop.notify_waiters();
        // Dropping the sender ends the dispatch worker after the drain.
        self.shared.ready_tx.lock().unwrap().take();

        let workers: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        for worker in workers {
            let _ = worker.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Queues one message for batching.
    pub fn add_message(&self, message: Message) -> Result<()> {
        if !self.is_running() {
            return Err(CommError::BatcherStopped);
        }

        let key = self.shared.key_for(&message);
        let mut queues = self.shared.queues.lock().unwrap();
        queues.entry(key).or_default().push(message);
        self.shared
            .counters
            .messages_received
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Queues several messages at once, stopping at the first failure.
    pub fn add_messages(&self, messages: Vec<Message>) -> Result<()> {
        for message in messages {
            self.add_message(message)?;
        }
        Ok(())
    }

    /// Drains every queue immediately, one batch per non-empty key,
    /// ignoring the ready predicate.
    pub fn flush_all(&self) {
        self.flush_where(|_| true);
    }

    /// Drains only the queues whose destination matches.
    pub fn flush_destination(&self, destination: &str) {
        self.flush_where(|key| key.0 == destination);
    }

    fn flush_where(&self, matches: impl Fn(&BatchKey) -> bool) {
        let mut batches = Vec::new();
        {
            let mut queues = self.shared.queues.lock().unwrap();
            queues.retain(|key, queue| {
                if !matches(key) || queue.messages.is_empty() {
                    return !queue.messages.is_empty();
                }
                let mut batch = MessageBatch::new(key.0.clone());
                while let Some(queued) = queue.messages.pop_front() {
                    queue.total_size -= queued.message.size;
                    batch.add_message(queued.message);
                }
                batches.push(batch);
                false
            });
        }
        for batch in batches {
            self.shared.enqueue_ready(batch);
        }
    }

    pub fn pending_message_count(&self) -> usize {
        self.shared
            .queues
            .lock()
            .unwrap()
            .values()
            .map(|q| q.messages.len())
            .sum()
    }

    pub fn pending_batch_count(&self) -> usize {
        self.shared.counters.pending_batches.load(Ordering::Relaxed)
    }

    pub fn metrics(&self) -> BatcherMetrics {
        let c = &self.shared.counters;
        BatcherMetrics {
            messages_received: c.messages_received.load(Ordering::Relaxed),
            messages_batched: c.messages_batched.load(Ordering::Relaxed),
            batches_created: c.batches_created.load(Ordering::Relaxed),
            batches_processed: c.batches_processed.load(Ordering::Relaxed),
            batches_failed: c.batches_failed.load(Ordering::Relaxed),
            callback_panics: c.callback_panics.load(Ordering::Relaxed),
            bytes_processed: c.bytes_processed.load(Ordering::Relaxed),
            average_batch_size: f64::from_bits(c.average_batch_size.load(Ordering::Relaxed)),
        }
    }

    pub fn configuration(&self) -> &MessageBatcherConfig {
        &self.shared.config
    }
}

impl BatcherShared {
    /// The queue key. Destination collapses when destination batching is
    /// off, priority collapses when priority batching is off.
    fn key_for(&self, message: &Message) -> BatchKey {
        let destination = if self.config.enable_destination_batching {
            message.destination.clone()
        } else {
            String::new()
        };
        let priority = if self.config.enable_priority_batching {
            message.priority
        } else {
            0
        };
        (destination, priority)
    }

    fn enqueue_ready(&self, mut batch: MessageBatch) {
        if batch.is_empty() {
            return;
        }
        batch.scheduled_at = now_millis();

        self.counters.batches_created.fetch_add(1, Ordering::Relaxed);
        self.counters
            .messages_batched
            .fetch_add(batch.messages.len() as u64, Ordering::Relaxed);
        self.counters
            .bytes_processed
            .fetch_add(batch.total_size as u64, Ordering::Relaxed);
        let current = f64::from_bits(self.counters.average_batch_size.load(Ordering::Relaxed));
        let next = if current == 0.0 {
            batch.messages.len() as f64
        } else {
            (current + batch.messages.len() as f64) / 2.0
        };
        self.counters
            .average_batch_size
            .store(next.to_bits(), Ordering::Relaxed);

        let tx = self.ready_tx.lock().unwrap();
        if let Some(tx) = tx.as_ref() {
            // Count before sending so the dispatch side never sees the
            // counter go negative.
            self.counters.pending_batches.fetch_add(1, Ordering::Relaxed);
            if tx.send(batch).is_err() {
                self.counters.pending_batches.fetch_sub(1, Ordering::Relaxed);
            }
        } else {
            warn!("MessageBatcher: dropping batch, batcher stopped");
        }
    }

    fn should_create_batch(&self, queue: &BatchingQueue) -> bool {
        if queue.messages.is_empty() {
            return false;
        }
        if queue.messages.len() >= self.config.max_batch_size {
            return true;
        }
        if queue.total_size >= self.config.max_batch_size_bytes {
            return true;
        }
        match queue.oldest_age() {
            Some(age) => age >= self.config.batch_timeout(),
            None => false,
        }
    }
}

/// One pass of the batching worker: build a batch from every queue whose
/// ready predicate holds.
fn sweep_queues(shared: &Arc<BatcherShared>) {
    let mut ready = Vec::new();
    {
        let mut queues = shared.queues.lock().unwrap();
        queues.retain(|key, queue| {
            if !shared.should_create_batch(queue) {
                return !queue.messages.is_empty();
            }

            let mut batch = MessageBatch::new(key.0.clone());
            while batch.messages.len() < shared.config.max_batch_size {
                let next_size = match queue.messages.front() {
                    Some(front) => front.message.size,
                    None => break,
                };
                // Never exceed the byte budget, but a batch always takes
                // at least one message so oversized singles still move.
                if !batch.messages.is_empty()
                    && batch.total_size + next_size > shared.config.max_batch_size_bytes
                {
                    break;
                }
                if let Some(queued) = queue.messages.pop_front() {
                    queue.total_size -= queued.message.size;
                    batch.add_message(queued.message);
                }
            }

            if !batch.is_empty() {
                ready.push(batch);
            }
            !queue.messages.is_empty()
        });
    }

    for batch in ready {
        shared.enqueue_ready(batch);
    }
}

/// Delivers one batch to the user callback, containing panics and
/// reporting the outcome through `batch_processed`.
fn dispatch_batch(shared: &Arc<BatcherShared>, batch: MessageBatch) {
    let callback = shared.batch_ready.lock().unwrap().clone();
    let outcome = match callback {
        Some(callback) => match catch_unwind(AssertUnwindSafe(|| callback(&batch))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                shared.counters.callback_panics.fetch_add(1, Ordering::Relaxed);
                error!("MessageBatcher: batch_ready callback panicked");
                Err(String::from("batch callback panicked"))
            }
        },
        None => Ok(()),
    };

    match &outcome {
        Ok(()) => {
            shared.counters.batches_processed.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            shared.counters.batches_failed.fetch_add(1, Ordering::Relaxed);
            warn!("MessageBatcher: batch {} failed: {}", batch.batch_id, e);
        }
    }

    let processed = shared.batch_processed.lock().unwrap().clone();
    if let Some(processed) = processed {
        let success = outcome.is_ok();
        let error = outcome.err().unwrap_or_default();
        processed(&batch.batch_id, success, &error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn test_config() -> MessageBatcherConfig {
        MessageBatcherConfig {
            max_batch_size: 5,
            max_batch_size_bytes: 1024,
            batch_timeout: 100,
            flush_interval: 20,
            ..Default::default()
        }
    }

    fn test_message(id: &str, destination: &str, priority: i32) -> Message {
        Message::new(id, "test", destination, json!({"data": id})).priority(priority)
    }

    /// Collects delivered batches for assertions.
    fn collector(batcher: &Arc<MessageBatcher>) -> Arc<Mutex<Vec<MessageBatch>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        batcher.set_batch_ready_callback(Arc::new(move |batch| {
            sink.lock().unwrap().push(batch.clone());
            Ok(())
        }));
        seen
    }

    async fn wait_for_batches(seen: &Arc<Mutex<Vec<MessageBatch>>>, count: usize) {
        for _ in 0..100 {
            if seen.lock().unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn message_json_roundtrip() {
        let message = test_message("m1", "dome", 2);
        let restored = Message::from_json(&message.to_json()).unwrap();
        assert_eq!(restored, message);
        assert_eq!(message.to_json()["type"], "test");
    }

    #[test]
    fn size_accounts_for_all_fields() {
        let mut message = test_message("m1", "dome", 0);
        let original = message.size;
        message.destination = String::from("a-much-longer-destination");
        message.calculate_size();
        assert!(message.size > original);
    }

    #[tokio::test]
    async fn add_message_requires_running() {
        let batcher = MessageBatcher::new(test_config());
        assert!(matches!(
            batcher.add_message(test_message("m1", "d", 0)),
            Err(CommError::BatcherStopped)
        ));
    }

    #[tokio::test]
    async fn flush_all_groups_by_destination() {
        let batcher = MessageBatcher::new(test_config());
        let seen = collector(&batcher);
        batcher.start().await;

        for i in 0..3 {
            batcher.add_message(test_message(&format!("a{i}"), "dest_a", 0)).unwrap();
            batcher.add_message(test_message(&format!("b{i}"), "dest_b", 0)).unwrap();
        }
        batcher.flush_all();
        wait_for_batches(&seen, 2).await;
        batcher.stop().await;

        let batches = seen.lock().unwrap();
        assert_eq!(batches.len(), 2);
        let mut destinations: Vec<_> = batches.iter().map(|b| b.destination.clone()).collect();
        destinations.sort();
        assert_eq!(destinations, vec!["dest_a", "dest_b"]);
        for batch in batches.iter() {
            assert_eq!(batch.message_count(), 3);
            assert!(batch.messages.iter().all(|m| m.destination == batch.destination));
        }
    }

    #[tokio::test]
    async fn flush_all_on_empty_batcher_is_silent() {
        let batcher = MessageBatcher::new(test_config());
        let seen = collector(&batcher);
        batcher.start().await;
        batcher.flush_all();
        tokio::time::sleep(Duration::from_millis(50)).await;
        batcher.stop().await;
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn max_batch_size_one_means_batch_per_message() {
        let batcher = MessageBatcher::new(MessageBatcherConfig {
            max_batch_size: 1,
            flush_interval: 10,
            ..test_config()
        });
        let seen = collector(&batcher);
        batcher.start().await;

        for i in 0..4 {
            batcher.add_message(test_message(&format!("m{i}"), "scope", 0)).unwrap();
        }
        wait_for_batches(&seen, 4).await;
        batcher.stop().await;

        let batches = seen.lock().unwrap();
        assert_eq!(batches.len(), 4);
        assert!(batches.iter().all(|b| b.message_count() == 1));
        // FIFO within the key.
        let ids: Vec<_> = batches.iter().map(|b| b.messages[0].id.clone()).collect();
        assert_eq!(ids, vec!["m0", "m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn byte_budget_limits_batches() {
        let batcher = MessageBatcher::new(MessageBatcherConfig {
            max_batch_size: 100,
            max_batch_size_bytes: 80,
            batch_timeout: 10,
            flush_interval: 10,
            ..Default::default()
        });
        let seen = collector(&batcher);
        batcher.start().await;

        for i in 0..6 {
            batcher.add_message(test_message(&format!("m{i}"), "cam", 0)).unwrap();
        }
        wait_for_batches(&seen, 2).await;
        batcher.stop().await;

        let batches = seen.lock().unwrap();
        assert!(batches.len() >= 2);
        for batch in batches.iter() {
            assert!(batch.total_size <= 80 || batch.message_count() == 1);
            assert!(batch.message_count() <= 100);
        }
    }

    #[tokio::test]
    async fn priority_buckets_stay_separate() {
        let batcher = MessageBatcher::new(test_config());
        let seen = collector(&batcher);
        batcher.start().await;

        batcher.add_message(test_message("low", "mount", 0)).unwrap();
        batcher.add_message(test_message("high", "mount", 5)).unwrap();
        batcher.flush_all();
        wait_for_batches(&seen, 2).await;
        batcher.stop().await;

        let batches = seen.lock().unwrap();
        assert_eq!(batches.len(), 2);
        for batch in batches.iter() {
            assert_eq!(batch.message_count(), 1);
        }
    }

    #[tokio::test]
    async fn flush_destination_only_drains_matching_keys() {
        let batcher = MessageBatcher::new(test_config());
        let seen = collector(&batcher);
        batcher.start().await;

        batcher.add_message(test_message("a", "dest_a", 0)).unwrap();
        batcher.add_message(test_message("b", "dest_b", 0)).unwrap();
        batcher.flush_destination("dest_a");
        wait_for_batches(&seen, 1).await;

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(seen.lock().unwrap()[0].destination, "dest_a");
        assert_eq!(batcher.pending_message_count(), 1);
        batcher.stop().await;
    }

    #[tokio::test]
    async fn failing_callback_reports_and_keeps_running() {
        let batcher = MessageBatcher::new(test_config());
        batcher.set_batch_ready_callback(Arc::new(|_| Err(String::from("downstream refused"))));
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&outcomes);
        batcher.set_batch_processed_callback(Arc::new(move |id, success, error| {
            sink.lock().unwrap().push((id.to_owned(), success, error.to_owned()));
        }));
        batcher.start().await;

        batcher.add_message(test_message("m1", "d", 0)).unwrap();
        batcher.flush_all();
        for _ in 0..100 {
            if !outcomes.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        {
            let outcomes = outcomes.lock().unwrap();
            assert_eq!(outcomes.len(), 1);
            assert!(!outcomes[0].1);
            assert_eq!(outcomes[0].2, "downstream refused");
        }
        assert!(batcher.is_running());
        assert_eq!(batcher.metrics().batches_failed, 1);
        batcher.stop().await;
    }

    #[tokio::test]
    async fn panicking_callback_is_contained() {
        let batcher = MessageBatcher::new(test_config());
        batcher.set_batch_ready_callback(Arc::new(|_| panic!("boom")));
        batcher.start().await;

        batcher.add_message(test_message("m1", "d", 0)).unwrap();
        batcher.flush_all();
        for _ in 0..100 {
            if batcher.metrics().callback_panics > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(batcher.metrics().callback_panics, 1);
        assert!(batcher.is_running());
        batcher.stop().await;
    }

    #[tokio::test]
    async fn timeout_flushes_idle_queue() {
        let batcher = MessageBatcher::new(MessageBatcherConfig {
            max_batch_size: 100,
            batch_timeout: 30,
            flush_interval: 10,
            ..Default::default()
        });
        let seen = collector(&batcher);
        batcher.start().await;

        batcher.add_message(test_message("solo", "focuser", 0)).unwrap();
        wait_for_batches(&seen, 1).await;
        batcher.stop().await;

        let batches = seen.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].messages[0].id, "solo");
    }
}
