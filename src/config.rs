//! Configuration types for the communication core.
//!
//! Every config round-trips through JSON (`serde_json`) so device hosts can
//! persist and reload them. Missing fields fall back to their defaults,
//! which lets older stored configs keep loading after new knobs are added.
//!
//! Durations are stored as integer milliseconds (keepalive times as whole
//! seconds) to keep the serialized form flat.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a TCP communicator, covering both client and server
/// mode. Which mode applies is decided once at construction via
/// `is_server`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConnectionConfig {
    pub server_address: String,
    pub server_port: u16,
    pub is_server: bool,
    pub connect_timeout: u64,
    pub read_timeout: u64,
    pub write_timeout: u64,
    pub buffer_size: usize,
    pub enable_keep_alive: bool,
    pub keep_alive_interval: u64,
    pub keep_alive_probes: u32,
    pub keep_alive_timeout: u64,
    pub enable_nagle: bool,
    pub max_connections: usize,
    pub reuse_address: bool,
    pub bind_interface: String,
    pub enable_ssl: bool,
    pub ssl_cert_path: String,
    pub ssl_key_path: String,
    pub ssl_ca_path: String,
    pub enable_compression: bool,
    pub enable_message_batching: bool,
    pub max_batch_size: usize,
    pub batch_timeout: u64,
}

impl Default for TcpConnectionConfig {
    fn default() -> Self {
        Self {
            server_address: String::from("localhost"),
            server_port: 8001,
            is_server: false,
            connect_timeout: 5_000,
            read_timeout: 30_000,
            write_timeout: 5_000,
            buffer_size: 8192,
            enable_keep_alive: true,
            keep_alive_interval: 30,
            keep_alive_probes: 3,
            keep_alive_timeout: 10,
            enable_nagle: false,
            max_connections: 100,
            reuse_address: true,
            bind_interface: String::from("0.0.0.0"),
            enable_ssl: false,
            ssl_cert_path: String::new(),
            ssl_key_path: String::new(),
            ssl_ca_path: String::new(),
            enable_compression: false,
            enable_message_batching: true,
            max_batch_size: 50,
            batch_timeout: 100,
        }
    }
}

impl TcpConnectionConfig {
    /// Default client configuration pointed at the given host and port.
    pub fn client(host: impl Into<String>, port: u16) -> Self {
        Self {
            server_address: host.into(),
            server_port: port,
            is_server: false,
            ..Default::default()
        }
    }

    /// Default server configuration listening on the given port.
    pub fn server(port: u16) -> Self {
        Self {
            server_port: port,
            is_server: true,
            ..Default::default()
        }
    }

    pub fn bind_interface(mut self, interface: impl Into<String>) -> Self {
        self.bind_interface = interface.into();
        self
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn message_batching(mut self, enabled: bool) -> Self {
        self.enable_message_batching = enabled;
        self
    }

    pub fn keep_alive(mut self, enabled: bool) -> Self {
        self.enable_keep_alive = enabled;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval)
    }

    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_secs(self.keep_alive_timeout)
    }
}

/// Configuration for a generic [`MemoryPool`](crate::pool::MemoryPool).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryPoolConfig {
    pub initial_pool_size: usize,
    pub max_pool_size: usize,
    pub growth_increment: usize,
    pub growth_threshold: f64,
    pub shrink_threshold: f64,
    pub cleanup_interval: u64,
    pub object_timeout: u64,
    pub enable_metrics: bool,
    pub enable_auto_cleanup: bool,
    pub enable_thread_safety: bool,
}

impl Default for MemoryPoolConfig {
    fn default() -> Self {
        Self {
            initial_pool_size: 100,
            max_pool_size: 1000,
            growth_increment: 50,
            growth_threshold: 0.8,
            shrink_threshold: 0.3,
            cleanup_interval: 60_000,
            object_timeout: 300_000,
            enable_metrics: true,
            enable_auto_cleanup: true,
            enable_thread_safety: true,
        }
    }
}

impl MemoryPoolConfig {
    /// Small pool sized for tests and short-lived tools.
    pub fn small(initial: usize, max: usize) -> Self {
        Self {
            initial_pool_size: initial,
            max_pool_size: max,
            growth_increment: (max / 10).max(1),
            ..Default::default()
        }
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval)
    }

    pub fn object_timeout(&self) -> Duration {
        Duration::from_millis(self.object_timeout)
    }
}

/// Configuration for the [`MessageBatcher`](crate::batch::MessageBatcher).
///
/// `enable_compression`, `max_concurrent_batches` and
/// `compression_threshold` are carried for persistence compatibility but
/// are not acted on by the current batcher: batches are delivered
/// uncompressed, one at a time, in ready order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageBatcherConfig {
    pub max_batch_size: usize,
    pub max_batch_size_bytes: usize,
    pub batch_timeout: u64,
    pub flush_interval: u64,
    pub enable_priority_batching: bool,
    pub enable_destination_batching: bool,
    pub enable_compression: bool,
    pub max_concurrent_batches: usize,
    pub compression_threshold: f64,
}

impl Default for MessageBatcherConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            max_batch_size_bytes: 1024 * 1024,
            batch_timeout: 100,
            flush_interval: 50,
            enable_priority_batching: true,
            enable_destination_batching: true,
            enable_compression: false,
            max_concurrent_batches: 10,
            compression_threshold: 0.7,
        }
    }
}

impl MessageBatcherConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval)
    }
}

/// Configuration for the
/// [`SerializationOptimizer`](crate::serialize::SerializationOptimizer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerializationOptimizerConfig {
    pub enable_caching: bool,
    pub enable_compression: bool,
    pub enable_async_serialization: bool,
    pub cache_max_size: usize,
    pub compression_threshold: usize,
    pub cache_timeout: u64,
    pub async_timeout: u64,
    pub worker_threads: usize,
    pub enable_metrics: bool,
}

impl Default for SerializationOptimizerConfig {
    fn default() -> Self {
        Self {
            enable_caching: true,
            enable_compression: false,
            enable_async_serialization: true,
            cache_max_size: 10_000,
            compression_threshold: 1024,
            cache_timeout: 300_000,
            async_timeout: 5_000,
            worker_threads: 4,
            enable_metrics: true,
        }
    }
}

impl SerializationOptimizerConfig {
    pub fn cache_timeout(&self) -> Duration {
        Duration::from_millis(self.cache_timeout)
    }

    pub fn async_timeout(&self) -> Duration {
        Duration::from_millis(self.async_timeout)
    }
}

/// Configuration for the
/// [`ConnectionPool`](crate::connection::pool::ConnectionPool).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionPoolConfig {
    pub min_connections: usize,
    pub max_connections: usize,
    pub initial_connections: usize,
    pub acquire_timeout: u64,
    pub idle_timeout: u64,
    pub max_lifetime: u64,
    pub health_check_interval: u64,
    pub cleanup_interval: u64,
    pub enable_health_checks: bool,
    pub enable_metrics: bool,
    pub growth_factor: f64,
    pub shrink_threshold: f64,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 5,
            max_connections: 50,
            initial_connections: 10,
            acquire_timeout: 30_000,
            idle_timeout: 300_000,
            max_lifetime: 3_600_000,
            health_check_interval: 60_000,
            cleanup_interval: 30_000,
            enable_health_checks: true,
            enable_metrics: true,
            growth_factor: 1.5,
            shrink_threshold: 0.3,
        }
    }
}

impl ConnectionPoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_millis(self.max_lifetime)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval)
    }
}
