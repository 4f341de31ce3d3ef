//! skyberry_core — TCP device communication core for astronomy
//! instrument servers.
//!
//! The crate carries JSON envelopes between device processes and clients
//! over TCP and keeps the hot path cheap with four cooperating
//! performance subsystems:
//!
//! - [`pool::MemoryPool`] — generic object reuse with RAII hand-back
//! - [`serialize::SerializationOptimizer`] — cached (and optionally
//!   deflate-compressed) JSON serialization with an async worker pool
//! - [`batch::MessageBatcher`] — groups outbound messages per
//!   `(destination, priority)` into size/time-bounded batches
//! - [`connection::ConnectionPool`] — health-checked pool of reusable
//!   connections
//!
//! [`communicator::TcpCommunicator`] composes them behind the
//! [`communicator::DeviceCommunicator`] contract. On the wire every
//! message is a 4-byte big-endian length prefix followed by UTF-8 JSON
//! (see [`connection::session`]).

pub mod batch;
pub mod communicator;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod message;
pub mod pool;
pub mod serialize;

pub use batch::{Message, MessageBatch, MessageBatcher};
pub use communicator::{DeviceCommunicator, Protocol, TcpCommunicator};
pub use config::{
    ConnectionPoolConfig, MemoryPoolConfig, MessageBatcherConfig, SerializationOptimizerConfig,
    TcpConnectionConfig,
};
pub use connection::{Connection, ConnectionFactory, ConnectionPool, TcpServer, TcpSession};
pub use context::CommContext;
pub use error::{CommError, Result};
pub use message::{CommunicationMessage, CommunicationResponse, CommunicationStats};
pub use pool::{MemoryPool, PooledHandle, StringPool};
pub use serialize::SerializationOptimizer;
