//! TCP implementations of the pooling traits.
//!
//! [`TcpConnection`] is a pooled data channel: a single framed TCP
//! stream with interior locking, suitable for auxiliary transfers next
//! to the main session. [`TcpConnectionFactory`] builds and validates
//! them for a [`ConnectionPool`](crate::connection::pool::ConnectionPool).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::TcpConnectionConfig;
use crate::connection::framing;
use crate::connection::pool::{Connection, ConnectionFactory};
use crate::error::{CommError, Result};
use crate::message::now_millis;

/// Applies keepalive and Nagle settings from the config to a connected
/// stream. Keepalive probe count is a unix-only socket option.
pub(crate) fn apply_socket_options(
    stream: &TcpStream,
    config: &TcpConnectionConfig,
) -> std::io::Result<()> {
    stream.set_nodelay(!config.enable_nagle)?;

    if config.enable_keep_alive {
        let sock = SockRef::from(stream);
        #[allow(unused_mut)]
        let mut keepalive = TcpKeepalive::new()
            .with_time(config.keep_alive_timeout())
            .with_interval(config.keep_alive_interval());
        #[cfg(unix)]
        {
            keepalive = keepalive.with_retries(config.keep_alive_probes);
        }
        sock.set_tcp_keepalive(&keepalive)?;
    }
    Ok(())
}

/// A single pooled TCP connection carrying framed text messages.
pub struct TcpConnection {
    config: TcpConnectionConfig,
    connection_id: String,
    stream: Mutex<Option<TcpStream>>,
    connected: AtomicBool,
    healthy: AtomicBool,
    connected_at: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    operation_count: AtomicU64,
}

impl TcpConnection {
    pub fn new(config: TcpConnectionConfig) -> Self {
        Self {
            config,
            connection_id: format!("conn_{}", Uuid::new_v4().simple()),
            stream: Mutex::new(None),
            connected: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            connected_at: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            operation_count: AtomicU64::new(0),
        }
    }

    /// Writes one framed message on the caller task.
    pub async fn send_data(&self, data: &str) -> Result<()> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or(CommError::NotConnected)?;

        let write = framing::write_frame(stream, data.as_bytes());
        match tokio::time::timeout(self.config.write_timeout(), write).await {
            Ok(Ok(())) => {
                self.bytes_sent
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                self.operation_count.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Ok(Err(e)) => {
                self.healthy.store(false, Ordering::SeqCst);
                Err(e)
            }
            Err(_) => {
                self.healthy.store(false, Ordering::SeqCst);
                Err(CommError::WriteError(String::from("write timed out")))
            }
        }
    }

    /// Reads one framed message, bounded by the configured read timeout.
    pub async fn receive_data(&self) -> Result<String> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or(CommError::NotConnected)?;

        match tokio::time::timeout(self.config.read_timeout(), framing::read_frame(stream)).await {
            Ok(Ok(message)) => {
                self.bytes_received
                    .fetch_add(message.len() as u64, Ordering::Relaxed);
                self.operation_count.fetch_add(1, Ordering::Relaxed);
                Ok(message)
            }
            Ok(Err(e)) => {
                self.healthy.store(false, Ordering::SeqCst);
                Err(e)
            }
            Err(_) => Err(CommError::ReadError(String::from("read timed out"))),
        }
    }

    pub fn remote_address(&self) -> String {
        format!("{}:{}", self.config.server_address, self.config.server_port)
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn connect(&self) -> bool {
        let address = self.remote_address();
        let attempt = TcpStream::connect(&address);
        match tokio::time::timeout(self.config.connect_timeout(), attempt).await {
            Ok(Ok(stream)) => {
                if let Err(e) = apply_socket_options(&stream, &self.config) {
                    warn!("TcpConnection: socket options failed on {}: {}", address, e);
                }
                *self.stream.lock().await = Some(stream);
                self.connected.store(true, Ordering::SeqCst);
                self.healthy.store(true, Ordering::SeqCst);
                self.connected_at.store(now_millis() as u64, Ordering::Relaxed);
                debug!("TcpConnection: {} connected to {}", self.connection_id, address);
                true
            }
            Ok(Err(e)) => {
                debug!("TcpConnection: connect to {} failed: {}", address, e);
                false
            }
            Err(_) => {
                debug!("TcpConnection: connect to {} timed out", address);
                false
            }
        }
    }

    async fn disconnect(&self) {
        if let Some(stream) = self.stream.lock().await.take() {
            drop(stream);
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    fn id(&self) -> String {
        self.connection_id.clone()
    }

    fn metadata(&self) -> Value {
        json!({
            "remoteAddress": self.remote_address(),
            "connectedAt": self.connected_at.load(Ordering::Relaxed),
            "bytesSent": self.bytes_sent.load(Ordering::Relaxed),
            "bytesReceived": self.bytes_received.load(Ordering::Relaxed),
            "operationCount": self.operation_count.load(Ordering::Relaxed),
        })
    }
}

/// Factory producing [`TcpConnection`]s toward one remote endpoint.
pub struct TcpConnectionFactory {
    config: TcpConnectionConfig,
}

impl TcpConnectionFactory {
    pub fn new(config: TcpConnectionConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ConnectionFactory for TcpConnectionFactory {
    async fn create_connection(&self) -> Option<Arc<dyn Connection>> {
        Some(Arc::new(TcpConnection::new(self.config.clone())))
    }

    async fn validate_connection(&self, connection: &Arc<dyn Connection>) -> bool {
        connection.is_connected().await && connection.is_healthy().await
    }

    fn connection_type(&self) -> &str {
        "tcp"
    }
}

#[cfg(test)]
pub(crate) use mock::{MockConnection, MockConnectionFactory};

#[cfg(test)]
mod mock {
    //! Scriptable connections for pool tests: connect failures, health
    //! flips and creation failures are all injectable.

    use super::*;
    use std::sync::Mutex as StdMutex;

    pub(crate) struct MockConnection {
        id: String,
        connected: AtomicBool,
        healthy: AtomicBool,
        connect_should_fail: AtomicBool,
    }

    impl MockConnection {
        pub(crate) fn new() -> Self {
            Self {
                id: format!("mock_{}", Uuid::new_v4().simple()),
                connected: AtomicBool::new(false),
                healthy: AtomicBool::new(true),
                connect_should_fail: AtomicBool::new(false),
            }
        }

        pub(crate) fn set_healthy(&self, healthy: bool) {
            self.healthy.store(healthy, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Connection for MockConnection {
        async fn connect(&self) -> bool {
            if self.connect_should_fail.load(Ordering::SeqCst) {
                return false;
            }
            self.connected.store(true, Ordering::SeqCst);
            true
        }

        async fn disconnect(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }

        async fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn is_healthy(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }

        fn id(&self) -> String {
            self.id.clone()
        }

        fn metadata(&self) -> Value {
            json!({ "mock": true })
        }
    }

    pub(crate) struct MockConnectionFactory {
        create_should_fail: AtomicBool,
        created: StdMutex<Vec<Arc<MockConnection>>>,
    }

    impl MockConnectionFactory {
        pub(crate) fn new() -> Self {
            Self {
                create_should_fail: AtomicBool::new(false),
                created: StdMutex::new(Vec::new()),
            }
        }

        pub(crate) fn set_create_should_fail(&self, fail: bool) {
            self.create_should_fail.store(fail, Ordering::SeqCst);
        }

        /// Marks the oldest still-healthy mock as unhealthy, simulating
        /// a dead peer behind an open socket.
        pub(crate) fn poison_one(&self) {
            let created = self.created.lock().unwrap();
            if let Some(conn) = created
                .iter()
                .find(|c| c.healthy.load(Ordering::SeqCst))
            {
                conn.set_healthy(false);
            }
        }

        /// Marks the mock with the given pool id as unhealthy.
        pub(crate) fn poison(&self, id: &str) {
            let created = self.created.lock().unwrap();
            if let Some(conn) = created.iter().find(|c| c.id == id) {
                conn.set_healthy(false);
            }
        }

        pub(crate) fn created_count(&self) -> usize {
            self.created.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ConnectionFactory for MockConnectionFactory {
        async fn create_connection(&self) -> Option<Arc<dyn Connection>> {
            if self.create_should_fail.load(Ordering::SeqCst) {
                return None;
            }
            let conn = Arc::new(MockConnection::new());
            self.created.lock().unwrap().push(Arc::clone(&conn));
            Some(conn)
        }

        async fn validate_connection(&self, connection: &Arc<dyn Connection>) -> bool {
            connection.is_connected().await && connection.is_healthy().await
        }

        fn connection_type(&self) -> &str {
            "mock"
        }
    }
}
